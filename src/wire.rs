//! HTTP/1.1 wire handling for intercepted traffic
//!
//! A deliberately small HTTP layer for the streams this crate owns outright:
//! the decrypted client side of a MITM session, the plaintext tunnel variant,
//! and upstream round trips. Heads are parsed with `httparse`, messages are
//! carried as [`Request`]/[`Response`] with fully buffered bodies so filter
//! chains can mutate them freely, and responses toward a MITM'd client are
//! re-framed with forced chunked encoding.

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of a request or response head
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;
const MAX_CHUNK_LINE: usize = 1024;
const CHUNK_WRITE_SIZE: usize = 8 * 1024;
pub(crate) const DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

// Headers set by proxy clients that must not reach the origin, plus
// connection-level headers the framer owns.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "connection",
    "keep-alive",
    "te",
    "trailer",
];

/// HTTP wire errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("message body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("connection closed mid-message")]
    UnexpectedEof,

    #[error("invalid HTTP head: {0}")]
    InvalidHead(String),

    #[error("invalid chunked framing: {0}")]
    InvalidChunk(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A buffered HTTP request with the body fully read.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method (GET, POST, ...)
    pub method: String,
    /// Request target as it appeared on the wire; the MITM session loop
    /// rewrites origin-form targets into absolute `https://` URLs
    pub uri: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
    /// Address of the client the request originated from
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    /// Host header value, if present and valid UTF-8.
    pub fn host(&self) -> Option<&str> {
        self.headers.get(header::HOST).and_then(|v| v.to_str().ok())
    }
}

/// A buffered HTTP response with the body fully read.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Reason phrase as received; empty if the peer sent none
    pub reason: String,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut resp = Self::new(status);
        resp.body = body.into();
        resp
    }

    /// Reason phrase to serialize: the one received, else the canonical one.
    pub fn reason_phrase(&self) -> &str {
        if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("")
        } else {
            &self.reason
        }
    }
}

/// Incremental reader for HTTP/1.1 messages on a byte stream.
///
/// Owns the stream plus a read buffer; bytes read past the current message
/// stay buffered for the next one. `get_mut` exposes the stream for writing
/// responses back (the buffer only holds inbound data).
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
    max_body: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_body(inner, DEFAULT_MAX_BODY)
    }

    pub fn with_max_body(inner: R, max_body: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            max_body,
        }
    }

    /// Access the underlying stream, e.g. to write a response.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Release the stream together with any bytes read past the last message.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }

    /// Read one request. `Ok(None)` means the peer closed cleanly before
    /// sending another request head.
    pub async fn read_request(&mut self) -> Result<Option<Request>, WireError> {
        let head = match self.read_head(true).await? {
            Some(head) => head,
            None => return Ok(None),
        };
        let (method, uri, headers) = parse_request_head(&head)?;

        let body = if is_chunked(&headers) {
            self.read_chunked_body().await?
        } else if let Some(len) = content_length(&headers)? {
            self.read_sized_body(len).await?
        } else {
            Bytes::new()
        };

        Ok(Some(Request {
            method,
            uri,
            headers,
            body,
            remote_addr: None,
        }))
    }

    /// Read one response. `skip_body` suppresses body reading for responses
    /// to HEAD requests, which carry framing headers but no payload.
    pub async fn read_response(&mut self, skip_body: bool) -> Result<Response, WireError> {
        let head = self.read_head(false).await?.ok_or(WireError::UnexpectedEof)?;
        let (status, reason, headers) = parse_response_head(&head)?;

        let body = if skip_body || !status_allows_body(status) {
            Bytes::new()
        } else if is_chunked(&headers) {
            self.read_chunked_body().await?
        } else if let Some(len) = content_length(&headers)? {
            self.read_sized_body(len).await?
        } else {
            // Close-delimited body
            self.read_to_eof().await?
        };

        Ok(Response {
            status,
            reason,
            headers,
            body,
        })
    }

    async fn fill(&mut self) -> Result<usize, WireError> {
        Ok(self.inner.read_buf(&mut self.buf).await?)
    }

    async fn read_head(&mut self, allow_eof: bool) -> Result<Option<Bytes>, WireError> {
        loop {
            if let Some(pos) = find_subsequence(&self.buf, b"\r\n\r\n") {
                return Ok(Some(self.buf.split_to(pos + 4).freeze()));
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(WireError::HeadTooLarge(MAX_HEAD_SIZE));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() && allow_eof {
                    return Ok(None);
                }
                return Err(WireError::UnexpectedEof);
            }
        }
    }

    async fn read_sized_body(&mut self, len: usize) -> Result<Bytes, WireError> {
        if len > self.max_body {
            return Err(WireError::BodyTooLarge(self.max_body));
        }
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(WireError::UnexpectedEof);
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }

    async fn read_chunked_body(&mut self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size_part = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_part, 16)
                .map_err(|_| WireError::InvalidChunk(format!("bad chunk size {size_part:?}")))?;

            if size == 0 {
                // Consume optional trailer section up to the blank line
                loop {
                    if self.read_line().await?.is_empty() {
                        break;
                    }
                }
                return Ok(body.freeze());
            }

            if body.len() + size > self.max_body {
                return Err(WireError::BodyTooLarge(self.max_body));
            }
            while self.buf.len() < size + 2 {
                if self.fill().await? == 0 {
                    return Err(WireError::UnexpectedEof);
                }
            }
            let mut chunk = self.buf.split_to(size + 2);
            if &chunk[size..] != b"\r\n" {
                return Err(WireError::InvalidChunk("missing chunk terminator".to_string()));
            }
            chunk.truncate(size);
            body.extend_from_slice(&chunk);
        }
    }

    async fn read_line(&mut self) -> Result<String, WireError> {
        loop {
            if let Some(pos) = find_subsequence(&self.buf, b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return String::from_utf8(line[..pos].to_vec())
                    .map_err(|_| WireError::InvalidChunk("non-ASCII chunk line".to_string()));
            }
            if self.buf.len() > MAX_CHUNK_LINE {
                return Err(WireError::InvalidChunk("chunk line too long".to_string()));
            }
            if self.fill().await? == 0 {
                return Err(WireError::UnexpectedEof);
            }
        }
    }

    async fn read_to_eof(&mut self) -> Result<Bytes, WireError> {
        loop {
            if self.buf.len() > self.max_body {
                return Err(WireError::BodyTooLarge(self.max_body));
            }
            if self.fill().await? == 0 {
                return Ok(self.buf.split().freeze());
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_request_head(head: &[u8]) -> Result<(String, String, HeaderMap), WireError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(WireError::InvalidHead("truncated request head".to_string()))
        }
        Err(e) => return Err(WireError::InvalidHead(e.to_string())),
    }

    let method = parsed
        .method
        .ok_or_else(|| WireError::InvalidHead("missing method".to_string()))?
        .to_string();
    let uri = parsed
        .path
        .ok_or_else(|| WireError::InvalidHead("missing request target".to_string()))?
        .to_string();
    let headers = collect_headers(parsed.headers)?;
    Ok((method, uri, headers))
}

pub(crate) fn parse_response_head(
    head: &[u8],
) -> Result<(StatusCode, String, HeaderMap), WireError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(WireError::InvalidHead("truncated response head".to_string()))
        }
        Err(e) => return Err(WireError::InvalidHead(e.to_string())),
    }

    let code = parsed
        .code
        .ok_or_else(|| WireError::InvalidHead("missing status code".to_string()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| WireError::InvalidHead(format!("invalid status code {code}")))?;
    let reason = parsed.reason.unwrap_or("").to_string();
    let headers = collect_headers(parsed.headers)?;
    Ok((status, reason, headers))
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, WireError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| WireError::InvalidHead(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| WireError::InvalidHead(format!("invalid value for {:?}", h.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<usize>, WireError> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .map(Some)
            .ok_or_else(|| WireError::InvalidHead("invalid Content-Length".to_string())),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::TRANSFER_ENCODING, "chunked")
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Standard `Upgrade: websocket` detection.
pub fn is_websocket_upgrade(req: &Request) -> bool {
    header_has_token(&req.headers, header::CONNECTION, "upgrade")
        && header_has_token(&req.headers, header::UPGRADE, "websocket")
}

/// Remove hop-by-hop headers set by proxy clients before an upstream round
/// trip.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Serialize a request in origin-form for an upstream connection.
///
/// The framer owns Host, Content-Length and Connection; everything else is
/// copied through. With `close` unset no Connection header is written and
/// the HTTP/1.1 keep-alive default applies, which lets one origin
/// connection serve a whole plaintext tunnel.
pub fn encode_request(req: &Request, path: &str, host: &str, close: bool) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, path).as_bytes());
    buf.extend_from_slice(format!("Host: {host}\r\n").as_bytes());

    for (name, value) in req.headers.iter() {
        if matches!(
            name.as_str(),
            "host" | "content-length" | "connection" | "transfer-encoding"
        ) {
            continue;
        }
        extend_header(&mut buf, name, value);
    }

    if !req.body.is_empty() || req.headers.contains_key(header::CONTENT_LENGTH) {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    }
    if close {
        buf.extend_from_slice(b"Connection: close\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&req.body);
    buf.freeze()
}

/// Serialize a WebSocket upgrade request, keeping its Connection/Upgrade
/// handshake headers intact.
pub fn encode_upgrade_request(req: &Request, path: &str, host: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, path).as_bytes());
    buf.extend_from_slice(format!("Host: {host}\r\n").as_bytes());

    for (name, value) in req.headers.iter() {
        if matches!(
            name.as_str(),
            "host" | "proxy-connection" | "proxy-authorization" | "proxy-authenticate"
        ) {
            continue;
        }
        extend_header(&mut buf, name, value);
    }
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// Standard response serialization: `HTTP/1.1` status line and an accurate
/// Content-Length for the buffered body.
pub fn encode_response(resp: &Response) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            resp.status.as_u16(),
            resp.reason_phrase()
        )
        .as_bytes(),
    );
    for (name, value) in resp.headers.iter() {
        if matches!(name.as_str(), "content-length" | "transfer-encoding") {
            continue;
        }
        extend_header(&mut buf, name, value);
    }
    if status_allows_body(resp.status) {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", resp.body.len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&resp.body);
    buf.freeze()
}

/// Write a response to a MITM'd client with forced framing: the status line
/// is always `HTTP/1.1`, Content-Length is dropped, the body goes out
/// chunked, and the connection is marked close so the client cannot hold the
/// tunnel open indefinitely.
///
/// The original Content-Length may be stale after filters ran; it is never
/// recomputed here.
pub async fn write_response_chunked<W>(w: &mut W, resp: &Response) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = BytesMut::new();
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            resp.status.as_u16(),
            resp.reason_phrase()
        )
        .as_bytes(),
    );
    for (name, value) in resp.headers.iter() {
        if matches!(
            name.as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        extend_header(&mut head, name, value);
    }
    head.extend_from_slice(b"Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n");
    w.write_all(&head).await?;

    for chunk in resp.body.chunks(CHUNK_WRITE_SIZE) {
        w.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
        w.write_all(chunk).await?;
        w.write_all(b"\r\n").await?;
    }
    w.write_all(b"0\r\n").await?;
    w.write_all(b"\r\n").await?;
    w.flush().await?;
    Ok(())
}

fn extend_header(buf: &mut BytesMut, name: &HeaderName, value: &HeaderValue) {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}
