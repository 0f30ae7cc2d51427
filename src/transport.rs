//! Upstream round trips for MITM'd requests
//!
//! One connection per exchange: dial the origin named by the request URL
//! (TLS for `https`), write the request in origin-form, read the full
//! response. Timeouts bound the write and the response read; the dialer's
//! custom dial override applies here too.

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::wire::{encode_request, MessageReader, Request, Response};

/// Where a request URL points.
pub(crate) struct Target {
    pub tls: bool,
    /// Name presented for SNI and certificate verification (no brackets)
    pub server_name: String,
    /// `host:port` to dial (brackets kept for IPv6)
    pub addr: String,
    /// Host header value
    pub host_header: String,
    /// Origin-form path and query
    pub path: String,
}

pub(crate) fn resolve_target(uri: &str) -> Result<Target, ProxyError> {
    let invalid = |source: &str| ProxyError::InvalidRequestUrl {
        url: uri.to_string(),
        detail: source.to_string(),
    };

    let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
    let tls = match url.scheme() {
        "http" => false,
        "https" => true,
        other => return Err(invalid(&format!("unsupported scheme {other:?}"))),
    };

    let (server_name, bracket_host) = match url.host() {
        Some(url::Host::Domain(d)) => (d.to_string(), d.to_string()),
        Some(url::Host::Ipv4(ip)) => (ip.to_string(), ip.to_string()),
        Some(url::Host::Ipv6(ip)) => (ip.to_string(), format!("[{ip}]")),
        None => return Err(invalid("missing host")),
    };

    let port = url
        .port()
        .unwrap_or(if tls { 443 } else { 80 });
    let addr = format!("{bracket_host}:{port}");
    let host_header = match url.port() {
        Some(p) => format!("{bracket_host}:{p}"),
        None => bracket_host,
    };

    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok(Target {
        tls,
        server_name,
        addr,
        host_header,
        path,
    })
}

/// Upstream HTTP transport.
pub struct Transport {
    tls: Arc<ClientConfig>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_body: usize,
}

impl Transport {
    pub fn new(
        tls: Arc<ClientConfig>,
        read_timeout: Duration,
        write_timeout: Duration,
        max_body: usize,
    ) -> Self {
        Self {
            tls,
            read_timeout,
            write_timeout,
            max_body,
        }
    }

    /// Replace the TLS client configuration used toward origins, e.g. to
    /// supply custom roots or relaxed verification.
    pub fn set_tls(&mut self, tls: Arc<ClientConfig>) {
        self.tls = tls;
    }

    /// Perform one request/response exchange with the origin named by
    /// `req.uri`.
    pub async fn round_trip(&self, dialer: &Dialer, req: &Request) -> Result<Response, ProxyError> {
        let target = resolve_target(&req.uri)?;
        let stream = dialer.dial(&target.addr).await?;
        let head_only = req.method.eq_ignore_ascii_case("HEAD");
        let bytes = encode_request(req, &target.path, &target.host_header, true);

        if target.tls {
            let server_name = ServerName::try_from(target.server_name.clone())
                .map_err(|e| ProxyError::tls_handshake(&target.server_name, e))?;
            let connector = TlsConnector::from(Arc::clone(&self.tls));
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProxyError::tls_handshake(&target.server_name, e))?;
            self.exchange(stream, &bytes, head_only).await
        } else {
            self.exchange(stream, &bytes, head_only).await
        }
    }

    async fn exchange<S>(
        &self,
        mut stream: S,
        request_bytes: &[u8],
        head_only: bool,
    ) -> Result<Response, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        timeout(self.write_timeout, stream.write_all(request_bytes))
            .await
            .map_err(|_| ProxyError::WriteTimeout)??;

        let mut reader = MessageReader::with_max_body(stream, self.max_body);
        let response = timeout(self.read_timeout, reader.read_response(head_only))
            .await
            .map_err(|_| ProxyError::ReadTimeout)??;
        Ok(response)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_body", &self.max_body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_https_defaults() {
        let target = resolve_target("https://example.com/a/b?q=1").unwrap();
        assert!(target.tls);
        assert_eq!(target.addr, "example.com:443");
        assert_eq!(target.host_header, "example.com");
        assert_eq!(target.path, "/a/b?q=1");
    }

    #[test]
    fn resolve_keeps_explicit_port_in_host_header() {
        let target = resolve_target("https://example.com:8443/").unwrap();
        assert_eq!(target.addr, "example.com:8443");
        assert_eq!(target.host_header, "example.com:8443");
    }

    #[test]
    fn resolve_ipv6_brackets() {
        let target = resolve_target("https://[::1]:9443/x").unwrap();
        assert_eq!(target.addr, "[::1]:9443");
        assert_eq!(target.server_name, "::1");
    }

    #[test]
    fn resolve_rejects_other_schemes() {
        assert!(matches!(
            resolve_target("ftp://example.com/"),
            Err(ProxyError::InvalidRequestUrl { .. })
        ));
    }

    #[test]
    fn resolve_empty_path_becomes_slash() {
        let target = resolve_target("http://example.com").unwrap();
        assert!(!target.tls);
        assert_eq!(target.addr, "example.com:80");
        assert_eq!(target.path, "/");
    }
}
