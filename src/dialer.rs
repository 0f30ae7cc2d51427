//! Upstream dialer
//!
//! Opens connections to CONNECT targets, either directly or tunneled through
//! a parent proxy via its own CONNECT request. A parent speaking plain HTTP
//! gets a raw TCP connection (port defaulted to 80); one speaking HTTPS/WSS
//! gets a TLS client connection first (port defaulted to 443). A caller may
//! override the raw TCP dial entirely with a custom dial function.

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::policy::{ensure_port, strip_port};
use crate::relay::UpstreamStream;
use crate::wire::{self, WireError};

// A plain parent's refusal body is drained up to the configured max body
// size; a TLS parent's is read bounded to 500 bytes.
const TLS_REFUSAL_LIMIT: usize = 500;

/// Replacement for the system TCP dialer.
pub type DialFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>
        + Send
        + Sync,
>;

/// Mutates the header list of the CONNECT request sent to a parent proxy,
/// e.g. to add `Proxy-Authorization`.
pub type ConnectRequestHook = Arc<dyn Fn(&mut Vec<(String, String)>) + Send + Sync>;

/// A parent proxy that outbound CONNECTs are tunneled through.
#[derive(Clone)]
pub enum ParentProxy {
    /// Plain-HTTP parent
    Http { host: String },
    /// HTTPS/WSS parent: the TCP connection is TLS-wrapped before CONNECT
    Tls {
        host: String,
        server_name: ServerName<'static>,
        tls: Arc<ClientConfig>,
    },
}

impl ParentProxy {
    /// Parse a parent proxy URL. A bare `host:port` is treated as a
    /// plain-HTTP parent.
    pub fn parse(raw: &str, tls: Arc<ClientConfig>) -> Result<Self, ProxyError> {
        let invalid = |source: &str| ProxyError::InvalidUpstreamUrl {
            url: raw.to_string(),
            detail: source.to_string(),
        };

        let normalized = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = Url::parse(&normalized).map_err(|e| invalid(&e.to_string()))?;
        let host = url_host(&url).ok_or_else(|| invalid("missing host"))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        match url.scheme() {
            "http" => Ok(Self::Http {
                host: ensure_port(&host, 80),
            }),
            "https" | "wss" => {
                let host = ensure_port(&host, 443);
                let name = strip_port(&host).trim_matches(['[', ']']).to_string();
                let server_name = ServerName::try_from(name)
                    .map_err(|e| invalid(&format!("invalid server name: {e}")))?;
                Ok(Self::Tls {
                    host,
                    server_name,
                    tls,
                })
            }
            other => Err(invalid(&format!("unsupported scheme {other:?}"))),
        }
    }
}

impl std::fmt::Debug for ParentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { host } => write!(f, "ParentProxy::Http({host})"),
            Self::Tls { host, .. } => write!(f, "ParentProxy::Tls({host})"),
        }
    }
}

fn url_host(url: &Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(d) => Some(d.to_string()),
        url::Host::Ipv4(ip) => Some(ip.to_string()),
        url::Host::Ipv6(ip) => Some(format!("[{ip}]")),
    }
}

/// Connection opener for origins and parent proxies.
pub struct Dialer {
    parent: Option<ParentProxy>,
    custom: Option<DialFn>,
    connect_hook: Option<ConnectRequestHook>,
    connect_timeout: Duration,
    max_body: usize,
}

impl Dialer {
    /// Direct dialer with no parent proxy.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            parent: None,
            custom: None,
            connect_hook: None,
            connect_timeout,
            max_body: wire::DEFAULT_MAX_BODY,
        }
    }

    /// Build from configuration. `ProxyConfig::from_env` is where the
    /// `HTTPS_PROXY` / `https_proxy` convenience lookup happens.
    pub fn from_config(
        config: &ProxyConfig,
        upstream_tls: Arc<ClientConfig>,
    ) -> Result<Self, ProxyError> {
        let mut dialer = Self::new(Duration::from_secs(config.connect_timeout_seconds));
        dialer.max_body = config.max_body_size;
        if let Some(url) = &config.upstream_proxy {
            dialer.parent = Some(ParentProxy::parse(url, upstream_tls)?);
        }
        Ok(dialer)
    }

    pub fn set_parent(&mut self, parent: Option<ParentProxy>) {
        self.parent = parent;
    }

    /// Override the raw TCP dial.
    pub fn set_custom_dial<F, Fut>(&mut self, dial: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<TcpStream>> + Send + 'static,
    {
        self.custom = Some(Arc::new(move |addr: String| {
            Box::pin(dial(addr))
                as Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>
        }));
    }

    /// Hook run over the headers of every CONNECT sent to a parent proxy.
    pub fn set_connect_hook(&mut self, hook: ConnectRequestHook) {
        self.connect_hook = Some(hook);
    }

    /// Open a raw TCP connection, honoring the custom dial override.
    pub async fn dial(&self, addr: &str) -> Result<TcpStream, ProxyError> {
        if let Some(custom) = &self.custom {
            return Ok(custom(addr.to_string()).await?);
        }
        timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::ConnectionTimeout(addr.to_string()))?
            .map_err(ProxyError::Io)
    }

    /// Open a connection to a CONNECT target, tunneling through the parent
    /// proxy when one is configured.
    pub async fn connect_dial(&self, addr: &str) -> Result<UpstreamStream, ProxyError> {
        match &self.parent {
            None => Ok(UpstreamStream::Tcp(self.dial(addr).await?)),
            Some(ParentProxy::Http { host }) => {
                debug!(parent = %host, target = %addr, "tunneling CONNECT through parent proxy");
                let mut stream = self.dial(host).await?;
                self.send_connect(&mut stream, addr, self.max_body).await?;
                Ok(UpstreamStream::Tcp(stream))
            }
            Some(ParentProxy::Tls {
                host,
                server_name,
                tls,
            }) => {
                debug!(parent = %host, target = %addr, "tunneling CONNECT through TLS parent proxy");
                let stream = self.dial(host).await?;
                let connector = TlsConnector::from(Arc::clone(tls));
                let mut stream = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(ProxyError::Io)?;
                self.send_connect(&mut stream, addr, TLS_REFUSAL_LIMIT).await?;
                Ok(UpstreamStream::Tls(Box::new(stream)))
            }
        }
    }

    /// Issue `CONNECT <addr>` on an established parent connection and parse
    /// the answer. On success the stream is positioned at the first tunnel
    /// byte; on refusal the body snippet is drained and the stream dropped
    /// by the caller.
    async fn send_connect<S>(
        &self,
        stream: &mut S,
        addr: &str,
        refusal_limit: usize,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut headers = vec![("Host".to_string(), addr.to_string())];
        if let Some(hook) = &self.connect_hook {
            hook(&mut headers);
        }

        let mut request = format!("CONNECT {addr} HTTP/1.1\r\n");
        for (name, value) in &headers {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Byte-wise head read: nothing past the blank line may be consumed,
        // the bytes that follow belong to the tunnel.
        let mut head = Vec::with_capacity(256);
        loop {
            head.push(stream.read_u8().await?);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
            if head.len() > wire::MAX_HEAD_SIZE {
                return Err(WireError::HeadTooLarge(wire::MAX_HEAD_SIZE).into());
            }
        }

        let (status, _, response_headers) = wire::parse_response_head(&head)?;
        if status.as_u16() == 200 {
            return Ok(());
        }

        let limit = wire::content_length(&response_headers)?
            .map(|len| len.min(refusal_limit))
            .unwrap_or(refusal_limit);
        let mut body = Vec::new();
        let mut buf = [0u8; 1024];
        while body.len() < limit {
            let want = (limit - body.len()).min(buf.len());
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }

        Err(ProxyError::UpstreamRefused {
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("parent", &self.parent)
            .field("has_custom_dial", &self.custom.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::upstream_client_config;

    #[test]
    fn parent_http_defaults_port_80() {
        let parent = ParentProxy::parse("http://parent", upstream_client_config()).unwrap();
        match parent {
            ParentProxy::Http { host } => assert_eq!(host, "parent:80"),
            other => panic!("unexpected parent {other:?}"),
        }
    }

    #[test]
    fn parent_without_scheme_is_plain_http() {
        let parent = ParentProxy::parse("parent:3128", upstream_client_config()).unwrap();
        match parent {
            ParentProxy::Http { host } => assert_eq!(host, "parent:3128"),
            other => panic!("unexpected parent {other:?}"),
        }
    }

    #[test]
    fn parent_https_defaults_port_443() {
        let parent = ParentProxy::parse("https://parent.example", upstream_client_config()).unwrap();
        match parent {
            ParentProxy::Tls { host, .. } => assert_eq!(host, "parent.example:443"),
            other => panic!("unexpected parent {other:?}"),
        }
    }

    #[test]
    fn parent_unknown_scheme_is_rejected() {
        let result = ParentProxy::parse("socks5://parent:1080", upstream_client_config());
        assert!(matches!(
            result,
            Err(ProxyError::InvalidUpstreamUrl { .. })
        ));
    }
}
