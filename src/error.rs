//! Proxy error types

use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors produced by the CONNECT engine and its collaborators
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on a client or origin stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client-side TLS handshake failed
    #[error("TLS handshake failed for {host}: {detail}")]
    TlsHandshakeFailed { host: String, detail: String },

    /// Leaf certificate forging failed
    #[error("failed to forge certificate for {host}: {detail}")]
    CertGenerationFailed { host: String, detail: String },

    /// CA certificate loading failed
    #[error("failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// CA certificate generation failed
    #[error("failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// No certificate authority configured but a MITM action was selected
    #[error("no certificate authority configured for TLS interception")]
    NoAuthority,

    /// Parent proxy answered the CONNECT with a non-200 status
    #[error("upstream proxy refused connection: {body}")]
    UpstreamRefused { body: String },

    /// Parent proxy URL could not be parsed
    #[error("invalid upstream proxy url {url}: {detail}")]
    InvalidUpstreamUrl { url: String, detail: String },

    /// Request URL inside a MITM session could not be interpreted
    #[error("invalid request url {url}: {detail}")]
    InvalidRequestUrl { url: String, detail: String },

    /// Connection attempt exceeded the configured deadline
    #[error("connection timeout dialing {0}")]
    ConnectionTimeout(String),

    /// Read exceeded the configured deadline
    #[error("read timeout")]
    ReadTimeout,

    /// Write exceeded the configured deadline
    #[error("write timeout")]
    WriteTimeout,

    /// Malformed HTTP traffic on a stream we were asked to parse
    #[error("HTTP protocol error: {0}")]
    Http(#[from] crate::wire::WireError),
}

impl ProxyError {
    /// Create a TLS handshake error
    pub fn tls_handshake(host: impl Into<String>, source: impl ToString) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            detail: source.to_string(),
        }
    }

    /// Create a certificate forging error
    pub fn cert_generation(host: impl Into<String>, source: impl ToString) -> Self {
        Self::CertGenerationFailed {
            host: host.into(),
            detail: source.to_string(),
        }
    }
}
