use anyhow::{Context, Result};
use std::env;

/// Proxy configuration, loaded from the environment or built by hand.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Listen address for the outer acceptor
    pub host: String,
    pub port: u16,

    // CA certificate and key paths (loaded if present, generated otherwise)
    pub ca_cert_path: String,
    pub ca_key_path: String,

    // Parent proxy URL for outbound CONNECTs; falls back to HTTPS_PROXY /
    // https_proxy when unset
    pub upstream_proxy: Option<String>,

    // Timeouts
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,

    // Size limits
    pub max_body_size: usize,

    // Forged certificate cache capacity
    pub cert_cache_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ca_cert_path: "ca.crt".to_string(),
            ca_key_path: "ca.key".to_string(),
            upstream_proxy: None,
            connect_timeout_seconds: 10,
            read_timeout_seconds: 60,
            write_timeout_seconds: 60,
            max_body_size: 16 * 1024 * 1024,
            cert_cache_size: 1000,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables.
    ///
    /// `HTTPS_PROXY` (preferred) or `https_proxy` configures a parent proxy
    /// for outbound CONNECTs.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();

        let host = env::var("PROXY_HOST").unwrap_or(defaults.host);
        let port = env::var("PROXY_PORT")
            .unwrap_or_else(|_| defaults.port.to_string())
            .parse()
            .context("Invalid PROXY_PORT")?;

        let ca_cert_path = env::var("CA_CERT_PATH").unwrap_or(defaults.ca_cert_path);
        let ca_key_path = env::var("CA_KEY_PATH").unwrap_or(defaults.ca_key_path);

        let upstream_proxy = upstream_proxy_from_env();

        let connect_timeout_seconds = env::var("CONNECT_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| defaults.connect_timeout_seconds.to_string())
            .parse()
            .context("Invalid CONNECT_TIMEOUT_SECONDS")?;
        let read_timeout_seconds = env::var("READ_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| defaults.read_timeout_seconds.to_string())
            .parse()
            .context("Invalid READ_TIMEOUT_SECONDS")?;
        let write_timeout_seconds = env::var("WRITE_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| defaults.write_timeout_seconds.to_string())
            .parse()
            .context("Invalid WRITE_TIMEOUT_SECONDS")?;

        let max_body_size = env::var("MAX_BODY_SIZE")
            .unwrap_or_else(|_| defaults.max_body_size.to_string())
            .parse()
            .context("Invalid MAX_BODY_SIZE")?;

        let cert_cache_size = env::var("CERT_CACHE_SIZE")
            .unwrap_or_else(|_| defaults.cert_cache_size.to_string())
            .parse()
            .context("Invalid CERT_CACHE_SIZE")?;

        if cert_cache_size == 0 {
            return Err(anyhow::anyhow!("CERT_CACHE_SIZE must be greater than 0"));
        }

        Ok(Self {
            host,
            port,
            ca_cert_path,
            ca_key_path,
            upstream_proxy,
            connect_timeout_seconds,
            read_timeout_seconds,
            write_timeout_seconds,
            max_body_size,
            cert_cache_size,
        })
    }
}

/// Read the parent proxy URL from `HTTPS_PROXY`, then `https_proxy`.
pub fn upstream_proxy_from_env() -> Option<String> {
    env::var("HTTPS_PROXY")
        .or_else(|_| env::var("https_proxy"))
        .ok()
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8080);
        assert!(config.upstream_proxy.is_none());
        assert!(config.cert_cache_size > 0);
        assert!(config.max_body_size >= 1024 * 1024);
    }
}
