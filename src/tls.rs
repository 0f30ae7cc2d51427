//! TLS configurations for interception
//!
//! Client-facing: a `ServerConfig` whose certificate resolver forges a leaf
//! during the handshake, keyed by the ClientHello SNI when present and the
//! CONNECT host (port stripped) otherwise. Upstream: a `ClientConfig`
//! verifying origins against the Mozilla root bundle.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::{debug, warn};
use webpki_roots::TLS_SERVER_ROOTS;

use crate::ca::CertificateAuthority;
use crate::cert_store::CertStore;
use crate::context::ProxyContext;
use crate::policy::{strip_port, TlsConfigFactory};

/// Forges a certificate for whichever name the handshake is actually for.
///
/// The ClientHello's SNI overrides the CONNECT host; without a store every
/// handshake signs a fresh leaf.
struct HostCertResolver {
    fallback: String,
    authority: Arc<CertificateAuthority>,
    store: Option<Arc<CertStore>>,
}

impl std::fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCertResolver")
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = match client_hello.server_name() {
            Some(sni) if !sni.is_empty() => sni.to_string(),
            _ => self.fallback.clone(),
        };
        debug!(host = %server_name, "signing for host");

        let result = match &self.store {
            Some(store) => store.fetch(&server_name, || {
                self.authority.sign_host(&[server_name.clone()])
            }),
            None => self
                .authority
                .sign_host(&[server_name.clone()])
                .map(Arc::new),
        };

        match result {
            Ok(forged) => Some(Arc::clone(&forged.certified)),
            Err(e) => {
                // Returning no certificate fails the handshake, which ends
                // the MITM attempt.
                warn!(host = %server_name, error = %e, "certificate forging failed");
                None
            }
        }
    }
}

/// TLS server configuration impersonating `connect_host`.
///
/// No ALPN is advertised; the session loop speaks HTTP/1.1.
pub fn mitm_server_config(
    connect_host: &str,
    authority: Arc<CertificateAuthority>,
    store: Option<Arc<CertStore>>,
) -> Arc<ServerConfig> {
    let resolver = HostCertResolver {
        fallback: strip_port(connect_host).trim_matches(['[', ']']).to_string(),
        authority,
        store,
    };
    Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver)),
    )
}

/// The default TLS configuration factory for MITM actions: forge with the
/// given CA, caching in `store`.
pub fn tls_factory_from_ca(
    authority: Arc<CertificateAuthority>,
    store: Option<Arc<CertStore>>,
) -> TlsConfigFactory {
    Arc::new(move |host: &str, _ctx: &ProxyContext| {
        Ok(mitm_server_config(
            host,
            Arc::clone(&authority),
            store.clone(),
        ))
    })
}

/// Client configuration for upstream connections, trusting the Mozilla CA
/// bundle.
pub fn upstream_client_config() -> Arc<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_config_builds_with_webpki_roots() {
        let config = upstream_client_config();
        assert!(config.enable_sni);
    }

    #[test]
    fn mitm_config_builds_from_connect_host_with_port() {
        let authority = Arc::new(CertificateAuthority::ephemeral().unwrap());
        let config = mitm_server_config("example.com:443", authority, None);
        assert!(config.alpn_protocols.is_empty());
    }
}
