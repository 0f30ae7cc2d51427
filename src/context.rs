//! Per-CONNECT state
//!
//! A [`ProxyContext`] is created when the outer server dispatches a CONNECT
//! and lives until the tunnel, hijack callback, or MITM session ends. Each
//! inner request inside a MITM session gets a child context with a fresh
//! session id; the user-data slot is shared by reference between parent and
//! children.

use http::HeaderMap;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cert_store::CertStore;
use crate::wire::{Request, Response};

// Process-wide; ids are never reused within a process lifetime.
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
}

/// The parsed CONNECT request handed over by the outer server.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Requested target, usually `host:port`
    pub host: String,
    /// Headers of the CONNECT request
    pub headers: HeaderMap,
    /// Address of the connecting client
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            headers: HeaderMap::new(),
            remote_addr: None,
        }
    }
}

/// State carried through one CONNECT and into its filter callbacks.
pub struct ProxyContext {
    /// Process-unique session id
    pub session: u64,

    /// The original CONNECT request
    pub connect: ConnectRequest,

    /// The inner request currently being processed (MITM sessions only)
    pub request: Option<Request>,

    /// Response slot consulted by the Reject action; a rejection handler may
    /// preset the response that is serialized to the client
    pub response: Option<Response>,

    /// Opaque user state, shared by reference with child contexts
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,

    pub(crate) cert_store: Option<Arc<CertStore>>,
}

impl ProxyContext {
    pub(crate) fn new(connect: ConnectRequest, cert_store: Option<Arc<CertStore>>) -> Self {
        Self {
            session: next_session_id(),
            connect,
            request: None,
            response: None,
            user_data: None,
            cert_store,
        }
    }

    /// Context for one inner request: fresh session id, inherited user-data.
    pub(crate) fn child(&self) -> Self {
        Self {
            session: next_session_id(),
            connect: self.connect.clone(),
            request: None,
            response: None,
            user_data: self.user_data.clone(),
            cert_store: self.cert_store.clone(),
        }
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("session", &self.session)
            .field("connect", &self.connect.host)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_increasing() {
        let a = ProxyContext::new(ConnectRequest::new("example.com:443"), None);
        let b = ProxyContext::new(ConnectRequest::new("example.com:443"), None);
        assert!(b.session > a.session);
    }

    #[test]
    fn child_inherits_user_data_by_reference() {
        let mut parent = ProxyContext::new(ConnectRequest::new("example.com:443"), None);
        parent.user_data = Some(Arc::new("tag".to_string()));

        let child = parent.child();
        assert_ne!(child.session, parent.session);
        let shared = child.user_data.as_ref().unwrap();
        assert!(Arc::ptr_eq(shared, parent.user_data.as_ref().unwrap()));
        assert_eq!(child.connect.host, "example.com:443");
    }
}
