//! CONNECT policy engine
//!
//! User-supplied handlers are consulted in registration order for every
//! CONNECT; the first handler returning a decision wins and may rewrite the
//! target host. If no handler decides, the tunnel is accepted untouched.
//! The six possible outcomes are a closed set, so the action is a tagged
//! enum carrying its per-variant payload (hijack callback, TLS config
//! factory) instead of an open-ended trait hierarchy.

use rustls::ServerConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::{ConnectRequest, ProxyContext};
use crate::error::ProxyError;
use crate::relay::ClientStream;

/// Callback that takes ownership of the raw client stream.
///
/// For [`ConnectAction::Hijack`] nothing has been written to the client when
/// the callback runs; for [`ConnectAction::ProxyAuthHijack`] the 407 status
/// line (without a terminating blank line) has already gone out and the
/// callback continues header emission on the same stream.
pub type HijackHandler = Box<
    dyn FnOnce(ConnectRequest, ClientStream, ProxyContext) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send,
>;

/// Produces the TLS server configuration presented to the client for a given
/// (possibly rewritten) CONNECT host.
pub type TlsConfigFactory =
    Arc<dyn Fn(&str, &ProxyContext) -> Result<Arc<ServerConfig>, ProxyError> + Send + Sync>;

/// Decision function consulted for each CONNECT. `None` defers to the next
/// handler in the chain.
pub type ConnectHandler =
    Box<dyn Fn(&str, &mut ProxyContext) -> Option<ConnectDecision> + Send + Sync>;

/// What to do with a CONNECT request.
pub enum ConnectAction {
    /// Write `200 OK` and blindly tunnel bytes to the origin
    Accept,
    /// Serialize `ProxyContext::response` if set, then close; the origin is
    /// never dialed
    Reject,
    /// Hand the raw client stream to the callback without writing anything
    Hijack(HijackHandler),
    /// Terminate TLS with a forged certificate and filter each inner
    /// request/response pair; `None` uses the proxy's configured CA
    MitmTls(Option<TlsConfigFactory>),
    /// Treat the tunnel as plaintext HTTP and filter each pair
    MitmHttp,
    /// Write a `407 Proxy Authentication Required` status line, then hand
    /// the stream to the callback
    ProxyAuthHijack(HijackHandler),
}

impl ConnectAction {
    /// Hijack the connection with an async callback.
    pub fn hijack<F, Fut>(f: F) -> Self
    where
        F: FnOnce(ConnectRequest, ClientStream, ProxyContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Hijack(Box::new(move |req, stream, ctx| Box::pin(f(req, stream, ctx))))
    }

    /// Challenge the client for proxy credentials, then hijack.
    pub fn proxy_auth_hijack<F, Fut>(f: F) -> Self
    where
        F: FnOnce(ConnectRequest, ClientStream, ProxyContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::ProxyAuthHijack(Box::new(move |req, stream, ctx| Box::pin(f(req, stream, ctx))))
    }

    /// TLS MITM with the proxy's configured CA.
    pub fn mitm_tls() -> Self {
        Self::MitmTls(None)
    }

    /// TLS MITM with a caller-supplied TLS configuration factory.
    pub fn mitm_tls_with(factory: TlsConfigFactory) -> Self {
        Self::MitmTls(Some(factory))
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Hijack(_) => "hijack",
            Self::MitmTls(_) => "mitm-tls",
            Self::MitmHttp => "mitm-http",
            Self::ProxyAuthHijack(_) => "proxy-auth-hijack",
        }
    }
}

impl std::fmt::Debug for ConnectAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A handler's verdict: the action to run and the (possibly rewritten)
/// target host that subsequent stages dial and, for TLS MITM, forge
/// certificates for.
#[derive(Debug)]
pub struct ConnectDecision {
    pub action: ConnectAction,
    pub host: String,
}

impl ConnectDecision {
    pub fn new(action: ConnectAction, host: impl Into<String>) -> Self {
        Self {
            action,
            host: host.into(),
        }
    }
}

/// Run the handler chain: first decision wins, default is Accept with the
/// original host.
pub(crate) fn evaluate(
    handlers: &[ConnectHandler],
    host: &str,
    ctx: &mut ProxyContext,
) -> ConnectDecision {
    for (i, handler) in handlers.iter().enumerate() {
        if let Some(decision) = handler(host, ctx) {
            tracing::debug!(
                session = ctx.session,
                handler = i,
                action = %decision.action.name(),
                host = %decision.host,
                "CONNECT handler decided"
            );
            return decision;
        }
    }
    ConnectDecision::new(ConnectAction::Accept, host)
}

/// Append `:port` when the host carries none.
pub(crate) fn ensure_port(host: &str, default_port: u16) -> String {
    if has_port(host) {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    }
}

fn has_port(host: &str) -> bool {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal
        rest.contains("]:")
    } else {
        host.contains(':')
    }
}

/// Drop a trailing `:port`, leaving bracketed IPv6 literals intact.
pub(crate) fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        match host.rfind("]:") {
            Some(pos) => &host[..pos + 1],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnectRequest;

    fn ctx() -> ProxyContext {
        ProxyContext::new(ConnectRequest::new("example.com:443"), None)
    }

    #[test]
    fn ensure_port_appends_default() {
        assert_eq!(ensure_port("example.com", 80), "example.com:80");
        assert_eq!(ensure_port("example.com:443", 80), "example.com:443");
        assert_eq!(ensure_port("[::1]", 80), "[::1]:80");
        assert_eq!(ensure_port("[::1]:443", 80), "[::1]:443");
    }

    #[test]
    fn strip_port_handles_literals() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("10.0.0.1:443"), "10.0.0.1");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn chain_defaults_to_accept() {
        let handlers: Vec<ConnectHandler> = Vec::new();
        let decision = evaluate(&handlers, "example.com:443", &mut ctx());
        assert!(matches!(decision.action, ConnectAction::Accept));
        assert_eq!(decision.host, "example.com:443");
    }

    #[test]
    fn first_decision_wins_and_can_rewrite_host() {
        let handlers: Vec<ConnectHandler> = vec![
            Box::new(|_, _| None),
            Box::new(|_, _| {
                Some(ConnectDecision::new(
                    ConnectAction::MitmHttp,
                    "rewritten.test:8080",
                ))
            }),
            Box::new(|_, _| Some(ConnectDecision::new(ConnectAction::Reject, "never.test"))),
        ];

        let decision = evaluate(&handlers, "example.com:443", &mut ctx());
        assert!(matches!(decision.action, ConnectAction::MitmHttp));
        assert_eq!(decision.host, "rewritten.test:8080");
    }
}
