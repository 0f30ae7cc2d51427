//! Middleman - HTTP/HTTPS Intercepting Proxy Core
//!
//! Middleman implements the hard parts of an intercepting forward proxy:
//! the CONNECT state machine, on-the-fly certificate forging, and the
//! full-duplex byte pump between client and origin.
//!
//! ## Features
//!
//! - **CONNECT policy dispatch**: an ordered handler chain picks one of six
//!   actions per tunnel - accept, reject, hijack, TLS MITM, plaintext MITM,
//!   or a proxy-auth challenge hijack - and may rewrite the target host
//! - **TLS MITM**: certificates are forged during the handshake for the SNI
//!   the client actually sent (falling back to the CONNECT host), cached
//!   with a single-flight guarantee
//! - **Filter chains**: every request/response pair inside a MITM'd tunnel
//!   passes through user filters; responses go back with forced chunked
//!   framing so mutated bodies never carry a stale Content-Length
//! - **Upstream chaining**: outbound CONNECTs can tunnel through a parent
//!   HTTP or HTTPS proxy (`HTTPS_PROXY` is honored)
//! - **Half-close-aware relay**: plain tunnels preserve directional EOF
//!
//! ## Usage
//!
//! ```rust,no_run
//! use middleman::{ConnectAction, ConnectDecision, Proxy, ProxyConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::from_env()?;
//!     let mut proxy = Proxy::from_config(&config)?;
//!
//!     // Intercept every tunnel with the configured CA
//!     proxy.on_connect(|host, _ctx| {
//!         Some(ConnectDecision::new(ConnectAction::mitm_tls(), host))
//!     });
//!     proxy.add_response_filter(|resp, ctx| {
//!         tracing::info!(session = ctx.session, status = %resp.status, "intercepted");
//!         resp
//!     });
//!
//!     let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
//!     middleman::serve(Arc::new(proxy), listener).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `policy` - CONNECT actions and the decision chain
//! - `connect` - dispatch of a hijacked CONNECT to its action
//! - `session` - MITM loops (TLS and plaintext)
//! - `ca` / `cert_store` - certificate forging and its single-flight cache
//! - `dialer` / `transport` - origin and parent-proxy connections, upstream
//!   round trips
//! - `relay` - full-duplex byte pump
//! - `server` - minimal outer acceptor handing CONNECTs to the engine

// CONNECT engine
pub mod connect;
pub mod context;
pub mod policy;
pub mod proxy;

// TLS interception
pub mod ca;
pub mod cert_store;
pub mod tls;

// Plumbing
pub mod config;
pub mod dialer;
pub mod error;
pub mod relay;
pub mod transport;
pub mod wire;

// Outer acceptor
pub mod server;

mod session;
mod websocket;

pub use ca::{CaConfig, CertificateAuthority, ForgedCert};
pub use cert_store::CertStore;
pub use config::ProxyConfig;
pub use connect::handle_connect;
pub use context::{ConnectRequest, ProxyContext};
pub use dialer::{Dialer, ParentProxy};
pub use error::ProxyError;
pub use policy::{ConnectAction, ConnectDecision, TlsConfigFactory};
pub use proxy::{Proxy, RequestFilter, ResponseFilter};
pub use relay::ClientStream;
pub use server::serve;
pub use wire::{Request, Response};
