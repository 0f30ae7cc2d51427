//! CONNECT dispatch
//!
//! Entry point for a hijacked CONNECT: run the policy chain, then execute
//! the selected action. Exactly one action runs per CONNECT. The wire
//! literals here are deliberate: `HTTP/1.0 200 OK` for accepted and MITM'd
//! tunnels, a bare 407 status line (no terminating blank line) before a
//! proxy-auth hijack so the callback can continue header emission, and
//! `HTTP/1.1 502 Bad Gateway` on dial failure.

use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::context::{ConnectRequest, ProxyContext};
use crate::policy::ConnectAction;
use crate::proxy::Proxy;
use crate::relay::{self, ClientStream, UpstreamStream};
use crate::session;
use crate::wire::encode_response;

const ACCEPT_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";
const PROXY_AUTH_PREFACE: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Handle one CONNECT request on its hijacked byte stream.
pub async fn handle_connect(proxy: Arc<Proxy>, req: ConnectRequest, mut client: ClientStream) {
    let mut ctx = ProxyContext::new(req.clone(), proxy.cert_store());
    debug!(
        session = ctx.session,
        host = %req.host,
        handlers = proxy.handler_count(),
        "running CONNECT handlers"
    );

    let decision = proxy.evaluate_connect(&req.host, &mut ctx);
    let host = decision.host;

    match decision.action {
        ConnectAction::Accept => {
            let host = crate::policy::ensure_port(&host, 80);
            let origin = match proxy.dialer().connect_dial(&host).await {
                Ok(origin) => origin,
                Err(e) => {
                    error!(session = ctx.session, host = %host, error = %e, "error dialing origin");
                    http_error(ctx.session, &mut client).await;
                    return;
                }
            };
            debug!(session = ctx.session, host = %host, "accepting CONNECT");
            if let Err(e) = client.write_all(ACCEPT_RESPONSE).await {
                warn!(session = ctx.session, error = %e, "cannot write CONNECT response");
                return;
            }

            match (client, origin) {
                // Both plain TCP: each direction half-closes independently
                (ClientStream::Tcp(client), UpstreamStream::Tcp(origin)) => {
                    relay::relay_tcp(ctx.session, client, origin);
                }
                (client, origin) => {
                    tokio::spawn(relay::relay_streams(ctx.session, client, origin));
                }
            }
        }

        ConnectAction::Reject => {
            debug!(session = ctx.session, host = %host, "rejecting CONNECT");
            if let Some(resp) = ctx.response.take() {
                if let Err(e) = client.write_all(&encode_response(&resp)).await {
                    warn!(session = ctx.session, error = %e, "cannot write rejection response");
                }
            }
            let _ = client.shutdown().await;
        }

        ConnectAction::Hijack(hijack) => {
            debug!(session = ctx.session, host = %host, "hijacking CONNECT");
            hijack(req, client, ctx).await;
        }

        ConnectAction::ProxyAuthHijack(hijack) => {
            if let Err(e) = client.write_all(PROXY_AUTH_PREFACE).await {
                warn!(session = ctx.session, error = %e, "cannot write proxy-auth preface");
                return;
            }
            hijack(req, client, ctx).await;
        }

        ConnectAction::MitmHttp => {
            if let Err(e) = client.write_all(ACCEPT_RESPONSE).await {
                warn!(session = ctx.session, error = %e, "cannot write CONNECT response");
                return;
            }
            debug!(
                session = ctx.session,
                host = %host,
                "assuming CONNECT is plain HTTP, proxying it"
            );
            session::run_http_session(proxy, ctx, host, client).await;
        }

        ConnectAction::MitmTls(factory) => {
            if let Err(e) = client.write_all(ACCEPT_RESPONSE).await {
                warn!(session = ctx.session, error = %e, "cannot write CONNECT response");
                return;
            }
            debug!(
                session = ctx.session,
                host = %host,
                "assuming CONNECT is TLS, proxying it"
            );

            let factory = match factory {
                Some(factory) => Ok(factory),
                None => proxy.default_tls_factory(),
            };
            let tls_config = match factory.and_then(|f| f(&host, &ctx)) {
                Ok(config) => config,
                Err(e) => {
                    error!(session = ctx.session, host = %host, error = %e, "cannot build TLS config");
                    http_error(ctx.session, &mut client).await;
                    return;
                }
            };

            // Detached: a long-lived tunnel must not pin the dispatching
            // task, and server shutdown reaches the loop via the watch
            // channel instead.
            tokio::spawn(session::run_tls_session(
                proxy, ctx, host, client, tls_config,
            ));
        }
    }
}

/// Emit `502 Bad Gateway` and close the stream.
pub(crate) async fn http_error<W>(session: u64, w: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = w.write_all(BAD_GATEWAY).await {
        warn!(session, error = %e, "error responding to client");
    }
    if let Err(e) = w.shutdown().await {
        warn!(session, error = %e, "error closing client connection");
    }
}
