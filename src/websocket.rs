//! WebSocket upgrade forwarding
//!
//! When a MITM'd request is a websocket upgrade the session loop stops
//! interpreting HTTP: the proxy opens its own TLS connection to the origin,
//! replays the client's upgrade request, and relays raw bytes both ways.
//! The origin's 101 response reaches the client through the relay.

use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::context::ProxyContext;
use crate::proxy::Proxy;
use crate::relay::{self, AsyncStream, RewindStream};
use crate::transport::resolve_target;
use crate::wire::{encode_upgrade_request, MessageReader, Request};

pub(crate) async fn bridge<R>(
    proxy: Arc<Proxy>,
    ctx: ProxyContext,
    req: Request,
    client: MessageReader<R>,
) where
    R: AsyncStream + 'static,
{
    let target = match resolve_target(&req.uri) {
        Ok(target) => target,
        Err(e) => {
            warn!(session = ctx.session, error = %e, "invalid websocket target");
            return;
        }
    };

    let stream = match proxy.dialer().dial(&target.addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(session = ctx.session, host = %target.addr, error = %e, "error dialing websocket origin");
            return;
        }
    };

    let server_name = match ServerName::try_from(target.server_name.clone()) {
        Ok(name) => name,
        Err(e) => {
            warn!(session = ctx.session, host = %target.server_name, error = %e, "invalid websocket server name");
            return;
        }
    };
    let connector = TlsConnector::from(proxy.upstream_tls());
    let mut origin = match connector.connect(server_name, stream).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!(session = ctx.session, host = %target.addr, error = %e, "websocket TLS handshake failed");
            return;
        }
    };

    let bytes = encode_upgrade_request(&req, &target.path, &target.host_header);
    if let Err(e) = origin.write_all(&bytes).await {
        warn!(session = ctx.session, error = %e, "cannot replay websocket handshake");
        return;
    }

    debug!(session = ctx.session, host = %target.addr, "relaying websocket frames");
    let (client_stream, leftover) = client.into_parts();
    let client_stream = RewindStream::new(leftover.freeze(), client_stream);
    relay::relay_streams(ctx.session, client_stream, origin).await;
}
