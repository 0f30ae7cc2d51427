//! MITM session loops
//!
//! After the 200 OK goes out on a CONNECT, these loops own the client side
//! of the tunnel. Each iteration handles exactly one inner request and its
//! response, in arrival order; a response is fully written before the next
//! request is read. The TLS variant runs detached from the dispatching
//! task and also exits when the proxy's shutdown signal fires.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::connect::http_error;
use crate::context::ProxyContext;
use crate::proxy::Proxy;
use crate::relay::ClientStream;
use crate::transport::resolve_target;
use crate::websocket;
use crate::wire::{self, MessageReader};

/// TLS MITM: handshake with a forged certificate, then filter each inner
/// request/response pair, writing responses with forced chunked framing.
pub(crate) async fn run_tls_session(
    proxy: Arc<Proxy>,
    ctx: ProxyContext,
    connect_host: String,
    client: ClientStream,
    tls_config: Arc<rustls::ServerConfig>,
) {
    let acceptor = TlsAcceptor::from(tls_config);
    let tls = match acceptor.accept(client).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                session = ctx.session,
                host = %connect_host,
                error = %e,
                "cannot handshake client"
            );
            return;
        }
    };

    let mut reader = MessageReader::with_max_body(tls, proxy.max_body());
    let mut shutdown = proxy.shutdown_rx();

    loop {
        let req = tokio::select! {
            _ = shutdown.changed() => {
                debug!(session = ctx.session, "session stopping on proxy shutdown");
                break;
            }
            read = reader.read_request() => match read {
                Ok(Some(req)) => req,
                Ok(None) => {
                    debug!(session = ctx.session, "exiting on EOF");
                    break;
                }
                Err(e) => {
                    warn!(
                        session = ctx.session,
                        host = %connect_host,
                        error = %e,
                        "cannot read request from client"
                    );
                    break;
                }
            }
        };

        let mut inner_ctx = ctx.child();
        let mut req = req;
        // The request arrived over the tunnel; carry the original
        // connecting address.
        req.remote_addr = inner_ctx.connect.remote_addr;
        if !req.uri.starts_with("https://") {
            req.uri = format!("https://{}{}", connect_host, req.uri);
        }
        inner_ctx.request = Some(req.clone());
        debug!(
            session = inner_ctx.session,
            method = %req.method,
            uri = %req.uri,
            "inner request"
        );

        let (mut req, short_circuit) = proxy.filter_request(req, &mut inner_ctx);

        let resp = match short_circuit {
            Some(resp) => resp,
            None => {
                if wire::is_websocket_upgrade(&req) {
                    debug!(session = inner_ctx.session, "request looks like websocket upgrade");
                    websocket::bridge(Arc::clone(&proxy), inner_ctx, req, reader).await;
                    return;
                }
                wire::strip_proxy_headers(&mut req.headers);
                match proxy.transport().round_trip(proxy.dialer(), &req).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(
                            session = inner_ctx.session,
                            error = %e,
                            "cannot read response from upstream"
                        );
                        break;
                    }
                }
            }
        };

        let resp = proxy.filter_response(resp, &mut inner_ctx);
        debug!(session = inner_ctx.session, status = %resp.status, "inner response");

        if let Err(e) = wire::write_response_chunked(reader.get_mut(), &resp).await {
            warn!(
                session = inner_ctx.session,
                error = %e,
                "cannot write response to client"
            );
            break;
        }
    }

    // Close the TLS stream on every exit path (close_notify included)
    let _ = reader.get_mut().shutdown().await;
}

/// Plaintext MITM: the same loop without TLS and without websocket
/// detection, over one origin connection, with responses written verbatim.
pub(crate) async fn run_http_session(
    proxy: Arc<Proxy>,
    ctx: ProxyContext,
    connect_host: String,
    client: ClientStream,
) {
    let origin = match proxy.dialer().connect_dial(&connect_host).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!(
                session = ctx.session,
                host = %connect_host,
                error = %e,
                "error dialing origin"
            );
            return;
        }
    };

    let mut client_reader = MessageReader::with_max_body(client, proxy.max_body());
    let mut origin_reader = MessageReader::with_max_body(origin, proxy.max_body());
    let mut shutdown = proxy.shutdown_rx();

    loop {
        let req = tokio::select! {
            _ = shutdown.changed() => {
                debug!(session = ctx.session, "session stopping on proxy shutdown");
                break;
            }
            read = client_reader.read_request() => match read {
                Ok(Some(req)) => req,
                Ok(None) => {
                    debug!(session = ctx.session, "exiting on EOF");
                    break;
                }
                Err(e) => {
                    warn!(
                        session = ctx.session,
                        host = %connect_host,
                        error = %e,
                        "cannot read request from client"
                    );
                    break;
                }
            }
        };

        let mut inner_ctx = ctx.child();
        let mut req = req;
        req.remote_addr = inner_ctx.connect.remote_addr;
        if !req.uri.starts_with("http://") {
            req.uri = format!("http://{}{}", connect_host, req.uri);
        }
        inner_ctx.request = Some(req.clone());
        debug!(
            session = inner_ctx.session,
            method = %req.method,
            uri = %req.uri,
            "inner request"
        );

        let (mut req, short_circuit) = proxy.filter_request(req, &mut inner_ctx);

        let resp = match short_circuit {
            Some(resp) => resp,
            None => {
                wire::strip_proxy_headers(&mut req.headers);
                let target = match resolve_target(&req.uri) {
                    Ok(target) => target,
                    Err(e) => {
                        warn!(session = inner_ctx.session, error = %e, "illegal URL");
                        break;
                    }
                };
                let bytes = wire::encode_request(&req, &target.path, &target.host_header, false);
                if let Err(e) = origin_reader.get_mut().write_all(&bytes).await {
                    warn!(session = inner_ctx.session, error = %e, "cannot write request to origin");
                    http_error(inner_ctx.session, client_reader.get_mut()).await;
                    return;
                }
                let head_only = req.method.eq_ignore_ascii_case("HEAD");
                match origin_reader.read_response(head_only).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(
                            session = inner_ctx.session,
                            error = %e,
                            "cannot read response from origin"
                        );
                        http_error(inner_ctx.session, client_reader.get_mut()).await;
                        return;
                    }
                }
            }
        };

        let resp = proxy.filter_response(resp, &mut inner_ctx);
        if let Err(e) = client_reader
            .get_mut()
            .write_all(&wire::encode_response(&resp))
            .await
        {
            warn!(
                session = inner_ctx.session,
                error = %e,
                "cannot write response to client"
            );
            break;
        }
    }

    let _ = client_reader.get_mut().shutdown().await;
}
