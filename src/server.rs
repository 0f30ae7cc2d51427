//! Outer TCP acceptor
//!
//! A thin front for the CONNECT engine: accept connections, parse the
//! initial request head, and hand CONNECTs to [`handle_connect`] together
//! with the raw stream. The stream is handed over as plain TCP when the
//! head parse consumed nothing beyond the blank line, so the tunnel relay
//! can use half-close; any early bytes (e.g. an eager ClientHello) are
//! replayed through a rewind wrapper instead. Non-CONNECT traffic is
//! answered 501 — plain forwarding belongs to a full HTTP front, not this
//! core.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::connect::handle_connect;
use crate::context::ConnectRequest;
use crate::error::ProxyError;
use crate::proxy::Proxy;
use crate::relay::{ClientStream, RewindStream};
use crate::wire::MessageReader;

/// Accept and dispatch connections until [`Proxy::shutdown`] is called.
pub async fn serve(proxy: Arc<Proxy>, listener: TcpListener) -> std::io::Result<()> {
    let mut shutdown = proxy.shutdown_rx();
    info!(addr = ?listener.local_addr().ok(), "proxy listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let proxy = Arc::clone(&proxy);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(proxy, stream, peer).await {
                                debug!(peer = %peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_client(
    proxy: Arc<Proxy>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let mut reader = MessageReader::with_max_body(stream, proxy.max_body());
    let head = match reader.read_request().await? {
        Some(head) => head,
        None => return Ok(()),
    };
    let (mut stream, leftover) = reader.into_parts();

    if head.method != "CONNECT" {
        debug!(peer = %peer, method = %head.method, "refusing non-CONNECT request");
        stream
            .write_all(b"HTTP/1.1 501 Not Implemented\r\nConnection: close\r\n\r\n")
            .await?;
        let _ = stream.shutdown().await;
        return Ok(());
    }

    let mut connect = ConnectRequest::new(head.uri);
    connect.headers = head.headers;
    connect.remote_addr = Some(peer);

    let client = if leftover.is_empty() {
        ClientStream::Tcp(stream)
    } else {
        ClientStream::boxed(RewindStream::new(leftover.freeze(), stream))
    };

    handle_connect(proxy, connect, client).await;
    Ok(())
}
