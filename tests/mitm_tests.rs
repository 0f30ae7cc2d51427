//! MITM session tests
//!
//! Full tunnels over real sockets: TLS interception with forged
//! certificates (SNI and CONNECT-host keyed), the forced response framing
//! inside intercepted tunnels, request-filter short-circuits, and the
//! plaintext tunnel variant.

use middleman::{
    CertificateAuthority, ConnectAction, ConnectDecision, Proxy, ProxyConfig, Response,
};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const CONNECT_OK: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

async fn start_proxy(proxy: Proxy) -> (SocketAddr, Arc<Proxy>) {
    let proxy = Arc::new(proxy);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(middleman::serve(Arc::clone(&proxy), listener));
    (addr, proxy)
}

fn trust_only(der: CertificateDer<'static>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(der).unwrap();
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

async fn connect_through(proxy_addr: SocketAddr, target: &str) -> TcpStream {
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut ok = [0u8; 19];
    client.read_exact(&mut ok).await.unwrap();
    assert_eq!(&ok, CONNECT_OK);
    client
}

/// TLS origin for 127.0.0.1 answering each request with a fixed response.
async fn start_tls_origin(response: &'static [u8]) -> (SocketAddr, CertificateDer<'static>) {
    let ca = CertificateAuthority::ephemeral().unwrap();
    let forged = ca.sign_host(&["127.0.0.1".to_string()]).unwrap();
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(forged.chain.clone(), forged.key.clone_key())
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let mut tls = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(_) => return,
                };
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if tls.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }
                let _ = tls.write_all(response).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    (addr, ca.ca_der())
}

#[tokio::test]
async fn tls_mitm_forces_chunked_close_framing() {
    let (origin_addr, origin_ca) =
        start_tls_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\n\r\nhello")
            .await;

    let mitm_ca = CertificateAuthority::ephemeral().unwrap();
    let trusted = mitm_ca.ca_der();

    let mut proxy = Proxy::new(&ProxyConfig::default()).unwrap();
    proxy.set_authority(mitm_ca);
    proxy.set_upstream_tls(trust_only(origin_ca));
    proxy.on_connect(|host, _| Some(ConnectDecision::new(ConnectAction::mitm_tls(), host)));
    let (proxy_addr, _proxy) = start_proxy(proxy).await;

    let client = connect_through(proxy_addr, &origin_addr.to_string()).await;

    // No SNI from the test client, so the CONNECT host keys the forge
    let mut tls_config = ClientConfig::builder()
        .with_root_certificates({
            let mut roots = RootCertStore::empty();
            roots.add(trusted).unwrap();
            roots
        })
        .with_no_client_auth();
    tls_config.enable_sni = false;
    let connector = TlsConnector::from(Arc::new(tls_config));
    let mut tls = connector
        .connect(ServerName::try_from("127.0.0.1").unwrap(), client)
        .await
        .unwrap();

    tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();
    tls.shutdown().await.unwrap();

    let mut raw = Vec::new();
    let _ = tls.read_to_end(&mut raw).await;
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.contains("x-origin: yes\r\n"));
    assert!(!text.to_lowercase().contains("content-length"));
    assert!(text.ends_with("5\r\nhello\r\n0\r\n\r\n"), "got: {text}");
}

#[tokio::test]
async fn sni_overrides_connect_host_for_forging() {
    let mitm_ca = CertificateAuthority::ephemeral().unwrap();
    let trusted = mitm_ca.ca_der();

    let mut proxy = Proxy::new(&ProxyConfig::default()).unwrap();
    proxy.set_authority(mitm_ca);
    proxy.on_connect(|host, _| Some(ConnectDecision::new(ConnectAction::mitm_tls(), host)));
    let (proxy_addr, _proxy) = start_proxy(proxy).await;

    // CONNECT names a bare IP; the ClientHello names real.example. The
    // handshake only succeeds if the forged certificate is for the SNI.
    let client = connect_through(proxy_addr, "10.0.0.1:443").await;
    let connector = TlsConnector::from(trust_only(trusted));
    let mut tls = connector
        .connect(ServerName::try_from("real.example").unwrap(), client)
        .await
        .expect("handshake must present a certificate for the SNI");

    tls.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let _ = tls.read_to_end(&mut rest).await;
}

#[tokio::test]
async fn request_filter_short_circuits_without_upstream() {
    let mitm_ca = CertificateAuthority::ephemeral().unwrap();
    let trusted = mitm_ca.ca_der();

    let mut proxy = Proxy::new(&ProxyConfig::default()).unwrap();
    proxy.set_authority(mitm_ca);
    proxy.on_connect(|host, _| Some(ConnectDecision::new(ConnectAction::mitm_tls(), host)));
    proxy.set_custom_dial(|_addr: String| async {
        Err(std::io::Error::other("short-circuit must not dial"))
    });
    proxy.add_request_filter(|req, _ctx| {
        let resp = Response::with_body(http::StatusCode::FORBIDDEN, "blocked");
        (req, Some(resp))
    });
    let (proxy_addr, _proxy) = start_proxy(proxy).await;

    let client = connect_through(proxy_addr, "blocked.test:443").await;
    let connector = TlsConnector::from(trust_only(trusted));
    let mut tls = connector
        .connect(ServerName::try_from("blocked.test").unwrap(), client)
        .await
        .unwrap();

    tls.write_all(b"GET /anything HTTP/1.1\r\nHost: blocked.test\r\n\r\n")
        .await
        .unwrap();
    tls.shutdown().await.unwrap();

    let mut raw = Vec::new();
    let _ = tls.read_to_end(&mut raw).await;
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {text}");
    assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    assert!(text.ends_with("7\r\nblocked\r\n0\r\n\r\n"), "got: {text}");
}

#[tokio::test]
async fn websocket_upgrade_is_bridged_through_tls() {
    // TLS origin that records the upgrade request, accepts it, then echoes
    // one frame back through the tunnel
    let origin_ca = CertificateAuthority::ephemeral().unwrap();
    let forged = origin_ca.sign_host(&["127.0.0.1".to_string()]).unwrap();
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(forged.chain.clone(), forged.key.clone_key())
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let origin_root = origin_ca.ca_der();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();

    let seen_handshake = Arc::new(Mutex::new(String::new()));
    let captured = Arc::clone(&seen_handshake);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = match acceptor.accept(stream).await {
            Ok(tls) => tls,
            Err(_) => return,
        };

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if tls.read_exact(&mut byte).await.is_err() {
                return;
            }
            head.push(byte[0]);
        }
        *captured.lock().unwrap() = String::from_utf8_lossy(&head).into_owned();

        tls.write_all(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

        let mut frame = [0u8; 5];
        if tls.read_exact(&mut frame).await.is_err() {
            return;
        }
        let _ = tls.write_all(&frame).await;
        let _ = tls.shutdown().await;
    });

    let mitm_ca = CertificateAuthority::ephemeral().unwrap();
    let trusted = mitm_ca.ca_der();

    let mut proxy = Proxy::new(&ProxyConfig::default()).unwrap();
    proxy.set_authority(mitm_ca);
    proxy.set_upstream_tls(trust_only(origin_root));
    proxy.on_connect(|host, _| Some(ConnectDecision::new(ConnectAction::mitm_tls(), host)));
    let (proxy_addr, _proxy) = start_proxy(proxy).await;

    let client = connect_through(proxy_addr, &origin_addr.to_string()).await;
    let mut tls_config = ClientConfig::builder()
        .with_root_certificates({
            let mut roots = RootCertStore::empty();
            roots.add(trusted).unwrap();
            roots
        })
        .with_no_client_auth();
    tls_config.enable_sni = false;
    let connector = TlsConnector::from(Arc::new(tls_config));
    let mut tls = connector
        .connect(ServerName::try_from("127.0.0.1").unwrap(), client)
        .await
        .unwrap();

    tls.write_all(
        b"GET /chat HTTP/1.1\r\nHost: 127.0.0.1\r\n\
          Connection: Upgrade\r\nUpgrade: websocket\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .await
    .unwrap();

    // The origin's 101 reaches the client through the relay untouched
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    while !reply.ends_with(b"\r\n\r\n") {
        tls.read_exact(&mut byte).await.unwrap();
        reply.push(byte[0]);
    }
    let reply = String::from_utf8_lossy(&reply).into_owned();
    assert!(
        reply.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "got: {reply}"
    );
    assert!(reply.contains("Upgrade: websocket\r\n"));

    // Frames relay both ways after the handshake
    tls.write_all(b"frame").await.unwrap();
    let mut echoed = [0u8; 5];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"frame");

    // The upgrade request was replayed to the origin with its handshake
    // headers intact and the proxy-level headers gone
    let handshake = seen_handshake.lock().unwrap().clone();
    assert!(
        handshake.starts_with(&format!(
            "GET /chat HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n",
            origin_addr.port()
        )),
        "got: {handshake}"
    );
    assert!(handshake.contains("upgrade: websocket\r\n"));
    assert!(handshake.contains("connection: Upgrade\r\n"));
    assert!(handshake.contains("sec-websocket-key: dGhlIHNhbXBsZQ==\r\n"));

    let _ = tls.shutdown().await;
}

#[tokio::test]
async fn plaintext_mitm_pumps_pairs_over_one_origin_connection() {
    // Plain HTTP origin serving two requests on one connection
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for _ in 0..2 {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if stream.read_exact(&mut byte).await.is_err() {
                    return;
                }
                head.push(byte[0]);
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        }
    });

    let seen_uris = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen_uris);

    let mut proxy = Proxy::new(&ProxyConfig::default()).unwrap();
    proxy.on_connect(|host, _| Some(ConnectDecision::new(ConnectAction::MitmHttp, host)));
    proxy.add_request_filter(move |req, _ctx| {
        recorded.lock().unwrap().push(req.uri.clone());
        (req, None)
    });
    let (proxy_addr, _proxy) = start_proxy(proxy).await;

    let mut client = connect_through(proxy_addr, &origin_addr.to_string()).await;

    for path in ["/a", "/b"] {
        client
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: app.test\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\nok") {
            client.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.contains("Content-Length: 2\r\n"));
    }
    drop(client);

    let uris = seen_uris.lock().unwrap().clone();
    assert_eq!(
        uris,
        vec![
            format!("http://{origin_addr}/a"),
            format!("http://{origin_addr}/b"),
        ]
    );
}
