//! Intercept everything and log each request/response pair.
//!
//! ```sh
//! RUST_LOG=middleman=debug,basic_proxy=info cargo run --example basic_proxy
//! curl --proxy http://127.0.0.1:8080 --cacert ca.crt https://example.com/
//! ```

use middleman::{ConnectAction, ConnectDecision, Proxy, ProxyConfig};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ProxyConfig::from_env()?;
    let mut proxy = Proxy::from_config(&config)?;

    if let Some(authority) = proxy.authority() {
        info!(
            "CA ready; install it in the client trust store:\n{}",
            authority.ca_pem()
        );
    }

    proxy.on_connect(|host, _ctx| Some(ConnectDecision::new(ConnectAction::mitm_tls(), host)));
    proxy.add_request_filter(|req, ctx| {
        info!(session = ctx.session, method = %req.method, uri = %req.uri, "request");
        (req, None)
    });
    proxy.add_response_filter(|resp, ctx| {
        info!(session = ctx.session, status = %resp.status, "response");
        resp
    });

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    middleman::serve(Arc::new(proxy), listener).await?;
    Ok(())
}
