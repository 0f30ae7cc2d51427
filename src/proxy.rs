//! The proxy aggregate
//!
//! A [`Proxy`] bundles everything a CONNECT needs: the handler chain that
//! picks an action, the request/response filter chains run inside MITM
//! sessions, the dialer (with optional parent proxy), the certificate
//! authority and its forging cache, the upstream transport, and a shutdown
//! signal observed by the accept loop and every MITM session.

use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::ca::{CaConfig, CertificateAuthority};
use crate::cert_store::CertStore;
use crate::config::ProxyConfig;
use crate::context::ProxyContext;
use crate::dialer::{ConnectRequestHook, Dialer, ParentProxy};
use crate::error::{ProxyError, Result};
use crate::policy::{self, ConnectDecision, ConnectHandler, TlsConfigFactory};
use crate::tls;
use crate::transport::Transport;
use crate::wire::{Request, Response};

/// Inspects or rewrites an inner request; a returned response short-circuits
/// the upstream round trip.
pub type RequestFilter =
    Box<dyn Fn(Request, &mut ProxyContext) -> (Request, Option<Response>) + Send + Sync>;

/// Inspects or rewrites an inner response before it is written back.
pub type ResponseFilter = Box<dyn Fn(Response, &mut ProxyContext) -> Response + Send + Sync>;

/// An intercepting proxy core.
pub struct Proxy {
    handlers: Vec<ConnectHandler>,
    request_filters: Vec<RequestFilter>,
    response_filters: Vec<ResponseFilter>,
    authority: Option<Arc<CertificateAuthority>>,
    cert_store: Option<Arc<CertStore>>,
    dialer: Dialer,
    transport: Transport,
    upstream_tls: Arc<ClientConfig>,
    max_body: usize,
    shutdown: watch::Sender<bool>,
}

impl Proxy {
    /// Build a proxy without a certificate authority. Accept, Reject and the
    /// hijack actions work; TLS MITM requires [`Proxy::set_authority`] or a
    /// per-action TLS config factory.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let upstream_tls = tls::upstream_client_config();
        let dialer = Dialer::from_config(config, Arc::clone(&upstream_tls))?;
        let transport = Transport::new(
            Arc::clone(&upstream_tls),
            Duration::from_secs(config.read_timeout_seconds),
            Duration::from_secs(config.write_timeout_seconds),
            config.max_body_size,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            handlers: Vec::new(),
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            authority: None,
            cert_store: Some(Arc::new(CertStore::new(config.cert_cache_size))),
            dialer,
            transport,
            upstream_tls,
            max_body: config.max_body_size,
            shutdown,
        })
    }

    /// Build a proxy and load (or generate) the CA named by the
    /// configuration.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let mut proxy = Self::new(config)?;
        let authority = CertificateAuthority::load_or_generate(CaConfig {
            cert_path: config.ca_cert_path.clone(),
            key_path: config.ca_key_path.clone(),
            ..Default::default()
        })?;
        proxy.authority = Some(Arc::new(authority));
        Ok(proxy)
    }

    /// Install the CA used for certificate forging. Cached certificates
    /// from a previous CA are dropped.
    pub fn set_authority(&mut self, authority: CertificateAuthority) {
        self.authority = Some(Arc::new(authority));
        if let Some(store) = &self.cert_store {
            store.clear();
        }
    }

    pub fn authority(&self) -> Option<Arc<CertificateAuthority>> {
        self.authority.clone()
    }

    /// Append a CONNECT decision handler. Handlers run in registration
    /// order; the first one returning a decision wins.
    pub fn on_connect<H>(&mut self, handler: H)
    where
        H: Fn(&str, &mut ProxyContext) -> Option<ConnectDecision> + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Append a request filter for MITM'd inner requests.
    pub fn add_request_filter<F>(&mut self, filter: F)
    where
        F: Fn(Request, &mut ProxyContext) -> (Request, Option<Response>) + Send + Sync + 'static,
    {
        self.request_filters.push(Box::new(filter));
    }

    /// Append a response filter for MITM'd inner responses.
    pub fn add_response_filter<F>(&mut self, filter: F)
    where
        F: Fn(Response, &mut ProxyContext) -> Response + Send + Sync + 'static,
    {
        self.response_filters.push(Box::new(filter));
    }

    /// Route outbound CONNECTs through a parent proxy.
    pub fn set_upstream_proxy(&mut self, url: &str) -> Result<()> {
        let parent = ParentProxy::parse(url, Arc::clone(&self.upstream_tls))?;
        self.dialer.set_parent(Some(parent));
        Ok(())
    }

    /// Replace the raw TCP dial used for origins.
    pub fn set_custom_dial<F, Fut>(&mut self, dial: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::io::Result<tokio::net::TcpStream>> + Send + 'static,
    {
        self.dialer.set_custom_dial(dial);
    }

    /// Hook run over the headers of CONNECTs sent to a parent proxy.
    pub fn set_connect_hook(&mut self, hook: ConnectRequestHook) {
        self.dialer.set_connect_hook(hook);
    }

    /// Replace the TLS client configuration used toward origins (upstream
    /// round trips and websocket bridging). Call before `set_upstream_proxy`
    /// if a TLS parent proxy should use it as well.
    pub fn set_upstream_tls(&mut self, tls_config: Arc<ClientConfig>) {
        self.upstream_tls = Arc::clone(&tls_config);
        self.transport.set_tls(tls_config);
    }

    /// Ask every accept loop and MITM session to terminate without waiting
    /// for peer EOF.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn evaluate_connect(&self, host: &str, ctx: &mut ProxyContext) -> ConnectDecision {
        policy::evaluate(&self.handlers, host, ctx)
    }

    pub(crate) fn filter_request(
        &self,
        mut req: Request,
        ctx: &mut ProxyContext,
    ) -> (Request, Option<Response>) {
        for filter in &self.request_filters {
            let (filtered, short_circuit) = filter(req, ctx);
            req = filtered;
            if short_circuit.is_some() {
                return (req, short_circuit);
            }
        }
        (req, None)
    }

    pub(crate) fn filter_response(&self, mut resp: Response, ctx: &mut ProxyContext) -> Response {
        for filter in &self.response_filters {
            resp = filter(resp, ctx);
        }
        resp
    }

    pub(crate) fn default_tls_factory(&self) -> Result<TlsConfigFactory> {
        let authority = self.authority.clone().ok_or(ProxyError::NoAuthority)?;
        Ok(tls::tls_factory_from_ca(authority, self.cert_store.clone()))
    }

    pub(crate) fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn cert_store(&self) -> Option<Arc<CertStore>> {
        self.cert_store.clone()
    }

    pub(crate) fn upstream_tls(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.upstream_tls)
    }

    pub(crate) fn max_body(&self) -> usize {
        self.max_body
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("handlers", &self.handlers.len())
            .field("request_filters", &self.request_filters.len())
            .field("response_filters", &self.response_filters.len())
            .field("has_authority", &self.authority.is_some())
            .field("dialer", &self.dialer)
            .finish()
    }
}
