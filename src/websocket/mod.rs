pub mod events;
pub mod handler;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::context::Context;
use crate::error::{BrokerError, BrokerResult};

pub use handler::websocket_handler;

/// The frontend endpoint: accepts WebSocket upgrades on any vhost path.
///
/// Cheaply cloneable; constructed through [`Context::websocket_endpoint`].
#[derive(Clone)]
pub struct WebsocketEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    context: Context,
    host: String,
    port: u16,
    running: AtomicBool,
    addr_tx: watch::Sender<Option<SocketAddr>>,
}

impl WebsocketEndpoint {
    pub(crate) fn new(context: Context, host: &str, port: u16) -> Self {
        let (addr_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(EndpointInner {
                context,
                host: host.to_owned(),
                port,
                running: AtomicBool::new(false),
                addr_tx,
            }),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/*vhost", get(websocket_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.inner.context.clone())
    }

    fn bind_addr(&self) -> BrokerResult<SocketAddr> {
        format!("{}:{}", self.inner.host, self.inner.port)
            .parse()
            .map_err(|e| BrokerError::Internal(format!("invalid listen address: {e}")))
    }

    /// Serve plaintext WebSocket upgrades until context shutdown. Returns a
    /// bind failure as an error so the launcher can exit non-zero.
    pub async fn listen_and_serve(&self) -> BrokerResult<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr()?).await?;
        let local = listener.local_addr()?;
        self.inner.addr_tx.send_replace(Some(local));
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!(addr = %local, "websocket endpoint listening");

        let cancel = self.inner.context.cancel_token();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;

        self.inner.running.store(false, Ordering::SeqCst);
        result.map_err(BrokerError::from)
    }

    /// Serve WebSocket upgrades over TLS. `cert` and `key` are PEM file
    /// paths; loading them is the only TLS-specific work the core does.
    pub async fn listen_and_serve_tls(
        &self,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> BrokerResult<()> {
        let tls = RustlsConfig::from_pem_file(cert.as_ref(), key.as_ref()).await?;
        let handle = axum_server::Handle::new();

        let cancel = self.inner.context.cancel_token();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        let addr_handle = handle.clone();
        let endpoint = self.clone();
        tokio::spawn(async move {
            if let Some(addr) = addr_handle.listening().await {
                endpoint.inner.addr_tx.send_replace(Some(addr));
                endpoint.inner.running.store(true, Ordering::SeqCst);
                tracing::info!(addr = %addr, "websocket endpoint listening (tls)");
            }
        });

        let result = axum_server::bind_rustls(self.bind_addr()?, tls)
            .handle(handle)
            .serve(self.router().into_make_service())
            .await;

        self.inner.running.store(false, Ordering::SeqCst);
        result.map_err(BrokerError::from)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The bound address, available once the listener is up. `None` before
    /// the first successful bind.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.inner.addr_tx.borrow()
    }

    /// Wait until the listener is bound and return its address. Intended for
    /// tests and launchers that race against `listen_and_serve`.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.inner.addr_tx.subscribe();
        loop {
            if let Some(addr) = *rx.borrow() {
                return Some(addr);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}
