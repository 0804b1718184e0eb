use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth;
use crate::backend::BackendEndpoint;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::vhost::Vhost;
use crate::websocket::WebsocketEndpoint;

/// Process-wide root owning the vhost registry and the shutdown machinery.
///
/// Cheaply cloneable — all clones share the same underlying state via `Arc`.
/// The root is explicit, not a singleton: every endpoint receives the
/// `Context` it was constructed from.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    vhosts: RwLock<HashMap<String, Arc<Vhost>>>,
    config: BrokerConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Context {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                vhosts: RwLock::new(HashMap::new()),
                config,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Vhost registry
    // ------------------------------------------------------------------------

    /// Create a vhost with a freshly generated secret. The path must be a
    /// non-empty leading-slash path, unique within this context.
    pub async fn add_vhost(&self, path: &str) -> BrokerResult<Arc<Vhost>> {
        auth::validate_vhost_path(path)?;
        let mut vhosts = self.inner.vhosts.write().await;
        if vhosts.contains_key(path) {
            return Err(BrokerError::VhostExists(path.to_owned()));
        }
        let vhost = Arc::new(Vhost::new(path, self.inner.config.token_ttl));
        vhosts.insert(path.to_owned(), vhost.clone());
        tracing::info!(vhost = %path, "vhost created");
        Ok(vhost)
    }

    /// Remove a vhost atomically. Connections already bound to it keep their
    /// handle until they disconnect; new connections no longer resolve it.
    pub async fn delete_vhost(&self, path: &str) -> BrokerResult<()> {
        match self.inner.vhosts.write().await.remove(path) {
            Some(_) => {
                tracing::info!(vhost = %path, "vhost deleted");
                Ok(())
            }
            None => Err(BrokerError::VhostNotFound(path.to_owned())),
        }
    }

    pub async fn vhost(&self, path: &str) -> BrokerResult<Arc<Vhost>> {
        self.inner
            .vhosts
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| BrokerError::VhostNotFound(path.to_owned()))
    }

    pub async fn vhost_paths(&self) -> Vec<String> {
        self.inner.vhosts.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Endpoint factory
    // ------------------------------------------------------------------------

    pub fn websocket_endpoint(&self, host: &str, port: u16) -> WebsocketEndpoint {
        WebsocketEndpoint::new(self.clone(), host, port)
    }

    pub fn backend_endpoint(&self, host: &str, port: u16) -> BackendEndpoint {
        BackendEndpoint::new(self.clone(), host, port)
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel every connection task and wait until each has released its
    /// channel memberships and worker-pool entries. No event is delivered
    /// after this returns.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("context shut down");
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
