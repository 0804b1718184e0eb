use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::auth::{self, Permissions, User};
use crate::channel::Channel;
use crate::error::{BrokerError, BrokerResult};
use crate::worker::WorkerPool;

#[derive(Debug)]
struct TokenGrant {
    user: String,
    minted_at: Instant,
}

/// A named isolation boundary owning channels, users, single-use tokens, and
/// the worker pool for RPC routing.
///
/// Each table sits behind its own lock; the tables are leaves of the lock
/// order (Context → Vhost → leaf) and are never held across another lock
/// acquisition.
#[derive(Debug)]
pub struct Vhost {
    path: String,
    secret: String,
    token_ttl: Duration,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    users: RwLock<HashMap<String, User>>,
    tokens: Mutex<HashMap<String, TokenGrant>>,
    workers: WorkerPool,
}

impl Vhost {
    pub(crate) fn new(path: impl Into<String>, token_ttl: Duration) -> Self {
        Self {
            path: path.into(),
            secret: auth::generate_secret(),
            token_ttl,
            channels: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            workers: WorkerPool::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The shared secret backend workers present in `IDENTIFY`. Never sent
    /// to frontend clients.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Check a worker's claim to this vhost.
    pub fn authenticate_worker(&self, secret: &str) -> BrokerResult<()> {
        if secret == self.secret {
            Ok(())
        } else {
            Err(BrokerError::Unauthorized)
        }
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    /// Create a channel. Fails `CHANNEL_EXISTS` when the name is taken.
    pub async fn open_channel(&self, name: &str) -> BrokerResult<Arc<Channel>> {
        auth::validate_name(name)?;
        let mut channels = self.channels.write().await;
        if channels.contains_key(name) {
            return Err(BrokerError::ChannelExists(name.to_owned()));
        }
        let channel = Arc::new(Channel::new(name));
        channels.insert(name.to_owned(), channel.clone());
        tracing::info!(vhost = %self.path, channel = %name, "channel opened");
        Ok(channel)
    }

    /// Remove a channel, detaching every subscriber. Their connections stay
    /// open; they simply receive nothing further via this channel.
    pub async fn delete_channel(&self, name: &str) -> BrokerResult<()> {
        let removed = self.channels.write().await.remove(name);
        match removed {
            Some(channel) => {
                channel.detach_all().await;
                tracing::info!(vhost = %self.path, channel = %name, "channel deleted");
                Ok(())
            }
            None => Err(BrokerError::ChannelNotFound(name.to_owned())),
        }
    }

    pub async fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    pub async fn add_user(&self, name: &str, permissions: Permissions) -> BrokerResult<()> {
        auth::validate_name(name)?;
        let mut users = self.users.write().await;
        if users.contains_key(name) {
            return Err(BrokerError::UserExists(name.to_owned()));
        }
        users.insert(name.to_owned(), User::new(name, permissions));
        tracing::info!(vhost = %self.path, user = %name, "user added");
        Ok(())
    }

    /// Delete a user and invalidate every outstanding token bound to them.
    pub async fn delete_user(&self, name: &str) -> BrokerResult<()> {
        if self.users.write().await.remove(name).is_none() {
            return Err(BrokerError::UserNotFound(name.to_owned()));
        }
        self.tokens.lock().await.retain(|_, grant| grant.user != name);
        tracing::info!(vhost = %self.path, user = %name, "user deleted");
        Ok(())
    }

    pub async fn user(&self, name: &str) -> Option<User> {
        self.users.read().await.get(name).cloned()
    }

    // ------------------------------------------------------------------------
    // Single-use access tokens
    // ------------------------------------------------------------------------

    /// Mint a fresh token bound to `user`, valid for one `auth` exchange or
    /// until the TTL elapses.
    pub async fn generate_single_access_token(&self, user: &str) -> BrokerResult<String> {
        if !self.users.read().await.contains_key(user) {
            return Err(BrokerError::UserNotFound(user.to_owned()));
        }
        let token = auth::generate_token();
        self.tokens.lock().await.insert(
            token.clone(),
            TokenGrant {
                user: user.to_owned(),
                minted_at: Instant::now(),
            },
        );
        Ok(token)
    }

    /// Atomically consume a token and resolve the bound user.
    ///
    /// The entry is removed before any further checks, so a second redeem of
    /// the same token always fails regardless of the first one's outcome.
    pub async fn validate_single_access_token(&self, token: &str) -> BrokerResult<User> {
        let grant = self.tokens.lock().await.remove(token);
        let Some(grant) = grant else {
            return Err(BrokerError::InvalidCredentials);
        };
        if grant.minted_at.elapsed() > self.token_ttl {
            tracing::debug!(vhost = %self.path, user = %grant.user, "expired token redeemed");
            return Err(BrokerError::InvalidCredentials);
        }
        // The user may have been deleted between mint and redeem.
        self.user(&grant.user)
            .await
            .ok_or(BrokerError::InvalidCredentials)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
