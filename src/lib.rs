//! WebRocket — a hybrid message broker bridging untrusted WebSocket clients
//! and trusted TCP workers across isolated vhosts.
//!
//! The [`Context`] owns the vhost registry and acts as the factory for the
//! two endpoints: the frontend [`websocket`] endpoint (browser clients
//! subscribing to channels) and the [`backend`] endpoint (workers that
//! publish, administer vhost state, and serve RPC requests).

pub mod auth;
pub mod backend;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod vhost;
pub mod websocket;
pub mod worker;

pub use config::{BrokerConfig, Config};
pub use context::Context;
pub use error::{BrokerError, BrokerResult, ErrorCode};
