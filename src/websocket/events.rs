use serde_json::json;

use crate::error::ErrorCode;
use crate::protocol::Envelope;

// ── Client-to-server event names ─────────────────────────────────────────────

pub const EVENT_AUTH: &str = "auth";
pub const EVENT_SUBSCRIBE: &str = "subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";
pub const EVENT_BROADCAST: &str = "broadcast";
pub const EVENT_TRIGGER: &str = "trigger";
pub const EVENT_CLOSE: &str = "close";

// ── Server-to-client event names ─────────────────────────────────────────────

pub const EVENT_CONNECTED: &str = "__connected__";
pub const EVENT_AUTHENTICATED: &str = "__authenticated__";
pub const EVENT_SUBSCRIBED: &str = "__subscribed__";
pub const EVENT_UNSUBSCRIBED: &str = "__unsubscribed__";
pub const EVENT_CLOSED: &str = "__closed__";
pub const EVENT_ERROR: &str = "__error__";
pub const EVENT_HEARTBEAT: &str = "__heartbeat__";

// ── Frame constructors ───────────────────────────────────────────────────────

pub fn connected() -> String {
    Envelope::new(EVENT_CONNECTED, json!({})).encode()
}

pub fn authenticated() -> String {
    Envelope::new(EVENT_AUTHENTICATED, json!({})).encode()
}

pub fn subscribed(channel: &str) -> String {
    Envelope::new(EVENT_SUBSCRIBED, json!({ "channel": channel })).encode()
}

pub fn unsubscribed(channel: &str) -> String {
    Envelope::new(EVENT_UNSUBSCRIBED, json!({ "channel": channel })).encode()
}

pub fn closed() -> String {
    Envelope::new(EVENT_CLOSED, json!({})).encode()
}

pub fn heartbeat() -> String {
    Envelope::new(EVENT_HEARTBEAT, json!({})).encode()
}

pub fn error(code: ErrorCode) -> String {
    Envelope::new(EVENT_ERROR, json!({ "code": code })).encode()
}
