use serde_json::{json, Value};

use crate::error::ErrorCode;
use crate::protocol::Envelope;

// ── Worker-to-broker frames ──────────────────────────────────────────────────

pub const FRAME_IDENTIFY: &str = "IDENTIFY";
pub const FRAME_PUBLISH: &str = "PUBLISH";
pub const FRAME_OPEN_CHANNEL: &str = "OPEN_CHANNEL";
pub const FRAME_DELETE_CHANNEL: &str = "DELETE_CHANNEL";
pub const FRAME_ADD_USER: &str = "ADD_USER";
pub const FRAME_DELETE_USER: &str = "DELETE_USER";
pub const FRAME_REQUEST_TOKEN: &str = "REQUEST_SINGLE_ACCESS_TOKEN";
pub const FRAME_ACK: &str = "ACK";

// ── Broker-to-worker frames ──────────────────────────────────────────────────

pub const FRAME_OK: &str = "OK";
pub const FRAME_TOKEN: &str = "TOKEN";
pub const FRAME_RPC: &str = "RPC";
pub const FRAME_ERROR: &str = "ERROR";

// ── Frame constructors ───────────────────────────────────────────────────────

pub fn ok() -> String {
    Envelope::new(FRAME_OK, json!({})).encode()
}

pub fn token(token: &str) -> String {
    Envelope::new(FRAME_TOKEN, json!({ "token": token })).encode()
}

pub fn error(code: ErrorCode) -> String {
    Envelope::new(FRAME_ERROR, json!({ "code": code })).encode()
}

/// RPC request handed to exactly one READY worker.
pub fn rpc(event: &str, data: Value) -> String {
    Envelope::new(FRAME_RPC, json!({ "event": event, "data": data })).encode()
}
