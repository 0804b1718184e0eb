use serde_json::{Map, Value};

use crate::error::{BrokerError, BrokerResult};

/// Wire envelope shared by both endpoints: a JSON object with exactly one
/// key naming the event, whose value is an object of named fields.
///
/// ```text
/// {"subscribe": {"channel": "room"}}
/// {"__error__": {"code": "ACCESS_DENIED"}}
/// ```
///
/// Unknown payload fields are ignored by handlers; missing required fields
/// surface as `INVALID_PAYLOAD`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            // Non-object payloads only arise from programmer error; encode
            // them under a conventional key rather than panic.
            other => {
                let mut map = Map::new();
                if !other.is_null() {
                    map.insert("data".to_owned(), other);
                }
                map
            }
        };
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Parse a single text frame into an envelope.
    ///
    /// Fails with `InvalidPayload` when the frame is not valid JSON, is not
    /// an object, has more or fewer than one key, or the value under the
    /// event key is not an object.
    pub fn decode(text: &str) -> BrokerResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BrokerError::InvalidPayload(format!("malformed JSON: {e}")))?;

        let Value::Object(mut outer) = value else {
            return Err(BrokerError::InvalidPayload(
                "envelope must be a JSON object".into(),
            ));
        };

        if outer.len() != 1 {
            return Err(BrokerError::InvalidPayload(format!(
                "envelope must have exactly one key, got {}",
                outer.len()
            )));
        }

        // len() == 1 checked above, so the iterator yields exactly one entry.
        let (event, payload) = outer.iter_mut().next().map(|(k, v)| (k.clone(), v.take()))
            .ok_or_else(|| BrokerError::InvalidPayload("empty envelope".into()))?;

        let Value::Object(payload) = payload else {
            return Err(BrokerError::InvalidPayload(format!(
                "payload of {event:?} must be a JSON object"
            )));
        };

        Ok(Self { event, payload })
    }

    /// Serialize to the single-key wire form.
    pub fn encode(&self) -> String {
        let mut outer = Map::with_capacity(1);
        outer.insert(self.event.clone(), Value::Object(self.payload.clone()));
        // A Map of JSON values cannot fail to serialize.
        serde_json::to_string(&Value::Object(outer)).unwrap_or_default()
    }

    /// Required string field, `INVALID_PAYLOAD` when absent or non-string.
    pub fn str_field(&self, name: &str) -> BrokerResult<&str> {
        self.payload
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrokerError::InvalidPayload(format!(
                    "{}: missing required field {name:?}",
                    self.event
                ))
            })
    }

    /// Optional field, `Null` when absent.
    pub fn field(&self, name: &str) -> Value {
        self.payload.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// Server-reserved event names carry the double-underscore prefix; clients
/// and workers may not publish under them.
pub fn is_reserved_event(name: &str) -> bool {
    name.starts_with("__")
}

/// The frame delivered to channel subscribers for a published event:
/// `{event: {"channel": …, "data": …}}`.
pub fn event_frame(event: &str, channel: &str, data: Value) -> String {
    Envelope::new(event, serde_json::json!({ "channel": channel, "data": data })).encode()
}
