//! Message data model.
//!
//! Three representations are involved in every message:
//!
//! - [`NativeValue`](crate::native::NativeValue): what the SDK's typed
//!   getters and setters deal in;
//! - [`FieldValue`]: the neutral representation assembled on native threads
//!   and carried through the bridge;
//! - [`HostValue`]: what application listeners see and what they pass to
//!   `send_message`.
//!
//! Conversions between them follow a fixed type table (see [`convert`]).

pub mod convert;
pub(crate) mod pipeline;

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value as JsonValue};

pub use crate::native::Timestamp;
use crate::error::LockResultExt;
use pipeline::OwnedMessage;

/// Neutral field value carried from native threads to the host thread.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    Int32(i32),
    Number(f64),
    Date(Timestamp),
    String(String),
    BooleanArray(Vec<bool>),
    Int16Array(Vec<i16>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    DateArray(Vec<Timestamp>),
    StringArray(Vec<String>),
}

/// One named field of a received message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFieldData {
    pub name: String,
    pub value: FieldValue,
}

/// A value as the host application sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Int32(i32),
    Number(f64),
    /// Host dates carry millisecond precision.
    Date(Timestamp),
    String(String),
    Array(Vec<HostValue>),
}

impl HostValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of `Int32` and `Number` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int32(i) => Some(f64::from(*i)),
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            HostValue::Undefined | HostValue::Null => JsonValue::Null,
            HostValue::Bool(b) => JsonValue::Bool(*b),
            HostValue::Int32(i) => JsonValue::from(*i),
            HostValue::Number(n) => JsonValue::from(*n),
            HostValue::Date(ts) => JsonValue::from(ts.as_millis()),
            HostValue::String(s) => JsonValue::String(s.clone()),
            HostValue::Array(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Int32(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Number(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<Timestamp> for HostValue {
    fn from(value: Timestamp) -> Self {
        HostValue::Date(value.truncated_to_millis())
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(values: Vec<T>) -> Self {
        HostValue::Array(values.into_iter().map(Into::into).collect())
    }
}

/// A named host value.
#[derive(Debug, Clone, PartialEq)]
pub struct HostField {
    pub name: String,
    pub value: HostValue,
}

/// An application message to publish.
///
/// Shared as `Arc<OutboundMessage>` so the send result can hand the
/// application back its own object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    fields: Vec<HostField>,
}

impl OutboundMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, keeping insertion order.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<HostValue>) {
        self.fields.push(HostField {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn fields(&self) -> &[HostField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&HostValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }
}

/// Ownership of a manually acknowledged message's native handle.
///
/// Shared by every clone of the [`HostMessage`]; the handle is taken out
/// exactly once by `Subscription::acknowledge`, or released when the last
/// clone is dropped.
#[derive(Clone)]
pub(crate) struct AckToken(Arc<Mutex<Option<OwnedMessage>>>);

impl AckToken {
    pub(crate) fn new(message: OwnedMessage) -> Self {
        Self(Arc::new(Mutex::new(Some(message))))
    }

    pub(crate) fn take(&self) -> Option<OwnedMessage> {
        self.0.lock().recover_poison("AckToken::take").take()
    }

    fn is_pending(&self) -> bool {
        self.0.lock().recover_poison("AckToken::is_pending").is_some()
    }
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AckToken").field(&self.is_pending()).finish()
    }
}

/// A received message as delivered to listeners.
#[derive(Debug, Clone)]
pub struct HostMessage {
    pub topic: String,
    pub generation_time: Timestamp,
    pub receive_time: Timestamp,
    pub is_last: bool,
    /// Fields in the order the native iterator produced them.
    pub fields: Vec<HostField>,
    pub(crate) ack: Option<AckToken>,
}

impl HostMessage {
    pub fn get(&self, name: &str) -> Option<&HostValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// True while this message still awaits a manual acknowledgment.
    pub fn needs_ack(&self) -> bool {
        self.ack.as_ref().is_some_and(AckToken::is_pending)
    }

    pub fn to_json(&self) -> JsonValue {
        let mut fields = Map::new();
        for field in &self.fields {
            fields.insert(field.name.clone(), field.value.to_json());
        }
        serde_json::json!({
            "topic": self.topic,
            "generationTime": self.generation_time.as_millis(),
            "receiveTime": self.receive_time.as_millis(),
            "lastMessage": self.is_last,
            "fields": JsonValue::Object(fields),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_message_keeps_insertion_order() {
        let message = OutboundMessage::new()
            .with("z", 1)
            .with("a", "text")
            .with("m", true);
        let names: Vec<&str> = message.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
        assert_eq!(message.get("a"), Some(&HostValue::from("text")));
    }

    #[test]
    fn timestamps_become_millisecond_dates() {
        let value = HostValue::from(Timestamp::from_micros(1_234_567));
        assert_eq!(value, HostValue::Date(Timestamp::from_micros(1_234_000)));
    }

    #[test]
    fn host_message_serializes_fields_by_name() {
        let message = HostMessage {
            topic: "A.B".to_string(),
            generation_time: Timestamp::from_millis(10),
            receive_time: Timestamp::from_millis(12),
            is_last: false,
            fields: vec![
                HostField {
                    name: "count".to_string(),
                    value: HostValue::Int32(3),
                },
                HostField {
                    name: "tags".to_string(),
                    value: HostValue::from(vec!["x", "y"]),
                },
            ],
            ack: None,
        };
        let json = message.to_json();
        assert_eq!(json["topic"], "A.B");
        assert_eq!(json["fields"]["count"], 3);
        assert_eq!(json["fields"]["tags"][1], "y");
        assert!(!message.needs_ack());
    }
}
