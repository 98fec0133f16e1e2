//! Contract of the native messaging fabric SDK.
//!
//! The SDK is consumed as an opaque collaborator through [`FabricApi`]. Its
//! calls may block and are not thread-safe with respect to one object, so the
//! binding only invokes them from worker threads (or inline for the blocking
//! variants). Callbacks registered with the SDK run on SDK-owned threads and
//! must only post into an `AsyncBridge`.
//!
//! [`sim::SimulatedFabric`] is an in-process implementation used by the
//! tests and the demo binary.

pub mod logger;
pub mod sim;
pub mod status;

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use status::Status;

use crate::error::BridgeError;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

native_handle!(
    /// Native session handle.
    SessionHandle
);
native_handle!(
    /// Native guaranteed-delivery context handle.
    GdHandle
);
native_handle!(
    /// Native publisher handle.
    PublisherHandle
);
native_handle!(
    /// Native outbound message under construction.
    OutboundHandle
);
native_handle!(
    /// Native subscription handle.
    SubscriptionHandle
);
native_handle!(
    /// Native replay session handle.
    ReplayHandle
);

/// Received native message.
///
/// Deliberately neither `Clone` nor `Copy`: the handle is released by
/// passing it by value to [`FabricApi::message_release`], so it can be
/// released at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MessageHandle(u64);

impl MessageHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Microseconds since the Unix epoch, the native datetime representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1000)
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub const fn as_millis(self) -> u64 {
        self.0 / 1000
    }

    /// Drop sub-millisecond precision.
    pub const fn truncated_to_millis(self) -> Self {
        Self::from_millis(self.as_millis())
    }

    /// Elapsed time from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let micros = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_micros(ts.0)
    }
}

/// Delivery strength of a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum Qos {
    #[serde(rename = "BE")]
    BestEffort,
    #[default]
    #[serde(rename = "GC")]
    GuaranteedConnected,
    #[serde(rename = "GD")]
    GuaranteedDelivery,
}

impl Qos {
    pub fn is_guaranteed_delivery(self) -> bool {
        self == Qos::GuaranteedDelivery
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Qos::BestEffort => "BE",
            Qos::GuaranteedConnected => "GC",
            Qos::GuaranteedDelivery => "GD",
        }
    }
}

impl FromStr for Qos {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BE" => Ok(Qos::BestEffort),
            "GC" => Ok(Qos::GuaranteedConnected),
            "GD" => Ok(Qos::GuaranteedDelivery),
            _ => Err(BridgeError::invalid_argument(format!(
                "Invalid QoS '{s}' (expected BE, GC or GD)"
            ))),
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layout of an outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageForm {
    /// Fields follow the topic's registered schema.
    #[default]
    TopicSchema,
    /// Field names and types travel with the message.
    SelfDescribing,
}

/// A typed native field value, one variant per native type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    DateTime(Timestamp),
    String(String),
    BooleanArray(Vec<bool>),
    ByteArray(Vec<i8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    DateTimeArray(Vec<Timestamp>),
    StringArray(Vec<String>),
    /// Binary or nested payload the binding has no host representation for.
    Opaque(Vec<u8>),
}

/// One field read from a received message.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeField {
    pub name: String,
    pub value: NativeValue,
}

/// Position of a field iteration over a received message.
#[derive(Debug, Default)]
pub struct FieldCursor {
    position: usize,
}

impl FieldCursor {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn advance(&mut self) {
        self.position += 1;
    }
}

/// Header of a received message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub topic: String,
    pub generation_time: Timestamp,
    pub receive_time: Timestamp,
    /// Set on the final message of a replay.
    pub is_last: bool,
}

/// Payload accompanying a session notification.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NotificationData {
    #[default]
    None,
    /// Ack-window slot echoed back by a GD outcome.
    Correlation(u32),
    /// Connected broker addresses, active first.
    Addresses(Vec<IpAddr>),
}

/// Login parameters handed to the native session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub primary_tmx: String,
    pub secondary_tmx: Option<String>,
    pub timeout: Duration,
}

/// Session and GD-context notification callback.
pub type NotificationCallback = Arc<dyn Fn(Status, NotificationData) + Send + Sync>;
/// Message arrival callback for subscriptions and replays.
pub type MessageCallback = Arc<dyn Fn(MessageHandle) + Send + Sync>;
/// Replay control notification callback.
pub type ReplayNotificationCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// Operations consumed from the native messaging fabric SDK.
///
/// Every call returns a [`Status`] (or a value/`Status` pair); none panic on
/// failure. Calls taking a handle may block.
pub trait FabricApi: Send + Sync {
    fn session_new(&self, on_notify: NotificationCallback) -> Result<SessionHandle, Status>;
    fn session_login(&self, session: SessionHandle, login: &LoginRequest) -> Status;
    fn session_terminate(&self, session: SessionHandle) -> Status;

    fn gd_context_new(
        &self,
        session: SessionHandle,
        client_name: &str,
        on_notify: NotificationCallback,
    ) -> Result<GdHandle, Status>;
    fn gd_context_configure(&self, gd: GdHandle, max_outstanding: u32) -> Status;
    fn gd_context_init(&self, gd: GdHandle) -> Status;
    fn gd_context_terminate(&self, gd: GdHandle) -> Status;

    fn publication_create(
        &self,
        session: SessionHandle,
        topic: &str,
    ) -> Result<PublisherHandle, Status>;
    fn publication_qos(&self, publisher: PublisherHandle) -> Result<Qos, Status>;
    fn publication_cancel(&self, publisher: PublisherHandle) -> Status;

    fn message_create(
        &self,
        publisher: PublisherHandle,
        topic: &str,
        form: MessageForm,
        field_count: usize,
    ) -> Result<OutboundHandle, Status>;
    fn message_set_field(&self, message: OutboundHandle, name: &str, value: &NativeValue)
    -> Status;
    fn message_send(&self, message: OutboundHandle, blocking: bool) -> Status;
    fn gd_message_send(&self, gd: GdHandle, message: OutboundHandle, correlation: u32) -> Status;
    fn message_destroy(&self, message: OutboundHandle);

    fn subscribe(
        &self,
        session: SessionHandle,
        topic: &str,
        qos: Qos,
        cache_period_ms: u32,
        on_message: MessageCallback,
    ) -> Result<SubscriptionHandle, Status>;
    fn gd_subscribe(
        &self,
        gd: GdHandle,
        name: &str,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<SubscriptionHandle, Status>;
    fn subscription_terminate(&self, subscription: SubscriptionHandle) -> Status;
    fn gd_subscription_terminate(&self, subscription: SubscriptionHandle) -> Status;

    fn message_header(&self, message: &MessageHandle) -> Result<MessageHeader, Status>;
    /// Next field of `message`, or `Err(Status::NO_FIELDS_REMAINING)`.
    fn message_next_field(
        &self,
        message: &MessageHandle,
        cursor: &mut FieldCursor,
    ) -> Result<NativeField, Status>;
    fn gd_message_ack(&self, message: &MessageHandle) -> Status;
    fn message_release(&self, message: MessageHandle);

    fn replay_create(
        &self,
        session: SessionHandle,
        topic: &str,
        start: Timestamp,
        end: Timestamp,
        on_message: MessageCallback,
        on_notify: ReplayNotificationCallback,
    ) -> Result<ReplayHandle, Status>;
    fn replay_pause(&self, replay: ReplayHandle) -> Status;
    fn replay_resume(&self, replay: ReplayHandle) -> Status;
    fn replay_release(&self, replay: ReplayHandle) -> Status;

    fn log_open(&self, file: &Path, tag: &str) -> Status;
    fn log_close(&self) -> Status;
    fn log_level(&self) -> u32;
    fn log_set_level(&self, level: u32) -> Status;
    fn log_write(&self, level: u32, text: &str) -> Status;
}
