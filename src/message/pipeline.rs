//! Received-message path shared by subscriptions and replays.
//!
//! Native thread: [`MessageSink::deliver`] extracts the message into a
//! [`MessageEvent`] and posts it through the owner's bridge. Host thread: the
//! owner calls [`MessageEvent::into_host`] and then settles the native
//! handle according to its [`Settlement`].
//!
//! The native handle lives in an [`OwnedMessage`], which releases it on drop
//! unless it was consumed by [`OwnedMessage::acknowledge`] or
//! [`OwnedMessage::release`]. Every exit path (entity no longer in use,
//! extraction failure, refused post, listener failure) therefore releases
//! the handle exactly once.

use std::fmt;
use std::sync::Arc;

use super::{AckToken, HostMessage, MessageFieldData};
use crate::config::AckMode;
use crate::host::{AsyncBridge, EntityLifecycle};
use crate::native::{FabricApi, FieldCursor, MessageHandle, Qos, Status, Timestamp};

/// A native message handle that is released when dropped.
pub(crate) struct OwnedMessage {
    api: Arc<dyn FabricApi>,
    handle: Option<MessageHandle>,
}

impl OwnedMessage {
    pub(crate) fn new(api: Arc<dyn FabricApi>, handle: MessageHandle) -> Self {
        Self {
            api,
            handle: Some(handle),
        }
    }

    fn handle(&self) -> Option<&MessageHandle> {
        self.handle.as_ref()
    }

    /// GD-acknowledge, then release. Blocking; worker threads only.
    pub(crate) fn acknowledge(mut self) -> Status {
        match self.handle.take() {
            Some(handle) => {
                let status = self.api.gd_message_ack(&handle);
                self.api.message_release(handle);
                status
            }
            None => Status::INVALID_HANDLE,
        }
    }

    pub(crate) fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.api.message_release(handle);
        }
    }
}

impl Drop for OwnedMessage {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.api.message_release(handle);
        }
    }
}

impl fmt::Debug for OwnedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedMessage")
            .field("handle", &self.handle)
            .finish()
    }
}

/// A received message in neutral form, queued for the host thread.
#[derive(Debug)]
pub(crate) struct MessageEvent {
    pub(crate) topic: String,
    pub(crate) generation_time: Timestamp,
    pub(crate) receive_time: Timestamp,
    pub(crate) is_last: bool,
    pub(crate) fields: Vec<MessageFieldData>,
    pub(crate) native: OwnedMessage,
}

/// What happens to the native handle after listeners ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// GD with automatic acknowledgment
    AutoAck,
    /// GD with manual acknowledgment; the application owns the handle
    Manual,
    /// Anything else: release unconditionally
    Release,
}

impl Settlement {
    pub(crate) fn for_subscription(qos: Qos, ack_mode: AckMode) -> Self {
        match (qos, ack_mode) {
            (Qos::GuaranteedDelivery, AckMode::Auto) => Settlement::AutoAck,
            (Qos::GuaranteedDelivery, AckMode::Manual) => Settlement::Manual,
            _ => Settlement::Release,
        }
    }
}

impl MessageEvent {
    /// Read header and fields from a native message.
    ///
    /// Fields whose type has no host representation are skipped. Iteration
    /// ends at `NO_FIELDS_REMAINING`; any other failure drops the message,
    /// releasing its handle.
    pub(crate) fn extract(api: &dyn FabricApi, native: OwnedMessage) -> Result<Self, Status> {
        let Some(handle) = native.handle() else {
            return Err(Status::INVALID_HANDLE);
        };
        let header = api.message_header(handle)?;
        let mut fields = Vec::new();
        let mut cursor = FieldCursor::default();
        loop {
            match api.message_next_field(handle, &mut cursor) {
                Ok(field) => {
                    let name = field.name.clone();
                    match MessageFieldData::from_native(field) {
                        Some(data) => fields.push(data),
                        None => log::debug!(
                            target: "fabric_bridge::subscription",
                            "Skipping field '{}' on {}: unsupported type",
                            name,
                            header.topic
                        ),
                    }
                }
                Err(status) if status == Status::NO_FIELDS_REMAINING => break,
                Err(status) => return Err(status),
            }
        }
        Ok(Self {
            topic: header.topic,
            generation_time: header.generation_time,
            receive_time: header.receive_time,
            is_last: header.is_last,
            fields,
            native,
        })
    }

    /// Build the host object. With [`Settlement::Manual`] the handle moves
    /// into the message's ack token and `None` is returned; otherwise the
    /// handle is handed back for the owner to settle after dispatch.
    pub(crate) fn into_host(self, settlement: Settlement) -> (HostMessage, Option<OwnedMessage>) {
        let MessageEvent {
            topic,
            generation_time,
            receive_time,
            is_last,
            fields,
            native,
        } = self;
        let (ack, native) = match settlement {
            Settlement::Manual => (Some(AckToken::new(native)), None),
            Settlement::AutoAck | Settlement::Release => (None, Some(native)),
        };
        let message = HostMessage {
            topic,
            generation_time,
            receive_time,
            is_last,
            fields: fields.iter().map(MessageFieldData::to_host).collect(),
            ack,
        };
        (message, native)
    }
}

/// Native-thread entry point of a subscription or replay message stream.
pub(crate) struct MessageSink<S> {
    api: Arc<dyn FabricApi>,
    lifecycle: Arc<EntityLifecycle>,
    bridge: AsyncBridge<S>,
    wrap: fn(MessageEvent) -> S,
}

impl<S: Send + 'static> MessageSink<S> {
    pub(crate) fn new(
        api: Arc<dyn FabricApi>,
        lifecycle: Arc<EntityLifecycle>,
        bridge: AsyncBridge<S>,
        wrap: fn(MessageEvent) -> S,
    ) -> Self {
        Self {
            api,
            lifecycle,
            bridge,
            wrap,
        }
    }

    /// Handle one message-arrival callback. Runs on a native thread.
    pub(crate) fn deliver(&self, handle: MessageHandle) {
        let native = OwnedMessage::new(Arc::clone(&self.api), handle);
        if !self.lifecycle.in_use() {
            log::trace!(
                target: "fabric_bridge::subscription",
                "Dropping message for closed {}",
                self.lifecycle.entity()
            );
            return;
        }
        let event = match MessageEvent::extract(self.api.as_ref(), native) {
            Ok(event) => event,
            Err(status) => {
                log::warn!(
                    target: "fabric_bridge::subscription",
                    "Dropping unreadable message for {}: {}",
                    self.lifecycle.entity(),
                    status
                );
                return;
            }
        };
        if self.bridge.post((self.wrap)(event)).is_err() {
            log::trace!(
                target: "fabric_bridge::subscription",
                "Bridge closed, releasing message for {}",
                self.lifecycle.entity()
            );
        }
    }
}
