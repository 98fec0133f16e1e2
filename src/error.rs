//! Error handling types for fabric-bridge
//!
//! Native SDK failures never panic: every status code other than
//! [`Status::OK`] is converted into a [`BridgeError`] at the nearest boundary
//! and handed to the completion callback of the operation that caused it.

use std::any::Any;
use std::sync::PoisonError;
use thiserror::Error;

use crate::native::Status;

/// Comprehensive error type for bridge operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// Malformed or missing argument, reported before any native call
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A native SDK call returned a failure status
    #[error("{operation} failed: {status}")]
    Native {
        operation: &'static str,
        status: Status,
    },

    /// Guaranteed-delivery outcome other than an acknowledgment
    #[error("Delivery failed: {status}")]
    Delivery { status: Status },

    /// GD operation requested on a session connected without a GD client name
    #[error("Guaranteed delivery is not enabled for this session")]
    GdNotEnabled,

    /// The next ack-window slot is still waiting for its acknowledgment
    #[error("GD ack window full ({capacity} sends outstanding)")]
    GdWindowFull { capacity: u32 },

    /// The send's ack-window slot was reused before its outcome arrived
    #[error("GD ack window slot {slot} overwritten before acknowledgment")]
    GdWindowOverwritten { slot: u32 },

    /// Operation issued on an entity that is draining or closed
    #[error("{entity} is closed")]
    Closed { entity: &'static str },

    /// The owning session terminated while the operation was outstanding
    #[error("Session terminated")]
    SessionTerminated,

    /// A worker thread failed while running a native call
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Helper functions for common error patterns
impl BridgeError {
    /// Create a parameter validation error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BridgeError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a native failure error
    pub fn native(operation: &'static str, status: Status) -> Self {
        BridgeError::Native { operation, status }
    }

    /// Create a closed-entity error
    pub fn closed(entity: &'static str) -> Self {
        BridgeError::Closed { entity }
    }

    /// Native status carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            BridgeError::Native { status, .. } | BridgeError::Delivery { status } => Some(*status),
            _ => None,
        }
    }
}

/// Helper trait for recovering guards from poisoned locks
pub trait LockResultExt<T> {
    /// Take the guard even if a panicking holder poisoned the lock, logging
    /// the recovery.
    ///
    /// The context parameter identifies which operation triggered lock recovery.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "fabric_bridge::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Value returned by application listeners and completion callbacks.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// How an application listener failed.
#[derive(Debug, Error)]
pub enum ListenerFailure {
    #[error("{0}")]
    Returned(Box<dyn std::error::Error + Send + Sync>),
    #[error("panicked: {0}")]
    Panicked(String),
}

/// An application listener failed during event dispatch.
///
/// Caught at the dispatch boundary and handed to the host's fatal hook. The
/// bridge keeps draining afterwards.
#[derive(Debug, Error)]
#[error("Uncaught error in {entity} '{event}' listener: {cause}")]
pub struct FatalListenerError {
    pub entity: &'static str,
    pub event: &'static str,
    #[source]
    pub cause: ListenerFailure,
}

impl FatalListenerError {
    pub(crate) fn returned(
        entity: &'static str,
        event: &'static str,
        error: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self {
            entity,
            event,
            cause: ListenerFailure::Returned(error),
        }
    }

    pub(crate) fn panicked(
        entity: &'static str,
        event: &'static str,
        payload: &(dyn Any + Send),
    ) -> Self {
        Self {
            entity,
            event,
            cause: ListenerFailure::Panicked(panic_message(payload)),
        }
    }

    /// True if the listener panicked rather than returning an error.
    pub fn is_panic(&self) -> bool {
        matches!(self.cause, ListenerFailure::Panicked(_))
    }
}

/// Extract the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
