//! Native status codes.
//!
//! Every native call reports a [`Status`]. `OK` is the single success value;
//! every other value names a failure reason or, for notification streams, an
//! event. [`Status::description`] is the status-to-string lookup.

use std::fmt;

use crate::error::{BridgeError, BridgeResult};

/// Status code returned by every native SDK call and carried by notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(u32);

impl Status {
    pub const OK: Status = Status(0);
    pub const ERROR: Status = Status(1);
    pub const INVALID_ARGUMENT: Status = Status(2);
    pub const INVALID_HANDLE: Status = Status(3);
    pub const NOT_IMPLEMENTED: Status = Status(4);
    pub const NO_FIELDS_REMAINING: Status = Status(5);
    pub const NOT_CONNECTED: Status = Status(6);
    pub const TIMEOUT: Status = Status(7);
    pub const LOGIN_FAILED: Status = Status(10);
    pub const PERMISSION_DENIED: Status = Status(11);
    pub const GD_NOT_INITIALIZED: Status = Status(20);
    pub const GD_MAX_OUTSTANDING: Status = Status(21);
    pub const GD_ACK_RECEIVED: Status = Status(100);
    pub const GD_MSG_TIMEOUT: Status = Status(101);
    pub const GD_TOO_MANY_RETRANSMITS: Status = Status(102);
    pub const TMX_CONNECTED: Status = Status(110);
    pub const TMX_CONNECTED_FT: Status = Status(111);
    pub const TMX_CONNECTION_FAILED: Status = Status(112);
    pub const TMX_RECONNECTED: Status = Status(113);
    pub const GDS_COMM_LOST: Status = Status(120);
    pub const GDS_COMM_RESTORED: Status = Status(121);
    pub const SESSION_TERMINATED: Status = Status(130);
    pub const REPLAY_PAUSED: Status = Status(140);
    pub const REPLAY_RESUMED: Status = Status(141);
    pub const REPLAY_NO_DATA: Status = Status(142);
    pub const REPLAY_FAILED: Status = Status(143);

    /// Wrap a raw code received from the native layer.
    pub const fn from_code(code: u32) -> Self {
        Status(code)
    }

    pub const fn code(self) -> u32 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == Self::OK.0
    }

    /// Human-readable description of the status.
    pub fn description(self) -> &'static str {
        match self {
            Self::OK => "OK",
            Self::ERROR => "General error",
            Self::INVALID_ARGUMENT => "Invalid argument",
            Self::INVALID_HANDLE => "Invalid handle",
            Self::NOT_IMPLEMENTED => "Not implemented",
            Self::NO_FIELDS_REMAINING => "No fields remaining",
            Self::NOT_CONNECTED => "Not connected",
            Self::TIMEOUT => "Operation timed out",
            Self::LOGIN_FAILED => "Login failed",
            Self::PERMISSION_DENIED => "Permission denied",
            Self::GD_NOT_INITIALIZED => "GD context not initialized",
            Self::GD_MAX_OUTSTANDING => "GD maximum outstanding messages reached",
            Self::GD_ACK_RECEIVED => "GD acknowledgment received",
            Self::GD_MSG_TIMEOUT => "GD message timed out",
            Self::GD_TOO_MANY_RETRANSMITS => "GD message exceeded retransmit limit",
            Self::TMX_CONNECTED => "Connected to TMX",
            Self::TMX_CONNECTED_FT => "Connected to fault-tolerant TMX pair",
            Self::TMX_CONNECTION_FAILED => "TMX connection lost",
            Self::TMX_RECONNECTED => "TMX connection restored",
            Self::GDS_COMM_LOST => "GDS communication lost",
            Self::GDS_COMM_RESTORED => "GDS communication restored",
            Self::SESSION_TERMINATED => "Session terminated",
            Self::REPLAY_PAUSED => "Replay paused",
            Self::REPLAY_RESUMED => "Replay resumed",
            Self::REPLAY_NO_DATA => "No messages in replay range",
            Self::REPLAY_FAILED => "Replay failed",
            _ => "Unknown status",
        }
    }

    /// `Ok(())` for `OK`, otherwise a native failure naming `operation`.
    pub fn check(self, operation: &'static str) -> BridgeResult<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(BridgeError::native(operation, self))
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn only_ok_is_success() {
        assert!(Status::OK.is_ok());
        assert!(!Status::ERROR.is_ok());
        assert!(!Status::GD_ACK_RECEIVED.is_ok());
    }

    #[rstest]
    #[case(Status::OK, "OK")]
    #[case(Status::LOGIN_FAILED, "Login failed")]
    #[case(Status::GD_MSG_TIMEOUT, "GD message timed out")]
    #[case(Status::from_code(9999), "Unknown status")]
    fn description_lookup(#[case] status: Status, #[case] expected: &str) {
        assert_eq!(status.description(), expected);
        assert_eq!(status.to_string(), expected);
    }

    #[test]
    fn check_maps_failure_to_native_error() {
        assert_eq!(Status::OK.check("send"), Ok(()));
        assert_eq!(
            Status::NOT_CONNECTED.check("send"),
            Err(BridgeError::native("send", Status::NOT_CONNECTED))
        );
    }
}
