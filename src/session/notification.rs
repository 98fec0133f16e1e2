//! Session notification router.
//!
//! Native session and GD-context notifications arrive on SDK threads and are
//! posted to the session bridge as [`SessionNotification`]s. On the host
//! thread each one is classified into exactly one outcome:
//!
//! | Status | Outcome |
//! |--------|---------|
//! | GD_ACK_RECEIVED, GD_MSG_TIMEOUT, GD_TOO_MANY_RETRANSMITS | ack-window completion |
//! | TMX_CONNECTED, TMX_CONNECTED_FT | `connection-info` |
//! | TMX_CONNECTION_FAILED | `connection-lost` |
//! | TMX_RECONNECTED | `connection-restored` |
//! | GDS_COMM_LOST / GDS_COMM_RESTORED | `gds-lost` / `gds-restored` |
//! | SESSION_TERMINATED | `close`, then teardown |
//! | anything else | `notify(code, description)` |
//!
//! Connection and GDS events with no registered listener fall back to
//! `notify`.

use std::net::IpAddr;
use std::sync::Arc;

use super::{SessionEvent, SessionEventKind, SessionInner};
use crate::error::{BridgeError, BridgeResult};
use crate::host::LifecycleState;
use crate::native::{NotificationData, Status};

/// A native notification queued for the host thread.
#[derive(Debug)]
pub(crate) struct SessionNotification {
    status: Status,
    data: NotificationData,
}

impl SessionNotification {
    pub(crate) fn new(status: Status, data: NotificationData) -> Self {
        Self { status, data }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Classified {
    GdOutcome { slot: u32, result: BridgeResult<()> },
    Event(SessionEvent),
    Terminated,
    Unclassified(Status),
}

fn connection_info(addresses: &[IpAddr]) -> Option<SessionEvent> {
    let active = *addresses.first()?;
    Some(SessionEvent::ConnectionInfo {
        active,
        standby: addresses.get(1).copied(),
    })
}

pub(crate) fn classify(status: Status, data: &NotificationData) -> Classified {
    match status {
        Status::GD_ACK_RECEIVED | Status::GD_MSG_TIMEOUT | Status::GD_TOO_MANY_RETRANSMITS => {
            let NotificationData::Correlation(slot) = *data else {
                log::warn!(
                    target: "fabric_bridge::gd",
                    "GD outcome {} without correlation id",
                    status
                );
                return Classified::Unclassified(status);
            };
            let result = if status == Status::GD_ACK_RECEIVED {
                Ok(())
            } else {
                Err(BridgeError::Delivery { status })
            };
            Classified::GdOutcome { slot, result }
        }
        Status::TMX_CONNECTED | Status::TMX_CONNECTED_FT => match data {
            NotificationData::Addresses(addresses) => connection_info(addresses)
                .map(Classified::Event)
                .unwrap_or(Classified::Unclassified(status)),
            _ => Classified::Unclassified(status),
        },
        Status::TMX_CONNECTION_FAILED => Classified::Event(SessionEvent::ConnectionLost),
        Status::TMX_RECONNECTED => Classified::Event(SessionEvent::ConnectionRestored),
        Status::GDS_COMM_LOST => Classified::Event(SessionEvent::GdsLost),
        Status::GDS_COMM_RESTORED => Classified::Event(SessionEvent::GdsRestored),
        Status::SESSION_TERMINATED => Classified::Terminated,
        other => Classified::Unclassified(other),
    }
}

impl SessionInner {
    /// Dispatch one notification. Host thread only.
    pub(super) fn route(self: &Arc<Self>, notification: SessionNotification) {
        let SessionNotification { status, data } = notification;
        match classify(status, &data) {
            Classified::GdOutcome { slot, result } => match &self.window {
                Some(window) => {
                    window.complete(slot, result);
                }
                None => log::warn!(
                    target: "fabric_bridge::gd",
                    "GD outcome {} for slot {} on a session without GD",
                    status,
                    slot
                ),
            },
            Classified::Event(event) => {
                let invoked = self.listeners.emit(&self.host, event.kind(), &event);
                if invoked == 0 {
                    self.notify(status);
                }
            }
            Classified::Terminated => self.terminate(),
            Classified::Unclassified(status) => self.notify(status),
        }
    }

    fn notify(&self, status: Status) {
        let invoked = self.listeners.emit(
            &self.host,
            SessionEventKind::Notify,
            &SessionEvent::notify(status),
        );
        if invoked == 0 {
            log::debug!(
                target: "fabric_bridge::session",
                "Unhandled session notification {} ({})",
                status.code(),
                status.description()
            );
        }
    }

    /// Terminal teardown; runs the steps below regardless of listeners.
    fn terminate(self: &Arc<Self>) {
        if self.lifecycle.state() == LifecycleState::Closed {
            return;
        }
        log::info!(target: "fabric_bridge::session", "Session terminated");
        self.listeners
            .emit(&self.host, SessionEventKind::Close, &SessionEvent::Close);

        if self.lifecycle.state() == LifecycleState::Active {
            self.lifecycle.begin_draining();
        }
        for subscription in self.take_subscriptions() {
            subscription.detach();
        }
        for replay in self.take_replays() {
            replay.detach();
        }
        if let Some(window) = &self.window {
            window.fail_all(BridgeError::SessionTerminated);
        }
        let leftovers = self.bridge.close();
        if !leftovers.is_empty() {
            log::debug!(
                target: "fabric_bridge::session",
                "Discarding {} notifications after termination",
                leftovers.len()
            );
        }
        self.lifecycle.close();
        self.listeners.clear();
    }
}
