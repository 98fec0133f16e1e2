//! Lifecycle state machine shared by sessions, subscriptions, replays and
//! publications.

use std::sync::RwLock;

use crate::error::{BridgeError, BridgeResult, LockResultExt};

/// State of a long-lived entity.
///
/// State transitions:
/// - Created -> Active (native start succeeded, bridge registered with the host loop)
/// - Created -> Closed (native start failed)
/// - Active -> Draining (stop/close confirmed by the worker)
/// - Active | Draining -> Closed (terminal event delivered, bridge torn down)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, native start in progress
    Created,
    /// Registered with the host loop, accepts events and operations
    Active,
    /// Stop issued; events still delivered, operations rejected
    Draining,
    /// Bridge torn down, keep-alive released (terminal state)
    Closed,
}

pub(crate) struct EntityLifecycle {
    entity: &'static str,
    state: RwLock<LifecycleState>,
}

impl EntityLifecycle {
    pub(crate) fn new(entity: &'static str) -> Self {
        Self {
            entity,
            state: RwLock::new(LifecycleState::Created),
        }
    }

    pub(crate) fn entity(&self) -> &'static str {
        self.entity
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.read().recover_poison("EntityLifecycle::state")
    }

    /// Created -> Active.
    pub(crate) fn activate(&self) -> bool {
        self.transition(&[LifecycleState::Created], LifecycleState::Active)
    }

    /// Active -> Draining.
    pub(crate) fn begin_draining(&self) -> bool {
        self.transition(&[LifecycleState::Active], LifecycleState::Draining)
    }

    /// Any non-terminal state -> Closed. Returns true exactly once.
    pub(crate) fn close(&self) -> bool {
        self.transition(
            &[
                LifecycleState::Created,
                LifecycleState::Active,
                LifecycleState::Draining,
            ],
            LifecycleState::Closed,
        )
    }

    /// Whether native events for this entity should still be queued.
    pub(crate) fn in_use(&self) -> bool {
        self.state() != LifecycleState::Closed
    }

    /// Reject new operations unless Active.
    pub(crate) fn ensure_accepting(&self) -> BridgeResult<()> {
        if self.state() == LifecycleState::Active {
            Ok(())
        } else {
            Err(BridgeError::closed(self.entity))
        }
    }

    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        let mut guard = self.state.write().recover_poison("EntityLifecycle::transition");
        if !from.contains(&*guard) {
            log::debug!(
                target: "fabric_bridge::host",
                "Refused {} transition {:?} -> {:?}",
                self.entity,
                *guard,
                to
            );
            return false;
        }
        log::trace!(
            target: "fabric_bridge::host",
            "{} {:?} -> {:?}",
            self.entity,
            *guard,
            to
        );
        *guard = to;
        true
    }
}
