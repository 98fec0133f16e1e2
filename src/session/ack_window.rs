//! Guaranteed-delivery acknowledgment window.
//!
//! GD sends are correlated with their eventual outcome only by a small
//! integer the native layer echoes back. The window is a fixed ring of
//! `capacity` slots; the slot index is that integer. Slots are handed out
//! round-robin by a counter guarded by its own lock.
//!
//! What happens when the next slot is still waiting for its outcome is
//! governed by [`SaturationPolicy`].

use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Deserialize;

use crate::error::{BridgeError, BridgeResult, LockResultExt};

/// Behaviour of [`GdAckWindow::acquire`] when the next slot is occupied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    /// Fail the new send with [`BridgeError::GdWindowFull`].
    #[default]
    Reject,
    /// Evict the waiting entry; it is completed with
    /// [`BridgeError::GdWindowOverwritten`].
    Overwrite,
}

impl FromStr for SaturationPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(SaturationPolicy::Reject),
            "overwrite" => Ok(SaturationPolicy::Overwrite),
            _ => Err(BridgeError::invalid_argument(format!(
                "Invalid saturation policy '{s}' (expected reject or overwrite)"
            ))),
        }
    }
}

/// Context stored in a slot until the send's outcome is known.
pub trait GdCompletion: Send + 'static {
    fn complete(self, result: BridgeResult<()>);
}

impl<F> GdCompletion for F
where
    F: FnOnce(BridgeResult<()>) + Send + 'static,
{
    fn complete(self, result: BridgeResult<()>) {
        self(result)
    }
}

/// Identifies one occupancy of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GdTicket {
    pub slot: u32,
    serial: u64,
}

/// Result of a successful [`GdAckWindow::acquire`].
#[derive(Debug)]
pub struct Acquired<C> {
    pub ticket: GdTicket,
    /// Entry evicted under [`SaturationPolicy::Overwrite`], with its slot.
    pub evicted: Option<(u32, C)>,
}

struct Entry<C> {
    serial: u64,
    context: C,
}

pub struct GdAckWindow<C> {
    next: Mutex<u32>,
    slots: Vec<Mutex<Option<Entry<C>>>>,
    policy: SaturationPolicy,
    sealed: AtomicBool,
    serial: AtomicU64,
}

impl<C: GdCompletion> GdAckWindow<C> {
    /// A window of `capacity` slots (at least one).
    pub fn new(capacity: u32, policy: SaturationPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            next: Mutex::new(0),
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            policy,
            sealed: AtomicBool::new(false),
            serial: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// Next slot in round-robin order, regardless of occupancy.
    pub fn reserve(&self) -> u32 {
        let mut next = self.next.lock().recover_poison("GdAckWindow::reserve");
        let slot = *next;
        *next = (slot + 1) % self.capacity();
        slot
    }

    /// Store `context` in the next slot.
    ///
    /// On failure the context is handed back with the error so the caller
    /// can complete it: [`BridgeError::SessionTerminated`] once the window is
    /// sealed, [`BridgeError::GdWindowFull`] under [`SaturationPolicy::Reject`]
    /// when the slot is occupied (the counter does not advance).
    pub fn acquire(&self, context: C) -> Result<Acquired<C>, (C, BridgeError)> {
        let mut next = self.next.lock().recover_poison("GdAckWindow::acquire");
        let slot = *next;
        let mut entry = self.slots[slot as usize]
            .lock()
            .recover_poison("GdAckWindow::acquire");

        // Checked under the slot lock so fail_all cannot miss this entry.
        if self.sealed.load(Ordering::Acquire) {
            return Err((context, BridgeError::SessionTerminated));
        }

        let evicted = match (entry.take(), self.policy) {
            (None, _) => None,
            (Some(waiting), SaturationPolicy::Reject) => {
                *entry = Some(waiting);
                log::debug!(
                    target: "fabric_bridge::gd",
                    "Ack window full at slot {} ({} outstanding)",
                    slot,
                    self.capacity()
                );
                return Err((
                    context,
                    BridgeError::GdWindowFull {
                        capacity: self.capacity(),
                    },
                ));
            }
            (Some(waiting), SaturationPolicy::Overwrite) => {
                log::warn!(
                    target: "fabric_bridge::gd",
                    "Overwriting unacknowledged GD send in slot {}",
                    slot
                );
                Some((slot, waiting.context))
            }
        };

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        *entry = Some(Entry { serial, context });
        *next = (slot + 1) % self.capacity();
        Ok(Acquired {
            ticket: GdTicket { slot, serial },
            evicted,
        })
    }

    /// Deliver the outcome for `slot`. Returns false if the slot was empty
    /// or out of range.
    pub fn complete(&self, slot: u32, result: BridgeResult<()>) -> bool {
        let Some(cell) = self.slots.get(slot as usize) else {
            log::warn!(
                target: "fabric_bridge::gd",
                "GD outcome for slot {} outside window of {}",
                slot,
                self.capacity()
            );
            return false;
        };
        let entry = cell.lock().recover_poison("GdAckWindow::complete").take();
        match entry {
            Some(entry) => {
                entry.context.complete(result);
                true
            }
            None => {
                log::debug!(
                    target: "fabric_bridge::gd",
                    "GD outcome for empty slot {}",
                    slot
                );
                false
            }
        }
    }

    /// Take the context back if the slot still holds this ticket's entry.
    pub fn retract(&self, ticket: GdTicket) -> Option<C> {
        let cell = self.slots.get(ticket.slot as usize)?;
        let mut entry = cell.lock().recover_poison("GdAckWindow::retract");
        match entry.as_ref() {
            Some(current) if current.serial == ticket.serial => entry.take().map(|e| e.context),
            _ => None,
        }
    }

    /// Seal the window and complete every outstanding entry with `error`.
    /// Later acquires fail with [`BridgeError::SessionTerminated`].
    pub fn fail_all(&self, error: BridgeError) -> usize {
        self.sealed.store(true, Ordering::Release);
        let mut failed = 0;
        for cell in &self.slots {
            let entry = cell.lock().recover_poison("GdAckWindow::fail_all").take();
            if let Some(entry) = entry {
                entry.context.complete(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            log::debug!(
                target: "fabric_bridge::gd",
                "Failed {} outstanding GD sends: {}",
                failed,
                error
            );
        }
        failed
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Number of slots waiting for an outcome.
    pub fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|cell| cell.lock().recover_poison("GdAckWindow::outstanding").is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(&'static str, BridgeResult<()>)>>>;

    fn recorder(log: &Log, name: &'static str) -> impl FnOnce(BridgeResult<()>) + Send + 'static {
        let log = Arc::clone(log);
        move |result| log.lock().unwrap().push((name, result))
    }

    #[test]
    fn reserve_is_round_robin() {
        let window: GdAckWindow<fn(BridgeResult<()>)> =
            GdAckWindow::new(4, SaturationPolicy::Reject);
        let slots: Vec<u32> = (0..5).map(|_| window.reserve()).collect();
        assert_eq!(slots, [0, 1, 2, 3, 0]);
    }

    #[test]
    fn completed_slot_is_reused() {
        let log = Log::default();
        let window = GdAckWindow::new(2, SaturationPolicy::Reject);
        let a = window.acquire(recorder(&log, "a")).ok().unwrap();
        let b = window.acquire(recorder(&log, "b")).ok().unwrap();
        assert_ne!(a.ticket.slot, b.ticket.slot);

        assert!(window.complete(0, Ok(())));
        let c = window.acquire(recorder(&log, "c")).ok().unwrap();
        assert_eq!(c.ticket.slot, 0);
        assert_eq!(log.lock().unwrap().as_slice(), [("a", Ok(()))]);
    }

    #[test]
    fn completion_runs_once() {
        let log = Log::default();
        let window = GdAckWindow::new(1, SaturationPolicy::Reject);
        window.acquire(recorder(&log, "a")).ok().unwrap();
        assert!(window.complete(0, Ok(())));
        assert!(!window.complete(0, Ok(())));
        assert!(!window.complete(7, Ok(())));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn reject_policy_fails_new_send_without_advancing() {
        let log = Log::default();
        let window = GdAckWindow::new(1, SaturationPolicy::Reject);
        window.acquire(recorder(&log, "a")).ok().unwrap();

        let Err((context, error)) = window.acquire(recorder(&log, "b")) else {
            panic!("acquire should fail on a full window");
        };
        assert_eq!(error, BridgeError::GdWindowFull { capacity: 1 });
        context.complete(Err(error));

        window.complete(0, Ok(()));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                ("b", Err(BridgeError::GdWindowFull { capacity: 1 })),
                ("a", Ok(()))
            ]
        );
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn overwrite_policy_hands_back_evicted_entry() {
        let log = Log::default();
        let window = GdAckWindow::new(1, SaturationPolicy::Overwrite);
        window.acquire(recorder(&log, "a")).ok().unwrap();
        let acquired = window.acquire(recorder(&log, "b")).ok().unwrap();

        let (slot, evicted) = acquired.evicted.unwrap();
        assert_eq!(slot, 0);
        evicted.complete(Err(BridgeError::GdWindowOverwritten { slot }));
        window.complete(0, Ok(()));

        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                ("a", Err(BridgeError::GdWindowOverwritten { slot: 0 })),
                ("b", Ok(()))
            ]
        );
    }

    #[test]
    fn retract_only_takes_matching_ticket() {
        let log = Log::default();
        let window = GdAckWindow::new(1, SaturationPolicy::Overwrite);
        let first = window.acquire(recorder(&log, "a")).ok().unwrap().ticket;
        let second = window.acquire(recorder(&log, "b")).ok().unwrap();
        drop(second.evicted);

        assert!(window.retract(first).is_none());
        assert!(window.retract(second.ticket).is_some());
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn fail_all_seals_and_sweeps() {
        let log = Log::default();
        let window = GdAckWindow::new(3, SaturationPolicy::Reject);
        window.acquire(recorder(&log, "a")).ok().unwrap();
        window.acquire(recorder(&log, "b")).ok().unwrap();

        assert_eq!(window.fail_all(BridgeError::SessionTerminated), 2);
        assert!(window.is_sealed());
        let Err((_, error)) = window.acquire(recorder(&log, "c")) else {
            panic!("acquire should fail on a sealed window");
        };
        assert_eq!(error, BridgeError::SessionTerminated);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                ("a", Err(BridgeError::SessionTerminated)),
                ("b", Err(BridgeError::SessionTerminated))
            ]
        );
    }

    #[test]
    fn saturation_policy_parses() {
        assert_eq!(
            "Overwrite".parse::<SaturationPolicy>().unwrap(),
            SaturationPolicy::Overwrite
        );
        assert!("drop".parse::<SaturationPolicy>().is_err());
    }
}
