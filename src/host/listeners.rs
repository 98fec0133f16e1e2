//! Typed listener tables.
//!
//! Each entity declares a closed enum of event kinds and builds its table
//! from an immutable list of the kinds it supports. Registration of a kind
//! outside that list (or of an unknown kind name) fails immediately; emission
//! never has to validate anything.
//!
//! Every registration gets a [`ListenerId`] so a single listener can be
//! removed again. Removals made while the kind is being emitted (including
//! from inside one of its listeners) take effect when that emission ends.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Mutex;

use super::LoopHandle;
use crate::error::{BridgeError, BridgeResult, FatalListenerError, ListenerResult, LockResultExt};

/// A closed set of event kinds for one entity type.
pub trait EventKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Host-facing event name.
    fn name(self) -> &'static str;
}

/// Handle for one registered listener, returned by `on`/`once`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type BoxedListener<E> = Box<dyn FnMut(&E) -> ListenerResult + Send>;

struct Registered<E> {
    id: ListenerId,
    listener: BoxedListener<E>,
    once: bool,
}

struct Listeners<K, E> {
    by_kind: HashMap<K, Vec<Registered<E>>>,
    /// Listeners taken out by a running emission, still counted as registered.
    in_flight: HashMap<ListenerId, K>,
    next_id: u64,
}

pub(crate) struct ListenerTable<K: EventKind, E> {
    entity: &'static str,
    kinds: &'static [K],
    listeners: Mutex<Listeners<K, E>>,
}

impl<K: EventKind, E> ListenerTable<K, E> {
    pub(crate) fn new(entity: &'static str, kinds: &'static [K]) -> Self {
        Self {
            entity,
            kinds,
            listeners: Mutex::new(Listeners {
                by_kind: HashMap::new(),
                in_flight: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub(crate) fn add(
        &self,
        kind: K,
        listener: impl FnMut(&E) -> ListenerResult + Send + 'static,
        once: bool,
    ) -> BridgeResult<ListenerId> {
        if !self.kinds.contains(&kind) {
            return Err(BridgeError::invalid_argument(format!(
                "{} does not emit '{}' events",
                self.entity,
                kind.name()
            )));
        }
        let mut listeners = self.listeners.lock().recover_poison("ListenerTable::add");
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.by_kind.entry(kind).or_default().push(Registered {
            id,
            listener: Box::new(listener),
            once,
        });
        Ok(id)
    }

    /// Register by host-facing name; unknown names are rejected here.
    pub(crate) fn add_named(
        &self,
        name: &str,
        listener: impl FnMut(&E) -> ListenerResult + Send + 'static,
        once: bool,
    ) -> BridgeResult<ListenerId>
    where
        K: FromStr<Err = BridgeError>,
    {
        let kind = name.parse::<K>()?;
        self.add(kind, listener, once)
    }

    /// Drop one listener of `kind`; false if it is not registered.
    pub(crate) fn remove(&self, kind: K, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().recover_poison("ListenerTable::remove");
        if listeners.in_flight.get(&id) == Some(&kind) {
            listeners.in_flight.remove(&id);
            return true;
        }
        let Some(list) = listeners.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|registered| registered.id != id);
        before != list.len()
    }

    /// Drop every listener of `kind`; returns how many were removed.
    pub(crate) fn remove_all(&self, kind: K) -> usize {
        let mut listeners = self.listeners.lock().recover_poison("ListenerTable::remove_all");
        let in_flight = listeners.in_flight.len();
        listeners.in_flight.retain(|_, running| *running != kind);
        let removed = in_flight - listeners.in_flight.len();
        removed
            + listeners
                .by_kind
                .remove(&kind)
                .map(|list| list.len())
                .unwrap_or(0)
    }

    /// Drop every listener. Called once the entity is closed, so listeners
    /// capturing the entity's own handle do not keep it alive.
    pub(crate) fn clear(&self) {
        let mut listeners = self.listeners.lock().recover_poison("ListenerTable::clear");
        listeners.by_kind.clear();
        listeners.in_flight.clear();
    }

    pub(crate) fn count(&self, kind: K) -> usize {
        let listeners = self.listeners.lock().recover_poison("ListenerTable::count");
        let running = listeners
            .in_flight
            .values()
            .filter(|running| **running == kind)
            .count();
        running
            + listeners
                .by_kind
                .get(&kind)
                .map(Vec::len)
                .unwrap_or(0)
    }

    /// Invoke every listener of `kind` in registration order.
    ///
    /// Listeners run without the table lock held, so they may register or
    /// remove listeners. Additions are kept for the next emission; every
    /// listener taken for this emission still runs. Failures are reported to
    /// the fatal hook and do not stop the remaining listeners. Returns the
    /// number of listeners invoked.
    pub(crate) fn emit(&self, host: &LoopHandle, kind: K, event: &E) -> usize {
        let mut current = {
            let mut listeners = self.listeners.lock().recover_poison("ListenerTable::emit");
            let current = match listeners.by_kind.get_mut(&kind) {
                Some(list) => std::mem::take(list),
                None => return 0,
            };
            for registered in &current {
                listeners.in_flight.insert(registered.id, kind);
            }
            current
        };
        let invoked = current.len();
        for registered in current.iter_mut() {
            let listener = &mut registered.listener;
            guarded(host, self.entity, kind.name(), || listener(event));
        }

        let mut listeners = self.listeners.lock().recover_poison("ListenerTable::emit");
        current.retain(|registered| {
            listeners.in_flight.remove(&registered.id).is_some() && !registered.once
        });
        if current.is_empty() {
            return invoked;
        }
        let list = listeners.by_kind.entry(kind).or_default();
        let added = std::mem::replace(list, current);
        list.extend(added);
        invoked
    }
}

/// Run application code, reporting a returned error or panic to the fatal
/// hook. Returns true if the code completed successfully.
pub(crate) fn guarded(
    host: &LoopHandle,
    entity: &'static str,
    event: &'static str,
    f: impl FnOnce() -> ListenerResult,
) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            host.report_fatal(FatalListenerError::returned(entity, event, error));
            false
        }
        Err(payload) => {
            host.report_fatal(FatalListenerError::panicked(entity, event, payload.as_ref()));
            false
        }
    }
}
