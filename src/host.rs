//! Single-threaded host loop.
//!
//! The host loop is the one execution context in which application listeners
//! and completion callbacks run. Other threads reach it only through a wake
//! channel:
//!
//! - native SDK callback threads post into an [`AsyncBridge`], which sends a
//!   [`Wakeup::Bridge`] for the bridge's arena id;
//! - worker threads running blocking native calls send a
//!   [`Wakeup::Completion`] carrying the host-side continuation.
//!
//! Active entities register a drain function in the loop's handle arena.
//! That registration is the keep-alive: [`HostLoop::run`] returns once the
//! arena is empty and no work item is pending. Closing an entity removes its
//! arena entry, after which wakes for that id are ignored.

mod bridge;
mod lifecycle;
mod listeners;
mod work_pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::HostSettings;
use crate::error::{BridgeError, BridgeResult, FatalListenerError};

pub(crate) use bridge::AsyncBridge;
pub(crate) use lifecycle::EntityLifecycle;
pub use lifecycle::LifecycleState;
pub use listeners::{EventKind, ListenerId};
pub(crate) use listeners::{ListenerTable, guarded};
pub(crate) use work_pool::{Completion, Operation, WorkRequestPool};
pub use work_pool::WorkPoolStats;

/// Arena id of a registered bridge.
pub(crate) type HandleId = u64;

type DrainFn = Arc<dyn Fn() + Send + Sync>;

/// Signal delivered to the host thread.
pub(crate) enum Wakeup {
    /// The bridge with this arena id has queued events.
    Bridge(HandleId),
    /// A worker finished; run its continuation on the host thread.
    Completion(Completion),
}

/// Outcome of [`HostLoop::run_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No registered bridges and no pending work remain.
    Idle,
    /// The timeout elapsed while the loop was still alive.
    TimedOut,
}

/// Receives listener failures caught at the dispatch boundary.
struct FatalHook(Box<dyn Fn(&FatalListenerError) + Send + Sync>);

impl Default for FatalHook {
    fn default() -> Self {
        FatalHook(Box::new(|error| {
            log::error!(target: "fabric_bridge::host", "{}", error);
        }))
    }
}

struct LoopShared {
    wake_tx: Sender<Wakeup>,
    handles: DashMap<HandleId, DrainFn>,
    next_handle: AtomicU64,
    pending_work: AtomicUsize,
    fatal_hook: ArcSwap<FatalHook>,
    workers: tokio::runtime::Handle,
    requests: WorkRequestPool,
}

/// Thread-safe handle to the host loop.
///
/// Cloned into every entity; used to register bridges, wake the loop, queue
/// work onto the worker pool and report listener failures.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub(crate) fn allocate_handle_id(&self) -> HandleId {
        self.shared.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a drain function into the arena (keep-alive).
    pub(crate) fn register(&self, id: HandleId, drain: DrainFn) {
        self.shared.handles.insert(id, drain);
    }

    /// Remove an arena entry. Returns true if it was registered.
    pub(crate) fn unregister(&self, id: HandleId) -> bool {
        self.shared.handles.remove(&id).is_some()
    }

    pub(crate) fn wake(&self, id: HandleId) {
        if self.shared.wake_tx.send(Wakeup::Bridge(id)).is_err() {
            log::trace!(
                target: "fabric_bridge::host",
                "Host loop gone, dropping wake for bridge {}",
                id
            );
        }
    }

    fn send(&self, wakeup: Wakeup) -> bool {
        self.shared.wake_tx.send(wakeup).is_ok()
    }

    /// Hand a listener failure to the fatal hook.
    pub(crate) fn report_fatal(&self, error: FatalListenerError) {
        let hook = self.shared.fatal_hook.load();
        (hook.0)(&error);
    }

    /// Replace the hook receiving listener failures (default: error log).
    pub fn set_fatal_hook(&self, hook: impl Fn(&FatalListenerError) + Send + Sync + 'static) {
        self.shared
            .fatal_hook
            .store(Arc::new(FatalHook(Box::new(hook))));
    }

    /// Number of bridges currently registered.
    pub fn active_handles(&self) -> usize {
        self.shared.handles.len()
    }

    /// Number of queued or running work items.
    pub fn pending_work(&self) -> usize {
        self.shared.pending_work.load(Ordering::Acquire)
    }

    pub fn work_pool_stats(&self) -> WorkPoolStats {
        self.shared.requests.stats()
    }
}

/// The single-threaded host loop.
pub struct HostLoop {
    handle: LoopHandle,
    wake_rx: Receiver<Wakeup>,
    workers: Option<tokio::runtime::Runtime>,
    shutdown_grace: Duration,
}

impl HostLoop {
    pub fn new() -> BridgeResult<Self> {
        Self::with_settings(&HostSettings::default())
    }

    pub fn with_settings(settings: &HostSettings) -> BridgeResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(settings.max_worker_threads.max(1))
            .thread_name("fabric-worker")
            .build()
            .map_err(|e| BridgeError::Worker(format!("failed to start worker pool: {e}")))?;
        let (wake_tx, wake_rx) = mpsc::channel();
        let shared = LoopShared {
            wake_tx,
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            pending_work: AtomicUsize::new(0),
            fatal_hook: ArcSwap::from_pointee(FatalHook::default()),
            workers: runtime.handle().clone(),
            requests: WorkRequestPool::new(settings.work_pool_capacity),
        };
        log::debug!(
            target: "fabric_bridge::host",
            "Host loop started (max {} worker threads, work pool capacity {})",
            settings.max_worker_threads,
            settings.work_pool_capacity
        );
        Ok(Self {
            handle: LoopHandle {
                shared: Arc::new(shared),
            },
            wake_rx,
            workers: Some(runtime),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Whether any bridge is registered or any work item is pending.
    pub fn is_alive(&self) -> bool {
        self.handle.active_handles() > 0 || self.handle.pending_work() > 0
    }

    /// Dispatch until the loop is no longer alive. Returns the number of
    /// wakeups processed.
    pub fn run(&mut self) -> usize {
        let mut dispatched = 0;
        while self.is_alive() {
            match self.wake_rx.recv() {
                Ok(wakeup) => {
                    self.dispatch(wakeup);
                    dispatched += 1;
                }
                Err(_) => break,
            }
        }
        dispatched
    }

    /// Like [`run`](Self::run), but gives up after `timeout`.
    pub fn run_for(&mut self, timeout: Duration) -> RunOutcome {
        let deadline = Instant::now() + timeout;
        while self.is_alive() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return RunOutcome::TimedOut;
            }
            match self.wake_rx.recv_timeout(remaining) {
                Ok(wakeup) => self.dispatch(wakeup),
                Err(RecvTimeoutError::Timeout) => return RunOutcome::TimedOut,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        RunOutcome::Idle
    }

    /// Dispatch whatever is already queued without blocking.
    pub fn run_nowait(&mut self) -> usize {
        let mut dispatched = 0;
        while let Ok(wakeup) = self.wake_rx.try_recv() {
            self.dispatch(wakeup);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch(&self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Bridge(id) => {
                // Clone out of the arena so the drain can unregister itself.
                let drain = self
                    .handle
                    .shared
                    .handles
                    .get(&id)
                    .map(|entry| Arc::clone(entry.value()));
                match drain {
                    Some(drain) => drain(),
                    None => log::trace!(
                        target: "fabric_bridge::host",
                        "Ignoring wake for closed bridge {}",
                        id
                    ),
                }
            }
            Wakeup::Completion(completion) => self.handle.finish_work(completion),
        }
    }
}

impl Drop for HostLoop {
    fn drop(&mut self) {
        if let Some(runtime) = self.workers.take() {
            runtime.shutdown_timeout(self.shutdown_grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn new_loop_is_not_alive() {
        let mut host = HostLoop::new().unwrap();
        assert!(!host.is_alive());
        assert_eq!(host.run(), 0);
        assert_eq!(host.run_for(Duration::from_millis(10)), RunOutcome::Idle);
    }

    #[test]
    fn registered_drain_keeps_loop_alive_and_runs_on_wake() {
        let mut host = HostLoop::new().unwrap();
        let handle = host.handle();
        let calls = Arc::new(Mutex::new(0));
        let id = handle.allocate_handle_id();
        let counter = Arc::clone(&calls);
        handle.register(
            id,
            Arc::new(move || {
                *counter.lock().unwrap() += 1;
            }),
        );
        assert!(host.is_alive());

        handle.wake(id);
        handle.wake(id);
        assert_eq!(host.run_nowait(), 2);
        assert_eq!(*calls.lock().unwrap(), 2);

        assert!(handle.unregister(id));
        handle.wake(id);
        assert_eq!(host.run_nowait(), 1);
        assert_eq!(*calls.lock().unwrap(), 2, "wake after unregister is ignored");
        assert!(!host.is_alive());
    }

    #[test]
    fn run_for_times_out_while_alive() {
        let mut host = HostLoop::new().unwrap();
        let handle = host.handle();
        let id = handle.allocate_handle_id();
        handle.register(id, Arc::new(|| {}));
        assert_eq!(
            host.run_for(Duration::from_millis(20)),
            RunOutcome::TimedOut
        );
        handle.unregister(id);
    }

    #[test]
    fn fatal_hook_can_be_replaced() {
        let host = HostLoop::new().unwrap();
        let handle = host.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        handle.set_fatal_hook(move |error| {
            sink.lock().unwrap().push(error.to_string());
        });
        handle.report_fatal(FatalListenerError::returned(
            "session",
            "notify",
            "listener failed".into(),
        ));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["Uncaught error in session 'notify' listener: listener failed"]
        );
    }
}
