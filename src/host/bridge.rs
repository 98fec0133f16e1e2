//! Thread-safe event queue feeding the host loop.
//!
//! Any thread may [`post`](AsyncBridge::post); only the host thread drains.
//! Wakes coalesce: at most one wake per bridge is outstanding, and the drain
//! empties the whole queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{HandleId, LoopHandle};
use crate::error::LockResultExt;

struct BridgeQueue<E> {
    events: VecDeque<E>,
    closed: bool,
}

struct BridgeShared<E> {
    id: HandleId,
    label: &'static str,
    queue: Mutex<BridgeQueue<E>>,
    wake_pending: AtomicBool,
    host: LoopHandle,
}

/// A FIFO queue plus wake signal owned by one entity.
pub(crate) struct AsyncBridge<E> {
    shared: Arc<BridgeShared<E>>,
}

impl<E> Clone for AsyncBridge<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Send + 'static> AsyncBridge<E> {
    pub(crate) fn new(host: &LoopHandle, label: &'static str) -> Self {
        Self {
            shared: Arc::new(BridgeShared {
                id: host.allocate_handle_id(),
                label,
                queue: Mutex::new(BridgeQueue {
                    events: VecDeque::new(),
                    closed: false,
                }),
                wake_pending: AtomicBool::new(false),
                host: host.clone(),
            }),
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.shared.id
    }

    /// Register `drain` in the host arena and flush anything queued before
    /// activation.
    pub(crate) fn activate(&self, drain: impl Fn() + Send + Sync + 'static) {
        let shared = &self.shared;
        shared.host.register(shared.id, Arc::new(drain));
        shared.wake_pending.store(false, Ordering::Release);
        if !self.is_empty() {
            self.signal();
        }
        log::debug!(
            target: "fabric_bridge::bridge",
            "Activated {} bridge {}",
            shared.label,
            shared.id
        );
    }

    /// Enqueue an event from any thread.
    ///
    /// Returns the event back if the bridge is closed; the caller disposes of
    /// it. The queue does not grow in that case.
    pub(crate) fn post(&self, event: E) -> Result<(), E> {
        {
            let mut queue = self.shared.queue.lock().recover_poison("AsyncBridge::post");
            if queue.closed {
                return Err(event);
            }
            queue.events.push_back(event);
        }
        self.signal();
        Ok(())
    }

    fn signal(&self) {
        if !self.shared.wake_pending.swap(true, Ordering::AcqRel) {
            self.shared.host.wake(self.shared.id);
        }
    }

    /// Pop and dispatch queued events in FIFO order. Host thread only.
    ///
    /// Each event is fully dispatched before the next is popped; the queue
    /// lock is not held while `dispatch` runs. Stops early if `dispatch`
    /// closes the bridge.
    pub(crate) fn drain(&self, mut dispatch: impl FnMut(E)) -> usize {
        self.shared.wake_pending.store(false, Ordering::Release);
        let mut dispatched = 0;
        loop {
            let next = {
                let mut queue = self.shared.queue.lock().recover_poison("AsyncBridge::drain");
                if queue.closed {
                    None
                } else {
                    queue.events.pop_front()
                }
            };
            match next {
                Some(event) => {
                    dispatch(event);
                    dispatched += 1;
                }
                None => break,
            }
        }
        dispatched
    }

    /// Tear the bridge down. Returns the undispatched events the first time,
    /// an empty list afterwards.
    pub(crate) fn close(&self) -> Vec<E> {
        let leftover = {
            let mut queue = self.shared.queue.lock().recover_poison("AsyncBridge::close");
            if queue.closed {
                return Vec::new();
            }
            queue.closed = true;
            queue.events.drain(..).collect::<Vec<_>>()
        };
        self.shared.host.unregister(self.shared.id);
        log::debug!(
            target: "fabric_bridge::bridge",
            "Closed {} bridge {} ({} undelivered)",
            self.shared.label,
            self.shared.id,
            leftover.len()
        );
        leftover
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared
            .queue
            .lock()
            .recover_poison("AsyncBridge::is_closed")
            .closed
    }

    pub(crate) fn len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .recover_poison("AsyncBridge::len")
            .events
            .len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostLoop, RunOutcome};
    use std::time::Duration;

    fn recording_bridge(host: &HostLoop) -> (AsyncBridge<u32>, Arc<Mutex<Vec<u32>>>) {
        let bridge = AsyncBridge::new(&host.handle(), "test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let drain_bridge = bridge.clone();
        let sink = Arc::clone(&seen);
        bridge.activate(move || {
            drain_bridge.drain(|event| sink.lock().unwrap().push(event));
        });
        (bridge, seen)
    }

    #[test]
    fn events_dispatch_in_post_order() {
        let mut host = HostLoop::new().unwrap();
        let (bridge, seen) = recording_bridge(&host);
        for i in 0..10 {
            bridge.post(i).unwrap();
        }
        host.run_nowait();
        assert_eq!(*seen.lock().unwrap(), (0..10u32).collect::<Vec<_>>());
        bridge.close();
    }

    #[test]
    fn sequential_posts_from_different_threads_keep_order() {
        let mut host = HostLoop::new().unwrap();
        let (bridge, seen) = recording_bridge(&host);
        for chunk in 0..4u32 {
            let poster = bridge.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    poster.post(chunk * 25 + i).unwrap();
                }
            })
            .join()
            .unwrap();
        }
        host.run_nowait();
        assert_eq!(*seen.lock().unwrap(), (0..100u32).collect::<Vec<_>>());
        bridge.close();
    }

    #[test]
    fn concurrent_posters_preserve_per_thread_order() {
        let mut host = HostLoop::new().unwrap();
        let (bridge, seen) = recording_bridge(&host);
        let posters: Vec<_> = (0..4u32)
            .map(|thread| {
                let poster = bridge.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        poster.post(thread * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for poster in posters {
            poster.join().unwrap();
        }
        host.run_nowait();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1000);
        for thread in 0..4u32 {
            let own: Vec<u32> = seen
                .iter()
                .copied()
                .filter(|v| v / 1000 == thread)
                .collect();
            assert_eq!(own, (0..250).map(|i| thread * 1000 + i).collect::<Vec<_>>());
        }
        bridge.close();
    }

    #[test]
    fn post_after_close_is_refused_without_growing_queue() {
        let mut host = HostLoop::new().unwrap();
        let (bridge, seen) = recording_bridge(&host);
        bridge.post(1).unwrap();
        let leftover = bridge.close();
        assert_eq!(leftover, vec![1]);
        assert_eq!(bridge.post(2), Err(2));
        assert_eq!(bridge.len(), 0);
        assert!(bridge.is_closed());
        assert_eq!(host.run_for(Duration::from_millis(50)), RunOutcome::Idle);
        assert!(seen.lock().unwrap().is_empty());
        assert!(bridge.close().is_empty(), "second close is a no-op");
    }

    #[test]
    fn events_posted_before_activation_are_flushed() {
        let mut host = HostLoop::new().unwrap();
        let bridge: AsyncBridge<u32> = AsyncBridge::new(&host.handle(), "test");
        bridge.post(7).unwrap();
        bridge.post(8).unwrap();
        host.run_nowait();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let drain_bridge = bridge.clone();
        bridge.activate(move || {
            drain_bridge.drain(|event| sink.lock().unwrap().push(event));
        });
        host.run_nowait();
        assert_eq!(*seen.lock().unwrap(), [7, 8]);
        bridge.close();
    }

    #[test]
    fn dispatch_that_closes_the_bridge_stops_draining() {
        let mut host = HostLoop::new().unwrap();
        let bridge: AsyncBridge<u32> = AsyncBridge::new(&host.handle(), "test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let drain_bridge = bridge.clone();
        bridge.activate(move || {
            let closer = drain_bridge.clone();
            drain_bridge.drain(|event| {
                sink.lock().unwrap().push(event);
                if event == 2 {
                    closer.close();
                }
            });
        });
        for i in 1..=4 {
            bridge.post(i).unwrap();
        }
        host.run_nowait();
        assert_eq!(*seen.lock().unwrap(), [1, 2]);
        assert!(!host.is_alive());
    }
}
