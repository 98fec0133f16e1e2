//! Host-loop polling for integration tests.
//!
//! Listeners only run while the host loop is pumped, so tests drive the loop
//! in short slices and check their condition in between.

use std::thread;
use std::time::{Duration, Instant};

use fabric_bridge::{HostLoop, RunOutcome};

const SLICE: Duration = Duration::from_millis(5);

/// Pump `host` until `done` holds. Returns false on timeout.
pub fn run_until<F>(host: &mut HostLoop, timeout: Duration, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        // An idle loop returns at once; completions may still be in flight
        // on native threads.
        if host.run_for(SLICE) == RunOutcome::Idle {
            thread::sleep(SLICE);
        }
    }
}

/// Pump `host` for the whole of `duration`.
pub fn run_for(host: &mut HostLoop, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if host.run_for(SLICE) == RunOutcome::Idle {
            thread::sleep(SLICE);
        }
    }
}
