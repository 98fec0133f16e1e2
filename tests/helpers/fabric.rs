//! A simulated fabric with one connected session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fabric_bridge::{
    ConnectOptions, HostLoop, RunOutcome, SaturationPolicy, Session, SimulatedFabric,
    connect_blocking,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn options() -> ConnectOptions {
    ConnectOptions::new("user", "pass", "10.0.0.1")
}

pub fn gd_options(max_outstanding: u32, policy: SaturationPolicy) -> ConnectOptions {
    options()
        .with_guaranteed_delivery("it-client", max_outstanding)
        .with_saturation_policy(policy)
}

pub struct Fixture {
    pub host: HostLoop,
    pub sim: SimulatedFabric,
    pub session: Session,
}

impl Fixture {
    pub fn connect() -> Self {
        Self::with_options(options())
    }

    pub fn with_gd(max_outstanding: u32, policy: SaturationPolicy) -> Self {
        Self::with_options(gd_options(max_outstanding, policy))
    }

    pub fn with_options(options: ConnectOptions) -> Self {
        let host = HostLoop::new().expect("host loop");
        let sim = SimulatedFabric::new();
        let session =
            connect_blocking(&host.handle(), Arc::new(sim.clone()), options).expect("connect");
        Self { host, sim, session }
    }

    pub fn run_until(&mut self, done: impl FnMut() -> bool) -> bool {
        super::polling::run_until(&mut self.host, TIMEOUT, done)
    }

    /// Wait until every received-message handle has been released.
    pub fn wait_released(&mut self) -> bool {
        let sim = self.sim.clone();
        self.run_until(|| sim.stats().live_messages == 0)
    }

    /// Close the session and wait for the loop to go idle.
    pub fn close(mut self) -> SimulatedFabric {
        self.session.close_blocking().expect("close");
        assert_eq!(
            self.host.run_for(Duration::from_secs(2)),
            RunOutcome::Idle,
            "host loop should be idle after close"
        );
        self.sim
    }
}

/// Thread-safe event log shared with listeners.
#[derive(Debug)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.0.lock().unwrap().push(item);
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}
