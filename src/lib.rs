//! Host-runtime binding for a native publish/subscribe messaging fabric.
//!
//! Native callbacks arrive on SDK-owned threads and are funnelled through
//! per-entity bridges into a single-threaded [`HostLoop`]; blocking native
//! calls run on a worker pool and complete back on the host thread.

pub mod config;
pub mod error;
pub mod host;
pub mod message;
pub mod native;
pub mod publication;
pub mod replay;
pub mod session;
pub mod subscription;

pub use config::{
    AckMode, BridgeSettings, ConnectOptions, ReplayOptions, SendOptions, SubscriptionOptions,
};
pub use error::{BridgeError, BridgeResult, FatalListenerError, ListenerResult, LockResultExt};
pub use host::{EventKind, HostLoop, LifecycleState, ListenerId, LoopHandle, RunOutcome};
pub use message::{HostMessage, HostValue, OutboundMessage};
pub use native::sim::SimulatedFabric;
pub use native::{FabricApi, Qos, Status, Timestamp};
pub use publication::{Publication, PublicationEventKind, SendResult};
pub use replay::{Replay, ReplayEvent, ReplayEventKind};
pub use session::{
    SaturationPolicy, Session, SessionEvent, SessionEventKind, connect, connect_blocking,
};
pub use subscription::{AckOutcome, Subscription, SubscriptionEvent, SubscriptionEventKind};
