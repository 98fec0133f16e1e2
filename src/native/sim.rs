//! In-process messaging fabric.
//!
//! `SimulatedFabric` implements [`FabricApi`] without a network: published
//! messages are routed to matching subscriptions of any session, kept in a
//! history for replays, and GD sends are acknowledged through the GD
//! context's notification callback. Like the real SDK, every callback runs on
//! a thread owned by the fabric:
//!
//! - one notifier thread per session for session and GD notifications;
//! - one delivery thread per subscription;
//! - one thread per replay.
//!
//! Terminating a subscription, replay or session joins its threads, so no
//! callback for it runs after the terminate call returns.
//!
//! Test hooks: failure injection ([`SimulatedFabric::fail_next`]), GD ack
//! control ([`GdAckMode`]), connection and GDS events, remote session
//! termination and resource counters ([`SimStats`]).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use tokio_util::sync::CancellationToken;

use super::{
    FabricApi, FieldCursor, GdHandle, LoginRequest, MessageCallback, MessageForm, MessageHandle,
    MessageHeader, NativeField, NativeValue, NotificationCallback, NotificationData,
    OutboundHandle, PublisherHandle, Qos, ReplayHandle, ReplayNotificationCallback,
    SessionHandle, Status, SubscriptionHandle, Timestamp,
};
use crate::error::LockResultExt;

/// Native operations that can be made to fail with [`SimulatedFabric::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOperation {
    SessionNew,
    SessionLogin,
    GdContextNew,
    GdContextInit,
    PublicationCreate,
    PublicationCancel,
    MessageCreate,
    MessageSetField,
    MessageSend,
    GdMessageSend,
    Subscribe,
    SubscriptionTerminate,
    MessageAck,
    ReplayCreate,
    ReplayControl,
}

/// How GD sends are answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GdAckMode {
    /// Acknowledge every send right away.
    #[default]
    Ack,
    /// Keep outcomes until [`SimulatedFabric::release_held_acks`].
    Hold,
    /// Answer every send with this status.
    Fail(Status),
}

/// Resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sessions: usize,
    pub subscriptions: usize,
    pub replays: usize,
    pub publishers: usize,
    /// Received-message handles not yet released.
    pub live_messages: usize,
    /// Outbound messages not yet destroyed.
    pub outbound_messages: usize,
    pub published: u64,
    pub gd_sent: u64,
    pub delivered: u64,
    pub released: u64,
    pub acked: u64,
    /// Releases of unknown or already released handles.
    pub invalid_releases: u64,
    /// Pause or resume calls on unknown or already released replays.
    pub invalid_replay_controls: u64,
}

type Notice = (NotificationCallback, Status, NotificationData);

/// Per-session notification thread.
struct Notifier {
    tx: Sender<Notice>,
    thread: JoinHandle<()>,
}

impl Notifier {
    fn spawn(session: u64) -> Result<Self, Status> {
        let (tx, rx) = mpsc::channel::<Notice>();
        let thread = thread::Builder::new()
            .name(format!("sim-session-{session}"))
            .spawn(move || {
                while let Ok((callback, status, data)) = rx.recv() {
                    callback(status, data);
                }
            })
            .map_err(|_| Status::ERROR)?;
        Ok(Self { tx, thread })
    }

    fn send(&self, callback: &NotificationCallback, status: Status, data: NotificationData) {
        let _ = self.tx.send((Arc::clone(callback), status, data));
    }

    fn shutdown(self) {
        drop(self.tx);
        let _ = self.thread.join();
    }
}

struct SimSession {
    on_notify: NotificationCallback,
    notifier: Notifier,
    logged_in: bool,
}

struct SimGd {
    session: u64,
    client_name: String,
    max_outstanding: u32,
    initialized: bool,
    on_notify: NotificationCallback,
}

struct SimPublisher {
    session: u64,
    topic: String,
}

struct SimOutbound {
    topic: String,
    form: MessageForm,
    fields: Vec<NativeField>,
}

#[derive(Clone)]
struct Delivery {
    topic: String,
    fields: Vec<NativeField>,
    time: Timestamp,
}

struct SimSubscription {
    session: u64,
    pattern: String,
    feeder: Sender<Delivery>,
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

impl SimSubscription {
    fn shutdown(self) {
        self.cancel.cancel();
        drop(self.feeder);
        let _ = self.thread.join();
    }
}

struct ReplayControl {
    paused: Mutex<bool>,
    resumed: Condvar,
    cancel: CancellationToken,
}

impl ReplayControl {
    /// Block while paused; false once cancelled.
    fn wait_while_paused(&self) -> bool {
        let mut paused = self.paused.lock().recover_poison("ReplayControl::wait_while_paused");
        while *paused && !self.cancel.is_cancelled() {
            paused = self
                .resumed
                .wait(paused)
                .recover_poison("ReplayControl::wait_while_paused");
        }
        !self.cancel.is_cancelled()
    }

    fn set_paused(&self, value: bool) {
        *self.paused.lock().recover_poison("ReplayControl::set_paused") = value;
        self.resumed.notify_all();
    }
}

struct SimReplay {
    session: u64,
    control: Arc<ReplayControl>,
    on_notify: ReplayNotificationCallback,
    thread: JoinHandle<()>,
}

impl SimReplay {
    fn shutdown(self) {
        self.control.cancel.cancel();
        self.control.set_paused(false);
        let _ = self.thread.join();
    }
}

struct LiveMessage {
    header: MessageHeader,
    fields: Vec<NativeField>,
}

#[derive(Default)]
struct SimState {
    sessions: HashMap<u64, SimSession>,
    gd_contexts: HashMap<u64, SimGd>,
    publishers: HashMap<u64, SimPublisher>,
    outbound: HashMap<u64, SimOutbound>,
    subscriptions: HashMap<u64, SimSubscription>,
    replays: HashMap<u64, SimReplay>,
    live: HashMap<u64, LiveMessage>,
    history: Vec<Delivery>,
    topic_qos: HashMap<String, Qos>,
    failures: HashMap<SimOperation, Status>,
    gd_ack_mode: GdAckMode,
    held_acks: Vec<(u64, u32)>,
    log_file: Option<(PathBuf, String)>,
    log_level: u32,
    log_lines: Vec<(u32, String)>,
    stats: SimStats,
}

struct SimInner {
    state: Mutex<SimState>,
    next_handle: AtomicU64,
}

impl SimInner {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().recover_poison("SimInner::state")
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn register_live(&self, delivery: Delivery, is_last: bool) -> MessageHandle {
        let id = self.allocate();
        let mut state = self.state();
        state.live.insert(
            id,
            LiveMessage {
                header: MessageHeader {
                    topic: delivery.topic,
                    generation_time: delivery.time,
                    receive_time: Timestamp::now(),
                    is_last,
                },
                fields: delivery.fields,
            },
        );
        state.stats.delivered += 1;
        MessageHandle::new(id)
    }
}

/// Simulated fabric; cheap to clone, clones share state.
#[derive(Clone)]
pub struct SimulatedFabric {
    inner: Arc<SimInner>,
}

impl Default for SimulatedFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// `*` matches one dot-separated segment, a trailing `>` the remainder.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut topic_segments = topic.split('.');
    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some(">"), Some(_)) => return pattern_segments.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn tmx_address(tmx: &str) -> IpAddr {
    let host = tmx.rsplit_once(':').map_or(tmx, |(host, _)| host);
    tmx.parse()
        .or_else(|_| host.parse())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

impl SimulatedFabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.state()
    }

    fn injected(state: &mut SimState, operation: SimOperation) -> Option<Status> {
        state.failures.remove(&operation)
    }

    /// Make the next call of `operation` fail with `status`.
    pub fn fail_next(&self, operation: SimOperation, status: Status) {
        self.state().failures.insert(operation, status);
    }

    /// QoS reported for publishers on `topic` (default GC).
    pub fn set_topic_qos(&self, topic: impl Into<String>, qos: Qos) {
        self.state().topic_qos.insert(topic.into(), qos);
    }

    pub fn set_gd_ack_mode(&self, mode: GdAckMode) {
        self.state().gd_ack_mode = mode;
    }

    pub fn held_acks(&self) -> usize {
        self.state().held_acks.len()
    }

    /// Acknowledge every held GD send, oldest first.
    pub fn release_held_acks(&self) -> usize {
        self.answer_held_acks(Status::GD_ACK_RECEIVED)
    }

    /// Answer every held GD send with `status`.
    pub fn answer_held_acks(&self, status: Status) -> usize {
        let mut state = self.state();
        let held = std::mem::take(&mut state.held_acks);
        let count = held.len();
        for (gd, correlation) in held {
            Self::notify_gd(&state, gd, status, NotificationData::Correlation(correlation));
        }
        count
    }

    fn notify_gd(state: &SimState, gd: u64, status: Status, data: NotificationData) {
        let Some(context) = state.gd_contexts.get(&gd) else {
            return;
        };
        if let Some(session) = state.sessions.get(&context.session) {
            session.notifier.send(&context.on_notify, status, data);
        }
    }

    /// Deliver a session notification to every logged-in session.
    pub fn notify_sessions(&self, status: Status, data: NotificationData) {
        let state = self.state();
        for session in state.sessions.values().filter(|s| s.logged_in) {
            session.notifier.send(&session.on_notify, status, data.clone());
        }
    }

    /// Deliver a notification through every GD context.
    pub fn notify_gd_contexts(&self, status: Status) {
        let state = self.state();
        for gd in state.gd_contexts.keys() {
            Self::notify_gd(&state, *gd, status, NotificationData::None);
        }
    }

    pub fn simulate_connection_lost(&self) {
        self.notify_sessions(Status::TMX_CONNECTION_FAILED, NotificationData::None);
    }

    pub fn simulate_reconnect(&self) {
        self.notify_sessions(Status::TMX_RECONNECTED, NotificationData::None);
    }

    pub fn simulate_gds_lost(&self) {
        self.notify_gd_contexts(Status::GDS_COMM_LOST);
    }

    pub fn simulate_gds_restored(&self) {
        self.notify_gd_contexts(Status::GDS_COMM_RESTORED);
    }

    /// Drop every session as the broker would: subscriptions and replays
    /// stop, then each session receives `SESSION_TERMINATED` as its final
    /// notification.
    pub fn terminate_sessions_remotely(&self) -> usize {
        let ids: Vec<u64> = self.state().sessions.keys().copied().collect();
        for id in &ids {
            let Some((session, subscriptions, replays)) = self.detach_session(*id) else {
                continue;
            };
            for subscription in subscriptions {
                subscription.shutdown();
            }
            for replay in replays {
                replay.shutdown();
            }
            session.notifier.send(
                &session.on_notify,
                Status::SESSION_TERMINATED,
                NotificationData::None,
            );
            session.notifier.shutdown();
        }
        log::debug!(
            target: "fabric_bridge::sim",
            "Terminated {} sessions remotely",
            ids.len()
        );
        ids.len()
    }

    /// Remove a session and everything it owns from the state.
    #[allow(clippy::type_complexity)]
    fn detach_session(
        &self,
        id: u64,
    ) -> Option<(SimSession, Vec<SimSubscription>, Vec<SimReplay>)> {
        let mut state = self.state();
        let session = state.sessions.remove(&id)?;
        state.gd_contexts.retain(|_, gd| gd.session != id);
        state.publishers.retain(|_, publisher| publisher.session != id);
        let sub_ids: Vec<u64> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.session == id)
            .map(|(key, _)| *key)
            .collect();
        let subscriptions = sub_ids
            .iter()
            .filter_map(|key| state.subscriptions.remove(key))
            .collect();
        let replay_ids: Vec<u64> = state
            .replays
            .iter()
            .filter(|(_, replay)| replay.session == id)
            .map(|(key, _)| *key)
            .collect();
        let replays = replay_ids
            .iter()
            .filter_map(|key| state.replays.remove(key))
            .collect();
        Some((session, subscriptions, replays))
    }

    /// Add a message to the replay history without routing it.
    pub fn record_history(
        &self,
        topic: &str,
        fields: Vec<(&str, NativeValue)>,
        generation_time: Timestamp,
    ) {
        let delivery = Delivery {
            topic: topic.to_string(),
            fields: named_fields(fields),
            time: generation_time,
        };
        self.state().history.push(delivery);
    }

    /// Route a message to every matching subscription, as if a remote
    /// publisher had sent it. Also recorded in the history.
    pub fn inject(&self, topic: &str, fields: Vec<(&str, NativeValue)>) {
        Self::publish(&mut self.state(), topic, named_fields(fields));
    }

    /// A live received-message handle, as if delivered by a subscription.
    pub fn fabricate_message(
        &self,
        topic: &str,
        fields: Vec<(&str, NativeValue)>,
        is_last: bool,
    ) -> MessageHandle {
        self.inner.register_live(
            Delivery {
                topic: topic.to_string(),
                fields: named_fields(fields),
                time: Timestamp::now(),
            },
            is_last,
        )
    }

    pub fn stats(&self) -> SimStats {
        let state = self.state();
        SimStats {
            sessions: state.sessions.len(),
            subscriptions: state.subscriptions.len(),
            replays: state.replays.len(),
            publishers: state.publishers.len(),
            live_messages: state.live.len(),
            outbound_messages: state.outbound.len(),
            ..state.stats
        }
    }

    /// Lines accepted by `log_write`.
    pub fn log_lines(&self) -> Vec<(u32, String)> {
        self.state().log_lines.clone()
    }

    /// Client name and window size of a GD context.
    pub fn gd_context_info(&self, gd: GdHandle) -> Option<(String, u32)> {
        self.state()
            .gd_contexts
            .get(&gd.raw())
            .map(|context| (context.client_name.clone(), context.max_outstanding))
    }

    fn publish(state: &mut SimState, topic: &str, fields: Vec<NativeField>) {
        let delivery = Delivery {
            topic: topic.to_string(),
            fields,
            time: Timestamp::now(),
        };
        for subscription in state.subscriptions.values() {
            if topic_matches(&subscription.pattern, topic) {
                let _ = subscription.feeder.send(delivery.clone());
            }
        }
        state.history.push(delivery);
        state.stats.published += 1;
    }

    fn start_subscription(
        &self,
        session: u64,
        pattern: &str,
        on_message: MessageCallback,
    ) -> Result<SubscriptionHandle, Status> {
        let id = self.inner.allocate();
        let (feeder, rx) = mpsc::channel::<Delivery>();
        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(&self.inner);
        let token = cancel.clone();
        let thread = thread::Builder::new()
            .name(format!("sim-subscription-{id}"))
            .spawn(move || run_delivery(weak, rx, token, on_message))
            .map_err(|_| Status::ERROR)?;
        self.state().subscriptions.insert(
            id,
            SimSubscription {
                session,
                pattern: pattern.to_string(),
                feeder,
                cancel,
                thread,
            },
        );
        log::debug!(
            target: "fabric_bridge::sim",
            "Subscription {} on '{}'",
            id,
            pattern
        );
        Ok(SubscriptionHandle::new(id))
    }

    fn stop_subscription(&self, subscription: SubscriptionHandle) -> Status {
        let removed = {
            let mut state = self.state();
            if let Some(status) = Self::injected(&mut state, SimOperation::SubscriptionTerminate) {
                return status;
            }
            state.subscriptions.remove(&subscription.raw())
        };
        match removed {
            Some(subscription) => {
                subscription.shutdown();
                Status::OK
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn logged_in(state: &SimState, session: SessionHandle) -> Result<(), Status> {
        match state.sessions.get(&session.raw()) {
            Some(s) if s.logged_in => Ok(()),
            Some(_) => Err(Status::NOT_CONNECTED),
            None => Err(Status::INVALID_HANDLE),
        }
    }
}

fn named_fields(fields: Vec<(&str, NativeValue)>) -> Vec<NativeField> {
    fields
        .into_iter()
        .map(|(name, value)| NativeField {
            name: name.to_string(),
            value,
        })
        .collect()
}

fn run_delivery(
    sim: Weak<SimInner>,
    rx: Receiver<Delivery>,
    cancel: CancellationToken,
    on_message: MessageCallback,
) {
    while let Ok(delivery) = rx.recv() {
        if cancel.is_cancelled() {
            break;
        }
        let Some(sim) = sim.upgrade() else {
            break;
        };
        let handle = sim.register_live(delivery, false);
        drop(sim);
        on_message(handle);
    }
}

fn run_replay(
    sim: Weak<SimInner>,
    entries: Vec<Delivery>,
    control: Arc<ReplayControl>,
    on_message: MessageCallback,
    on_notify: ReplayNotificationCallback,
) {
    if entries.is_empty() {
        on_notify(Status::REPLAY_NO_DATA);
        return;
    }
    let last = entries.len() - 1;
    for (index, entry) in entries.into_iter().enumerate() {
        if !control.wait_while_paused() {
            return;
        }
        let Some(sim) = sim.upgrade() else {
            return;
        };
        let handle = sim.register_live(entry, index == last);
        drop(sim);
        on_message(handle);
    }
}

impl FabricApi for SimulatedFabric {
    fn session_new(&self, on_notify: NotificationCallback) -> Result<SessionHandle, Status> {
        if let Some(status) = Self::injected(&mut self.state(), SimOperation::SessionNew) {
            return Err(status);
        }
        let id = self.inner.allocate();
        let notifier = Notifier::spawn(id)?;
        self.state().sessions.insert(
            id,
            SimSession {
                on_notify,
                notifier,
                logged_in: false,
            },
        );
        Ok(SessionHandle::new(id))
    }

    fn session_login(&self, session: SessionHandle, login: &LoginRequest) -> Status {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::SessionLogin) {
            return status;
        }
        if login.username.is_empty() || login.password.is_empty() || login.primary_tmx.is_empty()
        {
            return Status::LOGIN_FAILED;
        }
        let Some(entry) = state.sessions.get_mut(&session.raw()) else {
            return Status::INVALID_HANDLE;
        };
        entry.logged_in = true;

        let mut addresses = vec![tmx_address(&login.primary_tmx)];
        let status = match &login.secondary_tmx {
            Some(secondary) => {
                addresses.push(tmx_address(secondary));
                Status::TMX_CONNECTED_FT
            }
            None => Status::TMX_CONNECTED,
        };
        entry
            .notifier
            .send(&entry.on_notify, status, NotificationData::Addresses(addresses));
        log::debug!(
            target: "fabric_bridge::sim",
            "Session {} logged in as {}",
            session.raw(),
            login.username
        );
        Status::OK
    }

    fn session_terminate(&self, session: SessionHandle) -> Status {
        match self.detach_session(session.raw()) {
            Some((session, subscriptions, replays)) => {
                for subscription in subscriptions {
                    subscription.shutdown();
                }
                for replay in replays {
                    replay.shutdown();
                }
                session.notifier.shutdown();
                Status::OK
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn gd_context_new(
        &self,
        session: SessionHandle,
        client_name: &str,
        on_notify: NotificationCallback,
    ) -> Result<GdHandle, Status> {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::GdContextNew) {
            return Err(status);
        }
        Self::logged_in(&state, session)?;
        let id = self.inner.allocate();
        state.gd_contexts.insert(
            id,
            SimGd {
                session: session.raw(),
                client_name: client_name.to_string(),
                max_outstanding: 0,
                initialized: false,
                on_notify,
            },
        );
        Ok(GdHandle::new(id))
    }

    fn gd_context_configure(&self, gd: GdHandle, max_outstanding: u32) -> Status {
        match self.state().gd_contexts.get_mut(&gd.raw()) {
            Some(context) => {
                context.max_outstanding = max_outstanding;
                Status::OK
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn gd_context_init(&self, gd: GdHandle) -> Status {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::GdContextInit) {
            return status;
        }
        match state.gd_contexts.get_mut(&gd.raw()) {
            Some(context) => {
                context.initialized = true;
                Status::OK
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn gd_context_terminate(&self, gd: GdHandle) -> Status {
        let mut state = self.state();
        state.held_acks.retain(|(context, _)| *context != gd.raw());
        match state.gd_contexts.remove(&gd.raw()) {
            Some(_) => Status::OK,
            None => Status::INVALID_HANDLE,
        }
    }

    fn publication_create(
        &self,
        session: SessionHandle,
        topic: &str,
    ) -> Result<PublisherHandle, Status> {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::PublicationCreate) {
            return Err(status);
        }
        Self::logged_in(&state, session)?;
        if topic.is_empty() || topic.contains(['*', '>']) {
            return Err(Status::INVALID_ARGUMENT);
        }
        let id = self.inner.allocate();
        state.publishers.insert(
            id,
            SimPublisher {
                session: session.raw(),
                topic: topic.to_string(),
            },
        );
        Ok(PublisherHandle::new(id))
    }

    fn publication_qos(&self, publisher: PublisherHandle) -> Result<Qos, Status> {
        let state = self.state();
        let entry = state
            .publishers
            .get(&publisher.raw())
            .ok_or(Status::INVALID_HANDLE)?;
        Ok(state
            .topic_qos
            .get(&entry.topic)
            .copied()
            .unwrap_or_default())
    }

    fn publication_cancel(&self, publisher: PublisherHandle) -> Status {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::PublicationCancel) {
            return status;
        }
        match state.publishers.remove(&publisher.raw()) {
            Some(_) => Status::OK,
            None => Status::INVALID_HANDLE,
        }
    }

    fn message_create(
        &self,
        publisher: PublisherHandle,
        topic: &str,
        form: MessageForm,
        field_count: usize,
    ) -> Result<OutboundHandle, Status> {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::MessageCreate) {
            return Err(status);
        }
        if !state.publishers.contains_key(&publisher.raw()) {
            return Err(Status::INVALID_HANDLE);
        }
        let id = self.inner.allocate();
        state.outbound.insert(
            id,
            SimOutbound {
                topic: topic.to_string(),
                form,
                fields: Vec::with_capacity(field_count),
            },
        );
        Ok(OutboundHandle::new(id))
    }

    fn message_set_field(
        &self,
        message: OutboundHandle,
        name: &str,
        value: &NativeValue,
    ) -> Status {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::MessageSetField) {
            return status;
        }
        let Some(outbound) = state.outbound.get_mut(&message.raw()) else {
            return Status::INVALID_HANDLE;
        };
        if outbound.form == MessageForm::TopicSchema && matches!(value, NativeValue::Opaque(_)) {
            return Status::INVALID_ARGUMENT;
        }
        outbound.fields.push(NativeField {
            name: name.to_string(),
            value: value.clone(),
        });
        Status::OK
    }

    fn message_send(&self, message: OutboundHandle, _blocking: bool) -> Status {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::MessageSend) {
            return status;
        }
        let Some(outbound) = state.outbound.get(&message.raw()) else {
            return Status::INVALID_HANDLE;
        };
        let (topic, fields) = (outbound.topic.clone(), outbound.fields.clone());
        Self::publish(&mut state, &topic, fields);
        Status::OK
    }

    fn gd_message_send(&self, gd: GdHandle, message: OutboundHandle, correlation: u32) -> Status {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::GdMessageSend) {
            return status;
        }
        match state.gd_contexts.get(&gd.raw()) {
            Some(context) if context.initialized => {}
            Some(_) => return Status::GD_NOT_INITIALIZED,
            None => return Status::INVALID_HANDLE,
        }
        let Some(outbound) = state.outbound.get(&message.raw()) else {
            return Status::INVALID_HANDLE;
        };
        let (topic, fields) = (outbound.topic.clone(), outbound.fields.clone());
        Self::publish(&mut state, &topic, fields);
        state.stats.gd_sent += 1;

        let data = NotificationData::Correlation(correlation);
        let mode = state.gd_ack_mode;
        match mode {
            GdAckMode::Ack => Self::notify_gd(&state, gd.raw(), Status::GD_ACK_RECEIVED, data),
            GdAckMode::Hold => state.held_acks.push((gd.raw(), correlation)),
            GdAckMode::Fail(status) => Self::notify_gd(&state, gd.raw(), status, data),
        }
        Status::OK
    }

    fn message_destroy(&self, message: OutboundHandle) {
        self.state().outbound.remove(&message.raw());
    }

    fn subscribe(
        &self,
        session: SessionHandle,
        topic: &str,
        _qos: Qos,
        _cache_period_ms: u32,
        on_message: MessageCallback,
    ) -> Result<SubscriptionHandle, Status> {
        {
            let mut state = self.state();
            if let Some(status) = Self::injected(&mut state, SimOperation::Subscribe) {
                return Err(status);
            }
            Self::logged_in(&state, session)?;
        }
        self.start_subscription(session.raw(), topic, on_message)
    }

    fn gd_subscribe(
        &self,
        gd: GdHandle,
        name: &str,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<SubscriptionHandle, Status> {
        let session = {
            let mut state = self.state();
            if let Some(status) = Self::injected(&mut state, SimOperation::Subscribe) {
                return Err(status);
            }
            if name.is_empty() {
                return Err(Status::INVALID_ARGUMENT);
            }
            match state.gd_contexts.get(&gd.raw()) {
                Some(context) if context.initialized => context.session,
                Some(_) => return Err(Status::GD_NOT_INITIALIZED),
                None => return Err(Status::INVALID_HANDLE),
            }
        };
        self.start_subscription(session, topic, on_message)
    }

    fn subscription_terminate(&self, subscription: SubscriptionHandle) -> Status {
        self.stop_subscription(subscription)
    }

    fn gd_subscription_terminate(&self, subscription: SubscriptionHandle) -> Status {
        self.stop_subscription(subscription)
    }

    fn message_header(&self, message: &MessageHandle) -> Result<MessageHeader, Status> {
        self.state()
            .live
            .get(&message.raw())
            .map(|live| live.header.clone())
            .ok_or(Status::INVALID_HANDLE)
    }

    fn message_next_field(
        &self,
        message: &MessageHandle,
        cursor: &mut FieldCursor,
    ) -> Result<NativeField, Status> {
        let state = self.state();
        let live = state
            .live
            .get(&message.raw())
            .ok_or(Status::INVALID_HANDLE)?;
        let field = live
            .fields
            .get(cursor.position())
            .cloned()
            .ok_or(Status::NO_FIELDS_REMAINING)?;
        cursor.advance();
        Ok(field)
    }

    fn gd_message_ack(&self, message: &MessageHandle) -> Status {
        let mut state = self.state();
        if let Some(status) = Self::injected(&mut state, SimOperation::MessageAck) {
            return status;
        }
        if state.live.contains_key(&message.raw()) {
            state.stats.acked += 1;
            Status::OK
        } else {
            Status::INVALID_HANDLE
        }
    }

    fn message_release(&self, message: MessageHandle) {
        let mut state = self.state();
        if state.live.remove(&message.raw()).is_some() {
            state.stats.released += 1;
        } else {
            log::warn!(
                target: "fabric_bridge::sim",
                "Release of unknown message handle {}",
                message.raw()
            );
            state.stats.invalid_releases += 1;
        }
    }

    fn replay_create(
        &self,
        session: SessionHandle,
        topic: &str,
        start: Timestamp,
        end: Timestamp,
        on_message: MessageCallback,
        on_notify: ReplayNotificationCallback,
    ) -> Result<ReplayHandle, Status> {
        let entries: Vec<Delivery> = {
            let mut state = self.state();
            if let Some(status) = Self::injected(&mut state, SimOperation::ReplayCreate) {
                return Err(status);
            }
            Self::logged_in(&state, session)?;
            state
                .history
                .iter()
                .filter(|entry| {
                    topic_matches(topic, &entry.topic) && entry.time >= start && entry.time < end
                })
                .cloned()
                .collect()
        };

        let id = self.inner.allocate();
        let control = Arc::new(ReplayControl {
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            cancel: CancellationToken::new(),
        });
        let weak = Arc::downgrade(&self.inner);
        let thread_control = Arc::clone(&control);
        let thread_notify = Arc::clone(&on_notify);
        log::debug!(
            target: "fabric_bridge::sim",
            "Replay {} of '{}' with {} messages",
            id,
            topic,
            entries.len()
        );
        let thread = thread::Builder::new()
            .name(format!("sim-replay-{id}"))
            .spawn(move || run_replay(weak, entries, thread_control, on_message, thread_notify))
            .map_err(|_| Status::ERROR)?;
        self.state().replays.insert(
            id,
            SimReplay {
                session: session.raw(),
                control,
                on_notify,
                thread,
            },
        );
        Ok(ReplayHandle::new(id))
    }

    fn replay_pause(&self, replay: ReplayHandle) -> Status {
        self.control_replay(replay, true)
    }

    fn replay_resume(&self, replay: ReplayHandle) -> Status {
        self.control_replay(replay, false)
    }

    fn replay_release(&self, replay: ReplayHandle) -> Status {
        let removed = self.state().replays.remove(&replay.raw());
        match removed {
            Some(replay) => {
                replay.shutdown();
                Status::OK
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn log_open(&self, file: &Path, tag: &str) -> Status {
        let mut state = self.state();
        if state.log_file.is_some() {
            return Status::ERROR;
        }
        state.log_file = Some((file.to_path_buf(), tag.to_string()));
        Status::OK
    }

    fn log_close(&self) -> Status {
        match self.state().log_file.take() {
            Some(_) => Status::OK,
            None => Status::ERROR,
        }
    }

    fn log_level(&self) -> u32 {
        self.state().log_level
    }

    fn log_set_level(&self, level: u32) -> Status {
        self.state().log_level = level;
        Status::OK
    }

    fn log_write(&self, level: u32, text: &str) -> Status {
        let mut state = self.state();
        if state.log_file.is_none() {
            return Status::ERROR;
        }
        if state.log_level & level != 0 {
            state.log_lines.push((level, text.to_string()));
        }
        Status::OK
    }
}

impl SimulatedFabric {
    fn control_replay(&self, replay: ReplayHandle, pause: bool) -> Status {
        let (control, on_notify) = {
            let mut state = self.state();
            if let Some(status) = Self::injected(&mut state, SimOperation::ReplayControl) {
                return status;
            }
            match state.replays.get(&replay.raw()) {
                Some(entry) => (Arc::clone(&entry.control), Arc::clone(&entry.on_notify)),
                None => {
                    state.stats.invalid_replay_controls += 1;
                    return Status::INVALID_HANDLE;
                }
            }
        };
        control.set_paused(pause);
        on_notify(if pause {
            Status::REPLAY_PAUSED
        } else {
            Status::REPLAY_RESUMED
        });
        Status::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn login(sim: &SimulatedFabric) -> (SessionHandle, Receiver<(Status, NotificationData)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let session = sim
            .session_new(Arc::new(move |status, data| {
                let _ = tx.lock().unwrap().send((status, data));
            }))
            .unwrap();
        let request = LoginRequest {
            username: "user".into(),
            password: "pass".into(),
            primary_tmx: "10.1.1.1".into(),
            secondary_tmx: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(sim.session_login(session, &request), Status::OK);
        (session, rx)
    }

    #[rstest]
    #[case("A.B.C", "A.B.C", true)]
    #[case("A.*.C", "A.B.C", true)]
    #[case("A.>", "A.B.C", true)]
    #[case("A.>", "A", false)]
    #[case("A.*", "A.B.C", false)]
    #[case("A.B", "A.B.C", false)]
    fn wildcard_matching(#[case] pattern: &str, #[case] topic: &str, #[case] expected: bool) {
        assert_eq!(topic_matches(pattern, topic), expected);
    }

    #[test]
    fn login_reports_connected_addresses() {
        let sim = SimulatedFabric::new();
        let (_session, rx) = login(&sim);
        let (status, data) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status, Status::TMX_CONNECTED);
        assert_eq!(
            data,
            NotificationData::Addresses(vec!["10.1.1.1".parse().unwrap()])
        );
    }

    #[test]
    fn injected_failure_applies_once() {
        let sim = SimulatedFabric::new();
        sim.fail_next(SimOperation::SessionNew, Status::PERMISSION_DENIED);
        assert_eq!(
            sim.session_new(Arc::new(|_, _| {})).unwrap_err(),
            Status::PERMISSION_DENIED
        );
        assert!(sim.session_new(Arc::new(|_, _| {})).is_ok());
    }

    #[test]
    fn published_message_reaches_matching_subscription() {
        let sim = SimulatedFabric::new();
        let (session, _rx) = login(&sim);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let subscription = sim
            .subscribe(
                session,
                "PRICES.*",
                Qos::BestEffort,
                50,
                Arc::new(move |handle| {
                    let _ = tx.lock().unwrap().send(handle);
                }),
            )
            .unwrap();

        let publisher = sim.publication_create(session, "PRICES.ACME").unwrap();
        let message = sim
            .message_create(publisher, "PRICES.ACME", MessageForm::SelfDescribing, 1)
            .unwrap();
        assert_eq!(
            sim.message_set_field(message, "px", &NativeValue::Double(1.5)),
            Status::OK
        );
        assert_eq!(sim.message_send(message, false), Status::OK);
        sim.message_destroy(message);

        let handle = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(sim.message_header(&handle).unwrap().topic, "PRICES.ACME");
        let mut cursor = FieldCursor::default();
        assert_eq!(
            sim.message_next_field(&handle, &mut cursor).unwrap().value,
            NativeValue::Double(1.5)
        );
        assert_eq!(
            sim.message_next_field(&handle, &mut cursor).unwrap_err(),
            Status::NO_FIELDS_REMAINING
        );
        sim.message_release(handle);
        assert_eq!(sim.subscription_terminate(subscription), Status::OK);

        let stats = sim.stats();
        assert_eq!(stats.live_messages, 0);
        assert_eq!(stats.outbound_messages, 0);
        assert_eq!(stats.subscriptions, 0);
    }

    #[test]
    fn double_release_is_counted() {
        let sim = SimulatedFabric::new();
        let handle = sim.fabricate_message("T", vec![], false);
        let raw = handle.raw();
        sim.message_release(handle);
        sim.message_release(MessageHandle::new(raw));
        assert_eq!(sim.stats().released, 1);
        assert_eq!(sim.stats().invalid_releases, 1);
    }

    #[test]
    fn replay_marks_last_message_in_range() {
        let sim = SimulatedFabric::new();
        let (session, _rx) = login(&sim);
        for millis in [10, 20, 30] {
            sim.record_history(
                "H.T",
                vec![("n", NativeValue::Long(millis as i64))],
                Timestamp::from_millis(millis),
            );
        }
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let replay = sim
            .replay_create(
                session,
                "H.T",
                Timestamp::from_millis(10),
                Timestamp::from_millis(30),
                Arc::new(move |handle| {
                    let _ = tx.lock().unwrap().send(handle);
                }),
                Arc::new(|_| {}),
            )
            .unwrap();
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!sim.message_header(&first).unwrap().is_last);
        assert!(sim.message_header(&second).unwrap().is_last);
        sim.message_release(first);
        sim.message_release(second);
        assert_eq!(sim.replay_release(replay), Status::OK);
    }

    #[test]
    fn held_acks_are_answered_on_release() {
        let sim = SimulatedFabric::new();
        let (session, _rx) = login(&sim);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let gd = sim
            .gd_context_new(
                session,
                "client",
                Arc::new(move |status, data| {
                    let _ = tx.lock().unwrap().send((status, data));
                }),
            )
            .unwrap();
        assert_eq!(sim.gd_context_configure(gd, 4), Status::OK);
        assert_eq!(sim.gd_context_init(gd), Status::OK);
        sim.set_gd_ack_mode(GdAckMode::Hold);

        let publisher = sim.publication_create(session, "GD.T").unwrap();
        let message = sim
            .message_create(publisher, "GD.T", MessageForm::TopicSchema, 0)
            .unwrap();
        assert_eq!(sim.gd_message_send(gd, message, 3), Status::OK);
        sim.message_destroy(message);
        assert_eq!(sim.held_acks(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert_eq!(sim.release_held_acks(), 1);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            (Status::GD_ACK_RECEIVED, NotificationData::Correlation(3))
        );
    }

    #[test]
    fn log_lines_respect_level_mask() {
        let sim = SimulatedFabric::new();
        assert_eq!(sim.log_write(1, "dropped"), Status::ERROR);
        assert_eq!(sim.log_open(Path::new("/tmp/fabric.log"), "test"), Status::OK);
        sim.log_set_level(0b01);
        assert_eq!(sim.log_write(0b01, "kept"), Status::OK);
        assert_eq!(sim.log_write(0b10, "filtered"), Status::OK);
        assert_eq!(sim.log_lines(), vec![(0b01, "kept".to_string())]);
    }
}
