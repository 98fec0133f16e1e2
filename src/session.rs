//! Sessions.
//!
//! A session owns the native session handle, the optional GD context with
//! its [`GdAckWindow`], one bridge carrying native notifications, and the
//! subscriptions and replays created through it. Notifications are routed on
//! the host thread by the session notification router.

mod ack_window;
mod notification;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

pub use ack_window::{Acquired, GdAckWindow, GdCompletion, GdTicket, SaturationPolicy};
pub(crate) use notification::SessionNotification;

use crate::config::{ConnectOptions, ReplayOptions, SubscriptionOptions};
use crate::error::{BridgeError, BridgeResult, ListenerResult, LockResultExt};
use crate::host::{
    AsyncBridge, EntityLifecycle, EventKind, HandleId, LifecycleState, ListenerId, ListenerTable,
    LoopHandle, Operation,
};
use crate::native::{
    FabricApi, GdHandle, NotificationCallback, NotificationData, SessionHandle, Status,
};
use crate::publication::{self, PendingSend, Publication};
use crate::replay::{self, Replay, ReplayInner};
use crate::subscription::{self, Subscription, SubscriptionInner};

/// Events emitted by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    ConnectionInfo,
    ConnectionLost,
    ConnectionRestored,
    Close,
    GdsLost,
    GdsRestored,
    Notify,
}

const SESSION_EVENTS: &[SessionEventKind] = &[
    SessionEventKind::ConnectionInfo,
    SessionEventKind::ConnectionLost,
    SessionEventKind::ConnectionRestored,
    SessionEventKind::Close,
    SessionEventKind::GdsLost,
    SessionEventKind::GdsRestored,
    SessionEventKind::Notify,
];

impl EventKind for SessionEventKind {
    fn name(self) -> &'static str {
        match self {
            SessionEventKind::ConnectionInfo => "connection-info",
            SessionEventKind::ConnectionLost => "connection-lost",
            SessionEventKind::ConnectionRestored => "connection-restored",
            SessionEventKind::Close => "close",
            SessionEventKind::GdsLost => "gds-lost",
            SessionEventKind::GdsRestored => "gds-restored",
            SessionEventKind::Notify => "notify",
        }
    }
}

impl FromStr for SessionEventKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SESSION_EVENTS
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                BridgeError::invalid_argument(format!("Unknown session event '{s}'"))
            })
    }
}

/// Payload of a session event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connected; `standby` is set for fault-tolerant connections.
    ConnectionInfo {
        active: IpAddr,
        standby: Option<IpAddr>,
    },
    ConnectionLost,
    ConnectionRestored,
    Close,
    GdsLost,
    GdsRestored,
    /// Any status without a dedicated event.
    Notify { code: Status, message: String },
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::ConnectionInfo { .. } => SessionEventKind::ConnectionInfo,
            SessionEvent::ConnectionLost => SessionEventKind::ConnectionLost,
            SessionEvent::ConnectionRestored => SessionEventKind::ConnectionRestored,
            SessionEvent::Close => SessionEventKind::Close,
            SessionEvent::GdsLost => SessionEventKind::GdsLost,
            SessionEvent::GdsRestored => SessionEventKind::GdsRestored,
            SessionEvent::Notify { .. } => SessionEventKind::Notify,
        }
    }

    pub(crate) fn notify(code: Status) -> Self {
        SessionEvent::Notify {
            code,
            message: code.description().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeSession {
    pub(crate) session: SessionHandle,
    pub(crate) gd: Option<GdHandle>,
}

pub(crate) struct SessionInner {
    pub(crate) host: LoopHandle,
    pub(crate) api: Arc<dyn FabricApi>,
    native: OnceLock<NativeSession>,
    pub(crate) lifecycle: EntityLifecycle,
    bridge: AsyncBridge<SessionNotification>,
    listeners: ListenerTable<SessionEventKind, SessionEvent>,
    pub(crate) window: Option<GdAckWindow<PendingSend>>,
    subscriptions: Mutex<HashMap<HandleId, Arc<SubscriptionInner>>>,
    replays: Mutex<HashMap<HandleId, Arc<ReplayInner>>>,
    closing: AtomicBool,
}

impl SessionInner {
    fn new(host: &LoopHandle, api: Arc<dyn FabricApi>, options: &ConnectOptions) -> Self {
        let window = options
            .gd_enabled()
            .then(|| GdAckWindow::new(options.gd_max_outstanding, options.gd_saturation));
        Self {
            host: host.clone(),
            api,
            native: OnceLock::new(),
            lifecycle: EntityLifecycle::new("session"),
            bridge: AsyncBridge::new(host, "session"),
            listeners: ListenerTable::new("session", SESSION_EVENTS),
            window,
            subscriptions: Mutex::new(HashMap::new()),
            replays: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// Callback handed to the native session and GD context.
    fn notification_callback(&self) -> NotificationCallback {
        let bridge = self.bridge.clone();
        Arc::new(move |status: Status, data: NotificationData| {
            if bridge
                .post(SessionNotification::new(status, data))
                .is_err()
            {
                log::trace!(
                    target: "fabric_bridge::session",
                    "Dropping notification {} for closed session",
                    status
                );
            }
        })
    }

    /// Native handles, once connected.
    pub(crate) fn native(&self) -> BridgeResult<NativeSession> {
        self.native
            .get()
            .copied()
            .ok_or_else(|| BridgeError::closed("session"))
    }

    /// Fail unless the session accepts new operations.
    pub(crate) fn ensure_accepting(&self) -> BridgeResult<NativeSession> {
        self.lifecycle.ensure_accepting()?;
        if self.closing.load(Ordering::Acquire) {
            return Err(BridgeError::closed("session"));
        }
        self.native()
    }

    fn finish_connect(
        self: &Arc<Self>,
        opened: BridgeResult<NativeSession>,
    ) -> BridgeResult<Session> {
        match opened {
            Ok(native) => {
                if self.native.set(native).is_err() {
                    log::warn!(target: "fabric_bridge::session", "Session connected twice");
                }
                let inner = Arc::clone(self);
                self.bridge.activate(move || inner.drain());
                self.lifecycle.activate();
                log::info!(
                    target: "fabric_bridge::session",
                    "Session {} connected (GD {})",
                    native.session.raw(),
                    if native.gd.is_some() { "enabled" } else { "disabled" }
                );
                Ok(Session {
                    inner: Arc::clone(self),
                })
            }
            Err(error) => {
                log::debug!(target: "fabric_bridge::session", "Connect failed: {}", error);
                self.lifecycle.close();
                self.bridge.close();
                Err(error)
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        self.bridge.drain(|notification| self.route(notification));
    }

    pub(crate) fn adopt_subscription(&self, subscription: Arc<SubscriptionInner>) {
        self.subscriptions
            .lock()
            .recover_poison("SessionInner::adopt_subscription")
            .insert(subscription.id(), subscription);
    }

    pub(crate) fn forget_subscription(&self, id: HandleId) {
        self.subscriptions
            .lock()
            .recover_poison("SessionInner::forget_subscription")
            .remove(&id);
    }

    pub(crate) fn adopt_replay(&self, replay: Arc<ReplayInner>) {
        self.replays
            .lock()
            .recover_poison("SessionInner::adopt_replay")
            .insert(replay.id(), replay);
    }

    pub(crate) fn forget_replay(&self, id: HandleId) {
        self.replays
            .lock()
            .recover_poison("SessionInner::forget_replay")
            .remove(&id);
    }

    fn take_subscriptions(&self) -> Vec<Arc<SubscriptionInner>> {
        self.subscriptions
            .lock()
            .recover_poison("SessionInner::take_subscriptions")
            .drain()
            .map(|(_, subscription)| subscription)
            .collect()
    }

    fn take_replays(&self) -> Vec<Arc<ReplayInner>> {
        self.replays
            .lock()
            .recover_poison("SessionInner::take_replays")
            .drain()
            .map(|(_, replay)| replay)
            .collect()
    }

    fn close_operation(self: &Arc<Self>) -> BridgeResult<Operation<Status, ()>> {
        let native = self.ensure_accepting()?;
        if self.closing.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::closed("session"));
        }

        // Native handles leave their owners now; the entities themselves are
        // detached by the router once the terminal notification is dispatched.
        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .recover_poison("SessionInner::close_operation")
            .values()
            .filter_map(|subscription| subscription.take_native())
            .collect();
        let replays: Vec<_> = self
            .replays
            .lock()
            .recover_poison("SessionInner::close_operation")
            .values()
            .filter_map(|replay| replay.take_native())
            .collect();

        let api = Arc::clone(&self.api);
        let inner = Arc::clone(self);
        Ok(Operation::new(
            "close",
            move || {
                for subscription in subscriptions {
                    log_cleanup(subscription.terminate(api.as_ref()), "subscription_terminate");
                }
                for replay in replays {
                    log_cleanup(api.replay_release(replay), "replay_release");
                }
                if let Some(gd) = native.gd {
                    log_cleanup(api.gd_context_terminate(gd), "gd_context_terminate");
                }
                api.session_terminate(native.session)
            },
            move |status| {
                inner.lifecycle.begin_draining();
                if inner
                    .bridge
                    .post(SessionNotification::new(
                        Status::SESSION_TERMINATED,
                        NotificationData::None,
                    ))
                    .is_err()
                {
                    log::debug!(
                        target: "fabric_bridge::session",
                        "Session already torn down when close completed"
                    );
                }
                status.check("session_terminate")
            },
        ))
    }
}

pub(crate) fn log_cleanup(status: Status, operation: &'static str) {
    if !status.is_ok() {
        log::warn!(
            target: "fabric_bridge::session",
            "{} during cleanup failed: {}",
            operation,
            status
        );
    }
}

fn open_gd(
    api: &dyn FabricApi,
    session: SessionHandle,
    client_name: &str,
    max_outstanding: u32,
    on_notify: NotificationCallback,
) -> BridgeResult<GdHandle> {
    let gd = api
        .gd_context_new(session, client_name, on_notify)
        .map_err(|status| BridgeError::native("gd_context_new", status))?;
    let initialized = api
        .gd_context_configure(gd, max_outstanding)
        .check("gd_context_configure")
        .and_then(|()| api.gd_context_init(gd).check("gd_context_init"));
    if let Err(error) = initialized {
        log_cleanup(api.gd_context_terminate(gd), "gd_context_terminate");
        return Err(error);
    }
    Ok(gd)
}

/// Worker half of connect. Anything created before a failure is terminated.
fn open_native(
    api: &dyn FabricApi,
    options: &ConnectOptions,
    on_notify: NotificationCallback,
) -> BridgeResult<NativeSession> {
    let session = api
        .session_new(Arc::clone(&on_notify))
        .map_err(|status| BridgeError::native("session_new", status))?;
    if let Err(error) = api
        .session_login(session, &options.login_request())
        .check("session_login")
    {
        log_cleanup(api.session_terminate(session), "session_terminate");
        return Err(error);
    }
    let Some(client_name) = options.gd_client_name.as_deref() else {
        return Ok(NativeSession { session, gd: None });
    };
    match open_gd(api, session, client_name, options.gd_max_outstanding, on_notify) {
        Ok(gd) => Ok(NativeSession {
            session,
            gd: Some(gd),
        }),
        Err(error) => {
            log_cleanup(api.session_terminate(session), "session_terminate");
            Err(error)
        }
    }
}

fn connect_operation(
    host: &LoopHandle,
    api: Arc<dyn FabricApi>,
    options: ConnectOptions,
) -> BridgeResult<Operation<BridgeResult<NativeSession>, Session>> {
    options.validate()?;
    let inner = Arc::new(SessionInner::new(host, api, &options));
    let on_notify = inner.notification_callback();
    let api = Arc::clone(&inner.api);
    Ok(Operation::new(
        "connect",
        move || open_native(api.as_ref(), &options, on_notify),
        move |opened| inner.finish_connect(opened),
    ))
}

/// Connect on a worker thread; `callback` runs on the host thread.
///
/// Option errors are returned immediately and no native call is made.
pub fn connect<C>(
    host: &LoopHandle,
    api: Arc<dyn FabricApi>,
    options: ConnectOptions,
    callback: C,
) -> BridgeResult<()>
where
    C: FnOnce(BridgeResult<Session>) -> ListenerResult + Send + 'static,
{
    connect_operation(host, api, options)?.spawn(host, "session", callback);
    Ok(())
}

/// Connect on the calling thread.
pub fn connect_blocking(
    host: &LoopHandle,
    api: Arc<dyn FabricApi>,
    options: ConnectOptions,
) -> BridgeResult<Session> {
    connect_operation(host, api, options)?.run_blocking()
}

/// A connected session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("gd_enabled", &self.is_gd_enabled())
            .finish()
    }
}

impl Session {
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn is_gd_enabled(&self) -> bool {
        self.inner.window.is_some()
    }

    /// GD sends still waiting for their outcome.
    pub fn outstanding_gd_sends(&self) -> usize {
        self.inner
            .window
            .as_ref()
            .map_or(0, |window| window.outstanding())
    }

    pub fn on(
        &self,
        kind: SessionEventKind,
        listener: impl FnMut(&SessionEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, false)
    }

    pub fn once(
        &self,
        kind: SessionEventKind,
        listener: impl FnMut(&SessionEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, true)
    }

    /// Register by event name, e.g. `"connection-lost"`.
    pub fn on_named(
        &self,
        name: &str,
        listener: impl FnMut(&SessionEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add_named(name, listener, false)
    }

    pub fn remove_listeners(&self, kind: SessionEventKind) -> usize {
        self.inner.listeners.remove_all(kind)
    }

    /// Remove one listener registered with `on` or `once`.
    pub fn remove_listener(&self, kind: SessionEventKind, id: ListenerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }

    pub fn create_publication<C>(&self, topic: &str, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<Publication>) -> ListenerResult + Send + 'static,
    {
        publication::create_operation(&self.inner, topic)?.spawn(
            &self.inner.host,
            "publication",
            callback,
        );
        Ok(())
    }

    pub fn create_publication_blocking(&self, topic: &str) -> BridgeResult<Publication> {
        publication::create_operation(&self.inner, topic)?.run_blocking()
    }

    pub fn create_subscription<C>(
        &self,
        topic: &str,
        options: SubscriptionOptions,
        callback: C,
    ) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<Subscription>) -> ListenerResult + Send + 'static,
    {
        subscription::create_operation(&self.inner, topic, options)?.spawn(
            &self.inner.host,
            "subscription",
            callback,
        );
        Ok(())
    }

    pub fn create_subscription_blocking(
        &self,
        topic: &str,
        options: SubscriptionOptions,
    ) -> BridgeResult<Subscription> {
        subscription::create_operation(&self.inner, topic, options)?.run_blocking()
    }

    pub fn create_replay<C>(
        &self,
        topic: &str,
        options: ReplayOptions,
        callback: C,
    ) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<Replay>) -> ListenerResult + Send + 'static,
    {
        replay::create_operation(&self.inner, topic, options)?.spawn(
            &self.inner.host,
            "replay",
            callback,
        );
        Ok(())
    }

    pub fn create_replay_blocking(
        &self,
        topic: &str,
        options: ReplayOptions,
    ) -> BridgeResult<Replay> {
        replay::create_operation(&self.inner, topic, options)?.run_blocking()
    }

    /// Terminate subscriptions, replays, the GD context and the session.
    ///
    /// `callback` receives the native outcome; `close` listeners fire once
    /// teardown is dispatched, after which the session no longer keeps the
    /// host loop alive.
    pub fn close<C>(&self, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<()>) -> ListenerResult + Send + 'static,
    {
        self.inner
            .close_operation()?
            .spawn(&self.inner.host, "session", callback);
        Ok(())
    }

    pub fn close_blocking(&self) -> BridgeResult<()> {
        self.inner.close_operation()?.run_blocking()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostLoop, RunOutcome};
    use crate::native::sim::{SimOperation, SimulatedFabric};
    use std::time::Duration;

    fn options() -> ConnectOptions {
        ConnectOptions::new("user", "pass", "10.0.0.1")
    }

    #[test]
    fn event_names_round_trip() {
        for kind in SESSION_EVENTS {
            assert_eq!(kind.name().parse::<SessionEventKind>().unwrap(), *kind);
        }
        assert!("disconnect".parse::<SessionEventKind>().is_err());
    }

    #[test]
    fn incomplete_options_fail_before_any_native_call() {
        let host = HostLoop::new().unwrap();
        let sim = SimulatedFabric::new();
        let err = connect_blocking(
            &host.handle(),
            Arc::new(sim.clone()),
            ConnectOptions::new("user", "", "tmx"),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(sim.stats().sessions, 0);
    }

    #[test]
    fn failed_login_terminates_native_session() {
        let host = HostLoop::new().unwrap();
        let sim = SimulatedFabric::new();
        sim.fail_next(SimOperation::SessionLogin, Status::LOGIN_FAILED);
        let err = connect_blocking(&host.handle(), Arc::new(sim.clone()), options()).unwrap_err();
        assert_eq!(
            err,
            BridgeError::native("session_login", Status::LOGIN_FAILED)
        );
        assert_eq!(sim.stats().sessions, 0);
        assert!(!host.is_alive());
    }

    #[test]
    fn failed_gd_init_rolls_back() {
        let host = HostLoop::new().unwrap();
        let sim = SimulatedFabric::new();
        sim.fail_next(SimOperation::GdContextInit, Status::GD_NOT_INITIALIZED);
        let err = connect_blocking(
            &host.handle(),
            Arc::new(sim.clone()),
            options().with_guaranteed_delivery("client", 8),
        )
        .unwrap_err();
        assert_eq!(
            err,
            BridgeError::native("gd_context_init", Status::GD_NOT_INITIALIZED)
        );
        assert_eq!(sim.stats().sessions, 0);
    }

    #[test]
    fn connected_session_keeps_loop_alive_until_closed() {
        let mut host = HostLoop::new().unwrap();
        let sim = SimulatedFabric::new();
        let session = connect_blocking(&host.handle(), Arc::new(sim.clone()), options()).unwrap();
        assert_eq!(session.state(), LifecycleState::Active);
        assert!(!session.is_gd_enabled());
        assert!(host.is_alive());

        session.close_blocking().unwrap();
        assert_eq!(host.run_for(Duration::from_secs(2)), RunOutcome::Idle);
        assert_eq!(session.state(), LifecycleState::Closed);
        assert_eq!(sim.stats().sessions, 0);
        assert!(matches!(
            session.close_blocking(),
            Err(BridgeError::Closed { .. })
        ));
    }
}
