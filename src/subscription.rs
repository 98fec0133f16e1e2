//! Subscriptions.
//!
//! Each subscription owns one bridge. The native delivery thread posts
//! [`SubscriptionSignal::Message`]s through a [`MessageSink`]; the stop
//! confirmation is posted on the same bridge, so no message is dispatched
//! after `stop`.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::SubscriptionOptions;
use crate::error::{BridgeError, BridgeResult, ListenerResult, LockResultExt};
use crate::host::{
    AsyncBridge, EntityLifecycle, EventKind, HandleId, LifecycleState, ListenerId, ListenerTable,
    LoopHandle, Operation,
};
use crate::message::HostMessage;
use crate::message::pipeline::{MessageEvent, MessageSink, OwnedMessage, Settlement};
use crate::native::{FabricApi, MessageCallback, MessageHandle, Qos, Status, SubscriptionHandle};
use crate::session::{SessionInner, log_cleanup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionEventKind {
    Message,
    /// Automatic GD acknowledgment finished.
    Ack,
    Stop,
}

const SUBSCRIPTION_EVENTS: &[SubscriptionEventKind] = &[
    SubscriptionEventKind::Message,
    SubscriptionEventKind::Ack,
    SubscriptionEventKind::Stop,
];

impl EventKind for SubscriptionEventKind {
    fn name(self) -> &'static str {
        match self {
            SubscriptionEventKind::Message => "message",
            SubscriptionEventKind::Ack => "ack",
            SubscriptionEventKind::Stop => "stop",
        }
    }
}

impl FromStr for SubscriptionEventKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SUBSCRIPTION_EVENTS
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                BridgeError::invalid_argument(format!("Unknown subscription event '{s}'"))
            })
    }
}

/// Result of an automatic acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct AckOutcome {
    pub topic: String,
    pub error: Option<BridgeError>,
}

#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Message(HostMessage),
    Ack(AckOutcome),
    Stop,
}

/// Queued on the subscription bridge.
#[derive(Debug)]
pub(crate) enum SubscriptionSignal {
    Message(MessageEvent),
    Stopped(BridgeResult<()>),
}

/// Native subscription handle together with the terminate call it needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeSubscription {
    handle: SubscriptionHandle,
    gd: bool,
}

impl NativeSubscription {
    pub(crate) fn terminate(self, api: &dyn FabricApi) -> Status {
        if self.gd {
            api.gd_subscription_terminate(self.handle)
        } else {
            api.subscription_terminate(self.handle)
        }
    }
}

pub(crate) struct SubscriptionInner {
    host: LoopHandle,
    api: Arc<dyn FabricApi>,
    session: Weak<SessionInner>,
    topic: String,
    qos: Qos,
    settlement: Settlement,
    native: Mutex<Option<NativeSubscription>>,
    lifecycle: Arc<EntityLifecycle>,
    bridge: AsyncBridge<SubscriptionSignal>,
    listeners: ListenerTable<SubscriptionEventKind, SubscriptionEvent>,
    stopping: AtomicBool,
}

impl SubscriptionInner {
    pub(crate) fn id(&self) -> HandleId {
        self.bridge.id()
    }

    /// Remove the native handle; the caller becomes responsible for it.
    pub(crate) fn take_native(&self) -> Option<NativeSubscription> {
        self.native.lock().recover_poison("SubscriptionInner::take_native").take()
    }

    fn message_callback(&self) -> MessageCallback {
        let sink = MessageSink::new(
            Arc::clone(&self.api),
            Arc::clone(&self.lifecycle),
            self.bridge.clone(),
            SubscriptionSignal::Message,
        );
        Arc::new(move |handle: MessageHandle| sink.deliver(handle))
    }

    /// Stop because the owning session went away. Host thread only.
    pub(crate) fn detach(self: &Arc<Self>) {
        // Native objects die with the session.
        self.take_native();
        if self.lifecycle.state() == LifecycleState::Active {
            self.lifecycle.begin_draining();
        }
        if let Err(SubscriptionSignal::Stopped(result)) =
            self.bridge.post(SubscriptionSignal::Stopped(Ok(())))
        {
            self.stopped(result);
        }
    }

    fn drain(self: &Arc<Self>) {
        self.bridge.drain(|signal| match signal {
            SubscriptionSignal::Message(event) => self.dispatch_message(event),
            SubscriptionSignal::Stopped(result) => self.stopped(result),
        });
    }

    fn dispatch_message(self: &Arc<Self>, event: MessageEvent) {
        let (message, native) = event.into_host(self.settlement);
        let topic = message.topic.clone();
        self.listeners.emit(
            &self.host,
            SubscriptionEventKind::Message,
            &SubscriptionEvent::Message(message),
        );
        let Some(native) = native else {
            return;
        };
        match self.settlement {
            Settlement::AutoAck => self.auto_ack(topic, native),
            Settlement::Release | Settlement::Manual => native.release(),
        }
    }

    fn auto_ack(self: &Arc<Self>, topic: String, native: OwnedMessage) {
        let inner = Arc::clone(self);
        self.host.queue_work(
            "gd_message_ack",
            move || native.acknowledge(),
            move |status| {
                let error = status
                    .and_then(|status| status.check("gd_message_ack"))
                    .err();
                if let Some(error) = &error {
                    log::warn!(
                        target: "fabric_bridge::subscription",
                        "Acknowledgment on {} failed: {}",
                        topic,
                        error
                    );
                }
                if inner.lifecycle.state() == LifecycleState::Closed {
                    return;
                }
                inner.listeners.emit(
                    &inner.host,
                    SubscriptionEventKind::Ack,
                    &SubscriptionEvent::Ack(AckOutcome { topic, error }),
                );
            },
        );
    }

    /// Terminal confirmation. Host thread only.
    fn stopped(self: &Arc<Self>, result: BridgeResult<()>) {
        if self.lifecycle.state() == LifecycleState::Closed {
            return;
        }
        if let Err(error) = &result {
            log::warn!(
                target: "fabric_bridge::subscription",
                "Subscription on {} stopped with error: {}",
                self.topic,
                error
            );
        }
        self.listeners
            .emit(&self.host, SubscriptionEventKind::Stop, &SubscriptionEvent::Stop);
        self.listeners.clear();
        self.lifecycle.close();
        // Undelivered messages release their handles when dropped.
        let leftovers = self.bridge.close();
        if !leftovers.is_empty() {
            log::debug!(
                target: "fabric_bridge::subscription",
                "Released {} undelivered messages on {}",
                leftovers.len(),
                self.topic
            );
        }
        if let Some(session) = self.session.upgrade() {
            session.forget_subscription(self.id());
        }
    }

    /// Host-side completion of a successful native subscribe.
    fn started(
        self: &Arc<Self>,
        native: NativeSubscription,
        session: &Arc<SessionInner>,
    ) -> BridgeResult<Subscription> {
        if let Err(error) = session.ensure_accepting() {
            let api = Arc::clone(&self.api);
            self.host.queue_work(
                "subscription_terminate",
                move || native.terminate(api.as_ref()),
                |status| {
                    if let Ok(status) = status {
                        log_cleanup(status, "subscription_terminate");
                    }
                },
            );
            self.abandon();
            return Err(error);
        }
        *self.native.lock().recover_poison("SubscriptionInner::started") = Some(native);
        let inner = Arc::clone(self);
        self.bridge.activate(move || inner.drain());
        self.lifecycle.activate();
        session.adopt_subscription(Arc::clone(self));
        log::debug!(
            target: "fabric_bridge::subscription",
            "Subscribed to {} ({})",
            self.topic,
            self.qos
        );
        Ok(Subscription {
            inner: Arc::clone(self),
        })
    }

    /// Roll back a subscription that never started.
    fn abandon(&self) {
        self.lifecycle.close();
        self.bridge.close();
    }
}

pub(crate) fn create_operation(
    session: &Arc<SessionInner>,
    topic: &str,
    options: SubscriptionOptions,
) -> BridgeResult<Operation<BridgeResult<NativeSubscription>, Subscription>> {
    if topic.is_empty() {
        return Err(BridgeError::invalid_argument("Topic must not be empty"));
    }
    options.validate()?;
    let native_session = session.ensure_accepting()?;
    let gd = match (options.qos.is_guaranteed_delivery(), native_session.gd) {
        (true, Some(gd)) => Some(gd),
        (true, None) => return Err(BridgeError::GdNotEnabled),
        (false, _) => None,
    };

    let inner = Arc::new(SubscriptionInner {
        host: session.host.clone(),
        api: Arc::clone(&session.api),
        session: Arc::downgrade(session),
        topic: topic.to_string(),
        qos: options.qos,
        settlement: Settlement::for_subscription(options.qos, options.ack_mode),
        native: Mutex::new(None),
        lifecycle: Arc::new(EntityLifecycle::new("subscription")),
        bridge: AsyncBridge::new(&session.host, "subscription"),
        listeners: ListenerTable::new("subscription", SUBSCRIPTION_EVENTS),
        stopping: AtomicBool::new(false),
    });
    let on_message = inner.message_callback();
    let api = Arc::clone(&session.api);
    let worker_topic = topic.to_string();
    let cache_period_ms = options.cache_period_ms();
    let name = options.name;
    let qos = options.qos;
    let session = Arc::clone(session);
    Ok(Operation::new(
        "create_subscription",
        move || match gd {
            Some(gd) => api
                .gd_subscribe(gd, name.as_deref().unwrap_or_default(), &worker_topic, on_message)
                .map(|handle| NativeSubscription { handle, gd: true })
                .map_err(|status| BridgeError::native("gd_subscribe", status)),
            None => api
                .subscribe(
                    native_session.session,
                    &worker_topic,
                    qos,
                    cache_period_ms,
                    on_message,
                )
                .map(|handle| NativeSubscription { handle, gd: false })
                .map_err(|status| BridgeError::native("subscribe", status)),
        },
        move |subscribed| match subscribed {
            Ok(native) => inner.started(native, &session),
            Err(error) => {
                inner.abandon();
                Err(error)
            }
        },
    ))
}

/// A live subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.inner.topic)
            .field("qos", &self.inner.qos)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn qos(&self) -> Qos {
        self.inner.qos
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn on(
        &self,
        kind: SubscriptionEventKind,
        listener: impl FnMut(&SubscriptionEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, false)
    }

    pub fn once(
        &self,
        kind: SubscriptionEventKind,
        listener: impl FnMut(&SubscriptionEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, true)
    }

    pub fn on_named(
        &self,
        name: &str,
        listener: impl FnMut(&SubscriptionEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add_named(name, listener, false)
    }

    /// Shorthand for a `message` listener receiving the message itself.
    pub fn on_message(
        &self,
        mut listener: impl FnMut(&HostMessage) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.on(SubscriptionEventKind::Message, move |event| match event {
            SubscriptionEvent::Message(message) => listener(message),
            _ => Ok(()),
        })
    }

    pub fn on_ack(
        &self,
        mut listener: impl FnMut(&AckOutcome) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.on(SubscriptionEventKind::Ack, move |event| match event {
            SubscriptionEvent::Ack(outcome) => listener(outcome),
            _ => Ok(()),
        })
    }

    pub fn on_stop(
        &self,
        mut listener: impl FnMut() -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.on(SubscriptionEventKind::Stop, move |_| listener())
    }

    pub fn remove_listeners(&self, kind: SubscriptionEventKind) -> usize {
        self.inner.listeners.remove_all(kind)
    }

    /// Remove one listener registered with `on` or `once`.
    pub fn remove_listener(&self, kind: SubscriptionEventKind, id: ListenerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }

    fn acknowledge_operation(&self, message: &HostMessage) -> BridgeResult<Operation<Status, ()>> {
        if self.inner.settlement != Settlement::Manual {
            return Err(BridgeError::invalid_argument(
                "Subscription does not use manual acknowledgment",
            ));
        }
        if !self.inner.lifecycle.in_use() {
            return Err(BridgeError::closed("subscription"));
        }
        let native = message
            .ack
            .as_ref()
            .and_then(|token| token.take())
            .ok_or_else(|| BridgeError::invalid_argument("Invalid message"))?;
        Ok(Operation::new(
            "acknowledge",
            move || native.acknowledge(),
            |status| status.check("gd_message_ack"),
        ))
    }

    /// Acknowledge a message received in manual ack mode. The native handle
    /// is released afterwards; a second call for the same message fails.
    pub fn acknowledge<C>(&self, message: &HostMessage, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<()>) -> ListenerResult + Send + 'static,
    {
        self.acknowledge_operation(message)?
            .spawn(&self.inner.host, "subscription", callback);
        Ok(())
    }

    pub fn acknowledge_blocking(&self, message: &HostMessage) -> BridgeResult<()> {
        self.acknowledge_operation(message)?.run_blocking()
    }

    fn stop_operation(&self) -> BridgeResult<Operation<Status, ()>> {
        self.inner.lifecycle.ensure_accepting()?;
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::closed("subscription"));
        }
        let worker = Arc::clone(&self.inner);
        let inner = Arc::clone(&self.inner);
        Ok(Operation::new(
            "stop",
            move || match worker.take_native() {
                Some(native) => native.terminate(worker.api.as_ref()),
                None => Status::OK,
            },
            move |status| {
                let result = status.check("subscription_terminate");
                inner.lifecycle.begin_draining();
                if let Err(SubscriptionSignal::Stopped(result)) =
                    inner.bridge.post(SubscriptionSignal::Stopped(result.clone()))
                {
                    inner.stopped(result);
                }
                result
            },
        ))
    }

    /// Terminate the native subscription. Messages already queued are
    /// delivered first, then `stop` fires.
    pub fn stop<C>(&self, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<()>) -> ListenerResult + Send + 'static,
    {
        self.stop_operation()?
            .spawn(&self.inner.host, "subscription", callback);
        Ok(())
    }

    pub fn stop_blocking(&self) -> BridgeResult<()> {
        self.stop_operation()?.run_blocking()
    }
}
