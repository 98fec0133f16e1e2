//! Replays of recorded history over a time range.
//!
//! Two bridges per replay: messages (plus the terminal stop marker) on one,
//! control notifications on the other. Replayed messages are always released
//! after their listeners ran. The message flagged `is_last` is followed by
//! `finish`, after which the replay releases its native session and closes.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::ReplayOptions;
use crate::error::{BridgeError, BridgeResult, ListenerResult, LockResultExt};
use crate::host::{
    AsyncBridge, EntityLifecycle, EventKind, HandleId, LifecycleState, ListenerId, ListenerTable,
    LoopHandle, Operation,
};
use crate::message::HostMessage;
use crate::message::pipeline::{MessageEvent, MessageSink, Settlement};
use crate::native::{
    FabricApi, MessageHandle, ReplayHandle, ReplayNotificationCallback, Status, Timestamp,
};
use crate::session::{SessionInner, log_cleanup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplayEventKind {
    Message,
    Finish,
    Error,
    Pause,
    Resume,
    Stop,
}

const REPLAY_EVENTS: &[ReplayEventKind] = &[
    ReplayEventKind::Message,
    ReplayEventKind::Finish,
    ReplayEventKind::Error,
    ReplayEventKind::Pause,
    ReplayEventKind::Resume,
    ReplayEventKind::Stop,
];

impl EventKind for ReplayEventKind {
    fn name(self) -> &'static str {
        match self {
            ReplayEventKind::Message => "message",
            ReplayEventKind::Finish => "finish",
            ReplayEventKind::Error => "error",
            ReplayEventKind::Pause => "pause",
            ReplayEventKind::Resume => "resume",
            ReplayEventKind::Stop => "stop",
        }
    }
}

impl FromStr for ReplayEventKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REPLAY_EVENTS
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| BridgeError::invalid_argument(format!("Unknown replay event '{s}'")))
    }
}

#[derive(Debug, Clone)]
pub enum ReplayEvent {
    Message(HostMessage),
    /// The last message of the range was delivered.
    Finish,
    /// Control notification other than pause/resume, e.g. no data in range.
    Error { code: Status, message: String },
    Pause,
    Resume,
    Stop,
}

impl ReplayEvent {
    fn from_control(status: Status) -> Self {
        match status {
            Status::REPLAY_PAUSED => ReplayEvent::Pause,
            Status::REPLAY_RESUMED => ReplayEvent::Resume,
            code => ReplayEvent::Error {
                code,
                message: code.description().to_string(),
            },
        }
    }

    pub fn kind(&self) -> ReplayEventKind {
        match self {
            ReplayEvent::Message(_) => ReplayEventKind::Message,
            ReplayEvent::Finish => ReplayEventKind::Finish,
            ReplayEvent::Error { .. } => ReplayEventKind::Error,
            ReplayEvent::Pause => ReplayEventKind::Pause,
            ReplayEvent::Resume => ReplayEventKind::Resume,
            ReplayEvent::Stop => ReplayEventKind::Stop,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ReplaySignal {
    Message(MessageEvent),
    Stopped(BridgeResult<()>),
}

pub(crate) struct ReplayInner {
    host: LoopHandle,
    api: Arc<dyn FabricApi>,
    session: Weak<SessionInner>,
    topic: String,
    range: (Timestamp, Timestamp),
    native: Mutex<Option<ReplayHandle>>,
    lifecycle: Arc<EntityLifecycle>,
    messages: AsyncBridge<ReplaySignal>,
    control: AsyncBridge<Status>,
    listeners: ListenerTable<ReplayEventKind, ReplayEvent>,
    stopping: AtomicBool,
}

impl ReplayInner {
    pub(crate) fn id(&self) -> HandleId {
        self.messages.id()
    }

    pub(crate) fn take_native(&self) -> Option<ReplayHandle> {
        self.native.lock().recover_poison("ReplayInner::take_native").take()
    }

    /// Run `call` on the native replay while holding its slot, so a
    /// concurrent stop or finish cannot release the handle underneath it.
    /// Returns None once the handle is gone.
    fn with_native(&self, call: impl FnOnce(ReplayHandle) -> Status) -> Option<Status> {
        let native = self.native.lock().recover_poison("ReplayInner::with_native");
        (*native).map(call)
    }

    fn control_callback(&self) -> ReplayNotificationCallback {
        let control = self.control.clone();
        Arc::new(move |status: Status| {
            if control.post(status).is_err() {
                log::trace!(
                    target: "fabric_bridge::replay",
                    "Dropping replay notification {} after close",
                    status
                );
            }
        })
    }

    /// Stop because the owning session went away. Host thread only.
    pub(crate) fn detach(self: &Arc<Self>) {
        self.take_native();
        if self.lifecycle.state() == LifecycleState::Active {
            self.lifecycle.begin_draining();
        }
        if let Err(ReplaySignal::Stopped(result)) =
            self.messages.post(ReplaySignal::Stopped(Ok(())))
        {
            self.stopped(result);
        }
    }

    fn emit(&self, event: ReplayEvent) {
        self.listeners.emit(&self.host, event.kind(), &event);
    }

    fn drain_messages(self: &Arc<Self>) {
        self.messages.drain(|signal| match signal {
            ReplaySignal::Message(event) => self.dispatch_message(event),
            ReplaySignal::Stopped(result) => self.stopped(result),
        });
    }

    fn drain_control(self: &Arc<Self>) {
        self.control
            .drain(|status| self.emit(ReplayEvent::from_control(status)));
    }

    fn dispatch_message(self: &Arc<Self>, event: MessageEvent) {
        let (message, native) = event.into_host(Settlement::Release);
        let is_last = message.is_last;
        self.emit(ReplayEvent::Message(message));
        if let Some(native) = native {
            native.release();
        }
        if is_last {
            self.emit(ReplayEvent::Finish);
            self.finished();
        }
    }

    /// Close both bridges and give back the native replay.
    fn finished(self: &Arc<Self>) {
        log::debug!(
            target: "fabric_bridge::replay",
            "Replay of {} finished",
            self.topic
        );
        self.close_down();
        if let Some(native) = self.take_native() {
            let api = Arc::clone(&self.api);
            self.host.queue_work(
                "replay_release",
                move || api.replay_release(native),
                |status| match status {
                    Ok(status) => log_cleanup(status, "replay_release"),
                    Err(error) => log::warn!(
                        target: "fabric_bridge::replay",
                        "Replay release failed: {}",
                        error
                    ),
                },
            );
        }
    }

    fn stopped(self: &Arc<Self>, result: BridgeResult<()>) {
        if self.lifecycle.state() == LifecycleState::Closed {
            return;
        }
        if let Err(error) = &result {
            log::warn!(
                target: "fabric_bridge::replay",
                "Replay of {} stopped with error: {}",
                self.topic,
                error
            );
        }
        self.emit(ReplayEvent::Stop);
        self.close_down();
    }

    fn close_down(&self) {
        if self.lifecycle.state() == LifecycleState::Active {
            self.lifecycle.begin_draining();
        }
        self.lifecycle.close();
        self.listeners.clear();
        self.control.close();
        let leftovers = self.messages.close();
        if !leftovers.is_empty() {
            log::debug!(
                target: "fabric_bridge::replay",
                "Released {} undelivered replay messages",
                leftovers.len()
            );
        }
        if let Some(session) = self.session.upgrade() {
            session.forget_replay(self.id());
        }
    }

    fn started(
        self: &Arc<Self>,
        native: ReplayHandle,
        session: &Arc<SessionInner>,
    ) -> BridgeResult<Replay> {
        if let Err(error) = session.ensure_accepting() {
            let api = Arc::clone(&self.api);
            self.host.queue_work(
                "replay_release",
                move || api.replay_release(native),
                |status| {
                    if let Ok(status) = status {
                        log_cleanup(status, "replay_release");
                    }
                },
            );
            self.abandon();
            return Err(error);
        }
        *self.native.lock().recover_poison("ReplayInner::started") = Some(native);
        let inner = Arc::clone(self);
        self.messages.activate(move || inner.drain_messages());
        let inner = Arc::clone(self);
        self.control.activate(move || inner.drain_control());
        self.lifecycle.activate();
        session.adopt_replay(Arc::clone(self));
        log::debug!(
            target: "fabric_bridge::replay",
            "Replaying {} from {} to {}",
            self.topic,
            self.range.0.as_millis(),
            self.range.1.as_millis()
        );
        Ok(Replay {
            inner: Arc::clone(self),
        })
    }

    fn abandon(&self) {
        self.lifecycle.close();
        self.control.close();
        self.messages.close();
    }
}

pub(crate) fn create_operation(
    session: &Arc<SessionInner>,
    topic: &str,
    options: ReplayOptions,
) -> BridgeResult<Operation<BridgeResult<ReplayHandle>, Replay>> {
    if topic.is_empty() {
        return Err(BridgeError::invalid_argument("Topic must not be empty"));
    }
    options.validate()?;
    let native_session = session.ensure_accepting()?;

    let inner = Arc::new(ReplayInner {
        host: session.host.clone(),
        api: Arc::clone(&session.api),
        session: Arc::downgrade(session),
        topic: topic.to_string(),
        range: (options.start_time, options.end_time),
        native: Mutex::new(None),
        lifecycle: Arc::new(EntityLifecycle::new("replay")),
        messages: AsyncBridge::new(&session.host, "replay"),
        control: AsyncBridge::new(&session.host, "replay-control"),
        listeners: ListenerTable::new("replay", REPLAY_EVENTS),
        stopping: AtomicBool::new(false),
    });
    let sink = MessageSink::new(
        Arc::clone(&inner.api),
        Arc::clone(&inner.lifecycle),
        inner.messages.clone(),
        ReplaySignal::Message,
    );
    let on_message = Arc::new(move |handle: MessageHandle| sink.deliver(handle));
    let on_notify = inner.control_callback();
    let api = Arc::clone(&session.api);
    let worker_topic = topic.to_string();
    let session = Arc::clone(session);
    Ok(Operation::new(
        "create_replay",
        move || {
            api.replay_create(
                native_session.session,
                &worker_topic,
                options.start_time,
                options.end_time,
                on_message,
                on_notify,
            )
            .map_err(|status| BridgeError::native("replay_create", status))
        },
        move |created| match created {
            Ok(native) => inner.started(native, &session),
            Err(error) => {
                inner.abandon();
                Err(error)
            }
        },
    ))
}

/// A running replay.
#[derive(Clone)]
pub struct Replay {
    inner: Arc<ReplayInner>,
}

impl fmt::Debug for Replay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replay")
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .finish()
    }
}

impl Replay {
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn on(
        &self,
        kind: ReplayEventKind,
        listener: impl FnMut(&ReplayEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, false)
    }

    pub fn once(
        &self,
        kind: ReplayEventKind,
        listener: impl FnMut(&ReplayEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, true)
    }

    pub fn on_named(
        &self,
        name: &str,
        listener: impl FnMut(&ReplayEvent) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add_named(name, listener, false)
    }

    pub fn remove_listeners(&self, kind: ReplayEventKind) -> usize {
        self.inner.listeners.remove_all(kind)
    }

    /// Remove one listener registered with `on` or `once`.
    pub fn remove_listener(&self, kind: ReplayEventKind, id: ListenerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }

    fn control_operation(
        &self,
        label: &'static str,
        call: fn(&dyn FabricApi, ReplayHandle) -> Status,
    ) -> BridgeResult<Operation<Option<Status>, ()>> {
        self.inner.lifecycle.ensure_accepting()?;
        let inner = Arc::clone(&self.inner);
        Ok(Operation::new(
            label,
            move || inner.with_native(|native| call(inner.api.as_ref(), native)),
            move |status| match status {
                Some(status) => status.check(label),
                None => Err(BridgeError::closed("replay")),
            },
        ))
    }

    fn pause_operation(&self) -> BridgeResult<Operation<Option<Status>, ()>> {
        self.control_operation("replay_pause", |api, native| api.replay_pause(native))
    }

    fn resume_operation(&self) -> BridgeResult<Operation<Option<Status>, ()>> {
        self.control_operation("replay_resume", |api, native| api.replay_resume(native))
    }

    /// Pause delivery; `pause` fires when the fabric confirms.
    pub fn pause<C>(&self, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<()>) -> ListenerResult + Send + 'static,
    {
        self.pause_operation()?
            .spawn(&self.inner.host, "replay", callback);
        Ok(())
    }

    pub fn pause_blocking(&self) -> BridgeResult<()> {
        self.pause_operation()?.run_blocking()
    }

    pub fn resume<C>(&self, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<()>) -> ListenerResult + Send + 'static,
    {
        self.resume_operation()?
            .spawn(&self.inner.host, "replay", callback);
        Ok(())
    }

    pub fn resume_blocking(&self) -> BridgeResult<()> {
        self.resume_operation()?.run_blocking()
    }

    fn stop_operation(&self) -> BridgeResult<Operation<Status, ()>> {
        self.inner.lifecycle.ensure_accepting()?;
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::closed("replay"));
        }
        let worker = Arc::clone(&self.inner);
        let inner = Arc::clone(&self.inner);
        Ok(Operation::new(
            "stop",
            move || match worker.take_native() {
                Some(native) => worker.api.replay_release(native),
                None => Status::OK,
            },
            move |status| {
                let result = status.check("replay_release");
                inner.lifecycle.begin_draining();
                if let Err(ReplaySignal::Stopped(result)) =
                    inner.messages.post(ReplaySignal::Stopped(result.clone()))
                {
                    inner.stopped(result);
                }
                result
            },
        ))
    }

    /// Release the native replay. Messages already queued are delivered,
    /// then `stop` fires.
    pub fn stop<C>(&self, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<()>) -> ListenerResult + Send + 'static,
    {
        self.stop_operation()?
            .spawn(&self.inner.host, "replay", callback);
        Ok(())
    }

    pub fn stop_blocking(&self) -> BridgeResult<()> {
        self.stop_operation()?.run_blocking()
    }
}
