//! Publications and the send path.
//!
//! Fields are converted on the host thread, so a bad value is reported to
//! the caller before any native call. The native create/set/send sequence
//! runs on a worker under the publication's send lock. Best-effort and
//! guaranteed-connected sends complete as soon as the worker returns; GD
//! sends are parked in the session's [`GdAckWindow`](crate::session::GdAckWindow)
//! and complete when the router sees their outcome.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SendOptions;
use crate::error::{BridgeError, BridgeResult, ListenerResult, LockResultExt};
use crate::host::{
    EntityLifecycle, EventKind, LifecycleState, ListenerId, ListenerTable, LoopHandle, Operation,
    guarded,
};
use crate::message::OutboundMessage;
use crate::message::convert::outbound_fields;
use crate::native::{
    FabricApi, GdHandle, MessageForm, NativeValue, OutboundHandle, PublisherHandle, Qos, Status,
};
use crate::session::{Acquired, GdCompletion, SessionInner, log_cleanup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicationEventKind {
    /// A send completed, successfully or not.
    Message,
}

const PUBLICATION_EVENTS: &[PublicationEventKind] = &[PublicationEventKind::Message];

impl EventKind for PublicationEventKind {
    fn name(self) -> &'static str {
        match self {
            PublicationEventKind::Message => "message",
        }
    }
}

impl FromStr for PublicationEventKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(PublicationEventKind::Message),
            _ => Err(BridgeError::invalid_argument(format!(
                "Unknown publication event '{s}'"
            ))),
        }
    }
}

/// Outcome of one send.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub topic: String,
    pub error: Option<BridgeError>,
    /// The application's own message object.
    pub message: Arc<OutboundMessage>,
}

impl SendResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

type SendCallback = Box<dyn FnOnce(&SendResult) -> ListenerResult + Send>;

pub(crate) struct PublicationInner {
    host: LoopHandle,
    api: Arc<dyn FabricApi>,
    session: Arc<SessionInner>,
    topic: String,
    qos: Qos,
    /// Also the send lock.
    publisher: Mutex<Option<PublisherHandle>>,
    lifecycle: EntityLifecycle,
    listeners: ListenerTable<PublicationEventKind, SendResult>,
    stopping: AtomicBool,
}

/// A send awaiting its completion.
pub(crate) struct PendingSend {
    publication: Arc<PublicationInner>,
    topic: String,
    message: Arc<OutboundMessage>,
    callback: Option<SendCallback>,
}

impl PendingSend {
    /// Emit `message` and run the per-send callback. Host thread only.
    fn finish(self, result: BridgeResult<()>) {
        let PendingSend {
            publication,
            topic,
            message,
            callback,
        } = self;
        let outcome = SendResult {
            topic,
            error: result.err(),
            message,
        };
        if let Some(error) = &outcome.error {
            log::debug!(
                target: "fabric_bridge::publication",
                "Send on {} failed: {}",
                outcome.topic,
                error
            );
        }
        publication
            .listeners
            .emit(&publication.host, PublicationEventKind::Message, &outcome);
        if let Some(callback) = callback {
            guarded(&publication.host, "publication", "message", || {
                callback(&outcome)
            });
        }
    }
}

impl GdCompletion for PendingSend {
    fn complete(self, result: BridgeResult<()>) {
        self.finish(result);
    }
}

/// What the worker leaves for the host thread to complete.
struct SendAttempt {
    completed: Option<(PendingSend, BridgeResult<()>)>,
    evicted: Option<(u32, PendingSend)>,
}

impl SendAttempt {
    fn done(pending: PendingSend, result: BridgeResult<()>) -> Self {
        Self {
            completed: Some((pending, result)),
            evicted: None,
        }
    }

    fn settle(self) {
        if let Some((slot, evicted)) = self.evicted {
            evicted.finish(Err(BridgeError::GdWindowOverwritten { slot }));
        }
        if let Some((pending, result)) = self.completed {
            pending.finish(result);
        }
    }
}

/// Outbound native message, destroyed when dropped.
struct OutboundDraft<'a> {
    api: &'a dyn FabricApi,
    handle: OutboundHandle,
}

impl<'a> OutboundDraft<'a> {
    fn build(
        api: &'a dyn FabricApi,
        publisher: PublisherHandle,
        topic: &str,
        form: MessageForm,
        fields: &[(String, NativeValue)],
    ) -> BridgeResult<Self> {
        let handle = api
            .message_create(publisher, topic, form, fields.len())
            .map_err(|status| BridgeError::native("message_create", status))?;
        let draft = Self { api, handle };
        for (name, value) in fields {
            api.message_set_field(handle, name, value)
                .check("message_set_field")?;
        }
        Ok(draft)
    }
}

impl Drop for OutboundDraft<'_> {
    fn drop(&mut self) {
        self.api.message_destroy(self.handle);
    }
}

impl PublicationInner {
    /// Worker half of a send, serialized by the publisher lock.
    fn send_on_worker(
        &self,
        gd: Option<GdHandle>,
        form: MessageForm,
        fields: Vec<(String, NativeValue)>,
        pending: PendingSend,
    ) -> SendAttempt {
        let guard = self.publisher.lock().recover_poison("PublicationInner::send_on_worker");
        let Some(publisher) = *guard else {
            return SendAttempt::done(pending, Err(BridgeError::closed("publication")));
        };
        let draft = match OutboundDraft::build(
            self.api.as_ref(),
            publisher,
            &pending.topic,
            form,
            &fields,
        ) {
            Ok(draft) => draft,
            Err(error) => return SendAttempt::done(pending, Err(error)),
        };

        if !self.qos.is_guaranteed_delivery() {
            let result = self.api.message_send(draft.handle, false).check("message_send");
            return SendAttempt::done(pending, result);
        }

        let (Some(window), Some(gd)) = (self.session.window.as_ref(), gd) else {
            return SendAttempt::done(pending, Err(BridgeError::GdNotEnabled));
        };
        let Acquired { ticket, evicted } = match window.acquire(pending) {
            Ok(acquired) => acquired,
            Err((pending, error)) => return SendAttempt::done(pending, Err(error)),
        };
        let completed = match self
            .api
            .gd_message_send(gd, draft.handle, ticket.slot)
            .check("gd_message_send")
        {
            Ok(()) => None,
            // None: already completed by termination.
            Err(error) => window.retract(ticket).map(|pending| (pending, Err(error))),
        };
        SendAttempt { completed, evicted }
    }
}

pub(crate) fn create_operation(
    session: &Arc<SessionInner>,
    topic: &str,
) -> BridgeResult<Operation<BridgeResult<(PublisherHandle, Qos)>, Publication>> {
    if topic.is_empty() {
        return Err(BridgeError::invalid_argument("Topic must not be empty"));
    }
    let native = session.ensure_accepting()?;
    let api = Arc::clone(&session.api);
    let worker_topic = topic.to_string();
    let topic = topic.to_string();
    let session = Arc::clone(session);
    Ok(Operation::new(
        "create_publication",
        move || {
            let publisher = api
                .publication_create(native.session, &worker_topic)
                .map_err(|status| BridgeError::native("publication_create", status))?;
            let qos = match api.publication_qos(publisher) {
                Ok(qos) => qos,
                Err(status) => {
                    log_cleanup(api.publication_cancel(publisher), "publication_cancel");
                    return Err(BridgeError::native("publication_qos", status));
                }
            };
            if qos.is_guaranteed_delivery() && native.gd.is_none() {
                log_cleanup(api.publication_cancel(publisher), "publication_cancel");
                return Err(BridgeError::GdNotEnabled);
            }
            Ok((publisher, qos))
        },
        move |created| {
            let (publisher, qos) = created?;
            let inner = Arc::new(PublicationInner {
                host: session.host.clone(),
                api: Arc::clone(&session.api),
                session,
                topic,
                qos,
                publisher: Mutex::new(Some(publisher)),
                lifecycle: EntityLifecycle::new("publication"),
                listeners: ListenerTable::new("publication", PUBLICATION_EVENTS),
                stopping: AtomicBool::new(false),
            });
            inner.lifecycle.activate();
            log::debug!(
                target: "fabric_bridge::publication",
                "Publication on {} ({})",
                inner.topic,
                qos
            );
            Ok(Publication { inner })
        },
    ))
}

/// A publisher on one topic.
#[derive(Clone)]
pub struct Publication {
    inner: Arc<PublicationInner>,
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("topic", &self.inner.topic)
            .field("qos", &self.inner.qos)
            .field("state", &self.state())
            .finish()
    }
}

impl Publication {
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
        kind: PublicationEventKind,
        listener: impl FnMut(&SendResult) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, false)
    }

    pub fn once(
        &self,
        kind: PublicationEventKind,
        listener: impl FnMut(&SendResult) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add(kind, listener, true)
    }

    pub fn on_named(
        &self,
        name: &str,
        listener: impl FnMut(&SendResult) -> ListenerResult + Send + 'static,
    ) -> BridgeResult<ListenerId> {
        self.inner.listeners.add_named(name, listener, false)
    }

    pub fn remove_listeners(&self, kind: PublicationEventKind) -> usize {
        self.inner.listeners.remove_all(kind)
    }

    /// Remove one listener registered with `on` or `once`.
    pub fn remove_listener(&self, kind: PublicationEventKind, id: ListenerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }

    /// Fire-and-forget send; the outcome is emitted as `message`.
    pub fn send_message(
        &self,
        topic: &str,
        message: impl Into<Arc<OutboundMessage>>,
        options: SendOptions,
    ) -> BridgeResult<()> {
        self.send(topic, message.into(), options, None)
    }

    /// Like [`send_message`](Self::send_message), also invoking `callback`
    /// after the `message` listeners.
    pub fn send_message_with<C>(
        &self,
        topic: &str,
        message: impl Into<Arc<OutboundMessage>>,
        options: SendOptions,
        callback: C,
    ) -> BridgeResult<()>
    where
        C: FnOnce(&SendResult) -> ListenerResult + Send + 'static,
    {
        self.send(topic, message.into(), options, Some(Box::new(callback)))
    }

    fn send(
        &self,
        topic: &str,
        message: Arc<OutboundMessage>,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> BridgeResult<()> {
        let inner = &self.inner;
        inner.lifecycle.ensure_accepting()?;
        if topic.is_empty() {
            return Err(BridgeError::invalid_argument("Topic must not be empty"));
        }
        let fields = outbound_fields(&message)?;
        let native = inner.session.ensure_accepting()?;

        let pending = PendingSend {
            publication: Arc::clone(inner),
            topic: topic.to_string(),
            message,
            callback,
        };
        let worker = Arc::clone(inner);
        inner.host.queue_work(
            "send_message",
            move || worker.send_on_worker(native.gd, options.form, fields, pending),
            |attempt| match attempt {
                Ok(attempt) => attempt.settle(),
                Err(error) => log::error!(
                    target: "fabric_bridge::publication",
                    "Send worker failed: {}",
                    error
                ),
            },
        );
        Ok(())
    }

    fn stop_operation(&self) -> BridgeResult<Operation<Status, ()>> {
        self.inner.lifecycle.ensure_accepting()?;
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::closed("publication"));
        }
        let worker = Arc::clone(&self.inner);
        let inner = Arc::clone(&self.inner);
        Ok(Operation::new(
            "stop",
            move || {
                let publisher = worker
                    .publisher
                    .lock()
                    .recover_poison("Publication::stop_operation")
                    .take();
                match publisher {
                    Some(publisher) => worker.api.publication_cancel(publisher),
                    None => Status::OK,
                }
            },
            move |status| {
                inner.lifecycle.begin_draining();
                inner.lifecycle.close();
                status.check("publication_cancel")
            },
        ))
    }

    /// Cancel the native publisher. Sends already queued fail with
    /// [`BridgeError::Closed`].
    pub fn stop<C>(&self, callback: C) -> BridgeResult<()>
    where
        C: FnOnce(BridgeResult<()>) -> ListenerResult + Send + 'static,
    {
        self.stop_operation()?
            .spawn(&self.inner.host, "publication", callback);
        Ok(())
    }

    pub fn stop_blocking(&self) -> BridgeResult<()> {
        self.stop_operation()?.run_blocking()
    }
}
