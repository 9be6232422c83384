// ===============================
// src/bus.rs
// ===============================
//
// In-process router between agents.
// - send      : unicast now, to every handler registered under `receiver`
// - broadcast : now, to every subscribed agent except the sender
// - publish   : enqueue; the dispatcher task unicasts or broadcasts later
//
// A handler that errors or panics is logged and skipped; delivery to the
// remaining handlers goes on and nothing reaches the caller.
//
// Duplicate `subscribe` calls are not merged: the handler then runs once per
// registration.
//
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::AgentError;
use crate::domain::Event;
use crate::message::Message;
use crate::metrics::{BUS_DELIVERIES, BUS_HANDLER_FAILURES, BUS_PUBLISHED};

pub type HandlerFuture = BoxFuture<'static, Result<(), AgentError>>;
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure into a bus handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), AgentError>> + Send + 'static,
{
    Arc::new(move |msg| f(msg).boxed())
}

struct Inner {
    subscribers: RwLock<HashMap<String, Vec<Handler>>>,
    queue_tx: mpsc::UnboundedSender<Message>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    recorder: Option<mpsc::Sender<Event>>,
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl Default for MessageBus {
    fn default() -> Self { Self::new(None) }
}

impl MessageBus {
    /// `recorder` receives a copy of every delivered message (dropped when full).
    pub fn new(recorder: Option<mpsc::Sender<Event>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                shutdown,
                dispatcher: Mutex::new(None),
                recorder,
            }),
        }
    }

    pub async fn subscribe(&self, agent_name: &str, handler: Handler) {
        let mut subs = self.inner.subscribers.write().await;
        subs.entry(agent_name.to_string()).or_default().push(handler);
        debug!(agent = agent_name, "subscribed to bus");
    }

    /// Removes one registration of `handler` (matched by identity).
    pub async fn unsubscribe(&self, agent_name: &str, handler: &Handler) -> bool {
        let mut subs = self.inner.subscribers.write().await;
        let Some(list) = subs.get_mut(agent_name) else { return false };
        match list.iter().position(|h| Arc::ptr_eq(h, handler)) {
            Some(i) => {
                list.remove(i);
                true
            }
            None => false,
        }
    }

    /// Fire-and-forget. Delivery happens on the dispatcher task once `start` ran.
    pub fn publish(&self, message: Message) {
        debug!(%message, "published");
        if self.inner.queue_tx.send(message).is_err() {
            warn!("bus queue closed, message dropped");
        } else {
            BUS_PUBLISHED.inc();
        }
    }

    pub async fn send(&self, message: Message) {
        let Some(receiver) = message.receiver.clone() else {
            warn!(%message, "send without receiver, dropped");
            return;
        };
        let handlers = {
            let subs = self.inner.subscribers.read().await;
            match subs.get(&receiver) {
                Some(list) => list.clone(),
                None => {
                    debug!(%message, "no subscriber for receiver");
                    return;
                }
            }
        };
        self.deliver(&handlers, &message, &receiver).await;
    }

    pub async fn broadcast(&self, message: Message) {
        let targets: Vec<(String, Vec<Handler>)> = {
            let subs = self.inner.subscribers.read().await;
            subs.iter()
                .filter(|(name, _)| **name != message.sender)
                .map(|(name, hs)| (name.clone(), hs.clone()))
                .collect()
        };
        for (name, handlers) in targets {
            self.deliver(&handlers, &message, &name).await;
        }
    }

    async fn deliver(&self, handlers: &[Handler], message: &Message, receiver: &str) {
        if let Some(rec) = &self.inner.recorder {
            let _ = rec.try_send(Event::Msg(message.clone()));
        }
        let kind = message.kind().as_str();
        for h in handlers {
            let h = h.clone();
            let m = message.clone();
            match AssertUnwindSafe(async move { h(m).await }).catch_unwind().await {
                Ok(Ok(())) => {
                    BUS_DELIVERIES.with_label_values(&[kind]).inc();
                }
                Ok(Err(e)) => {
                    BUS_HANDLER_FAILURES.with_label_values(&[receiver]).inc();
                    error!(receiver, message_type = kind, sender = %message.sender, error = %e, "handler failed");
                }
                Err(_) => {
                    BUS_HANDLER_FAILURES.with_label_values(&[receiver]).inc();
                    error!(receiver, message_type = kind, sender = %message.sender, "handler panicked");
                }
            }
        }
    }

    /// Spawns the dispatcher. Calling it again while running is a no-op; after
    /// `stop` it waits for the old dispatcher to hand the queue back first.
    pub async fn start(&self) {
        let mut dispatcher = self.inner.dispatcher.lock().await;
        if let Some(handle) = dispatcher.take() {
            if !handle.is_finished() && !*self.inner.shutdown.borrow() {
                *dispatcher = Some(handle);
                return;
            }
            if let Err(e) = handle.await {
                error!(?e, "previous dispatcher failed");
            }
        }
        let Some(mut rx) = self.inner.queue_rx.lock().await.take() else {
            warn!("bus queue unavailable, dispatcher not started");
            return;
        };
        self.inner.shutdown.send_replace(false);
        let mut stop_rx = self.inner.shutdown.subscribe();
        let bus = self.clone();
        *dispatcher = Some(tokio::spawn(async move {
            info!("message bus started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() { break; }
                    }
                    maybe = rx.recv() => match maybe {
                        Some(msg) => bus.dispatch(msg).await,
                        None => break,
                    },
                }
            }
            *bus.inner.queue_rx.lock().await = Some(rx);
            info!("message bus stopped");
        }));
    }

    pub fn stop(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Drops every subscription. Handlers own their agents, so this is what
    /// lets agents (and the recorder sender) be released at shutdown.
    pub async fn clear(&self) {
        self.inner.subscribers.write().await.clear();
    }

    async fn dispatch(&self, message: Message) {
        if message.receiver.is_some() {
            self.send(message).await;
        } else {
            self.broadcast(message).await;
        }
    }
}
