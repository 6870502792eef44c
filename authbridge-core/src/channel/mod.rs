//! Symmetric RPC over an untrusted message pipe.
//!
//! A [`Channel`] sends fire-and-forget messages, correlated requests whose
//! reply resolves a callback or a future, and dispatches inbound messages to
//! a [`MessageHandler`] for the names registered on it.
//!
//! Replies to inbound requests go out in the order the requests arrived,
//! even when a handler answers with a deferred [`Reply`].

mod envelope;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub use envelope::{ChannelMessage, Envelope, INTERNAL_REPLY, INTERNAL_REQUEST};

use crate::error::TransportAnomaly;
use crate::transport::ChannelId;

/// Anything a serialized message can be posted to.
pub trait PostTarget: Send + Sync {
    fn post_message(&self, message: Value);
}

impl PostTarget for mpsc::UnboundedSender<Value> {
    fn post_message(&self, message: Value) {
        if self.send(message).is_err() {
            debug!("Post target closed, message dropped");
        }
    }
}

/// A handler's answer to a request.
#[derive(Debug)]
pub enum Reply {
    Ready(Value),
    /// Resolved later; later replies queue behind it.
    Deferred(oneshot::Receiver<Value>),
}

impl Reply {
    pub fn none() -> Self {
        Self::Ready(Value::Null)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Ready(value)
    }
}

/// Receives messages dispatched by a [`Channel`].
pub trait MessageHandler<M> {
    fn handle(&mut self, message: M) -> Reply;
}

impl<M, F> MessageHandler<M> for F
where
    F: FnMut(M) -> Reply,
{
    fn handle(&mut self, message: M) -> Reply {
        self(message)
    }
}

enum PendingCall {
    Callback(Box<dyn FnOnce(Value) + Send>),
    Future(oneshot::Sender<Value>),
}

impl PendingCall {
    fn complete(self, result: Value) {
        match self {
            Self::Callback(callback) => callback(result),
            Self::Future(sender) => {
                if sender.send(result).is_err() {
                    debug!("Reply future dropped before completion");
                }
            }
        }
    }
}

/// One logical bidirectional pipe.
pub struct Channel<M> {
    id: ChannelId,
    name: String,
    target: Option<Arc<dyn PostTarget>>,
    outbound: VecDeque<Value>,
    handlers: HashSet<&'static str>,
    pending: HashMap<u64, PendingCall>,
    next_request_id: u64,
    replies: VecDeque<(u64, Reply)>,
    _message: PhantomData<fn() -> M>,
}

impl<M: ChannelMessage> Channel<M> {
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            target: None,
            outbound: VecDeque::new(),
            handlers: HashSet::new(),
            pending: HashMap::new(),
            next_request_id: 0,
            replies: VecDeque::new(),
            _message: PhantomData,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// Number of messages waiting for a target.
    pub fn buffered(&self) -> usize {
        self.outbound.len()
    }

    /// Number of requests still waiting for their reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Resolve the target and flush buffered traffic in FIFO order.
    pub fn set_target(&mut self, target: Arc<dyn PostTarget>) {
        let buffered = std::mem::take(&mut self.outbound);
        if !buffered.is_empty() {
            debug!(channel = %self.id, count = buffered.len(), "Flushing buffered messages");
        }
        for message in buffered {
            target.post_message(message);
        }
        self.target = Some(target);
    }

    /// Accept inbound messages named `name`.
    pub fn register(&mut self, name: &'static str) {
        self.handlers.insert(name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains(name)
    }

    pub fn send(&mut self, message: &M) {
        self.post(Envelope::Message(message).encode());
    }

    pub fn send_with_callback<F>(&mut self, message: &M, callback: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let request_id = self.allocate_request_id();
        self.pending
            .insert(request_id, PendingCall::Callback(Box::new(callback)));
        self.post(
            Envelope::Request {
                request_id,
                payload: message,
            }
            .encode(),
        );
    }

    /// Like [`Self::send_with_callback`], returning the reply as a future.
    pub fn request(&mut self, message: &M) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let request_id = self.allocate_request_id();
        self.pending.insert(request_id, PendingCall::Future(tx));
        self.post(
            Envelope::Request {
                request_id,
                payload: message,
            }
            .encode(),
        );
        rx
    }

    /// Process one inbound envelope.
    ///
    /// Requests for unregistered names still get a `null` reply so the
    /// remote side never waits forever; the anomaly is reported to the
    /// caller either way.
    pub fn receive<H>(&mut self, raw: Value, handler: &mut H) -> Result<(), TransportAnomaly>
    where
        H: MessageHandler<M>,
    {
        match Envelope::<M>::decode(raw)? {
            Envelope::Reply { request_id, result } => {
                let call = self.pending.remove(&request_id).ok_or_else(|| {
                    debug!(channel = %self.id, request_id, "Reply for unknown request dropped");
                    TransportAnomaly::UnmatchedReply
                })?;
                call.complete(result);
                Ok(())
            }
            Envelope::Request {
                request_id,
                payload,
            } => {
                let registered = self.is_registered(payload.name());
                let reply = if registered {
                    handler.handle(payload)
                } else {
                    warn!(channel = %self.id, kind = payload.name(), "No handler registered");
                    Reply::none()
                };
                self.replies.push_back((request_id, reply));
                self.flush_replies();
                if registered {
                    Ok(())
                } else {
                    Err(TransportAnomaly::UnregisteredMessage)
                }
            }
            Envelope::Message(payload) => {
                if !self.is_registered(payload.name()) {
                    warn!(channel = %self.id, kind = payload.name(), "No handler registered");
                    return Err(TransportAnomaly::UnregisteredMessage);
                }
                // Replies to plain messages have nowhere to go.
                drop(handler.handle(payload));
                Ok(())
            }
        }
    }

    /// Send every reply at the head of the queue that is ready.
    ///
    /// Returns the number of replies sent.
    pub fn flush_replies(&mut self) -> usize {
        let mut sent = 0;
        loop {
            let result = match self.replies.front_mut() {
                None => break,
                Some((_, Reply::Ready(value))) => std::mem::take(value),
                Some((_, Reply::Deferred(rx))) => match rx.try_recv() {
                    Ok(value) => value,
                    Err(oneshot::error::TryRecvError::Empty) => break,
                    Err(oneshot::error::TryRecvError::Closed) => Value::Null,
                },
            };
            let Some((request_id, _)) = self.replies.pop_front() else {
                break;
            };
            self.post(Envelope::<M>::Reply { request_id, result }.encode());
            sent += 1;
        }
        sent
    }

    /// Tear down: drops pending callbacks without invoking them.
    pub fn close(&mut self) {
        if !self.pending.is_empty() {
            debug!(channel = %self.id, count = self.pending.len(), "Dropping pending requests");
        }
        self.pending.clear();
        self.replies.clear();
        self.outbound.clear();
        self.target = None;
    }

    fn allocate_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn post(&mut self, message: Value) {
        match &self.target {
            Some(target) => target.post_message(message),
            None => self.outbound.push_back(message),
        }
    }
}

impl<M> fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_target", &self.target.is_some())
            .field("buffered", &self.outbound.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
