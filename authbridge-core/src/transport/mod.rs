//! Channel routing across a tree of browsing surfaces.
//!
//! One [`Transport`] per surface. The host runs the daemon role and accepts
//! connect handshakes from allow-listed origins only. Every other surface
//! runs the relay role: it owns local channel endpoints, proxies frames for
//! its children upward and downward without looking at payloads, and
//! buffers upstream traffic until its parent announces itself with `init`.
//!
//! The route table is the only state shared between endpoints of one
//! document, so it lives in a [`DashMap`] and registration goes through the
//! entry API.

mod origin;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

pub use origin::{is_http_like, origin_of, same_origin, OriginAllowList};

use crate::channel::PostTarget;
use crate::error::{BridgeError, Result, TransportAnomaly};

/// Locally generated channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ChannelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Frame exchanged between adjacent transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Parent announces itself as the upstream target.
    Init,
    #[serde(rename_all = "camelCase")]
    Connect { channel_id: ChannelId, name: String },
    #[serde(rename_all = "camelCase")]
    Message { channel_id: ChannelId, payload: Value },
    #[serde(rename_all = "camelCase")]
    Disconnect { channel_id: ChannelId },
}

impl Frame {
    pub fn decode(raw: Value) -> std::result::Result<Self, TransportAnomaly> {
        serde_json::from_value(raw).map_err(|_| TransportAnomaly::MalformedFrame)
    }

    pub fn encode(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Where an inbound frame came from.
#[derive(Clone)]
pub enum Source {
    /// The surface that embeds this one.
    Parent(Arc<dyn PostTarget>),
    /// An embedded surface; `port` posts back down to it.
    Child {
        origin: String,
        port: Arc<dyn PostTarget>,
    },
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parent(_) => f.write_str("Parent"),
            Self::Child { origin, .. } => f.debug_struct("Child").field("origin", origin).finish(),
        }
    }
}

/// A frame that reached a local endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A child opened a channel to the daemon.
    Connected {
        channel_id: ChannelId,
        name: String,
        origin: String,
    },
    Message {
        channel_id: ChannelId,
        payload: Value,
    },
    Disconnected {
        channel_id: ChannelId,
    },
}

#[derive(Debug, Clone)]
pub enum Role {
    Daemon(OriginAllowList),
    Relay,
}

#[derive(Clone)]
enum Route {
    /// Endpoint owned by this surface.
    Local,
    /// Endpoint owned by a descendant reached through `port`.
    Downstream {
        origin: String,
        port: Arc<dyn PostTarget>,
    },
}

#[derive(Default)]
struct Upstream {
    target: Option<Arc<dyn PostTarget>>,
    buffer: VecDeque<Value>,
}

/// Per-surface router.
pub struct Transport {
    role: Role,
    routes: DashMap<ChannelId, Route>,
    upstream: Mutex<Upstream>,
    anomalies: DashMap<TransportAnomaly, u64>,
}

impl Transport {
    pub fn daemon(allow_list: OriginAllowList) -> Self {
        Self::with_role(Role::Daemon(allow_list))
    }

    pub fn relay() -> Self {
        Self::with_role(Role::Relay)
    }

    fn with_role(role: Role) -> Self {
        Self {
            role,
            routes: DashMap::new(),
            upstream: Mutex::new(Upstream::default()),
            anomalies: DashMap::new(),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self.role, Role::Daemon(_))
    }

    /// Number of live routes.
    pub fn channel_count(&self) -> usize {
        self.routes.len()
    }

    pub fn has_channel(&self, channel_id: ChannelId) -> bool {
        self.routes.contains_key(&channel_id)
    }

    pub fn has_upstream(&self) -> bool {
        self.lock_upstream().target.is_some()
    }

    /// Frames waiting for the parent to announce itself.
    pub fn buffered(&self) -> usize {
        self.lock_upstream().buffer.len()
    }

    pub fn anomaly_count(&self, anomaly: TransportAnomaly) -> u64 {
        self.anomalies.get(&anomaly).map(|c| *c).unwrap_or(0)
    }

    /// Tell a freshly embedded child that this surface is its upstream.
    pub fn announce(&self, child: &dyn PostTarget) {
        child.post_message(Frame::Init.encode());
    }

    /// Open a local endpoint named `name` toward the daemon.
    pub fn connect(&self, name: &str) -> Result<ChannelId> {
        if self.is_daemon() {
            return Err(BridgeError::Transport(
                "the daemon accepts connections, it does not open them".into(),
            ));
        }
        let channel_id = loop {
            let candidate = ChannelId::generate();
            if let Entry::Vacant(slot) = self.routes.entry(candidate) {
                slot.insert(Route::Local);
                break candidate;
            }
        };
        debug!(channel = %channel_id, name, "Connecting channel");
        self.send_upstream(Frame::Connect {
            channel_id,
            name: name.to_string(),
        });
        Ok(channel_id)
    }

    /// Close an endpoint; the far side sees a disconnect.
    pub fn disconnect(&self, channel_id: ChannelId) {
        let Some((_, route)) = self.routes.remove(&channel_id) else {
            return;
        };
        let frame = Frame::Disconnect { channel_id };
        match route {
            Route::Local => self.send_upstream(frame),
            Route::Downstream { port, .. } => port.post_message(frame.encode()),
        }
    }

    /// Send `payload` on an open channel.
    pub fn send(&self, channel_id: ChannelId, payload: Value) {
        // Clone the route out so no map guard is held while posting.
        let route = self.routes.get(&channel_id).map(|r| r.clone());
        let frame = Frame::Message {
            channel_id,
            payload,
        };
        match route {
            Some(Route::Local) => self.send_upstream(frame),
            Some(Route::Downstream { port, .. }) => port.post_message(frame.encode()),
            None => self.record_anomaly(TransportAnomaly::UnknownChannel),
        }
    }

    /// A [`PostTarget`] that sends on `channel_id` through this transport.
    pub fn port(self: &Arc<Self>, channel_id: ChannelId) -> Arc<dyn PostTarget> {
        Arc::new(TransportPort {
            transport: Arc::clone(self),
            channel_id,
        })
    }

    /// Process one inbound frame.
    ///
    /// Returns the delivery for a local endpoint, if any. Everything that is
    /// dropped is counted as an anomaly; nothing here fails.
    pub fn receive(&self, source: Source, raw: Value) -> Option<Delivery> {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(anomaly) => {
                self.record_anomaly(anomaly);
                return None;
            }
        };

        match source {
            Source::Parent(parent) => self.receive_from_parent(parent, frame),
            Source::Child { origin, port } => self.receive_from_child(origin, port, frame),
        }
    }

    fn receive_from_parent(&self, parent: Arc<dyn PostTarget>, frame: Frame) -> Option<Delivery> {
        if self.is_daemon() {
            self.record_anomaly(TransportAnomaly::UnexpectedInit);
            return None;
        }
        match frame {
            Frame::Init => {
                self.resolve_upstream(parent);
                None
            }
            Frame::Connect { .. } => {
                self.record_anomaly(TransportAnomaly::MalformedFrame);
                None
            }
            Frame::Message {
                channel_id,
                payload,
            } => match self.route(channel_id) {
                Some(Route::Local) => Some(Delivery::Message {
                    channel_id,
                    payload,
                }),
                Some(Route::Downstream { port, .. }) => {
                    port.post_message(
                        Frame::Message {
                            channel_id,
                            payload,
                        }
                        .encode(),
                    );
                    None
                }
                None => {
                    self.record_anomaly(TransportAnomaly::UnknownChannel);
                    None
                }
            },
            Frame::Disconnect { channel_id } => match self.routes.remove(&channel_id) {
                Some((_, Route::Local)) => Some(Delivery::Disconnected { channel_id }),
                Some((_, Route::Downstream { port, .. })) => {
                    port.post_message(Frame::Disconnect { channel_id }.encode());
                    None
                }
                None => {
                    self.record_anomaly(TransportAnomaly::UnknownChannel);
                    None
                }
            },
        }
    }

    fn receive_from_child(
        &self,
        origin: String,
        port: Arc<dyn PostTarget>,
        frame: Frame,
    ) -> Option<Delivery> {
        match frame {
            Frame::Init => {
                self.record_anomaly(TransportAnomaly::UnexpectedInit);
                None
            }
            Frame::Connect { channel_id, name } => {
                if let Role::Daemon(allow_list) = &self.role {
                    if !allow_list.allows(&origin) {
                        debug!(%origin, "Connect handshake from disallowed origin");
                        self.record_anomaly(TransportAnomaly::DisallowedOrigin);
                        return None;
                    }
                }
                match self.routes.entry(channel_id) {
                    Entry::Occupied(_) => {
                        self.record_anomaly(TransportAnomaly::ChannelIdCollision);
                        return None;
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Route::Downstream {
                            origin: origin.clone(),
                            port,
                        });
                    }
                }
                if self.is_daemon() {
                    debug!(channel = %channel_id, %name, %origin, "Channel connected");
                    Some(Delivery::Connected {
                        channel_id,
                        name,
                        origin,
                    })
                } else {
                    self.send_upstream(Frame::Connect { channel_id, name });
                    None
                }
            }
            Frame::Message {
                channel_id,
                payload,
            } => {
                if !self.owned_by(channel_id, &origin) {
                    return None;
                }
                let frame = Frame::Message {
                    channel_id,
                    payload,
                };
                self.deliver_or_forward(frame)
            }
            Frame::Disconnect { channel_id } => {
                if !self.owned_by(channel_id, &origin) {
                    return None;
                }
                self.routes.remove(&channel_id);
                self.deliver_or_forward(Frame::Disconnect { channel_id })
            }
        }
    }

    /// Whether `channel_id` was opened by a child at `origin`.
    fn owned_by(&self, channel_id: ChannelId, origin: &str) -> bool {
        match self.route(channel_id) {
            Some(Route::Downstream { origin: owner, .. }) if owner == origin => true,
            Some(Route::Downstream { .. }) => {
                self.record_anomaly(TransportAnomaly::DisallowedOrigin);
                false
            }
            Some(Route::Local) | None => {
                self.record_anomaly(TransportAnomaly::UnknownChannel);
                false
            }
        }
    }

    fn deliver_or_forward(&self, frame: Frame) -> Option<Delivery> {
        if !self.is_daemon() {
            self.send_upstream(frame);
            return None;
        }
        match frame {
            Frame::Message {
                channel_id,
                payload,
            } => Some(Delivery::Message {
                channel_id,
                payload,
            }),
            Frame::Disconnect { channel_id } => Some(Delivery::Disconnected { channel_id }),
            Frame::Init | Frame::Connect { .. } => None,
        }
    }

    fn route(&self, channel_id: ChannelId) -> Option<Route> {
        self.routes.get(&channel_id).map(|r| r.clone())
    }

    /// Install the parent target and flush buffered frames in order.
    ///
    /// Frames sent while the flush is running are appended to the buffer and
    /// drained by the same loop, so ordering holds even if posting re-enters
    /// this transport.
    fn resolve_upstream(&self, target: Arc<dyn PostTarget>) {
        loop {
            let batch = {
                let mut upstream = self.lock_upstream();
                if upstream.buffer.is_empty() {
                    upstream.target = Some(Arc::clone(&target));
                    break;
                }
                std::mem::take(&mut upstream.buffer)
            };
            debug!(count = batch.len(), "Flushing buffered upstream frames");
            for frame in batch {
                target.post_message(frame);
            }
        }
    }

    fn send_upstream(&self, frame: Frame) {
        let encoded = frame.encode();
        let target = {
            let mut upstream = self.lock_upstream();
            match &upstream.target {
                Some(target) => Arc::clone(target),
                None => {
                    upstream.buffer.push_back(encoded);
                    return;
                }
            }
        };
        target.post_message(encoded);
    }

    fn lock_upstream(&self) -> std::sync::MutexGuard<'_, Upstream> {
        self.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a dropped input.
    pub fn record_anomaly(&self, anomaly: TransportAnomaly) {
        warn!(%anomaly, "Transport frame dropped");
        *self.anomalies.entry(anomaly).or_default() += 1;
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("channels", &self.routes.len())
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// Sends on one channel of a shared [`Transport`].
pub struct TransportPort {
    transport: Arc<Transport>,
    channel_id: ChannelId,
}

impl PostTarget for TransportPort {
    fn post_message(&self, message: Value) {
        self.transport.send(self.channel_id, message);
    }
}
