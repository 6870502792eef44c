//! Wire envelope for channel traffic.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::TransportAnomaly;

/// Name of the envelope wrapping a correlated request.
pub const INTERNAL_REQUEST: &str = "internal-request-message";

/// Name of the envelope carrying the reply to a correlated request.
pub const INTERNAL_REPLY: &str = "internal-reply-message";

/// A message vocabulary that can travel over a [`super::Channel`].
///
/// Implementations are serde enums tagged by `name`; `name()` must return
/// the same tag so handler registration can be checked before dispatch.
pub trait ChannelMessage: Serialize + DeserializeOwned {
    fn name(&self) -> &'static str;
}

/// Decoded channel envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<M> {
    /// Fire-and-forget message.
    Message(M),
    /// Correlated request expecting exactly one reply.
    Request { request_id: u64, payload: M },
    /// Reply to a previously sent request.
    Reply { request_id: u64, result: Value },
}

impl<M: DeserializeOwned> Envelope<M> {
    pub fn decode(raw: Value) -> Result<Self, TransportAnomaly> {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or(TransportAnomaly::MalformedEnvelope)?;

        match name {
            INTERNAL_REQUEST => {
                let request_id = request_id(&raw)?;
                let payload = raw
                    .get("payload")
                    .cloned()
                    .ok_or(TransportAnomaly::MalformedEnvelope)?;
                let payload = serde_json::from_value(payload)
                    .map_err(|_| TransportAnomaly::MalformedEnvelope)?;
                Ok(Self::Request {
                    request_id,
                    payload,
                })
            }
            INTERNAL_REPLY => Ok(Self::Reply {
                request_id: request_id(&raw)?,
                result: raw.get("result").cloned().unwrap_or(Value::Null),
            }),
            _ => serde_json::from_value(raw)
                .map(Self::Message)
                .map_err(|_| TransportAnomaly::MalformedEnvelope),
        }
    }
}

impl<M: Serialize> Envelope<M> {
    pub fn encode(&self) -> Value {
        match self {
            Self::Message(message) => serde_json::to_value(message).unwrap_or(Value::Null),
            Self::Request {
                request_id,
                payload,
            } => json!({
                "name": INTERNAL_REQUEST,
                "requestId": request_id,
                "payload": serde_json::to_value(payload).unwrap_or(Value::Null),
            }),
            Self::Reply { request_id, result } => json!({
                "name": INTERNAL_REPLY,
                "requestId": request_id,
                "result": result,
            }),
        }
    }
}

fn request_id(raw: &Value) -> Result<u64, TransportAnomaly> {
    raw.get("requestId")
        .and_then(Value::as_u64)
        .ok_or(TransportAnomaly::MalformedEnvelope)
}
