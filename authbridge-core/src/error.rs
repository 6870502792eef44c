use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Malformed header {name}: {reason}")]
    MalformedHeader { name: &'static str, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication service is not running")]
    ServiceStopped,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Credential API misuse, classified into a bounded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorKind {
    UnsupportedKey,
    ConfirmTokenMismatch,
    UnsupportedMessage,
    CreateTokenMismatch,
    UnknownMessage,
    NotInitialized,
    PasswordNotConfirmed,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedKey => "UNSUPPORTED_KEY",
            Self::ConfirmTokenMismatch => "CONFIRM_TOKEN_MISMATCH",
            Self::UnsupportedMessage => "UNSUPPORTED_MESSAGE",
            Self::CreateTokenMismatch => "CREATE_TOKEN_MISMATCH",
            Self::UnknownMessage => "UNKNOWN_MESSAGE",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::PasswordNotConfirmed => "PASSWORD_NOT_CONFIRMED",
        };
        f.write_str(name)
    }
}

/// Device attestation event that arrived out of order, keyed by the call
/// site that detected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageViolation {
    /// Challenge header while a cycle is signing or replaying.
    ChallengeDuringCycle,
    /// Main-frame request while the signing collaborator is still running.
    RequestWhileSigning,
    /// Replay went to a different destination than the canceled one.
    ReplayUrlMismatch,
    /// Outbound headers for a request that should have been intercepted.
    HeadersBeforeIntercept,
    /// Outbound headers while the signing collaborator is still running.
    HeadersWhileSigning,
    /// Signing result for the active cycle outside `REDIRECT_CANCELED`.
    UnexpectedSignature,
}

impl fmt::Display for StageViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChallengeDuringCycle => "challenge_during_cycle",
            Self::RequestWhileSigning => "request_while_signing",
            Self::ReplayUrlMismatch => "replay_url_mismatch",
            Self::HeadersBeforeIntercept => "headers_before_intercept",
            Self::HeadersWhileSigning => "headers_while_signing",
            Self::UnexpectedSignature => "unexpected_signature",
        };
        f.write_str(name)
    }
}

/// Transport-level input that was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportAnomaly {
    MalformedEnvelope,
    MalformedFrame,
    DisallowedOrigin,
    UnknownChannel,
    UnknownChannelName,
    ChannelIdCollision,
    UnmatchedReply,
    UnregisteredMessage,
    UnexpectedInit,
}

impl fmt::Display for TransportAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedEnvelope => "malformed_envelope",
            Self::MalformedFrame => "malformed_frame",
            Self::DisallowedOrigin => "disallowed_origin",
            Self::UnknownChannel => "unknown_channel",
            Self::UnknownChannelName => "unknown_channel_name",
            Self::ChannelIdCollision => "channel_id_collision",
            Self::UnmatchedReply => "unmatched_reply",
            Self::UnregisteredMessage => "unregistered_message",
            Self::UnexpectedInit => "unexpected_init",
        };
        f.write_str(name)
    }
}

/// Counters for absorbed session faults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FaultCounters {
    pub api: BTreeMap<ApiErrorKind, u64>,
    pub stage: BTreeMap<StageViolation, u64>,
}

impl FaultCounters {
    pub fn record_api(&mut self, kind: ApiErrorKind) {
        *self.api.entry(kind).or_default() += 1;
    }

    pub fn record_stage(&mut self, site: StageViolation) {
        *self.stage.entry(site).or_default() += 1;
    }

    pub fn api_count(&self, kind: ApiErrorKind) -> u64 {
        self.api.get(&kind).copied().unwrap_or(0)
    }

    pub fn stage_count(&self, site: StageViolation) -> u64 {
        self.stage.get(&site).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.api.values().sum::<u64>() + self.stage.values().sum::<u64>()
    }
}
