//! Device attestation cancel-and-replay exchange.
//!
//! A challenge on a 3xx response arms the exchange. The next main-frame
//! request is canceled and its URL remembered while the signer computes a
//! response; once the response is in, the same URL is re-issued and the
//! response header is attached to its outbound headers.
//!
//! Only one cycle is outstanding at a time. Any out-of-order event resets
//! the stage to [`Stage::None`] and is returned as a [`StageViolation`]
//! naming the site that detected it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StageViolation;
use crate::headers::{self, Header, CHALLENGE_HEADER, CHALLENGE_RESPONSE_HEADER, DEVICE_TRUST_HEADER};
use crate::messages::Secret;

/// Where canceled requests are sent.
pub const CANCEL_DESTINATION: &str = "about:blank";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    None,
    ChallengeReceived,
    RedirectCanceled,
    Replaying,
    DeviceTrustFlow,
}

/// Result reported by the signing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttestationOutcome {
    Success { response: Secret },
    Failure {
        #[serde(default)]
        reason: String,
    },
}

/// What to do with an outbound main-frame request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    Proceed,
    /// Redirect to [`CANCEL_DESTINATION`] and sign `challenge` for `url`.
    Cancel {
        cycle: u64,
        url: String,
        challenge: String,
    },
}

#[derive(Debug, Default)]
pub struct DeviceAttestation {
    stage: Stage,
    pending_challenge: Option<String>,
    pending_response: Option<Secret>,
    pending_redirect_url: Option<String>,
    outstanding_cycle: Option<u64>,
    /// Never reset, so results from before a reset stay stale.
    last_cycle: u64,
    device_trust_seen: bool,
}

impl DeviceAttestation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn outstanding_cycle(&self) -> Option<u64> {
        self.outstanding_cycle
    }

    pub fn pending_redirect_url(&self) -> Option<&str> {
        self.pending_redirect_url.as_deref()
    }

    /// Response headers of a tracked request.
    ///
    /// Returns `Ok(true)` when a challenge armed a new cycle.
    pub fn on_headers_received(
        &mut self,
        status: u16,
        response_headers: &[Header],
    ) -> Result<bool, StageViolation> {
        if headers::find(response_headers, DEVICE_TRUST_HEADER).is_some() {
            if self.stage != Stage::DeviceTrustFlow {
                info!("Device trust header observed; attestation stands down");
            }
            self.clear_cycle();
            self.device_trust_seen = true;
            self.stage = Stage::DeviceTrustFlow;
            return Ok(false);
        }
        if self.device_trust_seen {
            return Ok(false);
        }

        let Some(challenge) = headers::find(response_headers, CHALLENGE_HEADER) else {
            return Ok(false);
        };
        if !(300..400).contains(&status) {
            debug!(status, "Challenge header on non-redirect response ignored");
            return Ok(false);
        }
        if self.stage != Stage::None {
            return Err(self.violation(StageViolation::ChallengeDuringCycle));
        }

        debug!("Attestation challenge received");
        self.pending_challenge = Some(challenge.to_string());
        self.stage = Stage::ChallengeReceived;
        Ok(true)
    }

    /// Outbound main-frame request, before it is sent.
    pub fn on_before_request(&mut self, url: &str) -> Result<RequestAction, StageViolation> {
        match self.stage {
            Stage::None | Stage::DeviceTrustFlow => Ok(RequestAction::Proceed),
            Stage::ChallengeReceived => {
                let challenge = self.pending_challenge.take().unwrap_or_default();
                self.last_cycle += 1;
                let cycle = self.last_cycle;
                self.outstanding_cycle = Some(cycle);
                self.pending_redirect_url = Some(url.to_string());
                self.stage = Stage::RedirectCanceled;
                debug!(cycle, %url, "Request canceled for attestation");
                Ok(RequestAction::Cancel {
                    cycle,
                    url: url.to_string(),
                    challenge,
                })
            }
            Stage::RedirectCanceled => Err(self.violation(StageViolation::RequestWhileSigning)),
            Stage::Replaying => {
                if self.pending_redirect_url.as_deref() == Some(url) {
                    Ok(RequestAction::Proceed)
                } else {
                    Err(self.violation(StageViolation::ReplayUrlMismatch))
                }
            }
        }
    }

    /// Outbound headers of a main-frame request.
    ///
    /// Returns the response header to attach, if the replay carries one.
    pub fn on_before_send_headers(&mut self) -> Result<Option<Header>, StageViolation> {
        match self.stage {
            Stage::None | Stage::DeviceTrustFlow => Ok(None),
            Stage::ChallengeReceived => Err(self.violation(StageViolation::HeadersBeforeIntercept)),
            Stage::RedirectCanceled => Err(self.violation(StageViolation::HeadersWhileSigning)),
            Stage::Replaying => {
                let header = self
                    .pending_response
                    .take()
                    .map(|response| Header::new(CHALLENGE_RESPONSE_HEADER, response.expose()));
                debug!(attached = header.is_some(), "Replay headers sent");
                self.clear_cycle();
                Ok(header)
            }
        }
    }

    /// Signer result for `cycle`.
    ///
    /// Returns the URL to re-issue. Results for a cycle that is no longer
    /// outstanding are discarded.
    pub fn on_signature(
        &mut self,
        cycle: u64,
        outcome: AttestationOutcome,
    ) -> Result<Option<String>, StageViolation> {
        if self.outstanding_cycle != Some(cycle) {
            debug!(cycle, "Stale attestation result discarded");
            return Ok(None);
        }
        self.outstanding_cycle = None;
        if self.stage != Stage::RedirectCanceled {
            return Err(self.violation(StageViolation::UnexpectedSignature));
        }

        let url = self.pending_redirect_url.clone();
        match outcome {
            AttestationOutcome::Success { response } => {
                debug!(cycle, "Attestation response computed");
                self.pending_response = Some(response);
                self.stage = Stage::Replaying;
            }
            AttestationOutcome::Failure { reason } => {
                warn!(cycle, %reason, "Attestation failed; replaying without response");
                self.clear_cycle();
            }
        }
        Ok(url)
    }

    /// Whether a top-level load abort is the one our cancel caused.
    ///
    /// Only true while the canceled request is waiting for its signature.
    pub fn is_intentional_abort(&self) -> bool {
        self.stage == Stage::RedirectCanceled
    }

    pub fn reset(&mut self) {
        self.clear_cycle();
        self.device_trust_seen = false;
    }

    fn clear_cycle(&mut self) {
        self.stage = Stage::None;
        self.pending_challenge = None;
        self.pending_response = None;
        self.pending_redirect_url = None;
        self.outstanding_cycle = None;
    }

    fn violation(&mut self, site: StageViolation) -> StageViolation {
        warn!(%site, stage = ?self.stage, "Attestation stage violation");
        self.clear_cycle();
        site
    }
}
