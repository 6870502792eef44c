//! Third-party IdP page tracking.
//!
//! [`SamlHandler`] owns the per-session state that only matters while the
//! hosted surface may be showing a third-party IdP page:
//!
//! - the pending and authoritative "is IdP page" flags
//! - scraped passwords, accepted only while the authoritative flag is set
//! - the credential API negotiation
//! - the device attestation exchange
//! - insecure content blocking and SAML response attribute extraction
//!
//! The boundary header only sets the pending flag. It is promoted at the
//! next same-origin http(s) top-level commit, since headers can arrive
//! before the navigation they describe commits.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::{Origin, Url};

use crate::attestation::{AttestationOutcome, DeviceAttestation, RequestAction};
use crate::config::{AuthConfig, AuthParams};
use crate::credential_api::{ApiEvent, CredentialApi};
use crate::error::{ApiErrorKind, BridgeError, FaultCounters, Result, StageViolation};
use crate::headers::{self, Header, SamlBoundary, SAML_HEADER};
use crate::messages::{InjectedMessage, Secret};
use crate::network::{Request, Response};
use crate::session::passwords::{FieldKey, PasswordStore};
use crate::transport::{is_http_like, origin_of};

/// Form field carrying the base64 SAML response.
pub const SAML_RESPONSE_FIELD: &str = "SAMLResponse";

/// Password policy attributes carried in a SAML response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_change_url: Option<String>,
}

/// Structured fields decoded from a SAML response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedResponse {
    pub x509_certificate: Option<String>,
    pub password_attributes: PasswordAttributes,
}

/// Turns a raw (base64-decoded) SAML response into structured fields.
pub trait AttributeDecoder: Send {
    fn decode(&self, saml_response: &[u8]) -> Result<DecodedResponse>;
}

/// Decision for an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDecision {
    Proceed,
    /// Plain-http main-frame load on an IdP page.
    BlockInsecure { url: String },
    /// Canceled for an attestation cycle.
    Attest {
        cycle: u64,
        url: String,
        challenge: String,
    },
}

/// Side information produced by an injected message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedNotice {
    Api(ApiEvent),
    PasswordScraped { accepted: bool },
    PageLoaded { url: String },
    ScrollInfo { width: u32, height: u32 },
}

#[derive(Debug, Clone)]
struct PendingFlag {
    is_saml_page: bool,
    origin: Origin,
}

pub struct SamlHandler {
    block_insecure_content: bool,
    extract_password_attributes: bool,
    pending: Option<PendingFlag>,
    is_saml_page: bool,
    passwords: PasswordStore,
    api: CredentialApi,
    attestation: DeviceAttestation,
    faults: FaultCounters,
    decoder: Option<Box<dyn AttributeDecoder>>,
    password_attributes: PasswordAttributes,
    x509_certificate: Option<String>,
    last_page_loaded: Option<String>,
}

impl SamlHandler {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            block_insecure_content: false,
            extract_password_attributes: false,
            pending: None,
            is_saml_page: false,
            passwords: PasswordStore::new(),
            api: CredentialApi::new(config),
            attestation: DeviceAttestation::new(),
            faults: FaultCounters::default(),
            decoder: None,
            password_attributes: PasswordAttributes::default(),
            x509_certificate: None,
            last_page_loaded: None,
        }
    }

    pub fn set_attribute_decoder(&mut self, decoder: Box<dyn AttributeDecoder>) {
        self.decoder = Some(decoder);
    }

    /// Apply per-flow parameters. Call after [`Self::reset`].
    pub fn configure(&mut self, params: &AuthParams) {
        self.block_insecure_content = params.blocks_insecure_content();
        self.extract_password_attributes = params.extract_saml_password_attributes;
        self.api
            .set_account_creation_enabled(params.record_account_creation);
        if params.starts_on_saml_page {
            self.is_saml_page = true;
        }
    }

    /// Clear all session state. Fault counters survive.
    pub fn reset(&mut self) {
        self.pending = None;
        self.is_saml_page = false;
        self.passwords.clear();
        self.api.reset();
        self.attestation.reset();
        self.password_attributes = PasswordAttributes::default();
        self.x509_certificate = None;
        self.last_page_loaded = None;
    }

    pub fn is_saml_page(&self) -> bool {
        self.is_saml_page
    }

    pub fn pending_flag(&self) -> Option<bool> {
        self.pending.as_ref().map(|p| p.is_saml_page)
    }

    pub fn passwords(&self) -> &PasswordStore {
        &self.passwords
    }

    pub fn scraped_password_count(&self) -> usize {
        self.passwords.count()
    }

    pub fn api(&self) -> &CredentialApi {
        &self.api
    }

    pub fn api_used(&self) -> bool {
        self.api.is_used()
    }

    pub fn attestation(&self) -> &DeviceAttestation {
        &self.attestation
    }

    pub fn faults(&self) -> &FaultCounters {
        &self.faults
    }

    pub fn password_attributes(&self) -> &PasswordAttributes {
        &self.password_attributes
    }

    pub fn x509_certificate(&self) -> Option<&str> {
        self.x509_certificate.as_deref()
    }

    pub fn last_page_loaded(&self) -> Option<&str> {
        self.last_page_loaded.as_deref()
    }

    pub fn first_scraped_password(&self) -> Option<Secret> {
        self.passwords.first().cloned()
    }

    /// Whether `password` is one of the scraped values.
    pub fn verify_confirmed_password(&self, password: &str) -> bool {
        self.passwords.contains(password)
    }

    pub fn record_api_fault(&mut self, kind: ApiErrorKind) {
        warn!(%kind, "Credential API call rejected");
        self.faults.record_api(kind);
    }

    fn record_stage_fault(&mut self, site: StageViolation) {
        self.faults.record_stage(site);
    }

    /// Response headers of a tracked request.
    ///
    /// Returns true when a new attestation challenge was armed.
    pub fn on_headers_received(&mut self, response: &Response) -> bool {
        if let Some(boundary) =
            headers::find(&response.headers, SAML_HEADER).and_then(SamlBoundary::parse)
        {
            match origin_of(&response.url) {
                Some(origin) => {
                    debug!(?boundary, url = %response.url, "SAML boundary header");
                    self.pending = Some(PendingFlag {
                        is_saml_page: boundary == SamlBoundary::Start,
                        origin,
                    });
                }
                None => debug!(url = %response.url, "SAML header on opaque origin ignored"),
            }
        }

        if !response.main_frame {
            return false;
        }
        match self
            .attestation
            .on_headers_received(response.status, &response.headers)
        {
            Ok(armed) => armed,
            Err(site) => {
                self.record_stage_fault(site);
                false
            }
        }
    }

    /// Top-level http(s) load commit.
    ///
    /// Promotes a pending flag set for the committed origin and returns the
    /// authoritative flag; `None` for commits that do not count.
    pub fn on_load_commit(&mut self, url: &str, is_top_level: bool) -> Option<bool> {
        if !is_top_level || !is_http_like(url) {
            return None;
        }
        let committed = origin_of(url)?;
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.origin == committed)
        {
            if let Some(pending) = self.pending.take() {
                if pending.is_saml_page != self.is_saml_page {
                    info!(is_saml_page = pending.is_saml_page, %url, "IdP page flag changed");
                }
                self.is_saml_page = pending.is_saml_page;
            }
        }
        Some(self.is_saml_page)
    }

    /// Outbound request of the hosted surface.
    pub fn on_before_request(&mut self, request: &Request) -> RequestDecision {
        if !request.main_frame {
            return RequestDecision::Proceed;
        }

        if self.is_saml_page && self.block_insecure_content && is_plain_http(&request.url) {
            warn!(url = %request.url, "Insecure content blocked");
            return RequestDecision::BlockInsecure {
                url: request.url.clone(),
            };
        }

        if self.extract_password_attributes && request.method.eq_ignore_ascii_case("POST") {
            if let Some(blob) = request.form_value(SAML_RESPONSE_FIELD) {
                if let Err(err) = self.decode_saml_response(blob) {
                    warn!(error = %err, "SAML response could not be decoded");
                }
            }
        }

        match self.attestation.on_before_request(&request.url) {
            Ok(RequestAction::Proceed) => RequestDecision::Proceed,
            Ok(RequestAction::Cancel {
                cycle,
                url,
                challenge,
            }) => RequestDecision::Attest {
                cycle,
                url,
                challenge,
            },
            Err(site) => {
                self.record_stage_fault(site);
                RequestDecision::Proceed
            }
        }
    }

    /// Outbound headers of a main-frame request; returns a header to add.
    pub fn on_before_send_headers(&mut self) -> Option<Header> {
        match self.attestation.on_before_send_headers() {
            Ok(header) => header,
            Err(site) => {
                self.record_stage_fault(site);
                None
            }
        }
    }

    /// Signer result; returns the URL to re-issue.
    pub fn on_attestation_resolved(
        &mut self,
        cycle: u64,
        outcome: AttestationOutcome,
    ) -> Option<String> {
        match self.attestation.on_signature(cycle, outcome) {
            Ok(url) => url,
            Err(site) => {
                self.record_stage_fault(site);
                None
            }
        }
    }

    /// Whether a top-level load abort was self-inflicted.
    pub fn is_intentional_abort(&self) -> bool {
        self.attestation.is_intentional_abort()
    }

    /// Handle one message from the injected scripts; returns the reply
    /// value and what happened.
    pub fn handle_injected(&mut self, message: InjectedMessage) -> (Value, Option<InjectedNotice>) {
        match message {
            InjectedMessage::ApiCall { call } => match self.api.process(&call) {
                Ok(event) => {
                    let reply = match &event {
                        ApiEvent::Initialized { version } => json!({ "version": version }),
                        _ => Value::Null,
                    };
                    (reply, Some(InjectedNotice::Api(event)))
                }
                Err(kind) => {
                    self.record_api_fault(kind);
                    (Value::Null, None)
                }
            },
            InjectedMessage::UpdatePassword {
                url,
                index,
                id,
                password,
            } => {
                let accepted = self.is_saml_page;
                if accepted {
                    self.passwords.record(FieldKey::new(&url, index, id), password);
                } else {
                    debug!(%url, "Password report outside IdP page ignored");
                }
                (
                    Value::Null,
                    Some(InjectedNotice::PasswordScraped { accepted }),
                )
            }
            InjectedMessage::PageLoaded { url } => {
                self.last_page_loaded = Some(url.clone());
                (Value::Null, Some(InjectedNotice::PageLoaded { url }))
            }
            InjectedMessage::GetSamlFlag => (Value::Bool(self.is_saml_page), None),
            InjectedMessage::ScrollInfo {
                scroll_width,
                scroll_height,
            } => (
                Value::Null,
                Some(InjectedNotice::ScrollInfo {
                    width: scroll_width,
                    height: scroll_height,
                }),
            ),
        }
    }

    fn decode_saml_response(&mut self, blob: &str) -> Result<()> {
        let Some(decoder) = &self.decoder else {
            debug!("No attribute decoder configured");
            return Ok(());
        };
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|err| BridgeError::Transport(format!("SAMLResponse is not base64: {err}")))?;
        let decoded = decoder.decode(&raw)?;
        debug!(
            has_certificate = decoded.x509_certificate.is_some(),
            "SAML response decoded"
        );
        self.password_attributes = decoded.password_attributes;
        if decoded.x509_certificate.is_some() {
            self.x509_certificate = decoded.x509_certificate;
        }
        Ok(())
    }
}

fn is_plain_http(url: &str) -> bool {
    Url::parse(url)
        .map(|u| u.scheme() == "http")
        .unwrap_or(false)
}

impl fmt::Debug for SamlHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamlHandler")
            .field("is_saml_page", &self.is_saml_page)
            .field("pending", &self.pending_flag())
            .field("passwords", &self.passwords)
            .field("api_version", &self.api.version())
            .field("attestation", &self.attestation.stage())
            .finish()
    }
}
