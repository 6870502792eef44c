//! Credential passing API negotiated with the IdP page.
//!
//! Calls are processed in arrival order. Every rejection is classified as
//! an [`ApiErrorKind`] and leaves the state untouched; nothing is reported
//! back to the calling page beyond a `null` reply.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::error::ApiErrorKind;
use crate::messages::{ApiCall, Secret};

/// Accepted state change produced by a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiEvent {
    Initialized { version: u32 },
    PasswordAdded { token: String },
    PasswordConfirmed { token: String },
    AccountCreated { token: String },
}

#[derive(Debug, Clone)]
struct TokenEntry {
    key_type: String,
    password_bytes: Secret,
    /// The call as received, minus the password bytes.
    raw_call: Value,
}

/// Negotiation and token state for one session.
#[derive(Debug, Clone)]
pub struct CredentialApi {
    min_version: u32,
    max_version: u32,
    supported_key_types: Vec<String>,
    account_creation_enabled: bool,
    version: Option<u32>,
    tokens: HashMap<String, TokenEntry>,
    confirm_token: Option<String>,
    last_password_bytes: Option<Secret>,
}

impl CredentialApi {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            min_version: config.min_api_version,
            max_version: config.max_api_version,
            supported_key_types: config.supported_key_types.clone(),
            account_creation_enabled: false,
            version: None,
            tokens: HashMap::new(),
            confirm_token: None,
            last_password_bytes: None,
        }
    }

    /// Honor `createaccount` for this session.
    pub fn set_account_creation_enabled(&mut self, enabled: bool) {
        self.account_creation_enabled = enabled;
    }

    /// Negotiated version, once initialized.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Whether the page passed a password through the API.
    pub fn is_used(&self) -> bool {
        self.last_password_bytes.is_some()
    }

    /// Confirmed password if any, otherwise the most recently added one.
    pub fn api_password_bytes(&self) -> Option<&Secret> {
        self.confirm_token
            .as_ref()
            .and_then(|token| self.tokens.get(token))
            .map(|entry| &entry.password_bytes)
            .or(self.last_password_bytes.as_ref())
    }

    /// Key type stored under `token`.
    pub fn key_type(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(|entry| entry.key_type.as_str())
    }

    /// The call that stored `token`, without its password bytes.
    pub fn raw_call(&self, token: &str) -> Option<&Value> {
        self.tokens.get(token).map(|entry| &entry.raw_call)
    }

    /// Process one raw call object.
    pub fn process(&mut self, raw: &Value) -> Result<ApiEvent, ApiErrorKind> {
        let call = ApiCall::parse(raw)?;
        debug!(method = call.method(), "Credential API call");

        if let ApiCall::Initialize { requested_version } = call {
            return self.initialize(requested_version);
        }
        if self.version.is_none() {
            return Err(ApiErrorKind::NotInitialized);
        }

        match call {
            ApiCall::Initialize { .. } => Err(ApiErrorKind::UnknownMessage),
            ApiCall::Add {
                token,
                key_type,
                password_bytes,
            } => {
                if !self.supported_key_types.contains(&key_type) {
                    return Err(ApiErrorKind::UnsupportedKey);
                }
                let mut raw_call = raw.clone();
                if let Some(fields) = raw_call.as_object_mut() {
                    fields.remove("passwordBytes");
                }
                self.last_password_bytes = Some(password_bytes.clone());
                self.tokens.insert(
                    token.clone(),
                    TokenEntry {
                        key_type,
                        password_bytes,
                        raw_call,
                    },
                );
                Ok(ApiEvent::PasswordAdded { token })
            }
            ApiCall::Confirm { token } => {
                if !self.tokens.contains_key(&token) {
                    return Err(ApiErrorKind::ConfirmTokenMismatch);
                }
                self.confirm_token = Some(token.clone());
                Ok(ApiEvent::PasswordConfirmed { token })
            }
            ApiCall::CreateAccount { token } => {
                if !self.account_creation_enabled {
                    return Err(ApiErrorKind::UnsupportedMessage);
                }
                if !self.tokens.contains_key(&token) {
                    return Err(ApiErrorKind::CreateTokenMismatch);
                }
                Ok(ApiEvent::AccountCreated { token })
            }
        }
    }

    fn initialize(&mut self, requested_version: u32) -> Result<ApiEvent, ApiErrorKind> {
        if let Some(version) = self.version {
            debug!(version, requested_version, "Credential API already initialized");
            return Ok(ApiEvent::Initialized { version });
        }
        if requested_version < self.min_version {
            return Err(ApiErrorKind::UnsupportedKey);
        }
        let version = requested_version.min(self.max_version);
        info!(version, "Credential API initialized");
        self.version = Some(version);
        Ok(ApiEvent::Initialized { version })
    }

    /// Drop all negotiation and token state.
    pub fn reset(&mut self) {
        self.version = None;
        self.tokens.clear();
        self.confirm_token = None;
        self.last_password_bytes = None;
    }
}
