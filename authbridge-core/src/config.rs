//! Authenticator configuration.
//!
//! [`AuthConfig`] holds process-wide settings loaded from environment
//! variables with sensible defaults. [`AuthParams`] is supplied per `load()`
//! and describes one authentication flow.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{BridgeError, Result};

/// Default time to wait for the IdP "done" signals once identity is known.
pub const DEFAULT_DONE_WAIT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Lowest credential API version the host accepts.
pub const MIN_API_VERSION: u32 = 1;

/// Highest credential API version the host speaks.
pub const MAX_API_VERSION: u32 = 1;

/// The only key type the credential API accepts by default.
pub const KEY_TYPE_PASSWORD_PLAIN: &str = "KEY_TYPE_PASSWORD_PLAIN";

/// Process-wide configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Bounded wait for `userInfo`/`closeView` (default: 5s)
    pub done_wait_timeout: Duration,
    /// Origins allowed to open channels to the host (default: none)
    pub allowed_origins: Vec<String>,
    /// Minimum credential API version (default: 1)
    pub min_api_version: u32,
    /// Maximum credential API version (default: 1)
    pub max_api_version: u32,
    /// Key types accepted by the credential API `add` call
    pub supported_key_types: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            done_wait_timeout: DEFAULT_DONE_WAIT_TIMEOUT,
            allowed_origins: Vec::new(),
            min_api_version: MIN_API_VERSION,
            max_api_version: MAX_API_VERSION,
            supported_key_types: vec![KEY_TYPE_PASSWORD_PLAIN.to_string()],
        }
    }
}

impl AuthConfig {
    /// Load configuration from environment variables.
    ///
    /// - `AUTHBRIDGE_DONE_TIMEOUT_MS` - completion wait bound in milliseconds
    /// - `AUTHBRIDGE_ALLOWED_ORIGINS` - comma-separated transport allow-list
    /// - `AUTHBRIDGE_MIN_API_VERSION` / `AUTHBRIDGE_MAX_API_VERSION`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let done_wait_timeout = env_parsed("AUTHBRIDGE_DONE_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.done_wait_timeout);

        let allowed_origins = std::env::var("AUTHBRIDGE_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let min_api_version =
            env_parsed("AUTHBRIDGE_MIN_API_VERSION").unwrap_or(defaults.min_api_version);

        let max_api_version =
            env_parsed("AUTHBRIDGE_MAX_API_VERSION").unwrap_or(defaults.max_api_version);

        let config = Self {
            done_wait_timeout,
            allowed_origins,
            min_api_version,
            max_api_version,
            supported_key_types: defaults.supported_key_types,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.min_api_version > self.max_api_version {
            return Err(BridgeError::Config(format!(
                "min_api_version ({}) exceeds max_api_version ({})",
                self.min_api_version, self.max_api_version
            )));
        }
        if self.supported_key_types.is_empty() {
            return Err(BridgeError::Config(
                "at least one supported key type is required".into(),
            ));
        }
        for origin in &self.allowed_origins {
            Url::parse(origin)?;
        }
        Ok(())
    }
}

/// Read and parse `name`; unparsable values fall back to the default.
fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparsable environment value");
            None
        }
    }
}

fn default_true() -> bool {
    true
}

/// Parameters for a single authentication flow, supplied by `load()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthParams {
    /// Origin of the primary host identity pages (e.g. `https://accounts.example.com/`)
    pub idp_origin: String,
    /// First URL the hosted surface navigates to
    pub initial_frame_url: String,
    /// Email to prefill
    #[serde(default)]
    pub email: Option<String>,
    /// SAML assertion consumer URL for flows that end without identity info
    #[serde(default)]
    pub saml_acl_url: Option<String>,
    /// Whether the flow starts on a third-party IdP page
    #[serde(default)]
    pub starts_on_saml_page: bool,
    /// Whether the host wants a password at all
    #[serde(default = "default_true")]
    pub need_password: bool,
    /// Whether `createaccount` calls are honored
    #[serde(default)]
    pub record_account_creation: bool,
    /// Whether to decode password attributes from the SAML response
    #[serde(default)]
    pub extract_saml_password_attributes: bool,
    /// Block plain-http navigations on IdP pages (default: idp origin is https)
    #[serde(default)]
    pub block_insecure_content: Option<bool>,
    /// Ask the host for a password when nothing was scraped
    #[serde(default = "default_true")]
    pub request_password_when_none_scraped: bool,
}

impl AuthParams {
    /// Minimal parameters for the given IdP origin; the initial frame is the
    /// origin itself.
    pub fn new(idp_origin: impl Into<String>) -> Self {
        let idp_origin = idp_origin.into();
        Self {
            initial_frame_url: idp_origin.clone(),
            idp_origin,
            email: None,
            saml_acl_url: None,
            starts_on_saml_page: false,
            need_password: true,
            record_account_creation: false,
            extract_saml_password_attributes: false,
            block_insecure_content: None,
            request_password_when_none_scraped: true,
        }
    }

    pub fn with_initial_frame_url(mut self, url: impl Into<String>) -> Self {
        self.initial_frame_url = url.into();
        self
    }

    pub fn with_saml_acl_url(mut self, url: impl Into<String>) -> Self {
        self.saml_acl_url = Some(url.into());
        self
    }

    pub fn starting_on_saml_page(mut self) -> Self {
        self.starts_on_saml_page = true;
        self
    }

    pub fn with_account_creation(mut self) -> Self {
        self.record_account_creation = true;
        self
    }

    pub fn with_password_attributes(mut self) -> Self {
        self.extract_saml_password_attributes = true;
        self
    }

    /// Effective insecure-content policy.
    pub fn blocks_insecure_content(&self) -> bool {
        self.block_insecure_content
            .unwrap_or_else(|| self.idp_origin.starts_with("https://"))
    }

    /// Parsed origin of the primary host pages.
    pub fn idp_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.idp_origin)?)
    }
}
