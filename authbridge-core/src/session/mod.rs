//! Per-flow identity and lifecycle state.

pub mod passwords;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::headers::SignInInfo;

pub use passwords::{FieldKey, PasswordStore};

/// Which kind of pages the flow went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthFlow {
    #[default]
    Default,
    Saml,
}

/// Identity and flags of the current flow.
#[derive(Debug, Clone)]
pub struct Session {
    pub email: Option<String>,
    pub gaia_id: Option<String>,
    pub session_index: Option<String>,
    pub auth_flow: AuthFlow,
    /// False once any request went over a non-https scheme
    pub trusted: bool,
    pub skip_for_now: bool,
    /// Guards completion; cleared only by load, reload and reset
    pub completion_fired: bool,
    pub is_loaded: bool,
    pub ready_fired: bool,
    pub sync_trusted_vault_keys: Option<Value>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            email: None,
            gaia_id: None,
            session_index: None,
            auth_flow: AuthFlow::Default,
            trusted: true,
            skip_for_now: false,
            completion_fired: false,
            is_loaded: false,
            ready_fired: false,
            sync_trusted_vault_keys: None,
        }
    }
}

impl Session {
    /// Clear everything except the completion guard.
    pub fn reset_states(&mut self) {
        let completion_fired = self.completion_fired;
        *self = Self {
            completion_fired,
            ..Self::default()
        };
    }

    pub fn apply_sign_in(&mut self, info: SignInInfo) {
        self.email = Some(info.email);
        self.gaia_id = Some(info.gaia_id);
        self.session_index = info.session_index;
    }

    pub fn set_email(&mut self, email: impl Into<String>) {
        let email = email.into();
        self.email = (!email.is_empty()).then_some(email);
    }

    /// Email, gaia id and session index are all known.
    pub fn has_identity(&self) -> bool {
        self.email.is_some() && self.gaia_id.is_some() && self.session_index.is_some()
    }

    pub fn is_saml(&self) -> bool {
        self.auth_flow == AuthFlow::Saml
    }
}
