//! Response/request header vocabulary consumed by the authenticator.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Marks the start/end of a third-party IdP section of the flow.
pub const SAML_HEADER: &str = "google-accounts-saml";

/// Carries the authenticated identity once the IdP flow has signed in.
pub const SIGN_IN_HEADER: &str = "google-accounts-signin";

/// Device attestation challenge on a 3xx response.
pub const CHALLENGE_HEADER: &str = "x-verified-access-challenge";

/// Attestation response attached to the replayed request.
pub const CHALLENGE_RESPONSE_HEADER: &str = "x-verified-access-challenge-response";

/// Device-trust marker; pre-empts the attestation exchange.
pub const DEVICE_TRUST_HEADER: &str = "x-device-trust";

/// A single HTTP header as reported by the network observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Case-insensitive lookup of the first header named `name`.
pub fn find<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Value of the SAML boundary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamlBoundary {
    Start,
    End,
}

impl SamlBoundary {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "end" => Some(Self::End),
            _ => None,
        }
    }
}

/// Identity fields parsed from the sign-in header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInInfo {
    pub email: String,
    pub gaia_id: String,
    pub session_index: Option<String>,
}

impl SignInInfo {
    /// Parse `email="a@b.c", obfuscatedid="123", sessionindex=0`.
    ///
    /// Keys are case-insensitive and values are lowercased. Quotes around
    /// values are removed.
    pub fn parse(value: &str) -> Result<Self> {
        let mut email = None;
        let mut gaia_id = None;
        let mut session_index = None;

        for pair in value.to_lowercase().split(',') {
            let Some((key, raw)) = pair.split_once('=') else {
                continue;
            };
            let raw = raw.trim();
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(raw)
                .to_string();
            match key.trim() {
                "email" => email = Some(unquoted),
                "obfuscatedid" => gaia_id = Some(unquoted),
                "sessionindex" => session_index = Some(unquoted),
                _ => {}
            }
        }

        let email = email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| BridgeError::MalformedHeader {
                name: SIGN_IN_HEADER,
                reason: "missing email".into(),
            })?;
        let gaia_id = gaia_id
            .filter(|g| !g.is_empty())
            .ok_or_else(|| BridgeError::MalformedHeader {
                name: SIGN_IN_HEADER,
                reason: "missing obfuscatedid".into(),
            })?;

        Ok(Self {
            email,
            gaia_id,
            session_index: session_index.filter(|s| !s.is_empty()),
        })
    }
}
