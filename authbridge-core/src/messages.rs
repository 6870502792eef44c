//! Message vocabularies crossing into the host.
//!
//! - [`InjectedMessage`]: channel traffic from the scraper and the
//!   credential API forwarder injected into the hosted surface.
//! - [`ApiCall`]: the call object carried by `apiCall`.
//! - [`GaiaMessage`]: page messages posted by the primary identity pages.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::channel::ChannelMessage;
use crate::error::ApiErrorKind;

/// Channel name of the password scraper.
pub const INJECTED_CHANNEL: &str = "injected";

/// Channel name of the credential API forwarder.
pub const CREDENTIALS_CHANNEL: &str = "credentials";

/// Message names a channel of the given name accepts, or `None` for an
/// unknown channel name.
pub fn accepted_messages(channel_name: &str) -> Option<&'static [&'static str]> {
    match channel_name {
        INJECTED_CHANNEL => Some(&[
            "updatePassword",
            "pageLoaded",
            "getSAMLFlag",
            "scrollInfo",
            "apiCall",
        ]),
        CREDENTIALS_CHANNEL => Some(&["apiCall"]),
        _ => None,
    }
}

/// Secret string wiped on drop and redacted from `Debug`.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Traffic on the `injected` and `credentials` channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum InjectedMessage {
    #[serde(rename = "apiCall")]
    ApiCall { call: Value },
    /// Scrape report for one password field.
    #[serde(rename = "updatePassword")]
    UpdatePassword {
        url: String,
        index: u32,
        id: String,
        password: Secret,
    },
    #[serde(rename = "pageLoaded")]
    PageLoaded { url: String },
    #[serde(rename = "getSAMLFlag")]
    GetSamlFlag,
    #[serde(rename = "scrollInfo", rename_all = "camelCase")]
    ScrollInfo { scroll_width: u32, scroll_height: u32 },
}

impl ChannelMessage for InjectedMessage {
    fn name(&self) -> &'static str {
        match self {
            Self::ApiCall { .. } => "apiCall",
            Self::UpdatePassword { .. } => "updatePassword",
            Self::PageLoaded { .. } => "pageLoaded",
            Self::GetSamlFlag => "getSAMLFlag",
            Self::ScrollInfo { .. } => "scrollInfo",
        }
    }
}

/// One credential API call, decoded from `apiCall.call`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ApiCall {
    #[serde(rename_all = "camelCase")]
    Initialize { requested_version: u32 },
    #[serde(rename_all = "camelCase")]
    Add {
        token: String,
        key_type: String,
        password_bytes: Secret,
    },
    Confirm {
        token: String,
    },
    #[serde(rename = "createaccount")]
    CreateAccount {
        token: String,
    },
}

impl ApiCall {
    /// Decode a call object; anything unrecognized is `UNKNOWN_MESSAGE`.
    pub fn parse(call: &Value) -> Result<Self, ApiErrorKind> {
        Self::deserialize(call).map_err(|_| ApiErrorKind::UnknownMessage)
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Add { .. } => "add",
            Self::Confirm { .. } => "confirm",
            Self::CreateAccount { .. } => "createaccount",
        }
    }
}

/// Page messages from the primary identity pages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum GaiaMessage {
    UserInfo {
        #[serde(default)]
        services: Vec<String>,
    },
    CloseView,
    SyncTrustedVaultKeys {
        #[serde(default)]
        value: Value,
    },
    AttemptLogin {
        email: String,
    },
    #[serde(rename_all = "camelCase")]
    IdentifierEntered {
        account_identifier: String,
    },
    ClearOldAttempts,
    ShowConfirmCancel,
}

/// Result of classifying a raw page message.
#[derive(Debug, Clone, PartialEq)]
pub enum PageMessage {
    Gaia(GaiaMessage),
    /// An object with a `method` string nobody handles.
    Unrecognized(String),
    /// Not addressed to the authenticator at all.
    Foreign,
}

impl GaiaMessage {
    pub fn classify(raw: &Value) -> PageMessage {
        let Some(method) = raw.get("method").and_then(Value::as_str) else {
            return PageMessage::Foreign;
        };
        match Self::deserialize(raw) {
            Ok(message) => PageMessage::Gaia(message),
            Err(_) => PageMessage::Unrecognized(method.to_string()),
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::ClearOldAttempts | Self::ShowConfirmCancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_password_wire_format() {
        let message: InjectedMessage = serde_json::from_value(json!({
            "name": "updatePassword",
            "url": "https://idp.example.org/login",
            "index": 0,
            "id": "pw",
            "password": "hunter2",
        }))
        .unwrap();
        assert_eq!(message.name(), "updatePassword");
        match &message {
            InjectedMessage::UpdatePassword { password, .. } => {
                assert_eq!(password.expose(), "hunter2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!format!("{message:?}").contains("hunter2"));
    }

    #[test]
    fn test_get_saml_flag_name() {
        let message: InjectedMessage =
            serde_json::from_value(json!({"name": "getSAMLFlag"})).unwrap();
        assert_eq!(message, InjectedMessage::GetSamlFlag);
        assert_eq!(
            serde_json::to_value(&InjectedMessage::ScrollInfo {
                scroll_width: 10,
                scroll_height: 20
            })
            .unwrap(),
            json!({"name": "scrollInfo", "scrollWidth": 10, "scrollHeight": 20})
        );
    }

    #[test]
    fn test_api_call_parse() {
        assert_eq!(
            ApiCall::parse(&json!({"method": "initialize", "requestedVersion": 2})),
            Ok(ApiCall::Initialize {
                requested_version: 2
            })
        );
        let add = ApiCall::parse(&json!({
            "method": "add",
            "token": "t1",
            "keyType": "KEY_TYPE_PASSWORD_PLAIN",
            "passwordBytes": "s3cret",
        }))
        .unwrap();
        assert_eq!(add.method(), "add");
        assert_eq!(
            ApiCall::parse(&json!({"method": "createaccount", "token": "t"})),
            Ok(ApiCall::CreateAccount { token: "t".into() })
        );
    }

    #[test]
    fn test_api_call_unknown_is_classified() {
        assert_eq!(
            ApiCall::parse(&json!({"method": "delete", "token": "t"})),
            Err(ApiErrorKind::UnknownMessage)
        );
        assert_eq!(
            ApiCall::parse(&json!("initialize")),
            Err(ApiErrorKind::UnknownMessage)
        );
    }

    #[test]
    fn test_gaia_message_classify() {
        assert_eq!(
            GaiaMessage::classify(&json!({"method": "userInfo", "services": ["mail"]})),
            PageMessage::Gaia(GaiaMessage::UserInfo {
                services: vec!["mail".into()]
            })
        );
        assert_eq!(
            GaiaMessage::classify(&json!({"method": "identifierEntered", "accountIdentifier": "a@b.c"})),
            PageMessage::Gaia(GaiaMessage::IdentifierEntered {
                account_identifier: "a@b.c".into()
            })
        );
        assert_eq!(
            GaiaMessage::classify(&json!({"method": "dance"})),
            PageMessage::Unrecognized("dance".into())
        );
        assert_eq!(GaiaMessage::classify(&json!([1, 2])), PageMessage::Foreign);
        assert_eq!(GaiaMessage::classify(&json!({"no": 1})), PageMessage::Foreign);
    }

    #[test]
    fn test_channel_vocabularies() {
        assert!(accepted_messages(INJECTED_CHANNEL)
            .unwrap()
            .contains(&"updatePassword"));
        assert_eq!(accepted_messages(CREDENTIALS_CHANNEL), Some(&["apiCall"][..]));
        assert_eq!(accepted_messages("other"), None);
    }
}
