//! Mock collaborators for testing.
//! WARNING: Do not use in production - results are canned and deterministic!

use crate::error::Result;
use crate::saml::{AttributeDecoder, DecodedResponse, PasswordAttributes};

/// Certificate reported by [`MockAttributeDecoder`].
pub const MOCK_CERTIFICATE: &str = "MIIBmockcertificate";

/// Decodes any SAML response into fixed attributes.
#[derive(Debug, Clone)]
pub struct MockAttributeDecoder {
    pub certificate: Option<String>,
    pub attributes: PasswordAttributes,
}

impl Default for MockAttributeDecoder {
    fn default() -> Self {
        Self {
            certificate: Some(MOCK_CERTIFICATE.to_string()),
            attributes: PasswordAttributes {
                modified_time: Some("1700000000000".into()),
                expiration_time: Some("1800000000000".into()),
                password_change_url: Some("https://idp.example.org/change".into()),
            },
        }
    }
}

impl AttributeDecoder for MockAttributeDecoder {
    fn decode(&self, _saml_response: &[u8]) -> Result<DecodedResponse> {
        Ok(DecodedResponse {
            x509_certificate: self.certificate.clone(),
            password_attributes: self.attributes.clone(),
        })
    }
}

#[cfg(feature = "runtime")]
pub use runtime_impl::{MockSigner, RecordingObserver};

#[cfg(feature = "runtime")]
mod runtime_impl {
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::authenticator::AuthEffect;
    use crate::error::{BridgeError, Result};
    use crate::messages::Secret;
    use crate::runtime::{AttestationSigner, AuthObserver};

    /// Signs by echoing the challenge, optionally after a delay.
    #[derive(Debug, Clone, Default)]
    pub struct MockSigner {
        pub delay: Option<Duration>,
        pub fail: bool,
    }

    impl MockSigner {
        pub fn delayed(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                delay: None,
                fail: true,
            }
        }

        /// The response this signer produces for `challenge`.
        pub fn response_for(challenge: &str) -> String {
            format!("signed:{challenge}")
        }
    }

    #[async_trait]
    impl AttestationSigner for MockSigner {
        async fn sign(&self, _url: &str, challenge: &str) -> Result<Secret> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(BridgeError::Transport("mock signer refused".into()));
            }
            Ok(Secret::new(Self::response_for(challenge)))
        }
    }

    /// Keeps every effect it observes.
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        effects: Mutex<Vec<AuthEffect>>,
    }

    impl RecordingObserver {
        pub fn take(&self) -> Vec<AuthEffect> {
            std::mem::take(&mut *self.effects.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }

    impl AuthObserver for RecordingObserver {
        fn on_effects(&self, effects: &[AuthEffect]) {
            self.effects
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(effects);
        }
    }
}
