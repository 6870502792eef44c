//! AuthBridge Core - host side of an embedded identity provider sign-in
//!
//! This crate drives a sign-in flow hosted in an embedded browsing surface
//! that may navigate from the primary identity pages to a third-party SAML
//! identity provider and back.
//!
//! # Features
//!
//! - Symmetric request/reply channels over an origin-checked frame transport
//! - SAML page detection from response header boundaries
//! - Password scraping and a versioned credential passing API
//! - Device attestation by cancel-and-replay of challenged redirects
//! - A single, bounded "authentication complete" decision
//!
//! The [`Authenticator`] is a pure state machine: events in, effects out.
//! With the `runtime` feature, [`AuthService`] runs it on tokio and carries
//! out the timer and signer effects itself.
//!
//! # Example
//!
//! ```no_run
//! use authbridge_core::{AuthConfig, AuthEffect, AuthEvent, AuthParams, Authenticator};
//!
//! # fn example() -> authbridge_core::Result<()> {
//! let mut authenticator = Authenticator::new(AuthConfig::from_env()?)?;
//!
//! let effects = authenticator.handle(AuthEvent::Load {
//!     params: AuthParams::new("https://accounts.example.com/"),
//! });
//! for effect in effects {
//!     if let AuthEffect::Navigate { url } = effect {
//!         println!("navigate to {url}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod attestation;
pub mod authenticator;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod credential_api;
pub mod error;
pub mod headers;
pub mod messages;
pub mod mock;
pub mod network;
pub mod saml;
pub mod session;
pub mod transport;

#[cfg(feature = "runtime")]
pub mod runtime;

// Re-export main types for convenience
pub use attestation::{AttestationOutcome, DeviceAttestation, Stage};
pub use authenticator::{AuthEffect, AuthEvent, Authenticator};
pub use channel::{Channel, ChannelMessage, Envelope, MessageHandler, PostTarget, Reply};
pub use config::{AuthConfig, AuthParams};
pub use coordinator::{AuthCompletedCredentials, CompletionCoordinator};
pub use credential_api::CredentialApi;
pub use error::{
    ApiErrorKind, BridgeError, FaultCounters, Result, StageViolation, TransportAnomaly,
};
pub use headers::{Header, SignInInfo};
pub use messages::{GaiaMessage, InjectedMessage, Secret};
pub use network::{Request, Response};
pub use saml::{AttributeDecoder, PasswordAttributes, SamlHandler};
pub use session::{AuthFlow, Session};
pub use transport::{ChannelId, Frame, Transport};

#[cfg(feature = "runtime")]
pub use runtime::{AttestationSigner, AuthHandle, AuthObserver, AuthService};
