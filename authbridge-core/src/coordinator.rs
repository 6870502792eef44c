//! Completion decision.
//!
//! Once identity is known, completion waits for the services list, the
//! flow-ended signal and any pending credential API confirmation. Older IdPs
//! never send some of these, so a single bounded timer synthesizes whatever
//! is still missing.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::messages::Secret;
use crate::saml::PasswordAttributes;

/// Payload of the one "authentication complete" outcome of a flow.
///
/// Passwords are wiped on drop and redacted from `Debug`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCompletedCredentials {
    pub email: String,
    pub gaia_id: String,
    pub password: Secret,
    #[serde(rename = "usingSAML")]
    pub using_saml: bool,
    #[serde(rename = "scrapedSAMLPasswords")]
    pub scraped_saml_passwords: Vec<Secret>,
    #[serde(rename = "publicSAML")]
    pub public_saml: bool,
    pub skip_for_now: bool,
    pub session_index: String,
    pub trusted: bool,
    pub services: Vec<String>,
    pub services_provided: bool,
    pub password_attributes: PasswordAttributes,
    pub sync_trusted_vault_keys: Value,
}

/// What the coordinator needs from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every signal is in; `cancel_timer` names the timer to drop.
    Done { cancel_timer: Option<u64> },
    /// Start the bounded wait.
    ArmTimer { generation: u64, delay: Duration },
    /// The bounded wait is already running.
    Waiting,
}

/// How to finish once the signals are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum PasswordDecision {
    Finish(Option<Secret>),
    /// Exactly one scraped password; finish with it.
    FinishWithScraped(Secret),
    /// Nothing scraped; ask the host for one.
    RequestPassword,
    /// Several scraped; ask the user which one.
    Disambiguate { count: usize },
}

/// Inputs to [`decide_password`].
#[derive(Debug, Clone, Copy)]
pub struct PasswordSources<'a> {
    pub api_password: Option<&'a Secret>,
    pub scraped_count: usize,
    pub first_scraped: Option<&'a Secret>,
    pub need_password: bool,
    pub request_when_none_scraped: bool,
}

pub fn decide_password(sources: PasswordSources<'_>) -> PasswordDecision {
    if let Some(password) = sources.api_password {
        return PasswordDecision::Finish(Some(password.clone()));
    }
    match sources.scraped_count {
        0 if sources.request_when_none_scraped => PasswordDecision::RequestPassword,
        0 => {
            warn!("No password scraped for the flow");
            PasswordDecision::Finish(None)
        }
        _ if !sources.need_password => PasswordDecision::Finish(None),
        1 => match sources.first_scraped {
            Some(password) => PasswordDecision::FinishWithScraped(password.clone()),
            None => PasswordDecision::Finish(None),
        },
        count => PasswordDecision::Disambiguate { count },
    }
}

/// Signal bookkeeping for one flow.
#[derive(Debug, Clone)]
pub struct CompletionCoordinator {
    done_wait_timeout: Duration,
    services: Option<Vec<String>>,
    services_provided: bool,
    close_view_received: bool,
    wait_api_password_confirm: bool,
    armed_timer: Option<u64>,
    /// Never reset, so a timeout from before a reset stays stale.
    last_generation: u64,
}

impl CompletionCoordinator {
    pub fn new(done_wait_timeout: Duration) -> Self {
        Self {
            done_wait_timeout,
            services: None,
            services_provided: false,
            close_view_received: false,
            wait_api_password_confirm: false,
            armed_timer: None,
            last_generation: 0,
        }
    }

    pub fn set_services(&mut self, services: Vec<String>) {
        self.services = Some(services);
        self.services_provided = true;
    }

    pub fn set_close_view(&mut self) {
        if self.services.is_none() {
            warn!("Flow ended before the services list arrived");
        }
        self.close_view_received = true;
    }

    pub fn set_waiting_for_api_confirm(&mut self, waiting: bool) {
        self.wait_api_password_confirm = waiting;
    }

    pub fn services(&self) -> &[String] {
        self.services.as_deref().unwrap_or_default()
    }

    pub fn services_provided(&self) -> bool {
        self.services_provided
    }

    pub fn close_view_received(&self) -> bool {
        self.close_view_received
    }

    pub fn waiting_for_api_confirm(&self) -> bool {
        self.wait_api_password_confirm
    }

    pub fn armed_timer(&self) -> Option<u64> {
        self.armed_timer
    }

    /// Whether every signal is in.
    pub fn is_done(&self) -> bool {
        self.services.is_some() && self.close_view_received && !self.wait_api_password_confirm
    }

    pub fn check(&mut self) -> Readiness {
        if self.is_done() {
            return Readiness::Done {
                cancel_timer: self.armed_timer.take(),
            };
        }
        if self.armed_timer.is_some() {
            return Readiness::Waiting;
        }
        self.last_generation += 1;
        let generation = self.last_generation;
        self.armed_timer = Some(generation);
        debug!(generation, delay_ms = self.done_wait_timeout.as_millis() as u64, "Waiting for flow signals");
        Readiness::ArmTimer {
            generation,
            delay: self.done_wait_timeout,
        }
    }

    /// The bounded wait for `generation` elapsed.
    ///
    /// Returns `None` for a stale timer, otherwise whether a pending API
    /// confirmation was abandoned.
    pub fn on_timeout(&mut self, generation: u64) -> Option<bool> {
        if self.armed_timer != Some(generation) {
            debug!(generation, "Stale completion timer ignored");
            return None;
        }
        self.armed_timer = None;
        if self.services.is_none() {
            warn!("Completion wait elapsed: forcing empty services");
            self.services = Some(Vec::new());
        }
        if !self.close_view_received {
            warn!("Completion wait elapsed: flow-ended signal never arrived");
            self.close_view_received = true;
        }
        Some(std::mem::take(&mut self.wait_api_password_confirm))
    }

    /// Clear all signals. Returns the timer that must be canceled.
    pub fn reset(&mut self) -> Option<u64> {
        self.services = None;
        self.services_provided = false;
        self.close_view_received = false;
        self.wait_api_password_confirm = false;
        self.armed_timer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> CompletionCoordinator {
        CompletionCoordinator::new(Duration::from_secs(5))
    }

    fn sources(scraped_count: usize) -> PasswordSources<'static> {
        PasswordSources {
            api_password: None,
            scraped_count,
            first_scraped: None,
            need_password: true,
            request_when_none_scraped: true,
        }
    }

    #[test]
    fn test_timer_armed_once() {
        let mut c = coordinator();
        assert_eq!(
            c.check(),
            Readiness::ArmTimer {
                generation: 1,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(c.check(), Readiness::Waiting);

        c.set_services(vec!["mail".into()]);
        c.set_close_view();
        assert_eq!(
            c.check(),
            Readiness::Done {
                cancel_timer: Some(1)
            }
        );
    }

    #[test]
    fn test_timeout_synthesizes_missing_signals() {
        let mut c = coordinator();
        c.set_waiting_for_api_confirm(true);
        let Readiness::ArmTimer { generation, .. } = c.check() else {
            panic!("timer should arm");
        };
        assert_eq!(c.on_timeout(generation), Some(true));
        assert!(c.is_done());
        assert!(c.services().is_empty());
        assert!(!c.services_provided());
    }

    #[test]
    fn test_stale_timeout_ignored_after_reset() {
        let mut c = coordinator();
        let Readiness::ArmTimer { generation, .. } = c.check() else {
            panic!("timer should arm");
        };
        assert_eq!(c.reset(), Some(generation));
        assert_eq!(c.on_timeout(generation), None);
        assert!(!c.is_done());

        let Readiness::ArmTimer { generation: next, .. } = c.check() else {
            panic!("timer should arm");
        };
        assert!(next > generation);
    }

    #[test]
    fn test_api_password_wins() {
        let api = Secret::new("from-api");
        let scraped = Secret::new("scraped");
        let decision = decide_password(PasswordSources {
            api_password: Some(&api),
            first_scraped: Some(&scraped),
            ..sources(1)
        });
        assert_eq!(decision, PasswordDecision::Finish(Some(api)));
    }

    #[test]
    fn test_scraped_count_branches() {
        assert_eq!(decide_password(sources(0)), PasswordDecision::RequestPassword);
        assert_eq!(
            decide_password(PasswordSources {
                request_when_none_scraped: false,
                ..sources(0)
            }),
            PasswordDecision::Finish(None)
        );

        let one = Secret::new("only");
        assert_eq!(
            decide_password(PasswordSources {
                first_scraped: Some(&one),
                ..sources(1)
            }),
            PasswordDecision::FinishWithScraped(one.clone())
        );
        assert_eq!(
            decide_password(sources(3)),
            PasswordDecision::Disambiguate { count: 3 }
        );
        assert_eq!(
            decide_password(PasswordSources {
                need_password: false,
                ..sources(3)
            }),
            PasswordDecision::Finish(None)
        );
    }

    #[test]
    fn test_payload_wire_names_and_redaction() {
        let payload = AuthCompletedCredentials {
            email: "user@example.com".into(),
            gaia_id: "42".into(),
            password: Secret::new("hunter2"),
            using_saml: true,
            scraped_saml_passwords: vec![Secret::new("hunter2")],
            public_saml: false,
            skip_for_now: false,
            session_index: "0".into(),
            trusted: true,
            services: vec![],
            services_provided: false,
            password_attributes: PasswordAttributes::default(),
            sync_trusted_vault_keys: serde_json::json!({}),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["usingSAML"], true);
        assert_eq!(json["scrapedSAMLPasswords"][0], "hunter2");
        assert_eq!(json["gaiaId"], "42");
        assert_eq!(json["syncTrustedVaultKeys"], serde_json::json!({}));
        assert!(!format!("{payload:?}").contains("hunter2"));
    }
}
