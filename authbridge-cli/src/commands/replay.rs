//! Replay command implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use authbridge_core::mock::MockSigner;
use authbridge_core::{
    AuthCompletedCredentials, AuthConfig, AuthEffect, AuthEvent, AuthObserver, AuthService,
    Authenticator,
};
use colored::Colorize;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Extra time allowed for background results after the last event.
const SETTLE_MARGIN: Duration = Duration::from_millis(250);

/// Collaborator behavior for a scenario.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignerSettings {
    #[serde(default)]
    fail: bool,
    #[serde(default)]
    delay_ms: u64,
}

/// A recorded sequence of environment events.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Scenario {
    #[serde(default)]
    allowed_origins: Vec<String>,
    #[serde(default)]
    done_timeout_ms: Option<u64>,
    #[serde(default)]
    signer: SignerSettings,
    events: Vec<AuthEvent>,
}

impl Scenario {
    fn config(&self) -> AuthConfig {
        let defaults = AuthConfig::default();
        AuthConfig {
            done_wait_timeout: self
                .done_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.done_wait_timeout),
            allowed_origins: self.allowed_origins.clone(),
            ..defaults
        }
    }

    fn signer(&self) -> MockSigner {
        MockSigner {
            delay: (self.signer.delay_ms > 0).then(|| Duration::from_millis(self.signer.delay_ms)),
            fail: self.signer.fail,
        }
    }
}

/// Forwards effects of timers and signer results to the replay loop.
struct ForwardingObserver(mpsc::UnboundedSender<Vec<AuthEffect>>);

impl AuthObserver for ForwardingObserver {
    fn on_effects(&self, effects: &[AuthEffect]) {
        if self.0.send(effects.to_vec()).is_err() {
            debug!("Replay loop finished; background effects dropped");
        }
    }
}

/// Execute the replay command.
pub async fn execute(scenario_path: PathBuf, json: bool, quiet: bool) -> Result<()> {
    let raw = std::fs::read(&scenario_path)
        .with_context(|| format!("Failed to read scenario: {}", scenario_path.display()))?;
    let scenario: Scenario = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse scenario: {}", scenario_path.display()))?;

    info!(
        path = %scenario_path.display(),
        events = scenario.events.len(),
        "Loaded scenario"
    );

    let config = scenario.config();
    let wait_bound = config.done_wait_timeout
        + Duration::from_millis(scenario.signer.delay_ms)
        + SETTLE_MARGIN;
    let authenticator = Authenticator::new(config).context("Invalid configuration")?;

    let (tx, mut background) = mpsc::unbounded_channel();
    let handle = AuthService::new(authenticator, Arc::new(scenario.signer()))
        .with_observer(Arc::new(ForwardingObserver(tx)))
        .start();

    let show_trace = !quiet && !json;
    let mut completed = None;
    for (step, event) in scenario.events.into_iter().enumerate() {
        let effects = handle
            .dispatch(event)
            .await
            .context("Authentication service stopped")?;
        record(step, &effects, show_trace, &mut completed);
        while let Ok(effects) = background.try_recv() {
            record(step, &effects, show_trace, &mut completed);
        }
    }

    if completed.is_none() {
        debug!(wait_ms = wait_bound.as_millis() as u64, "Waiting for background results");
        let waited = tokio::time::timeout(wait_bound, async {
            while let Some(effects) = background.recv().await {
                record(usize::MAX, &effects, show_trace, &mut completed);
                if completed.is_some() {
                    break;
                }
            }
        })
        .await;
        if waited.is_err() {
            warn!("Scenario ended with no further background results");
        }
    }

    if let Err(err) = handle.shutdown().await {
        debug!(error = %err, "Service already stopped");
    }

    let Some(credentials) = completed else {
        bail!("No completion: the flow ended without an authentication result");
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&credentials).context("Failed to serialize credentials")?
        );
    } else if !quiet {
        print_summary(&credentials);
    }
    Ok(())
}

fn record(
    step: usize,
    effects: &[AuthEffect],
    show_trace: bool,
    completed: &mut Option<AuthCompletedCredentials>,
) {
    for effect in effects {
        if show_trace {
            print_effect(step, effect);
        }
        if let AuthEffect::Completed { credentials } = effect {
            if completed.is_some() {
                warn!("Second completion observed");
            } else {
                *completed = Some((**credentials).clone());
            }
        }
    }
}

fn print_effect(step: usize, effect: &AuthEffect) {
    let step = if step == usize::MAX {
        "bg".to_string()
    } else {
        format!("{:>2}", step + 1)
    };
    let value = serde_json::to_value(effect).unwrap_or_default();
    let name = value
        .get("effect")
        .and_then(|name| name.as_str())
        .unwrap_or("unknown")
        .to_string();
    match effect {
        AuthEffect::Completed { .. } => {
            println!("   {} {}", step.dimmed(), name.green().bold());
        }
        AuthEffect::MissingGaiaInfo
        | AuthEffect::LoadAborted { .. }
        | AuthEffect::InsecureContentBlocked { .. } => {
            println!("   {} {} {}", step.dimmed(), name.yellow(), details(value));
        }
        _ => println!("   {} {} {}", step.dimmed(), name.cyan(), details(value)),
    }
}

/// Effect fields without the tag, compact.
fn details(mut value: serde_json::Value) -> String {
    if let Some(fields) = value.as_object_mut() {
        fields.remove("effect");
        if fields.is_empty() {
            return String::new();
        }
    }
    value.to_string()
}

fn print_summary(credentials: &AuthCompletedCredentials) {
    let flow = if credentials.using_saml { "SAML" } else { "default" };
    let password = if credentials.password.is_empty() {
        "none".yellow()
    } else {
        "provided".green()
    };

    println!();
    println!("{}", "╔════════════════════════════════════════╗".green());
    println!(
        "{}",
        "║            AUTHENTICATED               ║".green().bold()
    );
    println!("{}", "╚════════════════════════════════════════╝".green());
    println!();
    println!("   {} {}", "Email:".dimmed(), credentials.email);
    println!("   {} {}", "Gaia ID:".dimmed(), credentials.gaia_id);
    println!("   {} {}", "Flow:".dimmed(), flow);
    println!("   {} {}", "Password:".dimmed(), password);
    if credentials.using_saml {
        println!(
            "   {} {}",
            "Scraped:".dimmed(),
            credentials.scraped_saml_passwords.len()
        );
    }
    println!(
        "   {} {}",
        "Services:".dimmed(),
        if credentials.services_provided {
            credentials.services.join(", ")
        } else {
            "not provided".to_string()
        }
    );
    println!("   {} {}", "Trusted:".dimmed(), credentials.trusted);
    if credentials.skip_for_now {
        println!("   {} {}", "Skip for now:".dimmed(), "yes".yellow());
    }
}
