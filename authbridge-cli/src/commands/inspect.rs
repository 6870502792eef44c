//! Inspect command implementation.

use anyhow::{Context, Result};
use authbridge_core::headers::SIGN_IN_HEADER;
use authbridge_core::SignInInfo;
use colored::Colorize;
use tracing::debug;

/// Execute the inspect-signin command.
pub fn execute(header: &str, json: bool, quiet: bool) -> Result<()> {
    let info = SignInInfo::parse(header).context("Failed to parse sign-in header")?;
    debug!(gaia_id = %info.gaia_id, "Parsed sign-in header");

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).context("Failed to serialize header")?
        );
        return Ok(());
    }
    if quiet {
        return Ok(());
    }

    println!();
    println!("   {} {}", "Header:".dimmed(), SIGN_IN_HEADER);
    println!("   {} {}", "Email:".dimmed(), info.email.green());
    println!("   {} {}", "Gaia ID:".dimmed(), info.gaia_id);
    match &info.session_index {
        Some(index) => println!("   {} {}", "Session index:".dimmed(), index),
        None => println!(
            "   {} {}",
            "Session index:".dimmed(),
            "missing (completion will restart the flow)".yellow()
        ),
    }
    Ok(())
}
