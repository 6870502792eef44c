//! Exit codes following sysexits.h conventions.
//!
//! Scripts can tell a bad invocation, a missing scenario and a flow that
//! never completed apart.

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Command line usage error (invalid arguments).
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// Data error (malformed scenario or header, flow did not complete).
/// Maps to EX_DATAERR from sysexits.h.
pub const DATA_ERROR: i32 = 65;

/// Cannot open input file.
/// Maps to EX_NOINPUT from sysexits.h.
pub const INPUT_ERROR: i32 = 66;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        // Classify error by inspecting the chain
        let code = if message.contains("Failed to read scenario") {
            INPUT_ERROR
        } else if message.contains("Failed to parse")
            || message.contains("Malformed header")
            || message.contains("No completion")
        {
            DATA_ERROR
        } else if message.contains("Invalid configuration") {
            USAGE_ERROR
        } else {
            GENERAL_ERROR
        };

        Self {
            code,
            message: Some(message),
        }
    }
}
