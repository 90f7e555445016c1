//! Decoding the exit code from an exec status channel.
//!
//! When an exec session closes, the status channel carries either nothing
//! (the command exited 0) or a Kubernetes `Status` document:
//!
//! ```json
//! {
//!   "kind": "Status",
//!   "status": "Failure",
//!   "details": { "causes": [{ "reason": "ExitCode", "message": "1" }] }
//! }
//! ```
//!
//! The first cause's message is the exit code.

use serde::Deserialize;

/// The status payload could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecStatusError {
    #[error("Malformed exec status: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    details: Option<StatusDetails>,
}

#[derive(Debug, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    message: Option<String>,
}

/// Returns the exit code carried by a raw status payload.
///
/// Empty (or whitespace-only) payloads and documents without causes mean
/// the command succeeded. Anything that is not valid JSON, or a cause
/// message that is not an integer, is [`ExecStatusError::Malformed`].
///
/// # Example
///
/// ```
/// use podfork::orchestrator::exec_status::decode_exit_code;
///
/// assert_eq!(decode_exit_code(b"").unwrap(), 0);
/// let raw = br#"{"details":{"causes":[{"message":"137"}]}}"#;
/// assert_eq!(decode_exit_code(raw).unwrap(), 137);
/// ```
pub fn decode_exit_code(raw: &[u8]) -> Result<i32, ExecStatusError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(0);
    }

    let status: Status =
        serde_json::from_slice(raw).map_err(|e| ExecStatusError::Malformed(e.to_string()))?;

    let Some(message) = status
        .details
        .and_then(|d| d.causes.into_iter().next())
        .and_then(|c| c.message)
    else {
        return Ok(0);
    };

    message
        .trim()
        .parse::<i32>()
        .map_err(|_| ExecStatusError::Malformed(format!("exit code '{}' is not an integer", message)))
}
