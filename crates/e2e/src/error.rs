//! Error types for smoke runs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid log pattern ({pattern}): {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to launch {executable}: {reason}")]
    Launch { executable: String, reason: String },

    #[error("Driver process (pid {pid}) crashed: {status}")]
    Crash { pid: u32, status: String },

    #[error("Could not create a webdriver session after {attempts} attempt(s): {last_error}")]
    SessionExhausted { attempts: u32, last_error: String },

    #[error("Timed out after {elapsed:?} waiting for pattern ({pattern})")]
    Timeout { pattern: String, elapsed: Duration },

    #[error("Log stream closed while waiting for pattern ({0})")]
    LogStreamClosed(String),

    #[error("Diagnostic capture failed: {0}")]
    DiagnosticCapture(String),

    #[error("WebDriver {command} failed: {message}")]
    WebDriver { command: String, message: String },

    #[error("Element {selector} did not appear within {timeout:?}")]
    ElementTimeout { selector: String, timeout: Duration },

    #[error("Phase {phase} failed at {step}: {reason}")]
    PhaseFailed {
        phase: String,
        step: String,
        reason: String,
    },

    #[error("Invalid phase plan: {0}")]
    InvalidPhasePlan(String),

    #[error("Preparation failed: {0}")]
    Prepare(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl E2eError {
    /// Errors raised by the supervised driver rather than by the main flow.
    pub fn is_crash(&self) -> bool {
        matches!(self, E2eError::Crash { .. })
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_pattern_and_elapsed() {
        let err = E2eError::Timeout {
            pattern: "Setup done".to_string(),
            elapsed: Duration::from_millis(1500),
        };
        let msg = err.to_string();
        assert!(msg.contains("(Setup done)"));
        assert!(msg.contains("1.5s"));
    }
}
