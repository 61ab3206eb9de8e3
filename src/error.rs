// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for agentdesk.
//!
//! This module provides strongly-typed errors for the workspace lock, the agent
//! clients, and the per-panel session supervisor, using `thiserror` for
//! ergonomic error definitions and `anyhow` for propagation at the binary edge.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::ProviderKind;

/// Why a workspace lock could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockFailureReason {
    /// The path does not exist or is not a directory.
    InvalidWorkspace,
    /// Another live instance holds the lease.
    InUse,
    /// Reading or writing the lock file failed.
    Error,
}

impl fmt::Display for LockFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWorkspace => write!(f, "invalid-workspace"),
            Self::InUse => write!(f, "in-use"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Metadata about the instance currently holding a lease.
///
/// Carries enough for a human to decide whether to force-claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: i64,
    pub heartbeat_at: i64,
}

/// A failed lock acquisition, returned as a typed result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("workspace lock {reason} for {}: {message}", .root.display())]
pub struct LockFailure {
    pub reason: LockFailureReason,
    pub root: PathBuf,
    pub message: String,
    pub owner: Option<LockOwner>,
}

impl LockFailure {
    pub fn invalid_workspace(root: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            reason: LockFailureReason::InvalidWorkspace,
            root: root.into(),
            message: message.into(),
            owner: None,
        }
    }

    pub fn in_use(root: impl Into<PathBuf>, owner: LockOwner) -> Self {
        let message = format!(
            "held by pid {} on {} (heartbeat at {})",
            owner.pid, owner.hostname, owner.heartbeat_at
        );
        Self {
            reason: LockFailureReason::InUse,
            root: root.into(),
            message,
            owner: Some(owner),
        }
    }

    pub fn io(root: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self {
            reason: LockFailureReason::Error,
            root: root.into(),
            message: err.to_string(),
            owner: None,
        }
    }

    /// Check if the failure came from a competing live owner.
    pub fn is_in_use(&self) -> bool {
        self.reason == LockFailureReason::InUse
    }
}

/// Errors raised while connecting to or driving an external agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("Turn did not start within {0}ms")]
    TurnTimeout(u64),

    #[error("Agent process {}: {stderr}", describe_exit(*code))]
    ProcessCrashed { code: Option<i32>, stderr: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Client is not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(String),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::ExecutableNotFound(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ConnectionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timed out: {}", err))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Errors surfaced by the session supervisor and registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Panel not found: {0}")]
    PanelNotFound(String),

    #[error("Panel already exists: {0}")]
    PanelExists(String),

    #[error("Wait for the current turn to finish before sending attachments")]
    QueueRejection,

    #[error(
        "This panel is bound to {panel_provider}; model {model} belongs to {model_provider}. Open a new panel to use it."
    )]
    ProviderMismatch {
        panel_provider: ProviderKind,
        model: String,
        model_provider: ProviderKind,
    },

    #[error("No queued message at index {0}")]
    InvalidQueueIndex(usize),

    #[error("Nothing to recall")]
    NothingToRecall,

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> LockOwner {
        LockOwner {
            pid: 4242,
            hostname: "devbox".to_string(),
            acquired_at: 1_700_000_000_000,
            heartbeat_at: 1_700_000_005_000,
        }
    }

    #[test]
    fn test_lock_failure_in_use_carries_owner() {
        let failure = LockFailure::in_use("/tmp/project", owner());
        assert!(failure.is_in_use());
        assert_eq!(failure.owner.as_ref().map(|o| o.pid), Some(4242));
        let display = failure.to_string();
        assert!(display.contains("in-use"));
        assert!(display.contains("devbox"));
    }

    #[test]
    fn test_process_crash_display_names_exit() {
        let crashed = ConnectionError::ProcessCrashed {
            code: Some(1),
            stderr: "oops".to_string(),
        };
        assert_eq!(crashed.to_string(), "Agent process exited with code 1: oops");

        let killed = ConnectionError::ProcessCrashed {
            code: None,
            stderr: String::new(),
        };
        assert_eq!(killed.to_string(), "Agent process was terminated by a signal: ");
    }

    #[test]
    fn test_lock_failure_reason_serializes_kebab() {
        let json = serde_json::to_string(&LockFailureReason::InvalidWorkspace).unwrap();
        assert_eq!(json, "\"invalid-workspace\"");
    }

    #[test]
    fn test_connection_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: ConnectionError = io_err.into();
        assert!(matches!(err, ConnectionError::ExecutableNotFound(_)));
    }

    #[test]
    fn test_provider_mismatch_display() {
        let err = SessionError::ProviderMismatch {
            panel_provider: ProviderKind::Codex,
            model: "gemini-2.5-pro".to_string(),
            model_provider: ProviderKind::Gemini,
        };
        let display = err.to_string();
        assert!(display.contains("Codex"));
        assert!(display.contains("gemini-2.5-pro"));
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let config_err: ConfigError = result.unwrap_err().into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }
}
