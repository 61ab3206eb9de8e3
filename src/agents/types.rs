// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared types for agent clients.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Supported agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenAI Codex CLI
    Codex,
    /// Anthropic Claude Code CLI
    Claude,
    /// Google Gemini CLI
    Gemini,
    /// Qwen Code CLI
    Qwen,
    /// Any OpenAI-compatible chat completions endpoint
    OpenAiCompatible,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        Self::Codex,
        Self::Claude,
        Self::Gemini,
        Self::Qwen,
        Self::OpenAiCompatible,
    ];

    /// Classify a model id by the provider that serves it.
    ///
    /// Unknown ids fall back to the OpenAI-compatible endpoint.
    pub fn for_model(model: &str) -> Self {
        let m = model.to_lowercase();
        if m.contains("claude") || m.contains("sonnet") || m.contains("opus") || m.contains("haiku") {
            Self::Claude
        } else if m.contains("gemini") {
            Self::Gemini
        } else if m.contains("qwen") {
            Self::Qwen
        } else if m.contains("codex")
            || m.starts_with("gpt")
            || m.starts_with("o1")
            || m.starts_with("o3")
            || m.starts_with("o4")
        {
            Self::Codex
        } else {
            Self::OpenAiCompatible
        }
    }

    /// Get the default model for this provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Codex => "gpt-5-codex",
            Self::Claude => "claude-sonnet-4-5",
            Self::Gemini => "gemini-2.5-pro",
            Self::Qwen => "qwen3-coder-plus",
            Self::OpenAiCompatible => "llama3.2",
        }
    }

    /// Executable name on `PATH`, if process-backed.
    pub fn executable(&self) -> Option<&'static str> {
        match self {
            Self::Codex => Some("codex"),
            Self::Claude => Some("claude"),
            Self::Gemini => Some("gemini"),
            Self::Qwen => Some("qwen"),
            Self::OpenAiCompatible => None,
        }
    }

    /// Inactivity allowed during an outstanding turn before it counts as stalled.
    pub fn default_stall_timeout(&self) -> Duration {
        match self {
            // Codex can think silently for a long time before emitting output
            Self::Codex => Duration::from_secs(300),
            Self::Claude | Self::Gemini | Self::Qwen => Duration::from_secs(180),
            Self::OpenAiCompatible => Duration::from_secs(120),
        }
    }

    /// Check if this provider runs as a local child process.
    pub fn is_process_backed(&self) -> bool {
        self.executable().is_some()
    }

    /// Config key for provider overrides.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Qwen => "qwen",
            Self::OpenAiCompatible => "openai-compatible",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codex => write!(f, "Codex"),
            Self::Claude => write!(f, "Claude"),
            Self::Gemini => write!(f, "Gemini"),
            Self::Qwen => write!(f, "Qwen"),
            Self::OpenAiCompatible => write!(f, "OpenAI-compatible"),
        }
    }
}

/// Error type for parsing a provider kind from a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseProviderKindError(pub String);

impl fmt::Display for ParseProviderKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown provider: {}", self.0)
    }
}

impl std::error::Error for ParseProviderKindError {}

impl std::str::FromStr for ProviderKind {
    type Err = ParseProviderKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "codex" => Ok(Self::Codex),
            "claude" | "claude-code" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "qwen" => Ok(Self::Qwen),
            "openai" | "openai-compatible" | "http" => Ok(Self::OpenAiCompatible),
            _ => Err(ParseProviderKindError(s.to_string())),
        }
    }
}

/// Phase carried by [`AgentClientEvent::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusPhase {
    Starting,
    Ready,
    Error,
    Closed,
}

/// Normalized events emitted by every agent client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentClientEvent {
    Status {
        phase: StatusPhase,
        message: String,
    },
    AssistantDelta {
        text: String,
    },
    AssistantCompleted,
    UsageUpdated {
        data: serde_json::Value,
    },
}

impl AgentClientEvent {
    pub fn status(phase: StatusPhase, message: impl Into<String>) -> Self {
        Self::Status {
            phase,
            message: message.into(),
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self::AssistantDelta { text: text.into() }
    }

    /// Check if this event ends the connection (error or closed status).
    pub fn is_terminal_status(&self) -> bool {
        matches!(
            self,
            Self::Status {
                phase: StatusPhase::Error | StatusPhase::Closed,
                ..
            }
        )
    }
}

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

/// One prior exchange used to seed a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Assistant,
            text: text.into(),
        }
    }
}

/// Parameters for [`AgentClient::connect`](super::AgentClient::connect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    pub provider: ProviderKind,
    pub model: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub sandbox_mode: Option<String>,
    #[serde(default)]
    pub interaction_mode: Option<String>,
    #[serde(default)]
    pub initial_history: Vec<HistoryEntry>,
}

impl ConnectOptions {
    pub fn new(provider: ProviderKind, model: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            model: model.into(),
            cwd: cwd.into(),
            permission_mode: None,
            sandbox_mode: None,
            interaction_mode: None,
            initial_history: Vec::new(),
        }
    }
}

/// Extra per-message options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    #[serde(default)]
    pub image_paths: Vec<PathBuf>,
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    pub thread_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_model() {
        assert_eq!(ProviderKind::for_model("gpt-5-codex"), ProviderKind::Codex);
        assert_eq!(ProviderKind::for_model("o3-mini"), ProviderKind::Codex);
        assert_eq!(ProviderKind::for_model("claude-opus-4-1"), ProviderKind::Claude);
        assert_eq!(ProviderKind::for_model("sonnet"), ProviderKind::Claude);
        assert_eq!(ProviderKind::for_model("gemini-2.5-flash"), ProviderKind::Gemini);
        assert_eq!(ProviderKind::for_model("Qwen3-Coder"), ProviderKind::Qwen);
        assert_eq!(ProviderKind::for_model("llama3.2"), ProviderKind::OpenAiCompatible);
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Claude);
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAiCompatible);
        assert!("bard".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_default_models_classify_back() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::for_model(kind.default_model()), kind, "{kind}");
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = AgentClientEvent::status(StatusPhase::Error, "boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["phase"], "error");
        assert!(event.is_terminal_status());
        assert!(!AgentClientEvent::AssistantCompleted.is_terminal_status());
    }
}
