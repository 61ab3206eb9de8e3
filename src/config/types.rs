// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of workspace and resolved configuration,
//! supporting JSON and YAML formats.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default application id recorded in lock files.
pub const DEFAULT_APP_ID: &str = "agentdesk";

/// Interval between lease heartbeats.
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Age after which a heartbeat is considered stale.
pub const STALE_THRESHOLD_MS: u64 = 30_000;

/// Extra slack callers add before treating a lease as contestable.
pub const CONTEST_GRACE_MS: u64 = 2_000;

/// On-disk configuration, every field optional.
/// Can be defined in .agentdesk.json or .agentdesk/config.json in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Application id written into lock tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    /// Workspace lease timing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockConfig>,

    /// Connect retry policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Hard timeouts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutConfig>,

    /// Conversation history bounds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryConfig>,

    /// Per-provider overrides keyed by provider name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<HashMap<String, ProviderOverride>>,

    /// Defaults for newly opened panels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<PanelDefaultsConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_threshold_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_start_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entry_chars: Option<usize>,
}

/// Overrides for a single provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOverride {
    /// Executable name or absolute path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    /// Inactivity threshold before a turn is considered stalled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_timeout_ms: Option<u64>,
    /// Extra arguments appended to every invocation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    /// Base URL for HTTP providers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key for HTTP providers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelDefaultsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
}

/// Resolved lease timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub app_id: String,
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    pub grace: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            stale_threshold: Duration::from_millis(STALE_THRESHOLD_MS),
            grace: Duration::from_millis(CONTEST_GRACE_MS),
        }
    }
}

/// Resolved session behaviour shared by every supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub turn_start_timeout: Duration,
    pub history_max_entries: usize,
    pub history_max_entry_chars: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(2_000),
            connect_timeout: Duration::from_millis(20_000),
            turn_start_timeout: Duration::from_millis(15_000),
            history_max_entries: 24,
            history_max_entry_chars: 6_000,
        }
    }
}

/// Fully resolved configuration with all defaults applied.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub lock: LockSettings,
    pub session: SessionSettings,
    /// Provider overrides keyed by lowercase provider name
    pub providers: HashMap<String, ProviderOverride>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub default_permission_mode: Option<String>,
    pub default_sandbox_mode: Option<String>,
}

impl ResolvedConfig {
    /// Look up overrides for a provider by name.
    pub fn provider_override(&self, name: &str) -> Option<&ProviderOverride> {
        self.providers.get(&name.to_lowercase())
    }
}
