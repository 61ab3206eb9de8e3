// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for agentdesk.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.agentdesk/config.json (or .yaml)
//! - Workspace config: .agentdesk.json or .agentdesk/config.json
//! - Local config: .agentdesk.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    get_global_config_dir, load_config_file, load_global_config, load_local_config,
    load_workspace_config, save_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR,
    LOCAL_CONFIG_FILE,
};

pub use merger::{merge_config, CliOptions};

pub use types::{
    HistoryConfig, LockConfig, LockSettings, PanelDefaultsConfig, ProviderOverride,
    ResolvedConfig, RetryConfig, SessionSettings, TimeoutConfig, WorkspaceConfig,
    CONTEST_GRACE_MS, DEFAULT_APP_ID, HEARTBEAT_INTERVAL_MS, STALE_THRESHOLD_MS,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
///
/// This is the main entry point for configuration loading.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    Ok(merge_config(global, workspace, local, cli_options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_workspace_and_local() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".agentdesk.json"),
            r#"{"defaults": {"provider": "codex", "model": "gpt-5-codex"}}"#,
        )
        .unwrap();
        std::fs::write(
            temp.path().join(LOCAL_CONFIG_FILE),
            r#"{"defaults": {"model": "o3"}}"#,
        )
        .unwrap();

        let config = load_config(temp.path(), CliOptions::default()).unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("codex"));
        assert_eq!(config.default_model.as_deref(), Some("o3"));
    }

    #[test]
    fn test_load_config_cli_override() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".agentdesk.json"),
            r#"{"defaults": {"provider": "gemini"}}"#,
        )
        .unwrap();

        let cli = CliOptions {
            provider: Some("claude".to_string()),
            ..Default::default()
        };

        let config = load_config(temp.path(), cli).unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("claude"));
    }
}
