// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::time::Duration;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub app_id: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub stale_threshold_ms: Option<u64>,
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.agentdesk.local.json)
/// 3. Workspace config (.agentdesk.json)
/// 4. Global config (~/.agentdesk/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = ResolvedConfig::default();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref app_id) = config.app_id {
        result.lock.app_id = app_id.clone();
    }

    if let Some(ref lock) = config.lock {
        if let Some(ms) = lock.heartbeat_interval_ms {
            result.lock.heartbeat_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = lock.stale_threshold_ms {
            result.lock.stale_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = lock.grace_ms {
            result.lock.grace = Duration::from_millis(ms);
        }
    }

    if let Some(ref retry) = config.retry {
        if let Some(attempts) = retry.max_attempts {
            // At least one attempt is always made
            result.session.max_attempts = attempts.max(1);
        }
        if let Some(ms) = retry.delay_ms {
            result.session.retry_delay = Duration::from_millis(ms);
        }
    }

    if let Some(ref timeouts) = config.timeouts {
        if let Some(ms) = timeouts.connect_ms {
            result.session.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = timeouts.turn_start_ms {
            result.session.turn_start_timeout = Duration::from_millis(ms);
        }
    }

    if let Some(ref history) = config.history {
        if let Some(max) = history.max_entries {
            result.session.history_max_entries = max;
        }
        if let Some(max) = history.max_entry_chars {
            result.session.history_max_entry_chars = max;
        }
    }

    if let Some(ref providers) = config.providers {
        // Later layers replace fields they set, keep the rest
        for (name, incoming) in providers {
            let entry = result.providers.entry(name.to_lowercase()).or_default();
            if incoming.executable.is_some() {
                entry.executable = incoming.executable.clone();
            }
            if incoming.stall_timeout_ms.is_some() {
                entry.stall_timeout_ms = incoming.stall_timeout_ms;
            }
            if !incoming.extra_args.is_empty() {
                entry.extra_args = incoming.extra_args.clone();
            }
            if incoming.base_url.is_some() {
                entry.base_url = incoming.base_url.clone();
            }
            if incoming.api_key_env.is_some() {
                entry.api_key_env = incoming.api_key_env.clone();
            }
        }
    }

    if let Some(ref defaults) = config.defaults {
        if defaults.provider.is_some() {
            result.default_provider = defaults.provider.clone();
        }
        if defaults.model.is_some() {
            result.default_model = defaults.model.clone();
        }
        if defaults.permission_mode.is_some() {
            result.default_permission_mode = defaults.permission_mode.clone();
        }
        if defaults.sandbox_mode.is_some() {
            result.default_sandbox_mode = defaults.sandbox_mode.clone();
        }
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if cli.provider.is_some() {
        result.default_provider = cli.provider.clone();
    }
    if cli.model.is_some() {
        result.default_model = cli.model.clone();
    }
    if let Some(ref app_id) = cli.app_id {
        result.lock.app_id = app_id.clone();
    }
    if let Some(ms) = cli.heartbeat_interval_ms {
        result.lock.heartbeat_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(ms) = cli.stale_threshold_ms {
        result.lock.stale_threshold = Duration::from_millis(ms);
    }
}
