// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Provider executable discovery.
//!
//! Executables are looked up on `PATH` and asked for their version. A missing
//! executable is a normal, reportable condition rather than an error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::error::ConnectionError;

use super::types::ProviderKind;

/// Timeout for `--version` probes.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Installation status of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProbe {
    pub provider: ProviderKind,
    pub installed: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

/// Executable name for `kind`, honouring config overrides.
pub fn executable_for(config: &ResolvedConfig, kind: ProviderKind) -> Option<String> {
    config
        .provider_override(kind.key())
        .and_then(|o| o.executable.clone())
        .or_else(|| kind.executable().map(str::to_string))
}

/// Resolve an executable name or path to an absolute file.
///
/// Names containing a path separator are checked directly; bare names are
/// searched on `PATH`.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| executable_candidates(&dir, name))
        .find(|p| is_executable(p))
}

fn executable_candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    if cfg!(windows) {
        ["", ".exe", ".cmd", ".bat"]
            .iter()
            .map(|ext| dir.join(format!("{}{}", name, ext)))
            .collect()
    } else {
        vec![dir.join(name)]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run `<exe> --version` and return the first non-empty output line.
pub async fn read_version(path: &Path, timeout: Duration) -> Result<String, ConnectionError> {
    let mut cmd = Command::new(path);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(timeout.as_millis() as u64))??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        return Err(super::cli::classify_failure(output.status.code(), &stderr));
    }

    Ok(stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown")
        .to_string())
}

/// Probe a single provider.
pub async fn probe_provider(config: &ResolvedConfig, kind: ProviderKind) -> ProviderProbe {
    let Some(name) = executable_for(config, kind) else {
        // HTTP providers need no local executable
        return ProviderProbe {
            provider: kind,
            installed: true,
            path: None,
            version: None,
        };
    };

    let Some(path) = resolve_executable(&name) else {
        debug!(provider = %kind, executable = %name, "Provider executable not found");
        return ProviderProbe {
            provider: kind,
            installed: false,
            path: None,
            version: None,
        };
    };

    let version = match read_version(&path, VERSION_PROBE_TIMEOUT).await {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(provider = %kind, error = %e, "Version probe failed");
            None
        }
    };

    ProviderProbe {
        provider: kind,
        installed: true,
        path: Some(path),
        version,
    }
}

/// Probe every known provider in catalogue order.
pub async fn probe_all(config: &ResolvedConfig) -> Vec<ProviderProbe> {
    let mut results = Vec::with_capacity(ProviderKind::ALL.len());
    for kind in ProviderKind::ALL {
        results.push(probe_provider(config, kind).await);
    }
    results
}
