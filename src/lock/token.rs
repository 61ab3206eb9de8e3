// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock file payload codec.
//!
//! The on-disk format is a single JSON object:
//!
//! ```text
//! { "version": 1, "app": "<AppId>", "instanceId": "<uuid>", "pid": <int>,
//!   "hostname": "<string>", "workspaceRoot": "<abs path>",
//!   "acquiredAt": <epoch ms>, "heartbeatAt": <epoch ms> }
//! ```
//!
//! Decoding is strict: a payload failing any presence or type check decodes to
//! `None`, and callers treat the lock as free to claim.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LockOwner;

/// Current lock file format version.
pub const LOCK_VERSION: u32 = 1;

/// Identifies the current holder of a workspace lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockToken {
    pub version: u32,
    #[serde(rename = "app")]
    pub app_id: String,
    pub instance_id: String,
    pub pid: u32,
    pub hostname: String,
    pub workspace_root: PathBuf,
    pub acquired_at: i64,
    pub heartbeat_at: i64,
}

impl LockToken {
    /// Build a fresh token for a lease starting at `now_ms`.
    pub fn new(
        app_id: impl Into<String>,
        instance_id: impl Into<String>,
        pid: u32,
        hostname: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        now_ms: i64,
    ) -> Self {
        Self {
            version: LOCK_VERSION,
            app_id: app_id.into(),
            instance_id: instance_id.into(),
            pid,
            hostname: hostname.into(),
            workspace_root: workspace_root.into(),
            acquired_at: now_ms,
            heartbeat_at: now_ms,
        }
    }

    /// Copy of this token with a new heartbeat; `acquired_at` is preserved.
    pub fn refreshed(&self, now_ms: i64) -> Self {
        Self {
            heartbeat_at: now_ms,
            ..self.clone()
        }
    }

    /// Milliseconds since the last heartbeat, never negative.
    pub fn heartbeat_age_ms(&self, now_ms: i64) -> u64 {
        now_ms.saturating_sub(self.heartbeat_at).max(0) as u64
    }

    /// Owner metadata for user-facing "in use" reports.
    pub fn owner(&self) -> LockOwner {
        LockOwner {
            pid: self.pid,
            hostname: self.hostname.clone(),
            acquired_at: self.acquired_at,
            heartbeat_at: self.heartbeat_at,
        }
    }

    /// Serialize to the on-disk representation.
    pub fn encode(&self) -> String {
        let mut out = serde_json::to_string_pretty(self).unwrap_or_default();
        out.push('\n');
        out
    }

    /// Parse and validate an on-disk payload.
    pub fn decode(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?;

        let version = obj.get("version")?.as_u64()?;
        if version != LOCK_VERSION as u64 {
            return None;
        }

        let app_id = non_empty_str(obj.get("app")?)?;
        let instance_id = non_empty_str(obj.get("instanceId")?)?;
        let pid = u32::try_from(obj.get("pid")?.as_u64()?).ok()?;
        let hostname = obj.get("hostname")?.as_str()?.to_string();
        let workspace_root = non_empty_str(obj.get("workspaceRoot")?)?;
        let acquired_at = epoch_ms(obj.get("acquiredAt")?)?;
        let heartbeat_at = epoch_ms(obj.get("heartbeatAt")?)?;

        Some(Self {
            version: LOCK_VERSION,
            app_id,
            instance_id,
            pid,
            hostname,
            workspace_root: PathBuf::from(workspace_root),
            acquired_at,
            heartbeat_at,
        })
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

/// Accepts integral or floating epoch milliseconds, rejecting non-finite values.
fn epoch_ms(value: &Value) -> Option<i64> {
    if let Some(ms) = value.as_i64() {
        return Some(ms);
    }
    let ms = value.as_f64()?;
    if ms.is_finite() {
        Some(ms as i64)
    } else {
        None
    }
}
