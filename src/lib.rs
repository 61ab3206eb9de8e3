// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! agentdesk - workspace leases and supervised AI agent sessions.
//!
//! The core of a multi-panel desktop front end for command-line and HTTP
//! coding agents. Rendering lives elsewhere; this crate owns the parts that
//! have to be right under concurrency.
//!
//! # Architecture
//!
//! - [`lock`] - Cross-process workspace lease with heartbeat and stale reclaim
//! - [`agents`] - Provider-polymorphic agent clients (CLI processes, HTTP streaming)
//! - [`session`] - Per-panel supervisor: retry, input queue, interrupt, stall recovery
//! - [`config`] - Layered configuration loading and merging
//! - [`error`] - Error types per concern
//! - [`telemetry`] - Tracing setup and lightweight metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use agentdesk::config::{load_config, CliOptions};
//! use agentdesk::lock::WorkspaceLockManager;
//! use agentdesk::session::SessionRegistry;
//!
//! let config = load_config(&root, CliOptions::default())?;
//! let locks = WorkspaceLockManager::new(config.lock.clone());
//! locks.acquire(&root).await?;
//!
//! let sessions = SessionRegistry::new(config);
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod lock;
pub mod session;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use agents::{AgentClient, AgentClientEvent, ConnectOptions, ProviderKind};
pub use error::{ConfigError, ConnectionError, LockFailure, Result, SessionError};
pub use lock::{LockEvent, LockStatus, WorkspaceLockManager};
pub use session::{SessionRegistry, SessionSupervisor};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let options = ConnectOptions::new(ProviderKind::Qwen, "qwen3-coder-plus", ".");
        assert_eq!(options.provider, ProviderKind::Qwen);
        assert!(!AgentClientEvent::AssistantCompleted.is_terminal_status());
    }
}
