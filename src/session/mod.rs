// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent panel sessions.
//!
//! Each panel owns one [`SessionSupervisor`], which drives a provider client
//! through connect, retry, queued input, interrupt, stall recovery, and
//! reconnect. The [`SessionRegistry`] maps panel ids to supervisors.
//!
//! ```rust,ignore
//! use agentdesk::agents::{ConnectOptions, ProviderKind};
//! use agentdesk::session::SessionRegistry;
//!
//! let registry = SessionRegistry::new(config);
//! let options = ConnectOptions::new(ProviderKind::Claude, "claude-sonnet-4-5", &root);
//! registry.connect("left", options).await?;
//! registry.send_message("left", "summarize the README", vec![]).await?;
//! ```

mod registry;
mod retry;
mod state;
mod supervisor;

pub use registry::SessionRegistry;
pub use retry::RetryPolicy;
pub use state::{AgentPanelState, ChatMessage, DraftEdit, MessageRole, PanelPhase, QueuedInput};
pub use supervisor::{SendOutcome, SessionSupervisor};
