// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent clients.
//!
//! Every backend implements [`AgentClient`] and reports progress as a single
//! ordered stream of [`AgentClientEvent`]s:
//!
//! - [`cli::CliAgentClient`] - Codex, Claude, Gemini and Qwen command-line agents
//! - [`http::HttpAgentClient`] - OpenAI-compatible chat completion endpoints
//!
//! ```rust,ignore
//! use agentdesk::agents::{ConnectOptions, DefaultClientFactory, ClientFactory, EventSink, ProviderKind};
//!
//! let (sink, mut events) = EventSink::channel();
//! let client = DefaultClientFactory::new(config).create(ProviderKind::Claude, sink);
//! client.connect(&ConnectOptions::new(ProviderKind::Claude, "claude-sonnet-4-5", cwd)).await?;
//! client.send_user_message("Summarize this repo", Default::default()).await?;
//! ```

pub mod cli;
mod client;
mod history;
pub mod http;
pub mod probe;
mod types;

pub use client::{AgentClient, ClientFactory, DefaultClientFactory, EventSink, ProviderClient};
pub use history::{condense, ConversationHistory};
pub use probe::{probe_all, probe_provider, ProviderProbe};
pub use types::{
    AgentClientEvent, ConnectInfo, ConnectOptions, HistoryEntry, HistoryRole, ParseProviderKindError,
    ProviderKind, SendOptions, StatusPhase,
};
