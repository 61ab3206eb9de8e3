// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The agent client contract and provider dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ResolvedConfig;
use crate::error::ConnectionError;

use super::cli::{CliAgentClient, CliAgentSettings};
use super::http::{HttpAgentClient, HttpAgentSettings};
use super::types::{AgentClientEvent, ConnectInfo, ConnectOptions, ProviderKind, SendOptions};

/// Sending half of a client's event stream.
///
/// Every client owns exactly one sink; events arrive at the receiver in the
/// order they were emitted.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AgentClientEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentClientEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. Returns false once the receiver is gone.
    pub fn emit(&self, event: AgentClientEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Capabilities shared by every agent backend.
///
/// A client owns one external session. `send_user_message` returns once the
/// turn has started; output then arrives through the client's [`EventSink`]
/// and always ends with [`AgentClientEvent::AssistantCompleted`].
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Validate the backend and establish a session.
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectInfo, ConnectionError>;

    /// Record the message in history and start a turn.
    async fn send_user_message(&self, text: &str, options: SendOptions) -> Result<(), ConnectionError>;

    /// Request termination of the in-flight turn. Safe when idle.
    async fn interrupt_active_turn(&self);

    /// Interrupt and release all session state. Idempotent.
    async fn close(&self);
}

/// Closed set of client implementations, one variant per transport.
pub enum ProviderClient {
    Cli(CliAgentClient),
    Http(HttpAgentClient),
}

impl ProviderClient {
    /// Build the client for `provider` from resolved configuration.
    pub fn from_config(config: &ResolvedConfig, provider: ProviderKind, sink: EventSink) -> Self {
        match provider {
            ProviderKind::OpenAiCompatible => {
                Self::Http(HttpAgentClient::new(HttpAgentSettings::from_config(config), sink))
            }
            ProviderKind::Codex | ProviderKind::Claude | ProviderKind::Gemini | ProviderKind::Qwen => {
                Self::Cli(CliAgentClient::new(
                    provider,
                    CliAgentSettings::from_config(config, provider),
                    sink,
                ))
            }
        }
    }
}

#[async_trait]
impl AgentClient for ProviderClient {
    fn provider(&self) -> ProviderKind {
        match self {
            Self::Cli(c) => c.provider(),
            Self::Http(c) => c.provider(),
        }
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectInfo, ConnectionError> {
        match self {
            Self::Cli(c) => c.connect(options).await,
            Self::Http(c) => c.connect(options).await,
        }
    }

    async fn send_user_message(&self, text: &str, options: SendOptions) -> Result<(), ConnectionError> {
        match self {
            Self::Cli(c) => c.send_user_message(text, options).await,
            Self::Http(c) => c.send_user_message(text, options).await,
        }
    }

    async fn interrupt_active_turn(&self) {
        match self {
            Self::Cli(c) => c.interrupt_active_turn().await,
            Self::Http(c) => c.interrupt_active_turn().await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Cli(c) => c.close().await,
            Self::Http(c) => c.close().await,
        }
    }
}

/// Creates clients for the session supervisor.
///
/// Tests substitute scripted clients here.
pub trait ClientFactory: Send + Sync {
    fn create(&self, provider: ProviderKind, sink: EventSink) -> Arc<dyn AgentClient>;
}

/// Factory producing [`ProviderClient`]s from configuration.
#[derive(Debug, Clone, Default)]
pub struct DefaultClientFactory {
    config: ResolvedConfig,
}

impl DefaultClientFactory {
    pub fn new(config: ResolvedConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for DefaultClientFactory {
    fn create(&self, provider: ProviderKind, sink: EventSink) -> Arc<dyn AgentClient> {
        Arc::new(ProviderClient::from_config(&self.config, provider, sink))
    }
}
