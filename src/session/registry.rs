// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Panel id to supervisor mapping, and the facade the UI layer talks to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::agents::{
    AgentClientEvent, ClientFactory, ConnectInfo, ConnectOptions, DefaultClientFactory,
    ProviderKind,
};
use crate::config::ResolvedConfig;
use crate::error::SessionError;

use super::state::AgentPanelState;
use super::supervisor::{SendOutcome, SessionSupervisor};

/// Registry of open panels.
///
/// Passed explicitly to whoever needs it; there is no process-wide instance.
pub struct SessionRegistry {
    config: ResolvedConfig,
    factory: Arc<dyn ClientFactory>,
    panels: RwLock<HashMap<String, SessionSupervisor>>,
}

impl SessionRegistry {
    /// Registry creating real provider clients.
    pub fn new(config: ResolvedConfig) -> Self {
        let factory = Arc::new(DefaultClientFactory::new(config.clone()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: ResolvedConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            config,
            factory,
            panels: RwLock::new(HashMap::new()),
        }
    }

    /// Inactivity threshold for `provider`, honouring config overrides.
    pub fn stall_timeout(&self, provider: ProviderKind) -> Duration {
        self.config
            .provider_override(provider.key())
            .and_then(|o| o.stall_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| provider.default_stall_timeout())
    }

    /// Create a disconnected panel bound to `options.provider`.
    pub fn open_panel(&self, id: &str, options: &ConnectOptions) -> Result<SessionSupervisor, SessionError> {
        let mut panels = self
            .panels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if panels.contains_key(id) {
            return Err(SessionError::PanelExists(id.to_string()));
        }

        let supervisor = SessionSupervisor::new(
            AgentPanelState::new(id, options),
            self.config.session.clone(),
            self.stall_timeout(options.provider),
            Arc::clone(&self.factory),
        );
        panels.insert(id.to_string(), supervisor.clone());
        info!(panel = %id, provider = %options.provider, "Panel opened");
        Ok(supervisor)
    }

    /// Close the panel's client and forget it.
    pub async fn close_panel(&self, id: &str) -> Result<(), SessionError> {
        let supervisor = self
            .panels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| SessionError::PanelNotFound(id.to_string()))?;
        supervisor.close().await;
        info!(panel = %id, "Panel closed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<SessionSupervisor> {
        self.panels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn panel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .panels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn require(&self, id: &str) -> Result<SessionSupervisor, SessionError> {
        self.get(id)
            .ok_or_else(|| SessionError::PanelNotFound(id.to_string()))
    }

    /// Connect a panel, opening it first if needed.
    pub async fn connect(&self, id: &str, options: ConnectOptions) -> Result<ConnectInfo, SessionError> {
        let supervisor = match self.get(id) {
            Some(s) => s,
            None => self.open_panel(id, &options)?,
        };
        supervisor.connect(options).await
    }

    pub async fn send_message(
        &self,
        id: &str,
        text: &str,
        image_paths: Vec<PathBuf>,
    ) -> Result<SendOutcome, SessionError> {
        self.require(id)?.send_message(text, image_paths).await
    }

    pub async fn interrupt(&self, id: &str) -> Result<(), SessionError> {
        self.require(id)?.interrupt().await;
        Ok(())
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), SessionError> {
        self.require(id)?.disconnect().await;
        Ok(())
    }

    pub fn subscribe(&self, id: &str) -> Result<mpsc::UnboundedReceiver<AgentClientEvent>, SessionError> {
        Ok(self.require(id)?.subscribe())
    }

    /// Close every panel.
    pub async fn shutdown(&self) {
        let panels: Vec<SessionSupervisor> = self
            .panels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for supervisor in panels {
            supervisor.close().await;
        }
    }
}
