// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP-backed agent client for OpenAI-compatible chat completion endpoints.
//!
//! Responses are consumed as server-sent events; `data:` payloads carry
//! content deltas and, when the server supports it, a final `usage` object.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::{ResolvedConfig, SessionSettings};
use crate::error::ConnectionError;
use crate::telemetry::metrics::{count, TimedOperation};

use super::client::{AgentClient, EventSink};
use super::history::ConversationHistory;
use super::types::{
    AgentClientEvent, ConnectInfo, ConnectOptions, HistoryRole, ProviderKind, SendOptions,
    StatusPhase,
};

/// Default base URL (a local Ollama server).
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Default environment variable for the API key.
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpAgentSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub history_max_entries: usize,
    pub history_max_entry_chars: usize,
}

impl HttpAgentSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let overrides = config.provider_override(ProviderKind::OpenAiCompatible.key());
        let base_url = overrides
            .and_then(|o| o.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let key_env = overrides
            .and_then(|o| o.api_key_env.clone())
            .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
        let api_key = std::env::var(&key_env).ok().filter(|k| !k.is_empty());
        Self::with_session(base_url, api_key, &config.session)
    }

    pub fn with_session(base_url: String, api_key: Option<String>, session: &SessionSettings) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            connect_timeout: session.connect_timeout,
            history_max_entries: session.history_max_entries,
            history_max_entry_chars: session.history_max_entry_chars,
        }
    }
}

/// Incremental decoder for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every complete `data:` payload.
    ///
    /// Only whole lines are decoded, so characters split across network
    /// chunks arrive intact.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

struct ActiveRequest {
    id: u64,
    cancel: oneshot::Sender<()>,
}

struct HttpState {
    options: Option<ConnectOptions>,
    history: ConversationHistory,
    active: Option<ActiveRequest>,
    next_turn: u64,
}

/// Agent client for OpenAI-compatible HTTP endpoints.
pub struct HttpAgentClient {
    settings: HttpAgentSettings,
    sink: EventSink,
    client: Client,
    state: Arc<Mutex<HttpState>>,
}

impl HttpAgentClient {
    pub fn new(settings: HttpAgentSettings, sink: EventSink) -> Self {
        let history = ConversationHistory::new(
            settings.history_max_entries,
            settings.history_max_entry_chars,
        );
        Self {
            settings,
            sink,
            client: Client::new(),
            state: Arc::new(Mutex::new(HttpState {
                options: None,
                history,
                active: None,
                next_turn: 0,
            })),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.settings.base_url, path));
        if let Some(ref key) = self.settings.api_key {
            req = req.header("authorization", format!("Bearer {}", key));
        }
        req
    }
}

fn status_error(status: StatusCode, body: &str) -> ConnectionError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ConnectionError::AuthenticationRequired(format!("{}: {}", status, body.trim()))
        }
        _ => ConnectionError::Transport(format!("{}: {}", status, body.trim())),
    }
}

/// Build the chat completions request body from the transcript.
pub fn build_request(model: &str, history: &ConversationHistory) -> Value {
    let messages: Vec<Value> = history
        .entries()
        .map(|e| {
            let role = match e.role {
                HistoryRole::User => "user",
                HistoryRole::Assistant => "assistant",
            };
            json!({ "role": role, "content": e.text })
        })
        .collect();

    json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    })
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAiCompatible
    }

    #[instrument(skip(self, options), fields(model = %options.model, base_url = %self.settings.base_url))]
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectInfo, ConnectionError> {
        self.sink.emit(AgentClientEvent::status(
            StatusPhase::Starting,
            format!("Connecting to {}", self.settings.base_url),
        ));

        let timeout = self.settings.connect_timeout;
        let response = tokio::time::timeout(
            timeout,
            self.request(reqwest::Method::GET, "/models").send(),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(timeout.as_millis() as u64))??;

        let status = response.status();
        // Some compatible servers do not implement the models listing
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        {
            let mut state = self.state.lock().await;
            state.history = ConversationHistory::seeded(
                self.settings.history_max_entries,
                self.settings.history_max_entry_chars,
                &options.initial_history,
            );
            state.options = Some(options.clone());
        }

        self.sink.emit(AgentClientEvent::status(StatusPhase::Ready, "Endpoint ready"));
        Ok(ConnectInfo {
            thread_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    #[instrument(skip(self, text, options))]
    async fn send_user_message(&self, text: &str, options: SendOptions) -> Result<(), ConnectionError> {
        let (body, turn_id, cancel_rx) = {
            let mut state = self.state.lock().await;
            let model = match &state.options {
                Some(o) => o.model.clone(),
                None => return Err(ConnectionError::NotConnected),
            };
            if let Some(previous) = state.active.take() {
                let _ = previous.cancel.send(());
            }

            let mut message = text.to_string();
            for image in &options.image_paths {
                message.push_str(&format!("\n[attached: {}]", image.display()));
            }
            state.history.push_user(&message);

            let turn_id = state.next_turn;
            state.next_turn += 1;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            state.active = Some(ActiveRequest {
                id: turn_id,
                cancel: cancel_tx,
            });
            (build_request(&model, &state.history), turn_id, cancel_rx)
        };

        let sent = self
            .request(reqwest::Method::POST, "/chat/completions")
            .json(&body)
            .send()
            .await;

        let response = match sent {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                self.clear_active(turn_id).await;
                return Err(status_error(status, &body));
            }
            Err(e) => {
                self.clear_active(turn_id).await;
                return Err(e.into());
            }
        };

        info!(turn = turn_id, "Chat completion stream started");
        tokio::spawn(stream_turn(
            response,
            self.sink.clone(),
            Arc::clone(&self.state),
            cancel_rx,
            turn_id,
        ));
        Ok(())
    }

    async fn interrupt_active_turn(&self) {
        if let Some(active) = self.state.lock().await.active.take() {
            debug!(turn = active.id, "Cancelling chat completion stream");
            let _ = active.cancel.send(());
        }
    }

    async fn close(&self) {
        let was_connected = {
            let mut state = self.state.lock().await;
            if let Some(active) = state.active.take() {
                let _ = active.cancel.send(());
            }
            state.history.clear();
            state.options.take().is_some()
        };
        if was_connected {
            self.sink
                .emit(AgentClientEvent::status(StatusPhase::Closed, "Session closed"));
        }
    }
}

impl HttpAgentClient {
    async fn clear_active(&self, turn_id: u64) {
        let mut state = self.state.lock().await;
        if state.active.as_ref().is_some_and(|a| a.id == turn_id) {
            state.active = None;
        }
    }
}

async fn stream_turn(
    mut response: reqwest::Response,
    sink: EventSink,
    state: Arc<Mutex<HttpState>>,
    mut cancel: oneshot::Receiver<()>,
    turn_id: u64,
) {
    let timer = TimedOperation::start("agent.turn");
    let mut decoder = SseDecoder::new();
    let mut reply = String::new();
    let mut failure: Option<ConnectionError> = None;
    let mut cancelled = false;

    'read: loop {
        let chunk = tokio::select! {
            _ = &mut cancel => {
                cancelled = true;
                break;
            }
            chunk = response.chunk() => chunk,
        };

        match chunk {
            Ok(Some(bytes)) => {
                for payload in decoder.push(&bytes) {
                    if payload == "[DONE]" {
                        break 'read;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        debug!(turn = turn_id, "Skipping unparseable stream payload");
                        continue;
                    };
                    if let Some(text) = value
                        .pointer("/choices/0/delta/content")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                    {
                        reply.push_str(text);
                        sink.emit(AgentClientEvent::delta(text));
                    }
                    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
                        sink.emit(AgentClientEvent::UsageUpdated { data: usage.clone() });
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                failure = Some(e.into());
                break;
            }
        }
    }

    {
        let mut state = state.lock().await;
        if failure.is_none() && !cancelled {
            state.history.push_assistant(&reply);
        }
        if state.active.as_ref().is_some_and(|a| a.id == turn_id) {
            state.active = None;
        }
    }

    if let Some(err) = failure {
        count("session.turn.error");
        warn!(turn = turn_id, error = %err, "Chat completion stream failed");
        sink.emit(AgentClientEvent::status(StatusPhase::Error, err.to_string()));
    }
    sink.emit(AgentClientEvent::AssistantCompleted);
    timer.finish();
}
