// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-panel session state.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::agents::{ConnectOptions, HistoryEntry, ProviderKind};

/// Pending modification of a message the user already submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "camelCase")]
pub enum DraftEdit {
    #[default]
    None,
    /// Editing the queued message at this index; resubmitting replaces it in place.
    QueuedEdit(usize),
    /// Correcting the last sent message; resubmitting queues it at the front.
    RecalledEdit,
}

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One rendered transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_error: bool,
}

impl ChatMessage {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(MessageRole::System, text)
        }
    }
}

/// A message waiting for a turn, with any attachments it was submitted with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedInput {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<PathBuf>,
}

impl QueuedInput {
    pub fn new(text: impl Into<String>, image_paths: Vec<PathBuf>) -> Self {
        Self {
            text: text.into(),
            image_paths,
        }
    }
}

impl From<&str> for QueuedInput {
    fn from(text: &str) -> Self {
        Self::new(text, Vec::new())
    }
}

impl From<String> for QueuedInput {
    fn from(text: String) -> Self {
        Self::new(text, Vec::new())
    }
}

/// Lifecycle phase derived from the panel flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelPhase {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Reconnecting,
}

impl std::fmt::Display for PanelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

/// State of one agent panel.
#[derive(Debug, Clone)]
pub struct AgentPanelState {
    pub id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub cwd: PathBuf,
    pub permission_mode: Option<String>,
    pub sandbox_mode: Option<String>,
    pub interaction_mode: Option<String>,
    pub connected: bool,
    pub streaming: bool,
    pub connecting: bool,
    pub reconnecting: bool,
    /// FIFO of messages waiting for a free turn.
    pub pending_inputs: VecDeque<QueuedInput>,
    /// Message pulled out of the queue to run before everything else.
    pub injected_input: Option<QueuedInput>,
    pub draft_edit: DraftEdit,
    pub messages: Vec<ChatMessage>,
    pub thread_id: Option<String>,
    pub usage: Option<serde_json::Value>,
    pub last_activity: Instant,
    assistant_open: bool,
}

impl AgentPanelState {
    /// Fresh, disconnected state for a panel bound to `options.provider`.
    pub fn new(id: impl Into<String>, options: &ConnectOptions) -> Self {
        Self {
            id: id.into(),
            provider: options.provider,
            model: options.model.clone(),
            cwd: options.cwd.clone(),
            permission_mode: options.permission_mode.clone(),
            sandbox_mode: options.sandbox_mode.clone(),
            interaction_mode: options.interaction_mode.clone(),
            connected: false,
            streaming: false,
            connecting: false,
            reconnecting: false,
            pending_inputs: VecDeque::new(),
            injected_input: None,
            draft_edit: DraftEdit::None,
            messages: Vec::new(),
            thread_id: None,
            usage: None,
            last_activity: Instant::now(),
            assistant_open: false,
        }
    }

    pub fn phase(&self) -> PanelPhase {
        if self.reconnecting {
            PanelPhase::Reconnecting
        } else if self.connecting {
            PanelPhase::Connecting
        } else if self.streaming {
            PanelPhase::Streaming
        } else if self.connected {
            PanelPhase::Connected
        } else {
            PanelPhase::Disconnected
        }
    }

    /// A turn is running or input is already waiting for one.
    pub fn is_busy(&self) -> bool {
        self.streaming || !self.pending_inputs.is_empty() || self.injected_input.is_some()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn push_system(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::new(MessageRole::System, text));
    }

    pub fn push_error(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::error(text));
    }

    /// Mark a turn as started for `text`.
    pub fn begin_turn(&mut self, text: &str) {
        self.messages.push(ChatMessage::new(MessageRole::User, text));
        self.streaming = true;
        self.assistant_open = false;
        self.touch();
    }

    /// Append streamed text to the open assistant message, opening one if needed.
    pub fn append_assistant_delta(&mut self, text: &str) {
        match self.messages.last_mut() {
            Some(last) if self.assistant_open && last.role == MessageRole::Assistant => {
                last.text.push_str(text);
            }
            _ => {
                self.messages.push(ChatMessage::new(MessageRole::Assistant, text));
                self.assistant_open = true;
            }
        }
    }

    /// Close the current turn.
    pub fn finish_turn(&mut self) {
        self.streaming = false;
        self.assistant_open = false;
    }

    /// Take the next message to dispatch, preferring an injected one.
    pub fn next_input(&mut self) -> Option<QueuedInput> {
        self.injected_input
            .take()
            .or_else(|| self.pending_inputs.pop_front())
    }

    /// Remove a queued item, keeping a queued-edit draft pointing at the same entry.
    pub fn remove_pending(&mut self, index: usize) -> Option<QueuedInput> {
        let removed = self.pending_inputs.remove(index)?;
        if let DraftEdit::QueuedEdit(edit) = self.draft_edit {
            if edit == index {
                self.draft_edit = DraftEdit::None;
            } else if edit > index {
                self.draft_edit = DraftEdit::QueuedEdit(edit - 1);
            }
        }
        Some(removed)
    }

    /// Drop the transcript entry of a turn that never reached the agent.
    ///
    /// The message goes back into the queue and is recorded again when it is
    /// dispatched, so it must not linger in the transcript or in reconnect history.
    pub fn retract_turn(&mut self, text: &str) {
        if self
            .messages
            .last()
            .is_some_and(|m| m.role == MessageRole::User && m.text == text)
        {
            self.messages.pop();
        }
        self.finish_turn();
    }

    /// Text of the most recent user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text.as_str())
    }

    /// Connection parameters for reconnecting, seeded with recent transcript.
    pub fn connect_options(&self, max_history: usize) -> ConnectOptions {
        let mut history: Vec<HistoryEntry> = self
            .messages
            .iter()
            .filter(|m| !m.is_error)
            .filter_map(|m| match m.role {
                MessageRole::User => Some(HistoryEntry::user(&m.text)),
                MessageRole::Assistant => Some(HistoryEntry::assistant(&m.text)),
                MessageRole::System => None,
            })
            .collect();
        if history.len() > max_history {
            history.drain(..history.len() - max_history);
        }

        ConnectOptions {
            provider: self.provider,
            model: self.model.clone(),
            cwd: self.cwd.clone(),
            permission_mode: self.permission_mode.clone(),
            sandbox_mode: self.sandbox_mode.clone(),
            interaction_mode: self.interaction_mode.clone(),
            initial_history: history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AgentPanelState {
        let options = ConnectOptions::new(ProviderKind::Codex, "gpt-5-codex", "/tmp/work");
        AgentPanelState::new("p1", &options)
    }

    #[test]
    fn test_phase_derivation() {
        let mut st = state();
        assert_eq!(st.phase(), PanelPhase::Disconnected);
        st.connected = true;
        assert_eq!(st.phase(), PanelPhase::Connected);
        st.streaming = true;
        assert_eq!(st.phase(), PanelPhase::Streaming);
        st.reconnecting = true;
        assert_eq!(st.phase(), PanelPhase::Reconnecting);
    }

    #[test]
    fn test_deltas_accumulate_into_one_message() {
        let mut st = state();
        st.begin_turn("hi");
        st.append_assistant_delta("Hel");
        st.append_assistant_delta("lo");
        st.finish_turn();
        assert_eq!(st.messages.len(), 2);
        assert_eq!(st.messages[1].text, "Hello");

        st.begin_turn("again");
        st.append_assistant_delta("second");
        assert_eq!(st.messages.len(), 4);
    }

    #[test]
    fn test_remove_pending_shifts_queued_edit() {
        let mut st = state();
        st.pending_inputs.extend(["a", "b", "c"].map(QueuedInput::from));
        st.draft_edit = DraftEdit::QueuedEdit(2);
        assert_eq!(st.remove_pending(0), Some(QueuedInput::from("a")));
        assert_eq!(st.draft_edit, DraftEdit::QueuedEdit(1));
        assert_eq!(st.remove_pending(1), Some(QueuedInput::from("c")));
        assert_eq!(st.draft_edit, DraftEdit::None);
        assert!(st.remove_pending(5).is_none());
    }

    #[test]
    fn test_injected_input_runs_first() {
        let mut st = state();
        st.pending_inputs.push_back("queued".into());
        st.injected_input = Some("urgent".into());
        assert!(st.is_busy());
        assert_eq!(st.next_input().map(|q| q.text).as_deref(), Some("urgent"));
        assert_eq!(st.next_input().map(|q| q.text).as_deref(), Some("queued"));
        assert!(st.next_input().is_none());
    }

    #[test]
    fn test_connect_options_skip_system_messages() {
        let mut st = state();
        st.begin_turn("one");
        st.append_assistant_delta("reply");
        st.finish_turn();
        st.push_error("boom");
        st.begin_turn("two");

        let opts = st.connect_options(2);
        assert_eq!(opts.provider, ProviderKind::Codex);
        let texts: Vec<_> = opts.initial_history.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["reply", "two"]);
    }

    #[test]
    fn test_retract_turn_removes_unsent_message() {
        let mut st = state();
        st.begin_turn("one");
        st.append_assistant_delta("reply");
        st.finish_turn();
        st.begin_turn("two");

        st.retract_turn("two");
        assert!(!st.streaming);
        let texts: Vec<_> = st.connect_options(10).initial_history.into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["one", "reply"]);

        // Only an unanswered trailing user message is retracted
        st.retract_turn("one");
        assert_eq!(st.messages.len(), 2);
    }
}
