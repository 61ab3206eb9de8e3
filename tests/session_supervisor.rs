// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session supervisor behaviour against a scripted agent client.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use agentdesk::agents::{
    AgentClient, AgentClientEvent, ClientFactory, ConnectInfo, ConnectOptions, EventSink,
    ProviderKind, SendOptions, StatusPhase,
};
use agentdesk::config::SessionSettings;
use agentdesk::error::{ConnectionError, SessionError};
use agentdesk::session::{
    AgentPanelState, DraftEdit, MessageRole, PanelPhase, QueuedInput, SendOutcome, SessionSupervisor,
};

#[derive(Default)]
struct Script {
    connect_failures: AtomicU32,
    send_failures: AtomicU32,
    interrupts: AtomicU32,
    connect_times: Mutex<Vec<Instant>>,
    sent: Mutex<Vec<String>>,
    attachments: Mutex<Vec<Vec<PathBuf>>>,
    histories: Mutex<Vec<Vec<String>>>,
    sinks: Mutex<Vec<EventSink>>,
}

impl Script {
    fn connects(&self) -> usize {
        self.connect_times.lock().unwrap().len()
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn attachments(&self) -> Vec<Vec<PathBuf>> {
        self.attachments.lock().unwrap().clone()
    }

    /// Emit on the most recently created client's stream.
    fn emit(&self, event: AgentClientEvent) {
        let sinks = self.sinks.lock().unwrap();
        sinks.last().expect("a client was created").emit(event);
    }

    fn complete_turn(&self) {
        self.emit(AgentClientEvent::delta("done"));
        self.emit(AgentClientEvent::AssistantCompleted);
    }
}

struct ScriptedClient {
    script: Arc<Script>,
    sink: EventSink,
}

#[async_trait]
impl AgentClient for ScriptedClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectInfo, ConnectionError> {
        self.script.histories.lock().unwrap().push(
            options
                .initial_history
                .iter()
                .map(|entry| entry.text.clone())
                .collect(),
        );
        let attempt = {
            let mut times = self.script.connect_times.lock().unwrap();
            times.push(Instant::now());
            times.len()
        };
        let failures = &self.script.connect_failures;
        if failures.load(Ordering::SeqCst) > 0 {
            failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::Transport("connection refused".to_string()));
        }
        self.sink
            .emit(AgentClientEvent::status(StatusPhase::Ready, "ready"));
        Ok(ConnectInfo {
            thread_id: format!("thread-{}", attempt),
        })
    }

    async fn send_user_message(&self, text: &str, options: SendOptions) -> Result<(), ConnectionError> {
        self.script.sent.lock().unwrap().push(text.to_string());
        self.script.attachments.lock().unwrap().push(options.image_paths);
        let failures = &self.script.send_failures;
        if failures.load(Ordering::SeqCst) > 0 {
            failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::ProcessCrashed {
                code: Some(1),
                stderr: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn interrupt_active_turn(&self) {
        self.script.interrupts.fetch_add(1, Ordering::SeqCst);
        self.sink.emit(AgentClientEvent::AssistantCompleted);
    }

    async fn close(&self) {}
}

struct ScriptedFactory(Arc<Script>);

impl ClientFactory for ScriptedFactory {
    fn create(&self, _provider: ProviderKind, sink: EventSink) -> Arc<dyn AgentClient> {
        self.0.sinks.lock().unwrap().push(sink.clone());
        Arc::new(ScriptedClient {
            script: Arc::clone(&self.0),
            sink,
        })
    }
}

fn options() -> ConnectOptions {
    ConnectOptions::new(ProviderKind::Codex, "gpt-5-codex", "/tmp/work")
}

fn supervisor(script: &Arc<Script>, stall_timeout: Duration) -> SessionSupervisor {
    SessionSupervisor::new(
        AgentPanelState::new("p1", &options()),
        SessionSettings::default(),
        stall_timeout,
        Arc::new(ScriptedFactory(Arc::clone(script))),
    )
}

/// Let spawned tasks run until the runtime goes idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn connected(script: &Arc<Script>) -> SessionSupervisor {
    let sup = supervisor(script, Duration::from_secs(300));
    sup.connect(options()).await.unwrap();
    settle().await;
    sup
}

#[tokio::test(start_paused = true)]
async fn test_busy_panel_queues_in_fifo_order() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;

    assert_eq!(sup.send_message("m1", vec![]).await.unwrap(), SendOutcome::Sent);
    assert_eq!(
        sup.send_message("m2", vec![]).await.unwrap(),
        SendOutcome::Queued { position: 0 }
    );
    assert_eq!(
        sup.send_message("m3", vec![]).await.unwrap(),
        SendOutcome::Queued { position: 1 }
    );
    assert_eq!(sup.phase(), PanelPhase::Streaming);

    script.complete_turn();
    settle().await;
    assert_eq!(script.sent(), vec!["m1", "m2"]);

    script.complete_turn();
    settle().await;
    assert_eq!(script.sent(), vec!["m1", "m2", "m3"]);

    script.complete_turn();
    settle().await;
    assert_eq!(sup.phase(), PanelPhase::Connected);
    assert!(sup.snapshot().pending_inputs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inject_interrupts_and_runs_next() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;

    sup.send_message("m0", vec![]).await.unwrap();
    for text in ["m1", "m2", "m3"] {
        sup.send_message(text, vec![]).await.unwrap();
    }

    sup.inject_queued(1).await.unwrap();
    let pending: Vec<String> = sup.snapshot().pending_inputs.into_iter().map(|q| q.text).collect();
    assert_eq!(pending, vec!["m1", "m3"]);
    assert_eq!(script.interrupts.load(Ordering::SeqCst), 1);

    settle().await;
    assert_eq!(script.sent(), vec!["m0", "m2"]);

    script.complete_turn();
    settle().await;
    script.complete_turn();
    settle().await;
    assert_eq!(script.sent(), vec!["m0", "m2", "m1", "m3"]);
}

#[tokio::test(start_paused = true)]
async fn test_inject_rejects_bad_index() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;
    assert_eq!(
        sup.inject_queued(0).await.unwrap_err(),
        SessionError::InvalidQueueIndex(0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_queued_edit_replaces_in_place() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;

    sup.send_message("m0", vec![]).await.unwrap();
    sup.send_message("m1", vec![]).await.unwrap();
    sup.send_message("m2", vec![]).await.unwrap();

    assert_eq!(sup.edit_queued(0).unwrap(), "m1");
    assert_eq!(sup.snapshot().draft_edit, DraftEdit::QueuedEdit(0));
    assert_eq!(
        sup.send_message("m1 edited", vec![]).await.unwrap(),
        SendOutcome::Replaced { index: 0 }
    );
    assert_eq!(sup.snapshot().draft_edit, DraftEdit::None);

    script.complete_turn();
    settle().await;
    assert_eq!(script.sent(), vec!["m0", "m1 edited"]);
}

#[tokio::test(start_paused = true)]
async fn test_recalled_edit_goes_to_front() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;

    sup.send_message("m0", vec![]).await.unwrap();
    sup.send_message("m1", vec![]).await.unwrap();

    assert_eq!(sup.recall_last_sent().unwrap(), "m0");
    assert_eq!(
        sup.send_message("m0 corrected", vec![]).await.unwrap(),
        SendOutcome::Queued { position: 0 }
    );
    let pending: Vec<String> = sup.snapshot().pending_inputs.into_iter().map(|q| q.text).collect();
    assert_eq!(pending, vec!["m0 corrected", "m1"]);
}

#[tokio::test(start_paused = true)]
async fn test_recall_on_empty_transcript() {
    let script = Arc::new(Script::default());
    let sup = supervisor(&script, Duration::from_secs(300));
    assert_eq!(sup.recall_last_sent().unwrap_err(), SessionError::NothingToRecall);
}

#[tokio::test(start_paused = true)]
async fn test_attachments_rejected_while_busy() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;

    assert_eq!(
        sup.send_message("look", vec!["shot.png".into()]).await.unwrap(),
        SendOutcome::Sent
    );
    assert_eq!(
        sup.send_message("again", vec!["shot.png".into()]).await.unwrap_err(),
        SessionError::QueueRejection
    );
    assert!(sup.snapshot().pending_inputs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_with_delay() {
    let script = Arc::new(Script::default());
    script.connect_failures.store(2, Ordering::SeqCst);
    let sup = supervisor(&script, Duration::from_secs(300));

    let info = sup.connect(options()).await.unwrap();
    assert_eq!(info.thread_id, "thread-3");
    assert_eq!(sup.phase(), PanelPhase::Connected);

    let times = script.connect_times.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(2));
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_three_attempts() {
    let script = Arc::new(Script::default());
    script.connect_failures.store(10, Ordering::SeqCst);
    let sup = supervisor(&script, Duration::from_secs(300));

    let err = sup.connect(options()).await.unwrap_err();
    assert!(matches!(err, SessionError::Connection(ConnectionError::Transport(_))));
    assert_eq!(script.connects(), 3);

    let state = sup.snapshot();
    assert_eq!(state.phase(), PanelPhase::Disconnected);
    assert!(state.messages.iter().any(|m| m.is_error));
}

#[tokio::test(start_paused = true)]
async fn test_panel_is_locked_to_its_provider() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;

    let err = sup.switch_model("gemini-2.5-pro").unwrap_err();
    assert!(matches!(
        err,
        SessionError::ProviderMismatch {
            panel_provider: ProviderKind::Codex,
            model_provider: ProviderKind::Gemini,
            ..
        }
    ));
    assert_eq!(sup.snapshot().model, "gpt-5-codex");
    assert_eq!(sup.phase(), PanelPhase::Connected);

    sup.switch_model("o3").unwrap();
    assert_eq!(sup.snapshot().model, "o3");

    let other = ConnectOptions::new(ProviderKind::Claude, "claude-sonnet-4-5", "/tmp/work");
    assert!(sup.connect(other).await.is_err());
    assert_eq!(script.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_with_queued_input_reconnects() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;
    let mut events = sup.subscribe();

    sup.send_message("m0", vec![]).await.unwrap();
    sup.send_message("m1", vec![]).await.unwrap();

    script.emit(AgentClientEvent::status(StatusPhase::Error, "process exited"));
    settle().await;
    assert_eq!(sup.phase(), PanelPhase::Reconnecting);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(script.connects(), 2);
    assert_eq!(script.sent(), vec!["m0", "m1"]);
    assert_eq!(sup.phase(), PanelPhase::Streaming);

    let first = events.recv().await.unwrap();
    assert_eq!(first, AgentClientEvent::status(StatusPhase::Error, "process exited"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_turn_start_requeues_message() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;
    script.send_failures.store(1, Ordering::SeqCst);

    let err = sup.send_message("m0", vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Connection(ConnectionError::ProcessCrashed { .. })
    ));
    let state = sup.snapshot();
    assert!(!state.connected);
    assert_eq!(state.pending_inputs.front(), Some(&QueuedInput::from("m0")));
    let user_messages = state
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .count();
    assert_eq!(user_messages, 0);

    assert_eq!(
        sup.send_message("m1", vec![]).await.unwrap(),
        SendOutcome::Queued { position: 1 }
    );
    settle().await;
    assert_eq!(script.connects(), 2);
    assert_eq!(script.sent(), vec!["m0", "m0"]);
    // The replayed message is sent once, not also seeded as prior history
    let histories = script.histories.lock().unwrap().clone();
    assert!(histories[1].is_empty());
    let user_messages: Vec<_> = sup
        .snapshot()
        .messages
        .into_iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.text)
        .collect();
    assert_eq!(user_messages, vec!["m0"]);

    script.complete_turn();
    settle().await;
    assert_eq!(script.sent(), vec!["m0", "m0", "m1"]);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_connects_first() {
    let script = Arc::new(Script::default());
    let sup = supervisor(&script, Duration::from_secs(300));

    assert_eq!(sup.send_message("hello", vec![]).await.unwrap(), SendOutcome::Sent);
    assert_eq!(script.connects(), 1);
    assert_eq!(script.sent(), vec!["hello"]);
}

#[tokio::test(start_paused = true)]
async fn test_attachments_survive_connect_on_send() {
    let script = Arc::new(Script::default());
    let sup = supervisor(&script, Duration::from_secs(300));

    let outcome = sup
        .send_message("look at this", vec!["/tmp/shot.png".into()])
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(script.sent(), vec!["look at this"]);
    assert_eq!(script.attachments(), vec![vec![PathBuf::from("/tmp/shot.png")]]);
}

#[tokio::test(start_paused = true)]
async fn test_attachments_survive_failed_turn_start() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;
    script.send_failures.store(1, Ordering::SeqCst);

    sup.send_message("diagram", vec!["/tmp/arch.png".into()])
        .await
        .unwrap_err();
    let queued = sup.snapshot().pending_inputs.front().cloned().unwrap();
    assert_eq!(queued.image_paths, vec![PathBuf::from("/tmp/arch.png")]);

    sup.connect(options()).await.unwrap();
    assert_eq!(script.sent(), vec!["diagram", "diagram"]);
    assert_eq!(
        script.attachments(),
        vec![
            vec![PathBuf::from("/tmp/arch.png")],
            vec![PathBuf::from("/tmp/arch.png")]
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stall_fails_turn_and_recovers_queue() {
    let script = Arc::new(Script::default());
    let sup = supervisor(&script, Duration::from_secs(5));
    sup.connect(options()).await.unwrap();
    settle().await;
    let mut events = sup.subscribe();

    sup.send_message("m0", vec![]).await.unwrap();
    sup.send_message("m1", vec![]).await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    let state = sup.snapshot();
    assert!(!state.streaming);
    assert!(state.messages.iter().any(|m| m.is_error));
    assert!(events.recv().await.unwrap().is_terminal_status());
    assert_eq!(events.recv().await.unwrap(), AgentClientEvent::AssistantCompleted);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(script.connects(), 2);
    assert_eq!(script.sent(), vec!["m0", "m1"]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_queue() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;
    let mut events = sup.subscribe();

    sup.send_message("m0", vec![]).await.unwrap();
    sup.send_message("m1", vec![]).await.unwrap();
    sup.disconnect().await;

    let state = sup.snapshot();
    assert_eq!(state.phase(), PanelPhase::Disconnected);
    assert_eq!(state.pending_inputs.len(), 1);
    assert!(events.recv().await.unwrap().is_terminal_status());

    // Late events from the dropped client are ignored
    script.complete_turn();
    settle().await;
    assert_eq!(script.sent(), vec!["m0"]);
}

#[tokio::test(start_paused = true)]
async fn test_remove_queued() {
    let script = Arc::new(Script::default());
    let sup = connected(&script).await;
    sup.send_message("m0", vec![]).await.unwrap();
    sup.send_message("m1", vec![]).await.unwrap();

    assert_eq!(sup.remove_queued(0).unwrap(), "m1");
    assert_eq!(sup.remove_queued(0).unwrap_err(), SessionError::InvalidQueueIndex(0));
}
