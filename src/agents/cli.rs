// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-backed agent client.
//!
//! Each turn spawns the provider CLI once, streams its stdout as assistant
//! deltas, and always finishes with `AssistantCompleted`, preceded by an
//! error status when the process fails.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::{ResolvedConfig, SessionSettings};
use crate::error::ConnectionError;
use crate::telemetry::metrics::{count, TimedOperation};

use super::client::{AgentClient, EventSink};
use super::history::ConversationHistory;
use super::probe::{executable_for, read_version, resolve_executable};
use super::types::{
    AgentClientEvent, ConnectInfo, ConnectOptions, ProviderKind, SendOptions, StatusPhase,
};

/// Stderr is trimmed to this many trailing characters in crash reports.
const MAX_STDERR_CHARS: usize = 2_000;

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI escape regex")
});

static AUTH_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)not logged in|please log ?in|login required|run .*\blogin\b|unauthori[sz]ed|authentication (?:required|failed)|invalid api key|missing api key|\b401\b",
    )
    .expect("valid auth failure regex")
});

/// Remove terminal escape sequences from CLI output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Map a failed process exit to a connection error.
pub fn classify_failure(code: Option<i32>, stderr: &str) -> ConnectionError {
    let stderr = strip_ansi(stderr);
    if AUTH_FAILURE.is_match(&stderr) {
        let line = stderr
            .lines()
            .map(str::trim)
            .find(|l| AUTH_FAILURE.is_match(l))
            .unwrap_or("authentication required");
        return ConnectionError::AuthenticationRequired(line.to_string());
    }

    let total = stderr.chars().count();
    let tail: String = stderr.chars().skip(total.saturating_sub(MAX_STDERR_CHARS)).collect();
    ConnectionError::ProcessCrashed {
        code,
        stderr: tail.trim().to_string(),
    }
}

/// Settings for one CLI-backed client.
#[derive(Debug, Clone)]
pub struct CliAgentSettings {
    pub executable: String,
    pub extra_args: Vec<String>,
    pub connect_timeout: Duration,
    pub history_max_entries: usize,
    pub history_max_entry_chars: usize,
}

impl CliAgentSettings {
    pub fn from_config(config: &ResolvedConfig, provider: ProviderKind) -> Self {
        let extra_args = config
            .provider_override(provider.key())
            .map(|o| o.extra_args.clone())
            .unwrap_or_default();
        Self::with_session(
            executable_for(config, provider).unwrap_or_else(|| provider.key().to_string()),
            extra_args,
            &config.session,
        )
    }

    pub fn with_session(executable: String, extra_args: Vec<String>, session: &SessionSettings) -> Self {
        Self {
            executable,
            extra_args,
            connect_timeout: session.connect_timeout,
            history_max_entries: session.history_max_entries,
            history_max_entry_chars: session.history_max_entry_chars,
        }
    }
}

/// Claude keeps its own transcript keyed by session id.
#[derive(Debug, Clone)]
struct NativeSession {
    id: String,
    started: bool,
}

struct ActiveTurn {
    id: u64,
    cancel: oneshot::Sender<()>,
}

struct CliState {
    options: Option<ConnectOptions>,
    executable: Option<PathBuf>,
    history: ConversationHistory,
    native: Option<NativeSession>,
    active: Option<ActiveTurn>,
    next_turn: u64,
}

/// Agent client that drives a provider CLI, one process per turn.
pub struct CliAgentClient {
    provider: ProviderKind,
    settings: CliAgentSettings,
    sink: EventSink,
    state: Arc<Mutex<CliState>>,
}

impl CliAgentClient {
    pub fn new(provider: ProviderKind, settings: CliAgentSettings, sink: EventSink) -> Self {
        let history = ConversationHistory::new(
            settings.history_max_entries,
            settings.history_max_entry_chars,
        );
        Self {
            provider,
            settings,
            sink,
            state: Arc::new(Mutex::new(CliState {
                options: None,
                executable: None,
                history,
                native: None,
                active: None,
                next_turn: 0,
            })),
        }
    }

    /// Check if a turn process is currently running.
    pub async fn has_active_turn(&self) -> bool {
        self.state.lock().await.active.is_some()
    }
}

/// Build the argument list for one turn.
///
/// `native` carries the Claude session id and whether it already exists.
pub fn build_turn_args(
    provider: ProviderKind,
    options: &ConnectOptions,
    native: Option<(&str, bool)>,
    prompt: &str,
    send: &SendOptions,
    extra_args: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut prompt = prompt.to_string();

    match provider {
        ProviderKind::Codex => {
            args.extend(["exec".into(), "--skip-git-repo-check".into()]);
            args.extend(["--model".into(), options.model.clone()]);
            if let Some(sandbox) = &options.sandbox_mode {
                args.extend(["--sandbox".into(), sandbox.clone()]);
            }
            for image in &send.image_paths {
                args.extend(["--image".into(), image.display().to_string()]);
            }
        }
        ProviderKind::Claude => {
            args.extend(["-p".into(), "--output-format".into(), "text".into()]);
            args.extend(["--model".into(), options.model.clone()]);
            if let Some(mode) = &options.permission_mode {
                args.extend(["--permission-mode".into(), mode.clone()]);
            }
            match native {
                Some((id, true)) => args.extend(["--resume".into(), id.to_string()]),
                Some((id, false)) => args.extend(["--session-id".into(), id.to_string()]),
                None => {}
            }
            // Claude reads attachments referenced by path in the prompt
            for image in &send.image_paths {
                prompt.push_str(&format!("\n@{}", image.display()));
            }
        }
        ProviderKind::Gemini | ProviderKind::Qwen => {
            args.extend(["--model".into(), options.model.clone()]);
            if options.permission_mode.as_deref() == Some("yolo") {
                args.push("--yolo".into());
            }
            if options.sandbox_mode.as_deref().is_some_and(|s| s != "off") {
                args.push("--sandbox".into());
            }
            for image in &send.image_paths {
                prompt.push_str(&format!("\n@{}", image.display()));
            }
        }
        ProviderKind::OpenAiCompatible => {}
    }

    args.extend(extra_args.iter().cloned());
    if matches!(provider, ProviderKind::Gemini | ProviderKind::Qwen) {
        args.push("--prompt".into());
    }
    args.push(prompt);
    args
}

#[async_trait]
impl AgentClient for CliAgentClient {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    #[instrument(skip(self, options), fields(provider = %self.provider, model = %options.model))]
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectInfo, ConnectionError> {
        self.sink.emit(AgentClientEvent::status(
            StatusPhase::Starting,
            format!("Starting {}", self.provider),
        ));

        let path = resolve_executable(&self.settings.executable)
            .ok_or_else(|| ConnectionError::ExecutableNotFound(self.settings.executable.clone()))?;
        let version = read_version(&path, self.settings.connect_timeout).await?;
        debug!(executable = %path.display(), %version, "Agent executable ready");

        let thread_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().await;
            state.history = ConversationHistory::seeded(
                self.settings.history_max_entries,
                self.settings.history_max_entry_chars,
                &options.initial_history,
            );
            state.native = (self.provider == ProviderKind::Claude).then(|| NativeSession {
                id: thread_id.clone(),
                started: false,
            });
            state.executable = Some(path);
            state.options = Some(options.clone());
        }

        self.sink.emit(AgentClientEvent::status(
            StatusPhase::Ready,
            format!("{} ready ({})", self.provider, version),
        ));
        Ok(ConnectInfo { thread_id })
    }

    #[instrument(skip(self, text, options), fields(provider = %self.provider))]
    async fn send_user_message(&self, text: &str, options: SendOptions) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        let (connect, executable) = match (&state.options, &state.executable) {
            (Some(o), Some(e)) => (o.clone(), e.clone()),
            _ => return Err(ConnectionError::NotConnected),
        };

        if let Some(previous) = state.active.take() {
            debug!(turn = previous.id, "Replacing active turn");
            let _ = previous.cancel.send(());
        }

        state.history.push_user(text);
        let native = state.native.as_ref().map(|n| (n.id.as_str(), n.started));
        let prompt = if native.is_some() {
            text.to_string()
        } else {
            state.history.transcript()
        };
        let args = build_turn_args(
            self.provider,
            &connect,
            native,
            &prompt,
            &options,
            &self.settings.extra_args,
        );

        let mut cmd = Command::new(&executable);
        cmd.args(&args)
            .current_dir(&connect.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn()?;

        if let Some(native) = state.native.as_mut() {
            native.started = true;
        }

        let turn_id = state.next_turn;
        state.next_turn += 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        state.active = Some(ActiveTurn {
            id: turn_id,
            cancel: cancel_tx,
        });
        drop(state);

        info!(turn = turn_id, pid = ?child.id(), "Agent turn started");
        tokio::spawn(run_turn(
            child,
            self.sink.clone(),
            Arc::clone(&self.state),
            cancel_rx,
            turn_id,
        ));
        Ok(())
    }

    async fn interrupt_active_turn(&self) {
        if let Some(active) = self.state.lock().await.active.take() {
            debug!(turn = active.id, "Interrupting agent turn");
            let _ = active.cancel.send(());
        }
    }

    async fn close(&self) {
        let was_connected = {
            let mut state = self.state.lock().await;
            if let Some(active) = state.active.take() {
                let _ = active.cancel.send(());
            }
            state.native = None;
            state.executable = None;
            state.history.clear();
            state.options.take().is_some()
        };
        if was_connected {
            self.sink
                .emit(AgentClientEvent::status(StatusPhase::Closed, "Session closed"));
        }
    }
}

async fn run_turn(
    mut child: Child,
    sink: EventSink,
    state: Arc<Mutex<CliState>>,
    mut cancel: oneshot::Receiver<()>,
    turn_id: u64,
) {
    let timer = TimedOperation::start("agent.turn");

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let mut reply = String::new();
    let mut cancelled = false;

    if let Some(stdout) = child.stdout.take() {
        // Raw lines: agents may print bytes that are not valid UTF-8
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        loop {
            line.clear();
            tokio::select! {
                _ = &mut cancel => {
                    cancelled = true;
                    break;
                }
                read = reader.read_until(b'\n', &mut line) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        let mut clean = strip_ansi(text.trim_end_matches(&['\r', '\n'][..]));
                        clean.push('\n');
                        reply.push_str(&clean);
                        sink.emit(AgentClientEvent::delta(clean));
                    }
                    Err(e) => {
                        warn!(turn = turn_id, error = %e, "Failed reading agent output");
                        break;
                    }
                }
            }
        }
    }

    let status = if cancelled {
        let _ = child.start_kill();
        child.wait().await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut cancel => {
                cancelled = true;
                let _ = child.start_kill();
                child.wait().await
            }
        }
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if cancelled {
        info!(turn = turn_id, "Agent turn interrupted");
    } else {
        match status {
            Ok(status) if status.success() => {
                state.lock().await.history.push_assistant(&reply);
            }
            Ok(status) => {
                let err = classify_failure(status.code(), &stderr);
                count("session.turn.error");
                warn!(turn = turn_id, code = ?status.code(), error = %err, "Agent process failed");
                sink.emit(AgentClientEvent::status(StatusPhase::Error, err.to_string()));
            }
            Err(e) => {
                count("session.turn.error");
                warn!(turn = turn_id, error = %e, "Agent process wait failed");
                sink.emit(AgentClientEvent::status(
                    StatusPhase::Error,
                    ConnectionError::from(e).to_string(),
                ));
            }
        }
    }

    {
        let mut state = state.lock().await;
        if state.active.as_ref().is_some_and(|a| a.id == turn_id) {
            state.active = None;
        }
    }

    sink.emit(AgentClientEvent::AssistantCompleted);
    timer.finish();
}
