// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-panel session supervisor.
//!
//! Owns the agent client for one panel and drives connect, retry, input
//! queueing, interrupt, stall detection, and reconnect. At most one client is
//! live per panel; each installed client gets a new generation number and
//! events from older generations are discarded.
//!
//! Panel state sits behind a synchronous mutex that is never held across an
//! await, so every transition is atomic with respect to the event forwarder.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agents::{
    AgentClient, AgentClientEvent, ClientFactory, ConnectInfo, ConnectOptions, EventSink,
    ProviderKind, SendOptions, StatusPhase,
};
use crate::config::SessionSettings;
use crate::error::{ConnectionError, SessionError};
use crate::telemetry::metrics::{count, TimedOperation};

use super::retry::RetryPolicy;
use super::state::{AgentPanelState, DraftEdit, PanelPhase, QueuedInput};

/// What happened to a submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SendOutcome {
    /// A turn was started with the message.
    Sent,
    /// The message waits in the queue at `position`.
    Queued { position: usize },
    /// A queued message was replaced in place.
    Replaced { index: usize },
}

struct ClientSlot {
    client: Arc<dyn AgentClient>,
    generation: u64,
    forwarder: JoinHandle<()>,
}

struct Inner {
    id: String,
    settings: SessionSettings,
    stall_timeout: Duration,
    factory: Arc<dyn ClientFactory>,
    state: Mutex<AgentPanelState>,
    client: Mutex<Option<ClientSlot>>,
    generation: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AgentClientEvent>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    connect_gate: tokio::sync::Mutex<()>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one panel's supervisor. Clones share the same session.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = guard(&self.inner.state);
        f.debug_struct("SessionSupervisor")
            .field("id", &self.inner.id)
            .field("provider", &st.provider)
            .field("phase", &st.phase())
            .field("queued", &st.pending_inputs.len())
            .finish()
    }
}

impl SessionSupervisor {
    pub fn new(
        state: AgentPanelState,
        settings: SessionSettings,
        stall_timeout: Duration,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: state.id.clone(),
                settings,
                stall_timeout,
                factory,
                state: Mutex::new(state),
                client: Mutex::new(None),
                generation: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                watchdog: Mutex::new(None),
                reconnect: Mutex::new(None),
                connect_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn provider(&self) -> ProviderKind {
        guard(&self.inner.state).provider
    }

    /// Copy of the current panel state.
    pub fn snapshot(&self) -> AgentPanelState {
        guard(&self.inner.state).clone()
    }

    pub fn phase(&self) -> PanelPhase {
        guard(&self.inner.state).phase()
    }

    /// Receive every event delivered to this panel, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        guard(&self.inner.subscribers).push(tx);
        rx
    }

    /// Connect with retry, replacing any existing client.
    ///
    /// The options' provider must match the panel's. On success, queued input
    /// starts draining.
    #[instrument(skip(self, options), fields(panel = %self.inner.id, model = %options.model))]
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectInfo, SessionError> {
        {
            let mut st = guard(&self.inner.state);
            if options.provider != st.provider {
                return Err(SessionError::ProviderMismatch {
                    panel_provider: st.provider,
                    model: options.model,
                    model_provider: options.provider,
                });
            }
            st.model = options.model.clone();
            st.cwd = options.cwd.clone();
            st.permission_mode = options.permission_mode.clone();
            st.sandbox_mode = options.sandbox_mode.clone();
            st.interaction_mode = options.interaction_mode.clone();
            // A turn on the client being replaced can no longer complete
            st.finish_turn();
        }
        self.inner.stop_watchdog();

        let info = self.inner.connect_with_retry(options).await?;
        if let Err(err) = self.inner.dispatch_next().await {
            warn!(error = %err, "Queued message failed to start after connect");
        }
        Ok(info)
    }

    /// Submit a message.
    ///
    /// Idle panels start a turn immediately; busy panels queue the message.
    /// Attachments are refused while busy. An active draft edit decides where
    /// the text lands in the queue.
    #[instrument(skip(self, text, image_paths), fields(panel = %self.inner.id))]
    pub async fn send_message(
        &self,
        text: &str,
        image_paths: Vec<PathBuf>,
    ) -> Result<SendOutcome, SessionError> {
        enum Next {
            Done(SendOutcome),
            Start,
            Reconnect,
            QueuedReconnect(usize),
        }

        let next = {
            let mut st = guard(&self.inner.state);
            let busy = st.is_busy();
            if busy && !image_paths.is_empty() {
                return Err(SessionError::QueueRejection);
            }

            match std::mem::take(&mut st.draft_edit) {
                DraftEdit::QueuedEdit(index) if index < st.pending_inputs.len() => {
                    st.pending_inputs[index].text = text.to_string();
                    Next::Done(SendOutcome::Replaced { index })
                }
                DraftEdit::RecalledEdit if busy => {
                    st.pending_inputs.push_front(QueuedInput::from(text));
                    Next::Done(SendOutcome::Queued { position: 0 })
                }
                _ if busy => {
                    st.pending_inputs.push_back(QueuedInput::from(text));
                    let position = st.pending_inputs.len() - 1;
                    if !st.connected && !st.connecting && !st.reconnecting {
                        st.reconnecting = true;
                        Next::QueuedReconnect(position)
                    } else {
                        Next::Done(SendOutcome::Queued { position })
                    }
                }
                _ if st.connected => {
                    st.begin_turn(text);
                    Next::Start
                }
                _ => {
                    // Idle but disconnected: the message rides the queue through the connect
                    st.pending_inputs
                        .push_back(QueuedInput::new(text, image_paths.clone()));
                    if st.connecting || st.reconnecting {
                        let position = st.pending_inputs.len() - 1;
                        Next::Done(SendOutcome::Queued { position })
                    } else {
                        st.reconnecting = true;
                        Next::Reconnect
                    }
                }
            }
        };

        match next {
            Next::Done(outcome) => {
                debug!(?outcome, "Message queued");
                Ok(outcome)
            }
            Next::Start => {
                self.inner
                    .start_turn(QueuedInput::new(text, image_paths))
                    .await?;
                Ok(SendOutcome::Sent)
            }
            Next::Reconnect => {
                self.inner.reconnect_and_drain(false).await?;
                Ok(SendOutcome::Sent)
            }
            Next::QueuedReconnect(position) => {
                self.inner.spawn_reconnect(false);
                Ok(SendOutcome::Queued { position })
            }
        }
    }

    /// Ask the agent to stop the current turn. Safe when idle.
    #[instrument(skip(self), fields(panel = %self.inner.id))]
    pub async fn interrupt(&self) {
        if let Some(client) = self.inner.current_client() {
            info!("Interrupting active turn");
            client.interrupt_active_turn().await;
        }
    }

    /// Drop the client. Queued input is kept for a later connect.
    #[instrument(skip(self), fields(panel = %self.inner.id))]
    pub async fn disconnect(&self) {
        self.inner.abort_reconnect();
        self.inner.stop_watchdog();
        let detached = self.inner.detach_client();
        {
            let mut st = guard(&self.inner.state);
            st.connected = false;
            st.connecting = false;
            st.reconnecting = false;
            st.finish_turn();
        }
        if let Some(client) = detached {
            client.close().await;
            self.inner.notify(&AgentClientEvent::status(
                StatusPhase::Closed,
                "Disconnected",
            ));
        }
    }

    /// Disconnect and drop all subscribers.
    pub async fn close(&self) {
        self.disconnect().await;
        guard(&self.inner.subscribers).clear();
    }

    /// Point the panel at another model of the same provider.
    ///
    /// Cross-provider switches are refused and leave the connection untouched.
    pub fn switch_model(&self, model: &str) -> Result<(), SessionError> {
        let mut st = guard(&self.inner.state);
        let model_provider = ProviderKind::for_model(model);
        if model_provider != st.provider {
            let err = SessionError::ProviderMismatch {
                panel_provider: st.provider,
                model: model.to_string(),
                model_provider,
            };
            st.push_system(err.to_string());
            return Err(err);
        }
        st.model = model.to_string();
        st.push_system(format!("Model set to {}", model));
        Ok(())
    }

    /// Takes effect on the next connect.
    pub fn set_permission_mode(&self, mode: Option<String>) {
        guard(&self.inner.state).permission_mode = mode;
    }

    /// Takes effect on the next connect.
    pub fn set_sandbox_mode(&self, mode: Option<String>) {
        guard(&self.inner.state).sandbox_mode = mode;
    }

    /// Takes effect on the next connect.
    pub fn set_interaction_mode(&self, mode: Option<String>) {
        guard(&self.inner.state).interaction_mode = mode;
    }

    /// Start correcting the last sent message; returns its text.
    pub fn recall_last_sent(&self) -> Result<String, SessionError> {
        let mut st = guard(&self.inner.state);
        let text = st
            .last_user_message()
            .map(str::to_string)
            .ok_or(SessionError::NothingToRecall)?;
        st.draft_edit = DraftEdit::RecalledEdit;
        Ok(text)
    }

    /// Start editing the queued message at `index`; returns its text.
    pub fn edit_queued(&self, index: usize) -> Result<String, SessionError> {
        let mut st = guard(&self.inner.state);
        let text = st
            .pending_inputs
            .get(index)
            .map(|queued| queued.text.clone())
            .ok_or(SessionError::InvalidQueueIndex(index))?;
        st.draft_edit = DraftEdit::QueuedEdit(index);
        Ok(text)
    }

    pub fn cancel_draft(&self) {
        guard(&self.inner.state).draft_edit = DraftEdit::None;
    }

    /// Drop a queued message without sending it.
    pub fn remove_queued(&self, index: usize) -> Result<String, SessionError> {
        guard(&self.inner.state)
            .remove_pending(index)
            .map(|queued| queued.text)
            .ok_or(SessionError::InvalidQueueIndex(index))
    }

    /// Pull one queued message out and run it next.
    ///
    /// If a turn is active it is interrupted and the message starts once that
    /// turn completes; otherwise it starts right away.
    #[instrument(skip(self), fields(panel = %self.inner.id))]
    pub async fn inject_queued(&self, index: usize) -> Result<(), SessionError> {
        let streaming = {
            let mut st = guard(&self.inner.state);
            let queued = st
                .remove_pending(index)
                .ok_or(SessionError::InvalidQueueIndex(index))?;
            if let Some(previous) = st.injected_input.replace(queued) {
                st.pending_inputs.push_front(previous);
            }
            st.streaming
        };

        if streaming {
            self.interrupt().await;
            Ok(())
        } else {
            self.inner.dispatch_next().await
        }
    }
}

impl Inner {
    fn current_client(&self) -> Option<Arc<dyn AgentClient>> {
        guard(&self.client).as_ref().map(|slot| Arc::clone(&slot.client))
    }

    fn notify(&self, event: &AgentClientEvent) {
        guard(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Create a client for a new generation and swap it in.
    fn install_client(self: &Arc<Self>) -> Arc<dyn AgentClient> {
        let provider = guard(&self.state).provider;
        let (sink, rx) = EventSink::channel();
        let client = self.factory.create(provider, sink);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let forwarder = tokio::spawn(forward_events(Arc::downgrade(self), rx, generation));

        let previous = guard(&self.client).replace(ClientSlot {
            client: Arc::clone(&client),
            generation,
            forwarder,
        });
        if let Some(old) = previous {
            retire(old);
        }
        client
    }

    /// Remove the current client so that its events are ignored.
    fn detach_client(&self) -> Option<Arc<dyn AgentClient>> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        guard(&self.client).take().map(|slot| {
            slot.forwarder.abort();
            slot.client
        })
    }

    async fn connect_with_retry(
        self: &Arc<Self>,
        options: ConnectOptions,
    ) -> Result<ConnectInfo, ConnectionError> {
        let _gate = self.connect_gate.lock().await;
        guard(&self.state).connecting = true;

        let timer = TimedOperation::start("session.connect");
        let policy = RetryPolicy::from(&self.settings);
        let this = Arc::clone(self);
        let result = policy
            .run(move |attempt| {
                let this = Arc::clone(&this);
                let options = options.clone();
                async move { this.connect_once(attempt, &options).await }
            })
            .await;
        timer.finish();

        let mut st = guard(&self.state);
        st.connecting = false;
        match &result {
            Ok(info) => {
                st.connected = true;
                st.thread_id = Some(info.thread_id.clone());
                st.touch();
                info!(panel = %self.id, thread_id = %info.thread_id, "Agent connected");
            }
            Err(err) => {
                st.connected = false;
                count("session.connect.failed");
                warn!(panel = %self.id, error = %err, "Agent connect failed");
                st.push_error(format!("Connection failed: {}", err));
            }
        }
        result
    }

    async fn connect_once(
        self: &Arc<Self>,
        attempt: u32,
        options: &ConnectOptions,
    ) -> Result<ConnectInfo, ConnectionError> {
        count("session.connect.attempt");
        debug!(panel = %self.id, attempt, "Connecting agent");
        let client = self.install_client();
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, client.connect(options)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectTimeout(timeout.as_millis() as u64)),
        }
    }

    /// Start a turn that the caller already recorded with `begin_turn`.
    ///
    /// On failure the message goes back to the front of the queue.
    async fn start_turn(self: &Arc<Self>, input: QueuedInput) -> Result<(), SessionError> {
        let Some(client) = self.current_client() else {
            self.requeue_failed_turn(input, &ConnectionError::NotConnected);
            return Err(ConnectionError::NotConnected.into());
        };

        self.start_watchdog();
        let timeout = self.settings.turn_start_timeout;
        let options = SendOptions {
            image_paths: input.image_paths.clone(),
        };
        let started = match tokio::time::timeout(timeout, client.send_user_message(&input.text, options)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::TurnTimeout(timeout.as_millis() as u64)),
        };

        if let Err(err) = started {
            count("session.turn.error");
            warn!(panel = %self.id, error = %err, "Turn failed to start");
            self.stop_watchdog();
            if let Some(client) = self.detach_client() {
                client.close().await;
            }
            self.requeue_failed_turn(input, &err);
            self.notify(&AgentClientEvent::status(StatusPhase::Error, err.to_string()));
            self.notify(&AgentClientEvent::AssistantCompleted);
            return Err(err.into());
        }
        Ok(())
    }

    fn requeue_failed_turn(&self, input: QueuedInput, err: &ConnectionError) {
        let mut st = guard(&self.state);
        st.retract_turn(&input.text);
        st.connected = false;
        st.pending_inputs.push_front(input);
        st.push_error(format!("Message not sent: {}", err));
    }

    /// Dispatch the next queued message if the panel is connected and idle.
    async fn dispatch_next(self: &Arc<Self>) -> Result<(), SessionError> {
        let input = {
            let mut st = guard(&self.state);
            if st.streaming || !st.connected {
                return Ok(());
            }
            let Some(input) = st.next_input() else {
                return Ok(());
            };
            st.begin_turn(&input.text);
            input
        };
        debug!(panel = %self.id, attachments = input.image_paths.len(), "Dispatching queued message");
        self.start_turn(input).await
    }

    /// Reconnect with the panel's current settings, then drain the queue.
    async fn reconnect_and_drain(self: &Arc<Self>, delay_first: bool) -> Result<(), SessionError> {
        if delay_first {
            tokio::time::sleep(self.settings.retry_delay).await;
        }
        let options = guard(&self.state).connect_options(self.settings.history_max_entries);
        info!(panel = %self.id, "Reconnecting agent");
        let result = self.connect_with_retry(options).await;
        guard(&self.state).reconnecting = false;
        result?;
        self.dispatch_next().await
    }

    fn spawn_reconnect(self: &Arc<Self>, delay_first: bool) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(err) = this.reconnect_and_drain(delay_first).await {
                warn!(panel = %this.id, error = %err, "Automatic reconnect failed");
            }
        });
        // An earlier reconnect may still be dispatching; let it finish
        guard(&self.reconnect).replace(handle);
    }

    fn abort_reconnect(&self) {
        if let Some(handle) = guard(&self.reconnect).take() {
            handle.abort();
        }
    }

    /// Apply one client event, then fan it out to subscribers.
    fn handle_event(self: &Arc<Self>, event: AgentClientEvent) {
        let mut reconnect = false;
        let mut drain = false;

        {
            let mut st = guard(&self.state);
            st.touch();
            match &event {
                AgentClientEvent::Status { phase, message } => match phase {
                    StatusPhase::Starting | StatusPhase::Ready => {
                        debug!(panel = %self.id, %message, "Agent status");
                    }
                    StatusPhase::Error | StatusPhase::Closed => {
                        st.connected = false;
                        st.finish_turn();
                        if *phase == StatusPhase::Error {
                            st.push_error(message.clone());
                        }
                        if (!st.pending_inputs.is_empty() || st.injected_input.is_some())
                            && !st.connecting
                            && !st.reconnecting
                        {
                            st.reconnecting = true;
                            reconnect = true;
                        }
                    }
                },
                AgentClientEvent::AssistantDelta { text } => st.append_assistant_delta(text),
                AgentClientEvent::AssistantCompleted => {
                    st.finish_turn();
                    drain = st.connected
                        && (!st.pending_inputs.is_empty() || st.injected_input.is_some());
                }
                AgentClientEvent::UsageUpdated { data } => st.usage = Some(data.clone()),
            }
        }

        if event == AgentClientEvent::AssistantCompleted || event.is_terminal_status() {
            self.stop_watchdog();
        }
        self.notify(&event);

        if reconnect {
            info!(panel = %self.id, "Client lost with queued input, scheduling reconnect");
            self.spawn_reconnect(true);
        } else if drain {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = this.dispatch_next().await {
                    warn!(panel = %this.id, error = %err, "Queued message failed to start");
                }
            });
        }
    }

    fn start_watchdog(self: &Arc<Self>) {
        let handle = tokio::spawn(watch_stall(Arc::downgrade(self), self.stall_timeout));
        if let Some(previous) = guard(&self.watchdog).replace(handle) {
            previous.abort();
        }
    }

    fn stop_watchdog(&self) {
        if let Some(handle) = guard(&self.watchdog).take() {
            handle.abort();
        }
    }

    /// No activity within the stall timeout while a turn was outstanding.
    async fn handle_stall(self: &Arc<Self>) {
        count("session.stall");
        let secs = self.stall_timeout.as_secs();
        warn!(panel = %self.id, timeout_secs = secs, "Agent turn stalled");

        let detached = self.detach_client();
        let reconnect = {
            let mut st = guard(&self.state);
            st.finish_turn();
            st.connected = false;
            st.push_error(format!("No response from the agent for {}s", secs));
            let queued = !st.pending_inputs.is_empty() || st.injected_input.is_some();
            if queued && !st.connecting && !st.reconnecting {
                st.reconnecting = true;
                true
            } else {
                false
            }
        };

        self.notify(&AgentClientEvent::status(
            StatusPhase::Error,
            format!("Agent stalled after {}s without activity", secs),
        ));
        self.notify(&AgentClientEvent::AssistantCompleted);

        if let Some(client) = detached {
            client.interrupt_active_turn().await;
            client.close().await;
        }
        if reconnect {
            self.spawn_reconnect(true);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(slot) = guard(&self.client).take() {
            retire(slot);
        }
        for handle in [guard(&self.watchdog).take(), guard(&self.reconnect).take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Stop forwarding a replaced client's events and close it in the background.
fn retire(slot: ClientSlot) {
    slot.forwarder.abort();
    debug!(generation = slot.generation, "Retiring agent client");
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        let client = slot.client;
        runtime.spawn(async move { client.close().await });
    }
}

async fn forward_events(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<AgentClientEvent>,
    generation: u64,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Dropping event from replaced client");
            break;
        }
        inner.handle_event(event);
    }
}

async fn watch_stall(inner: Weak<Inner>, timeout: Duration) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let st = guard(&inner.state);
            if !st.streaming {
                return;
            }
            st.last_activity + timeout
        };

        tokio::time::sleep_until(deadline).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let stalled = {
            let st = guard(&inner.state);
            st.streaming && Instant::now() >= st.last_activity + timeout
        };
        if stalled {
            // Detach from the handle first so the stall path cannot abort itself
            guard(&inner.watchdog).take();
            inner.handle_stall().await;
            return;
        }
    }
}
