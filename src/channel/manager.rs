//! Websocket channel manager for the live session event stream.
//!
//! A [`ChannelManager`] owns at most one logical channel at a time, keyed by
//! session id. The physical websocket lives inside a background worker task
//! that reconnects with exponential backoff after transport loss, so
//! consumers keep their subscriptions across reconnects and only observe the
//! `live/disconnected` status flip. Steady-state faults (lost transport,
//! dropped sends, malformed frames, panicking handlers) are absorbed and
//! reported to `tracing`; only the initial connect failure is surfaced to the
//! caller.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::channel::proto::{EventType, InboundEnvelope, OutboundEnvelope};

/// Identifier of a discussion session, as assigned by the session API.
pub type SessionId = u64;

/// Default websocket endpoint for a locally running session service.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000";

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Connection lifecycle states observable through [`ChannelManager::status`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelStatus {
    /// No channel has been opened yet.
    Idle,
    /// Initial transport establishment is in flight.
    Connecting,
    /// The transport is open and dispatch is live.
    Connected,
    /// A replacement transport attempt is in flight after a loss.
    Reconnecting,
    /// No live transport: explicit disconnect, initial failure, or retry
    /// budget exhausted. A fresh `connect` call starts over.
    Disconnected,
}

/// Tunables for a channel manager instance.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Base websocket URL; the per-session path is appended to it.
    pub endpoint: String,
    /// Delay before the first reconnect attempt; doubles per consecutive loss.
    pub base_delay: Duration,
    /// Number of reconnect attempts before the channel settles disconnected.
    pub max_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Errors surfaced by channel operations.
///
/// Post-establishment faults never appear here; they feed the reconnect state
/// machine or the observability sink instead.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Initial transport establishment failed.
    #[error("connection failed: {0}")]
    Connection(String),
}

type Handler = Box<dyn FnMut(&Value) + Send>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    handler: Arc<Mutex<Handler>>,
}

#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    entries: HashMap<EventType, Vec<HandlerEntry>>,
}

impl HandlerRegistry {
    fn insert(&mut self, event: EventType, handler: Handler) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.entry(event).or_default().push(HandlerEntry {
            id,
            handler: Arc::new(Mutex::new(handler)),
        });
        id
    }

    fn remove(&mut self, event: EventType, id: u64) {
        if let Some(entries) = self.entries.get_mut(&event) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                self.entries.remove(&event);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn handlers_for(&self, event: EventType) -> Vec<HandlerEntry> {
        self.entries.get(&event).cloned().unwrap_or_default()
    }
}

/// Token returned by [`ChannelManager::on`]; removes exactly the registration
/// it was issued for, even when the same closure shape is registered several
/// times or under several event types.
pub struct Subscription {
    registry: Weak<Mutex<HandlerRegistry>>,
    event: EventType,
    id: u64,
}

impl Subscription {
    /// Removes the registration this token stands for. Dropping the token
    /// without calling this leaves the handler registered.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(self.event, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

struct Shared {
    registry: Arc<Mutex<HandlerRegistry>>,
    connected: AtomicBool,
    generation: AtomicU64,
    dropped_sends: AtomicU64,
    status_tx: watch::Sender<ChannelStatus>,
}

impl Shared {
    fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_replace(status);
    }
}

struct ActiveChannel {
    session_id: SessionId,
    generation: u64,
    outbound_tx: mpsc::UnboundedSender<OutboundEnvelope>,
    worker: JoinHandle<()>,
}

/// Manager of one logical session channel.
///
/// Cloning yields another handle to the same channel; independent channels
/// (e.g. in tests, or a UI that views several sessions at once) each need
/// their own manager instance.
#[derive(Clone)]
pub struct ChannelManager {
    config: ChannelConfig,
    shared: Arc<Shared>,
    active: Arc<Mutex<Option<ActiveChannel>>>,
}

impl ChannelManager {
    /// Creates a manager with default endpoint and backoff settings.
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    /// Creates a manager with explicit settings.
    pub fn with_config(config: ChannelConfig) -> Self {
        let (status_tx, _status_rx) = watch::channel(ChannelStatus::Idle);
        Self {
            config,
            shared: Arc::new(Shared {
                registry: Arc::new(Mutex::new(HandlerRegistry::default())),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                dropped_sends: AtomicU64::new(0),
                status_tx,
            }),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Overrides the websocket endpoint, e.g. `wss://sessions.example/live`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into().trim().trim_end_matches('/').to_string();
        self
    }

    /// Overrides the reconnect backoff schedule.
    pub fn with_backoff(mut self, base_delay: Duration, max_attempts: u32) -> Self {
        self.config.base_delay = base_delay;
        self.config.max_attempts = max_attempts;
        self
    }

    /// Opens the channel for `session_id`, resolving once the transport is
    /// open for the first time.
    ///
    /// Calling this while a channel is live for a different session first
    /// performs an implicit [`disconnect`](Self::disconnect) of that channel;
    /// calling it again for the same live session resolves immediately
    /// without reopening anything.
    pub async fn connect(&self, session_id: SessionId) -> Result<(), ChannelError> {
        let (generation, ready_rx) = {
            let mut active = lock(&self.active);
            if let Some(current) = active.as_ref() {
                if current.session_id == session_id && !current.worker.is_finished() {
                    return Ok(());
                }
            }
            if let Some(old) = active.take() {
                // Replacing a channel for another session is a full implicit
                // disconnect; restarting the same session keeps subscriptions.
                self.teardown(old, session_id);
            }

            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let url = format!("{}/ws/sessions/{session_id}", self.config.endpoint);

            let worker = tokio::spawn(channel_worker(
                WorkerContext {
                    shared: Arc::clone(&self.shared),
                    generation,
                    url,
                    base_delay: self.config.base_delay,
                    max_attempts: self.config.max_attempts,
                },
                outbound_rx,
                ready_tx,
            ));
            *active = Some(ActiveChannel {
                session_id,
                generation,
                outbound_tx,
                worker,
            });
            (generation, ready_rx)
        };

        let result = match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ChannelError::Connection(
                "channel worker stopped before initial open".to_string(),
            )),
        };

        if result.is_err() {
            let mut active = lock(&self.active);
            if active.as_ref().map(|a| a.generation) == Some(generation) {
                active.take();
            }
        }
        result
    }

    /// Closes the channel if one is open: aborts the worker (cancelling any
    /// pending reconnect timer), clears every handler registration, and
    /// resets reconnect state. Idempotent.
    pub fn disconnect(&self) {
        let mut active = lock(&self.active);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = active.take() {
            old.worker.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        lock(&self.shared.registry).clear();
        self.shared.set_status(ChannelStatus::Disconnected);
    }

    /// Serializes `{type, data}` and writes it iff the transport is currently
    /// open. Otherwise the envelope is dropped and the drop reported — sends
    /// may legitimately race a reconnect, so this is never an error.
    pub fn send(&self, event: EventType, data: Value) {
        let envelope = OutboundEnvelope::new(event, data);
        let delivered = {
            let active = lock(&self.active);
            self.is_connected()
                && active
                    .as_ref()
                    .is_some_and(|a| a.outbound_tx.send(envelope).is_ok())
        };
        if !delivered {
            self.shared.dropped_sends.fetch_add(1, Ordering::SeqCst);
            warn!(event = "send_dropped_while_closed", kind = ?event);
        }
    }

    /// Registers `handler` for inbound envelopes of kind `event`. Handlers
    /// for one kind run in registration order, inline with frame delivery,
    /// and should stay short.
    pub fn on<F>(&self, event: EventType, handler: F) -> Subscription
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let id = lock(&self.shared.registry).insert(event, Box::new(handler));
        Subscription {
            registry: Arc::downgrade(&self.shared.registry),
            event,
            id,
        }
    }

    /// True iff a transport exists and is in the open state.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Watch receiver for the live/disconnected indicator.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Number of sends dropped because no transport was open.
    pub fn dropped_sends(&self) -> u64 {
        self.shared.dropped_sends.load(Ordering::SeqCst)
    }

    fn teardown(&self, old: ActiveChannel, next_session_id: SessionId) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        old.worker.abort();
        self.shared.connected.store(false, Ordering::SeqCst);
        if old.session_id != next_session_id {
            lock(&self.shared.registry).clear();
        }
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempts))
}

struct WorkerContext {
    shared: Arc<Shared>,
    generation: u64,
    url: String,
    base_delay: Duration,
    max_attempts: u32,
}

impl WorkerContext {
    fn stale(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) != self.generation
    }
}

enum TransportOutcome {
    Lost,
    Shutdown,
}

async fn channel_worker(
    ctx: WorkerContext,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundEnvelope>,
    ready_tx: oneshot::Sender<Result<(), ChannelError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut attempts: u32 = 0;

    loop {
        ctx.shared.set_status(if ready_tx.is_some() {
            ChannelStatus::Connecting
        } else {
            ChannelStatus::Reconnecting
        });

        match connect_async(ctx.url.as_str()).await {
            Ok((socket, _)) => {
                attempts = 0;
                ctx.shared.connected.store(true, Ordering::SeqCst);
                ctx.shared.set_status(ChannelStatus::Connected);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }

                let outcome = drive_transport(socket, &ctx, &mut outbound_rx).await;
                ctx.shared.connected.store(false, Ordering::SeqCst);
                ctx.shared.set_status(ChannelStatus::Disconnected);
                if matches!(outcome, TransportOutcome::Shutdown) {
                    return;
                }

                // A lost transport voids anything still queued; delivery is
                // never deferred across a reconnect boundary.
                let mut voided = 0usize;
                while outbound_rx.try_recv().is_ok() {
                    voided += 1;
                }
                if voided > 0 {
                    ctx.shared
                        .dropped_sends
                        .fetch_add(voided as u64, Ordering::SeqCst);
                    debug!(event = "queued_sends_voided", count = voided);
                }
                debug!(event = "transport_lost", url = %ctx.url);
            }
            Err(err) => {
                if let Some(tx) = ready_tx.take() {
                    ctx.shared.set_status(ChannelStatus::Disconnected);
                    let _ = tx.send(Err(ChannelError::Connection(err.to_string())));
                    return;
                }
                debug!(event = "reconnect_attempt_failed", error = %err);
            }
        }

        if ctx.stale() {
            return;
        }
        if attempts >= ctx.max_attempts {
            warn!(event = "reconnect_exhausted", attempts, url = %ctx.url);
            ctx.shared.set_status(ChannelStatus::Disconnected);
            return;
        }

        let delay = backoff_delay(ctx.base_delay, attempts);
        attempts += 1;
        debug!(
            event = "reconnect_scheduled",
            attempt = attempts,
            delay_ms = delay.as_millis() as u64
        );
        tokio::time::sleep(delay).await;
        if ctx.stale() {
            return;
        }
    }
}

async fn drive_transport(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ctx: &WorkerContext,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEnvelope>,
) -> TransportOutcome {
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(envelope) => {
                        let text = match envelope.to_text() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(event = "send_encode_failed", error = %err);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            return TransportOutcome::Lost;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return TransportOutcome::Shutdown;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if ctx.stale() {
                            return TransportOutcome::Shutdown;
                        }
                        match InboundEnvelope::from_text(&text) {
                            Ok(envelope) => dispatch_envelope(&ctx.shared, &envelope),
                            Err(err) => {
                                warn!(event = "malformed_frame_dropped", error = %err);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return TransportOutcome::Lost;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return TransportOutcome::Lost,
                    Some(Ok(other)) => {
                        warn!(event = "non_text_frame_dropped", len = other.len());
                    }
                    Some(Err(err)) => {
                        warn!(event = "transport_error", error = %err);
                        return TransportOutcome::Lost;
                    }
                    None => return TransportOutcome::Lost,
                }
            }
        }
    }
}

/// Invokes every handler registered for the envelope's kind, in registration
/// order. A panicking handler is reported and the rest still run.
fn dispatch_envelope(shared: &Shared, envelope: &InboundEnvelope) {
    if envelope.event == EventType::Unknown {
        debug!(event = "unknown_event_ignored");
        return;
    }

    let handlers = lock(&shared.registry).handlers_for(envelope.event);
    for entry in handlers {
        let mut handler = lock(&entry.handler);
        let invoked = catch_unwind(AssertUnwindSafe(|| (*handler)(&envelope.data)));
        if invoked.is_err() {
            warn!(
                event = "handler_panicked",
                kind = ?envelope.event,
                handler_id = entry.id
            );
        }
    }
}
