//! Binds a channel manager's lifecycle to one UI session's lifetime.
//!
//! `SessionBinding` owns the fixed set of subscriptions a session view needs
//! and folds the raw event stream into typed [`SessionUpdate`]s plus a
//! [`SessionView`] snapshot. Teardown runs unsubscribe-then-disconnect, in
//! that order, so no handler can fire once a release has begun even if a
//! reconnect races it.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::channel::manager::{ChannelError, ChannelManager, SessionId, Subscription};
use crate::channel::proto::{
    CompletionPayload, ConsensusPayload, ErrorPayload, EventType, MessagePayload, PresencePayload,
    RoundPayload, TypingPayload, TypingStoppedPayload,
};

/// Lifecycle of a binding across one UI session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindingState {
    Idle,
    Binding,
    Bound,
    Unbinding,
}

/// Typed event emitted on the update stream returned by
/// [`SessionBinding::bind`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    MessageReceived(MessagePayload),
    TypingStarted(TypingPayload),
    TypingStopped(TypingStoppedPayload),
    ConsensusChanged(ConsensusPayload),
    RoundAdvanced(RoundPayload),
    Completed(CompletionPayload),
    ParticipantJoined(PresencePayload),
    ParticipantLeft(PresencePayload),
    ServerFault(ErrorPayload),
}

/// Participant currently typing, as shown by the typing indicator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypingParticipant {
    pub llm_id: i64,
    pub llm_name: String,
}

/// Snapshot of session progress folded from the event stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionView {
    pub typing: Option<TypingParticipant>,
    pub consensus_percentage: f64,
    pub current_round: u32,
    pub completed: bool,
    pub participants: u32,
    pub messages_seen: u64,
    pub last_error: Option<String>,
}

struct BoundChannel {
    session_id: SessionId,
    subscriptions: Vec<Subscription>,
    view: Arc<Mutex<SessionView>>,
}

/// Per-UI-session consumer of a [`ChannelManager`].
pub struct SessionBinding {
    manager: ChannelManager,
    state: BindingState,
    bound: Option<BoundChannel>,
}

impl SessionBinding {
    pub fn new(manager: ChannelManager) -> Self {
        Self {
            manager,
            state: BindingState::Idle,
            bound: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BindingState {
        self.state
    }

    /// Session the binding currently serves, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.bound.as_ref().map(|bound| bound.session_id)
    }

    /// Shared manager handle, for callers that need raw channel access.
    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    /// Connects the channel for `session_id` and registers the session view's
    /// handler set, returning the typed update stream.
    ///
    /// Binding while already bound releases the previous session first. A
    /// connect failure leaves the binding idle and is surfaced to the caller
    /// as a connectivity-degraded signal, not a crash.
    pub async fn bind(
        &mut self,
        session_id: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SessionUpdate>, ChannelError> {
        if self.bound.is_some() {
            self.release();
        }

        self.state = BindingState::Binding;
        if let Err(err) = self.manager.connect(session_id).await {
            self.state = BindingState::Idle;
            return Err(err);
        }

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let view = Arc::new(Mutex::new(SessionView::default()));

        let subscriptions = vec![
            self.subscribe::<MessagePayload, _>(
                EventType::NewMessage,
                &view,
                &updates_tx,
                SessionUpdate::MessageReceived,
            ),
            self.subscribe::<TypingPayload, _>(
                EventType::LlmTyping,
                &view,
                &updates_tx,
                SessionUpdate::TypingStarted,
            ),
            self.subscribe::<TypingStoppedPayload, _>(
                EventType::LlmStoppedTyping,
                &view,
                &updates_tx,
                SessionUpdate::TypingStopped,
            ),
            self.subscribe::<ConsensusPayload, _>(
                EventType::ConsensusUpdate,
                &view,
                &updates_tx,
                SessionUpdate::ConsensusChanged,
            ),
            self.subscribe::<RoundPayload, _>(
                EventType::RoundUpdate,
                &view,
                &updates_tx,
                SessionUpdate::RoundAdvanced,
            ),
            self.subscribe::<CompletionPayload, _>(
                EventType::SessionCompleted,
                &view,
                &updates_tx,
                SessionUpdate::Completed,
            ),
            self.subscribe::<PresencePayload, _>(
                EventType::UserJoined,
                &view,
                &updates_tx,
                SessionUpdate::ParticipantJoined,
            ),
            self.subscribe::<PresencePayload, _>(
                EventType::UserLeft,
                &view,
                &updates_tx,
                SessionUpdate::ParticipantLeft,
            ),
            self.subscribe::<ErrorPayload, _>(
                EventType::Error,
                &view,
                &updates_tx,
                SessionUpdate::ServerFault,
            ),
        ];

        self.bound = Some(BoundChannel {
            session_id,
            subscriptions,
            view,
        });
        self.state = BindingState::Bound;
        Ok(updates_rx)
    }

    /// Releases the current session: every subscription token is invoked
    /// first, then the channel is disconnected. Synchronous — teardown never
    /// awaits server acknowledgement. Idempotent.
    pub fn release(&mut self) {
        let Some(bound) = self.bound.take() else {
            self.state = BindingState::Idle;
            return;
        };

        self.state = BindingState::Unbinding;
        for subscription in bound.subscriptions {
            subscription.unsubscribe();
        }
        self.manager.disconnect();
        self.state = BindingState::Idle;
    }

    /// Snapshot of the folded session view. Default when nothing is bound.
    pub fn view(&self) -> SessionView {
        self.bound
            .as_ref()
            .and_then(|bound| bound.view.lock().ok().map(|view| view.clone()))
            .unwrap_or_default()
    }

    /// Sends a user chat message into the discussion. Dropped (and reported
    /// by the manager) when no transport is open.
    pub fn send_chat_message(&self, content: &str) {
        self.manager
            .send(EventType::SendMessage, json!({ "content": content }));
    }

    fn subscribe<P, F>(
        &self,
        event: EventType,
        view: &Arc<Mutex<SessionView>>,
        updates_tx: &mpsc::UnboundedSender<SessionUpdate>,
        wrap: F,
    ) -> Subscription
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> SessionUpdate + Send + 'static,
    {
        let view = Arc::clone(view);
        let updates_tx = updates_tx.clone();
        self.manager.on(event, move |data| {
            match serde_json::from_value::<P>(data.clone()) {
                Ok(payload) => {
                    let update = wrap(payload);
                    if let Ok(mut view) = view.lock() {
                        apply_update(&mut view, &update);
                    }
                    let _ = updates_tx.send(update);
                }
                Err(err) => {
                    warn!(event = "payload_decode_failed", kind = ?event, error = %err);
                }
            }
        })
    }
}

impl Drop for SessionBinding {
    fn drop(&mut self) {
        self.release();
    }
}

fn apply_update(view: &mut SessionView, update: &SessionUpdate) {
    match update {
        SessionUpdate::MessageReceived(_) => {
            view.messages_seen += 1;
        }
        SessionUpdate::TypingStarted(payload) => {
            view.typing = Some(TypingParticipant {
                llm_id: payload.llm_id,
                llm_name: payload.llm_name.clone(),
            });
        }
        SessionUpdate::TypingStopped(_) => {
            view.typing = None;
        }
        SessionUpdate::ConsensusChanged(payload) => {
            view.consensus_percentage = payload.consensus_percentage;
            if let Some(round) = payload.current_round {
                view.current_round = round;
            }
        }
        SessionUpdate::RoundAdvanced(payload) => {
            view.current_round = payload.current_round;
        }
        SessionUpdate::Completed(payload) => {
            view.completed = true;
            view.typing = None;
            if let Some(percentage) = payload.consensus_percentage {
                view.consensus_percentage = percentage;
            }
        }
        SessionUpdate::ParticipantJoined(payload) | SessionUpdate::ParticipantLeft(payload) => {
            view.participants = payload.connection_count;
        }
        SessionUpdate::ServerFault(payload) => {
            view.last_error = Some(payload.message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_binding_starts_idle() {
        let binding = SessionBinding::new(ChannelManager::new());
        assert_eq!(binding.state(), BindingState::Idle);
        assert_eq!(binding.session_id(), None);
        assert_eq!(binding.view(), SessionView::default());
    }

    #[test]
    fn release_without_binding_is_idempotent() {
        let mut binding = SessionBinding::new(ChannelManager::new());
        binding.release();
        binding.release();
        assert_eq!(binding.state(), BindingState::Idle);
    }

    #[test]
    fn view_folds_typing_lifecycle() {
        let mut view = SessionView::default();

        apply_update(
            &mut view,
            &SessionUpdate::TypingStarted(TypingPayload {
                llm_id: 2,
                llm_name: "claude".to_string(),
            }),
        );
        assert_eq!(
            view.typing,
            Some(TypingParticipant {
                llm_id: 2,
                llm_name: "claude".to_string(),
            })
        );

        apply_update(
            &mut view,
            &SessionUpdate::TypingStopped(TypingStoppedPayload { llm_id: Some(2) }),
        );
        assert_eq!(view.typing, None);
    }

    #[test]
    fn view_folds_consensus_round_and_completion() {
        let mut view = SessionView::default();

        apply_update(
            &mut view,
            &SessionUpdate::ConsensusChanged(ConsensusPayload {
                consensus_percentage: 41.5,
                current_round: Some(2),
                total_messages: Some(9),
            }),
        );
        assert_eq!(view.consensus_percentage, 41.5);
        assert_eq!(view.current_round, 2);

        apply_update(
            &mut view,
            &SessionUpdate::RoundAdvanced(RoundPayload {
                current_round: 3,
                max_rounds: Some(5),
                status: Some("started".to_string()),
            }),
        );
        assert_eq!(view.current_round, 3);

        apply_update(
            &mut view,
            &SessionUpdate::Completed(CompletionPayload {
                summary: Some("converged".to_string()),
                total_rounds: Some(3),
                total_messages: Some(14),
                consensus_percentage: Some(80.0),
            }),
        );
        assert!(view.completed);
        assert_eq!(view.consensus_percentage, 80.0);
        assert_eq!(view.typing, None);
    }

    #[test]
    fn view_tracks_presence_and_message_counts() {
        let mut view = SessionView::default();

        apply_update(
            &mut view,
            &SessionUpdate::ParticipantJoined(PresencePayload {
                timestamp: None,
                connection_count: 3,
            }),
        );
        assert_eq!(view.participants, 3);

        apply_update(
            &mut view,
            &SessionUpdate::ParticipantLeft(PresencePayload {
                timestamp: None,
                connection_count: 2,
            }),
        );
        assert_eq!(view.participants, 2);

        apply_update(
            &mut view,
            &SessionUpdate::MessageReceived(MessagePayload {
                id: 1,
                session_id: None,
                llm_id: None,
                llm_name: None,
                llm_brand_color: None,
                role: crate::channel::proto::MessageRole::User,
                content: "hello".to_string(),
                thinking_content: None,
                tokens_used: None,
                response_time_ms: None,
                created_at: "2025-06-01T12:00:00Z".to_string(),
            }),
        );
        assert_eq!(view.messages_seen, 1);

        apply_update(
            &mut view,
            &SessionUpdate::ServerFault(ErrorPayload {
                message: "session is not active".to_string(),
            }),
        );
        assert_eq!(view.last_error.as_deref(), Some("session is not active"));
    }
}
