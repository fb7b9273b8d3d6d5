//! Chat Session Controller
//!
//! One [`ChatSession`] backs one open chat window. It owns a single live query on
//! the store for the signed-in user, narrows every delivered snapshot down to the
//! selected peer, and publishes the resulting [`SessionState`] on a watch channel.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SendFailurePolicy;
use crate::error::{QuadchatError, Result};
use crate::identity::{AuthState, IdentityProvider};
use crate::store::{
    ConversationStore, Message, MessageDraft, SnapshotUpdate, Subscription, bulk_delete,
};
use crate::types::{MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Closed,
    Opening,
    Open,
}

/// Banner-level error kept in the session state until dismissed or superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Subscription(String),
    Write(String),
    Clear(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Subscription(reason) => write!(f, "Failed to load messages: {reason}"),
            SessionError::Write(reason) => write!(f, "Failed to send message: {reason}"),
            SessionError::Clear(reason) => write!(f, "Failed to clear conversation: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub peer: Option<UserId>,
    /// Messages between the current user and `peer`, oldest first.
    pub messages: Vec<Message>,
    pub input: String,
    pub loading: bool,
    pub error: Option<SessionError>,
    /// Bumped whenever a delivery leaves a non-empty list; the view scrolls to the
    /// bottom each time it changes.
    pub scroll_epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyContent,
    NoPeerSelected,
    NotAuthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Message),
    Skipped(SkipReason),
}

struct Listener {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Listener {
    async fn stop(self) {
        // Already gone if the loop ended on its own
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.task.await
            && !e.is_cancelled()
        {
            tracing::warn!(target: "quadchat::session", "Session listener panicked: {}", e);
        }
    }
}

pub struct ChatSession {
    store: Arc<dyn ConversationStore>,
    identity: Arc<dyn IdentityProvider>,
    send_failure_policy: SendFailurePolicy,
    state: Arc<watch::Sender<SessionState>>,
    listener: Mutex<Option<Listener>>,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        identity: Arc<dyn IdentityProvider>,
        send_failure_policy: SendFailurePolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            store,
            identity,
            send_failure_policy,
            state: Arc::new(state),
            listener: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Selects `peer` and starts listening for the conversation with them.
    ///
    /// Any previous conversation is torn down first, so deliveries for an old peer
    /// never reach the new state.
    pub async fn open(&self, peer: impl Into<UserId>) -> Result<()> {
        let peer = peer.into();
        let current = self.identity.auth_state().require_user()?;
        if peer == current {
            return Err(QuadchatError::SelfConversation);
        }

        let mut listener = self.listener.lock().await;
        if let Some(previous) = listener.take() {
            previous.stop().await;
        }

        tracing::debug!(
            target: "quadchat::session",
            "Opening conversation between {} and {}",
            current,
            peer
        );

        self.state.send_modify(|s| {
            s.phase = SessionPhase::Opening;
            s.peer = Some(peer.clone());
            s.messages.clear();
            s.loading = true;
            s.error = None;
        });

        let mut subscription = match self.store.subscribe(&current).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(
                    target: "quadchat::session",
                    "Failed to subscribe for {}: {}",
                    current,
                    e
                );
                self.state.send_modify(|s| {
                    s.phase = SessionPhase::Closed;
                    s.loading = false;
                    s.error = Some(SessionError::Subscription(e.to_string()));
                });
                return Err(QuadchatError::Subscription(e.to_string()));
            }
        };

        apply_snapshot(&self.state, &current, &peer, &subscription.take_initial());

        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);
        let task = tokio::spawn(listen(
            self.store.clone(),
            self.state.clone(),
            self.identity.watch(),
            subscription,
            current,
            peer,
            shutdown_receiver,
        ));

        *listener = Some(Listener {
            shutdown: shutdown_sender,
            task,
        });

        Ok(())
    }

    /// Stops listening and resets the window. Nothing is cached for the next open.
    pub async fn close(&self) {
        let mut listener = self.listener.lock().await;
        if let Some(previous) = listener.take() {
            previous.stop().await;
        }
        self.state.send_replace(SessionState::default());
        tracing::debug!(target: "quadchat::session", "Conversation closed");
    }

    pub fn set_input(&self, text: impl Into<String>) {
        let text = text.into();
        self.state.send_modify(|s| s.input = text);
    }

    /// Sends `text` to the selected peer.
    ///
    /// Blank text, a missing peer, or a missing identity skip the write without
    /// touching any state. The input buffer is cleared before the write; the
    /// message itself only shows up through the next delivered snapshot.
    pub async fn send(&self, text: &str) -> Result<SendOutcome> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(SendOutcome::Skipped(SkipReason::EmptyContent));
        }
        let Some(peer) = self.state.borrow().peer.clone() else {
            return Ok(SendOutcome::Skipped(SkipReason::NoPeerSelected));
        };
        let Some(current) = self.identity.current_user_id() else {
            return Ok(SendOutcome::Skipped(SkipReason::NotAuthenticated));
        };

        let draft = MessageDraft::new(current, peer, trimmed)?;
        self.state.send_modify(|s| s.input.clear());

        match self.store.append(draft).await {
            Ok(message) => {
                tracing::debug!(target: "quadchat::session", "Sent message {}", message.id);
                Ok(SendOutcome::Sent(message))
            }
            Err(e) => {
                tracing::error!(target: "quadchat::session", "Failed to send message: {}", e);
                let restore = self.send_failure_policy == SendFailurePolicy::RestoreInput;
                self.state.send_modify(|s| {
                    s.error = Some(SessionError::Write(e.to_string()));
                    if restore && s.input.is_empty() {
                        s.input = text.to_string();
                    }
                });
                Err(QuadchatError::Write(e))
            }
        }
    }

    /// Sends whatever is in the input buffer.
    pub async fn send_input(&self) -> Result<SendOutcome> {
        let text = self.state.borrow().input.clone();
        self.send(&text).await
    }

    /// Deletes the whole conversation with the selected peer, for both sides.
    ///
    /// On failure the local list is left as it was; the store may still hold part
    /// of the conversation.
    pub async fn clear(&self) -> Result<usize> {
        let current = self.identity.auth_state().require_user()?;
        let peer = self
            .state
            .borrow()
            .peer
            .clone()
            .ok_or(QuadchatError::NoPeerSelected)?;

        match bulk_delete(self.store.as_ref(), &current, &peer).await {
            Ok(removed) => {
                self.state.send_modify(|s| s.messages.clear());
                Ok(removed)
            }
            Err(e) => {
                tracing::error!(
                    target: "quadchat::session",
                    "Failed to clear conversation with {}: {}",
                    peer,
                    e
                );
                self.state
                    .send_modify(|s| s.error = Some(SessionError::Clear(e.to_string())));
                Err(e)
            }
        }
    }

    /// Marks every unread message from the peer as read.
    pub async fn mark_read(&self) -> Result<usize> {
        let current = self.identity.auth_state().require_user()?;
        let unread: Vec<MessageId> = {
            let state = self.state.borrow();
            let peer = state.peer.as_ref().ok_or(QuadchatError::NoPeerSelected)?;
            state
                .messages
                .iter()
                .filter(|m| &m.sender_id == peer && m.is_unread_for(&current))
                .map(|m| m.id.clone())
                .collect()
        };

        if unread.is_empty() {
            return Ok(0);
        }
        Ok(self.store.mark_read(&current, &unread).await?)
    }

    pub fn dismiss_error(&self) {
        self.state.send_modify(|s| s.error = None);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
        }
    }
}

fn apply_snapshot(
    state: &watch::Sender<SessionState>,
    current: &UserId,
    peer: &UserId,
    snapshot: &[Message],
) {
    let conversation: Vec<Message> = snapshot
        .iter()
        .filter(|m| m.involves(current, peer))
        .cloned()
        .collect();

    state.send_modify(|s| {
        s.phase = SessionPhase::Open;
        s.loading = false;
        if matches!(s.error, Some(SessionError::Subscription(_))) {
            s.error = None;
        }
        if !conversation.is_empty() {
            s.scroll_epoch += 1;
        }
        s.messages = conversation;
    });
}

fn report_subscription_error(state: &watch::Sender<SessionState>, reason: String) {
    state.send_modify(|s| {
        s.loading = false;
        s.error = Some(SessionError::Subscription(reason));
    });
}

async fn listen(
    store: Arc<dyn ConversationStore>,
    state: Arc<watch::Sender<SessionState>>,
    mut auth: watch::Receiver<AuthState>,
    mut subscription: Subscription,
    current: UserId,
    peer: UserId,
    mut shutdown: mpsc::Receiver<()>,
) {
    tracing::debug!(
        target: "quadchat::session::listen",
        "Listening for conversation between {} and {}",
        current,
        peer
    );

    let mut auth_open = true;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            changed = auth.changed(), if auth_open => {
                if changed.is_err() {
                    auth_open = false;
                    continue;
                }
                if auth.borrow_and_update().user_id() != Some(&current) {
                    tracing::info!(
                        target: "quadchat::session::listen",
                        "Identity changed, closing conversation for {}",
                        current
                    );
                    state.send_replace(SessionState::default());
                    break;
                }
            }

            update = subscription.recv() => match update {
                Ok(SnapshotUpdate::Changed { messages, .. }) => {
                    apply_snapshot(&state, &current, &peer, &messages);
                }
                Ok(SnapshotUpdate::Interrupted { reason }) => {
                    tracing::warn!(
                        target: "quadchat::session::listen",
                        "Live query interrupted: {}",
                        reason
                    );
                    report_subscription_error(&state, reason);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        target: "quadchat::session::listen",
                        "Skipped {} snapshots, re-reading",
                        skipped
                    );
                    match store.snapshot(&current).await {
                        Ok(messages) => apply_snapshot(&state, &current, &peer, &messages),
                        Err(e) => report_subscription_error(&state, e.to_string()),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    report_subscription_error(&state, "store closed".to_string());
                    break;
                }
            },
        }
    }

    subscription.unsubscribe();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SessionIdentity;
    use crate::store::InMemoryStore;
    use crate::test_utils::{FlakyStore, TEST_TIMEOUT, uid};

    fn signed_in(user: &str) -> Arc<SessionIdentity> {
        let identity = SessionIdentity::new();
        identity.sign_in(user);
        Arc::new(identity)
    }

    fn session_for(store: Arc<dyn ConversationStore>, user: &str) -> ChatSession {
        ChatSession::new(store, signed_in(user), SendFailurePolicy::RestoreInput)
    }

    async fn wait_for<F>(session: &ChatSession, predicate: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = session.watch();
        let state = tokio::time::timeout(TEST_TIMEOUT, rx.wait_for(predicate))
            .await
            .expect("timed out waiting for session state")
            .expect("session state channel closed");
        state.clone()
    }

    fn contents(state: &SessionState) -> Vec<&str> {
        state.messages.iter().map(|m| m.content.as_str()).collect()
    }

    async fn seed(store: &dyn ConversationStore, from: &str, to: &str, text: &str) -> Message {
        store
            .append(MessageDraft::new(uid(from), uid(to), text).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_requires_resolved_identity() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        let identity = Arc::new(SessionIdentity::new());
        let session = ChatSession::new(
            store,
            identity.clone(),
            SendFailurePolicy::RestoreInput,
        );

        assert!(matches!(
            session.open("bob").await,
            Err(QuadchatError::IdentityUnresolved)
        ));

        identity.sign_out();
        assert!(matches!(
            session.open("bob").await,
            Err(QuadchatError::NotAuthenticated)
        ));
        assert_eq!(session.state().phase, SessionPhase::Closed);
    }

    #[tokio::test]
    async fn open_rejects_self_conversation() {
        let session = session_for(Arc::new(InMemoryStore::new()), "alice");
        assert!(matches!(
            session.open("alice").await,
            Err(QuadchatError::SelfConversation)
        ));
    }

    #[tokio::test]
    async fn open_shows_only_the_selected_conversation() {
        let store = Arc::new(InMemoryStore::new());
        seed(store.as_ref(), "a", "b", "to b").await;
        seed(store.as_ref(), "c", "a", "from c").await;
        seed(store.as_ref(), "b", "a", "from b").await;
        seed(store.as_ref(), "a", "d", "to d").await;

        let session = session_for(store, "a");
        session.open("b").await.unwrap();

        let state = session.state();
        assert_eq!(state.phase, SessionPhase::Open);
        assert!(!state.loading);
        assert_eq!(contents(&state), vec!["to b", "from b"]);
        assert!(
            state
                .messages
                .iter()
                .all(|m| m.participants.contains(&uid("a")) && m.participants.contains(&uid("b")))
        );
        assert_eq!(state.scroll_epoch, 1);
    }

    #[tokio::test]
    async fn both_sides_see_hi_then_hello() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        let alice = session_for(store.clone(), "a");
        let bob = session_for(store.clone(), "b");
        alice.open("b").await.unwrap();
        bob.open("a").await.unwrap();

        alice.set_input("hi");
        assert!(matches!(
            alice.send_input().await.unwrap(),
            SendOutcome::Sent(_)
        ));
        wait_for(&bob, |s| s.messages.len() == 1).await;
        bob.send("hello").await.unwrap();

        for session in [&alice, &bob] {
            let state = wait_for(session, |s| s.messages.len() == 2).await;
            assert_eq!(contents(&state), vec!["hi", "hello"]);
            assert!(state.messages[0].timestamp < state.messages[1].timestamp);
            assert!(state.scroll_epoch >= 2);
        }
        assert!(alice.state().input.is_empty());
    }

    #[tokio::test]
    async fn blank_input_is_never_written() {
        let store = Arc::new(InMemoryStore::new());
        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();

        session.set_input("   \n\t ");
        assert_eq!(
            session.send_input().await.unwrap(),
            SendOutcome::Skipped(SkipReason::EmptyContent)
        );
        assert_eq!(session.state().input, "   \n\t ");
        assert!(store.snapshot(&uid("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_without_peer_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let session = session_for(store.clone(), "a");

        assert_eq!(
            session.send("hello?").await.unwrap(),
            SendOutcome::Skipped(SkipReason::NoPeerSelected)
        );
        assert!(store.snapshot(&uid("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_after_sign_out_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let identity = signed_in("a");
        let session = ChatSession::new(
            store.clone(),
            identity.clone(),
            SendFailurePolicy::RestoreInput,
        );
        session.open("b").await.unwrap();

        identity.sign_out();
        wait_for(&session, |s| s.phase == SessionPhase::Closed).await;

        assert!(matches!(
            session.send("still there?").await.unwrap(),
            SendOutcome::Skipped(_)
        ));
        assert!(store.snapshot(&uid("b")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_send_restores_input() {
        let store = FlakyStore::shared();
        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();

        store.fail_appends(true);
        session.set_input("  lost?  ");
        let err = session.send_input().await.unwrap_err();
        assert!(matches!(err, QuadchatError::Write(_)));

        let state = session.state();
        assert_eq!(state.input, "  lost?  ");
        assert!(matches!(state.error, Some(SessionError::Write(_))));
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn failed_send_can_keep_input_cleared() {
        let store = FlakyStore::shared();
        let session = ChatSession::new(
            store.clone(),
            signed_in("a"),
            SendFailurePolicy::KeepCleared,
        );
        session.open("b").await.unwrap();

        store.fail_appends(true);
        session.set_input("gone");
        assert!(session.send_input().await.is_err());

        let state = session.state();
        assert!(state.input.is_empty());
        assert!(matches!(state.error, Some(SessionError::Write(_))));

        session.dismiss_error();
        assert_eq!(session.state().error, None);
    }

    #[tokio::test]
    async fn clear_removes_only_the_pair() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        seed(store.as_ref(), "a", "b", "1").await;
        seed(store.as_ref(), "b", "a", "2").await;
        seed(store.as_ref(), "a", "c", "3").await;

        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();
        assert_eq!(session.state().messages.len(), 2);

        assert_eq!(session.clear().await.unwrap(), 2);
        assert!(session.state().messages.is_empty());

        session.open("c").await.unwrap();
        assert_eq!(contents(&session.state()), vec!["3"]);

        session.open("b").await.unwrap();
        assert!(session.state().messages.is_empty());

        let for_b = store.snapshot(&uid("b")).await.unwrap();
        assert!(for_b.is_empty());
    }

    #[tokio::test]
    async fn failed_clear_keeps_local_messages() {
        let store = FlakyStore::shared();
        seed(store.as_ref(), "a", "b", "1").await;
        seed(store.as_ref(), "b", "a", "2").await;

        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();

        store.fail_deletes_after(0);
        let err = session.clear().await.unwrap_err();
        assert!(matches!(
            err,
            QuadchatError::Clear {
                failed: 2,
                attempted: 2
            }
        ));

        let state = session.state();
        assert_eq!(state.messages.len(), 2);
        assert!(matches!(state.error, Some(SessionError::Clear(_))));
    }

    #[tokio::test]
    async fn subscription_error_is_sticky_until_next_delivery() {
        let store = FlakyStore::shared();
        seed(store.as_ref(), "b", "a", "before").await;

        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();

        store.interrupt(&uid("a"), "listener failed");
        let state = wait_for(&session, |s| s.error.is_some()).await;
        assert_eq!(
            state.error,
            Some(SessionError::Subscription("listener failed".to_string()))
        );
        assert_eq!(contents(&state), vec!["before"]);

        seed(store.as_ref(), "b", "a", "after").await;
        let state = wait_for(&session, |s| s.messages.len() == 2).await;
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn failed_subscribe_reports_error() {
        let store = FlakyStore::shared();
        store.fail_subscribe(true);
        let session = session_for(store, "a");

        assert!(matches!(
            session.open("b").await,
            Err(QuadchatError::Subscription(_))
        ));
        let state = session.state();
        assert!(!state.loading);
        assert!(matches!(state.error, Some(SessionError::Subscription(_))));
    }

    #[tokio::test]
    async fn peer_change_drops_old_conversation() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        seed(store.as_ref(), "b", "a", "from b").await;

        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();
        session.open("c").await.unwrap();
        assert!(session.state().messages.is_empty());
        assert_eq!(session.state().peer, Some(uid("c")));

        seed(store.as_ref(), "b", "a", "late from b").await;
        seed(store.as_ref(), "c", "a", "from c").await;

        let state = wait_for(&session, |s| !s.messages.is_empty()).await;
        assert_eq!(contents(&state), vec!["from c"]);
    }

    #[tokio::test]
    async fn close_resets_state() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        seed(store.as_ref(), "a", "b", "hi").await;

        let session = session_for(store, "a");
        session.open("b").await.unwrap();
        session.set_input("draft");
        session.close().await;

        assert_eq!(session.state(), SessionState::default());
    }

    #[tokio::test]
    async fn mark_read_only_touches_messages_from_peer() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        seed(store.as_ref(), "b", "a", "one").await;
        seed(store.as_ref(), "b", "a", "two").await;
        seed(store.as_ref(), "a", "b", "mine").await;
        seed(store.as_ref(), "c", "a", "other").await;

        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();

        assert_eq!(session.mark_read().await.unwrap(), 2);
        let state = wait_for(&session, |s| {
            s.messages
                .iter()
                .filter(|m| m.sender_id == uid("b"))
                .all(|m| m.read)
        })
        .await;
        assert!(!state.messages.iter().find(|m| m.content == "mine").unwrap().read);

        let from_c = store.snapshot(&uid("c")).await.unwrap();
        assert!(!from_c[0].read);
    }

    #[tokio::test]
    async fn lagging_session_catches_up_from_snapshot() {
        let store = Arc::new(InMemoryStore::with_stream_buffer(1));
        let session = session_for(store.clone(), "a");
        session.open("b").await.unwrap();

        for i in 0..8 {
            seed(store.as_ref(), "b", "a", &format!("m{i}")).await;
        }

        let state = wait_for(&session, |s| s.messages.len() == 8).await;
        assert_eq!(state.messages.last().unwrap().content, "m7");
        assert_eq!(state.error, None);
        assert_eq!(state.phase, SessionPhase::Open);
    }

    #[tokio::test]
    async fn switching_user_closes_conversation() {
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        seed(store.as_ref(), "b", "a", "for a").await;

        let identity = signed_in("a");
        let session = ChatSession::new(
            store.clone(),
            identity.clone(),
            SendFailurePolicy::RestoreInput,
        );
        session.open("b").await.unwrap();
        assert_eq!(session.state().messages.len(), 1);

        identity.sign_in("c");
        let state = wait_for(&session, |s| s.phase == SessionPhase::Closed).await;
        assert!(state.messages.is_empty());
        assert_eq!(state.peer, None);

        seed(store.as_ref(), "b", "a", "after switch").await;
        tokio::task::yield_now().await;
        assert!(session.state().messages.is_empty());
    }
}
