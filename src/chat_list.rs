//! Conversation List Aggregator
//!
//! Turns the signed-in user's full message snapshot into one summary per peer and
//! keeps it current for the inbox view.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{QuadchatError, Result};
use crate::identity::{AuthState, IdentityProvider};
use crate::store::{ConversationStore, Message, SnapshotUpdate, Subscription};
use crate::types::UserId;

/// Summary of one conversation for the inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// The other participant
    pub peer_id: UserId,

    /// Content of the most recent message in either direction
    pub last_message: String,

    pub last_message_at: DateTime<Utc>,

    pub last_sender_id: UserId,

    /// Messages from the peer the current user has not read yet
    pub unread_count: usize,

    /// Always false; there is no presence feed yet.
    pub online: bool,
}

/// Builds the per-peer summaries for `current` from a full snapshot.
///
/// The result depends only on `messages`, so feeding the same snapshot twice yields
/// the same list. When two messages share a timestamp the one later in `messages`
/// counts as the last one.
pub fn aggregate(current: &UserId, messages: &[Message]) -> Vec<PeerSummary> {
    let mut by_peer: HashMap<&UserId, PeerSummary> = HashMap::new();

    for message in messages {
        let Some(peer) = message.participants.other(current) else {
            continue;
        };
        let unread = usize::from(message.is_unread_for(current));

        match by_peer.get_mut(peer) {
            Some(summary) => {
                if message.timestamp >= summary.last_message_at {
                    summary.last_message = message.content.clone();
                    summary.last_message_at = message.timestamp;
                    summary.last_sender_id = message.sender_id.clone();
                }
                summary.unread_count += unread;
            }
            None => {
                by_peer.insert(
                    peer,
                    PeerSummary {
                        peer_id: peer.clone(),
                        last_message: message.content.clone(),
                        last_message_at: message.timestamp,
                        last_sender_id: message.sender_id.clone(),
                        unread_count: unread,
                        online: false,
                    },
                );
            }
        }
    }

    let mut summaries: Vec<PeerSummary> = by_peer.into_values().collect();
    sort_summaries(&mut summaries);
    summaries
}

/// Most recent conversation first; ties fall back to the peer id.
fn sort_summaries(summaries: &mut [PeerSummary]) {
    summaries.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatListState {
    pub summaries: Vec<PeerSummary>,
    /// How many summaries the view shows.
    pub revealed: usize,
    pub error: Option<String>,
    pub loading: bool,
}

impl ChatListState {
    fn new(initial_reveal: usize) -> Self {
        Self {
            summaries: Vec::new(),
            revealed: initial_reveal,
            error: None,
            loading: true,
        }
    }

    pub fn visible(&self) -> &[PeerSummary] {
        let end = self.revealed.min(self.summaries.len());
        &self.summaries[..end]
    }

    pub fn has_more(&self) -> bool {
        self.summaries.len() > self.revealed
    }

    pub fn total_unread(&self) -> usize {
        self.summaries.iter().map(|s| s.unread_count).sum()
    }
}

struct Listener {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Live inbox for the signed-in user.
pub struct ConversationList {
    current: UserId,
    identity: Arc<dyn IdentityProvider>,
    reveal_step: usize,
    state: Arc<watch::Sender<ChatListState>>,
    listener: Mutex<Option<Listener>>,
}

impl ConversationList {
    pub async fn start(
        store: Arc<dyn ConversationStore>,
        identity: Arc<dyn IdentityProvider>,
        initial_reveal: usize,
        reveal_step: usize,
    ) -> Result<Self> {
        let current = identity.auth_state().require_user()?;
        let (state, _) = watch::channel(ChatListState::new(initial_reveal));
        let state = Arc::new(state);

        let mut subscription = store.subscribe(&current).await.map_err(|e| {
            tracing::error!(
                target: "quadchat::chat_list",
                "Failed to subscribe for {}: {}",
                current,
                e
            );
            QuadchatError::Subscription(e.to_string())
        })?;

        publish(&state, &current, &subscription.take_initial());

        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);
        let task = tokio::spawn(listen(
            store,
            state.clone(),
            identity.watch(),
            subscription,
            current.clone(),
            shutdown_receiver,
        ));

        tracing::debug!(
            target: "quadchat::chat_list",
            "Conversation list started for {}",
            current
        );

        Ok(Self {
            current,
            identity,
            reveal_step,
            state,
            listener: Mutex::new(Some(Listener {
                shutdown: shutdown_sender,
                task,
            })),
        })
    }

    pub fn current_user(&self) -> &UserId {
        &self.current
    }

    /// Whether the identity this list was started for is still signed in.
    pub fn is_current(&self) -> bool {
        self.identity.current_user_id().as_ref() == Some(&self.current)
    }

    pub fn state(&self) -> ChatListState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChatListState> {
        self.state.subscribe()
    }

    pub fn visible(&self) -> Vec<PeerSummary> {
        self.state.borrow().visible().to_vec()
    }

    /// Grows the visible window by one step.
    pub fn reveal_more(&self) {
        let step = self.reveal_step;
        self.state
            .send_modify(|s| s.revealed = s.revealed.saturating_add(step));
    }

    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            let _ = listener.shutdown.send(()).await;
            let _ = listener.task.await;
            tracing::debug!(
                target: "quadchat::chat_list",
                "Conversation list stopped for {}",
                self.current
            );
        }
    }
}

impl Drop for ConversationList {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
        }
    }
}

fn publish(state: &watch::Sender<ChatListState>, current: &UserId, messages: &[Message]) {
    let summaries = aggregate(current, messages);
    state.send_modify(|s| {
        s.summaries = summaries;
        s.error = None;
        s.loading = false;
    });
}

fn report_error(state: &watch::Sender<ChatListState>, reason: String) {
    state.send_modify(|s| {
        s.error = Some(reason);
        s.loading = false;
    });
}

async fn listen(
    store: Arc<dyn ConversationStore>,
    state: Arc<watch::Sender<ChatListState>>,
    mut auth: watch::Receiver<AuthState>,
    mut subscription: Subscription,
    current: UserId,
    mut shutdown: mpsc::Receiver<()>,
) {
    // A provider that went away can no longer sign anyone out.
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
                        target: "quadchat::chat_list::listen",
                        "Identity changed, dropping conversation list for {}",
                        current
                    );
                    state.send_modify(|s| s.summaries.clear());
                    break;
                }
            }

            update = subscription.recv() => match update {
                Ok(SnapshotUpdate::Changed { messages, .. }) => {
                    publish(&state, &current, &messages);
                }
                Ok(SnapshotUpdate::Interrupted { reason }) => {
                    tracing::warn!(
                        target: "quadchat::chat_list::listen",
                        "Live query interrupted: {}",
                        reason
                    );
                    report_error(&state, reason);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        target: "quadchat::chat_list::listen",
                        "Skipped {} snapshots, re-reading",
                        skipped
                    );
                    match store.snapshot(&current).await {
                        Ok(messages) => publish(&state, &current, &messages),
                        Err(e) => report_error(&state, e.to_string()),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    report_error(&state, "store closed".to_string());
                    break;
                }
            },
        }
    }

    subscription.unsubscribe();
}
