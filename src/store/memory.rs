//! Process-local conversation store.
//!
//! Keeps every message in insertion order behind a single lock. Mutations and the
//! snapshot deliveries they cause happen under that lock, so subscribers never see
//! an older snapshot after a newer one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::clock::StoreClock;
use super::streams::{SnapshotStreamManager, SnapshotUpdate, Subscription, UpdateTrigger};
use super::{ConversationStore, Message, MessageDraft, StoreError};
use crate::types::{MessageId, UserId};

type Result<T> = std::result::Result<T, StoreError>;

pub struct InMemoryStore {
    messages: RwLock<Vec<Message>>,
    clock: StoreClock,
    streams: SnapshotStreamManager,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_stream_buffer(super::streams::DEFAULT_BUFFER_SIZE)
    }

    pub fn with_stream_buffer(buffer_size: usize) -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            clock: StoreClock::new(),
            streams: SnapshotStreamManager::with_buffer_size(buffer_size),
            closed: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn streams(&self) -> &SnapshotStreamManager {
        &self.streams
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn select(messages: &[Message], participant: &UserId) -> Vec<Message> {
        let mut selected: Vec<Message> = messages
            .iter()
            .filter(|m| m.participants.contains(participant))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        selected.sort_by_key(|m| m.timestamp);
        selected
    }

    fn notify(
        &self,
        messages: &[Message],
        affected: &HashSet<UserId>,
        trigger: UpdateTrigger,
        changed: &[MessageId],
    ) {
        for participant in affected {
            if !self.streams.has_subscribers(participant) {
                self.streams.prune(participant);
                continue;
            }
            let snapshot = Self::select(messages, participant);
            self.streams.emit(
                participant,
                SnapshotUpdate::Changed {
                    trigger: trigger.clone(),
                    changed: changed.to_vec(),
                    messages: Arc::new(snapshot),
                },
            );
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message> {
        self.ensure_open()?;

        let mut messages = self.messages.write().await;
        let message = draft.into_message(MessageId::random(), self.clock.next());
        messages.push(message.clone());

        tracing::debug!(
            target: "quadchat::store::memory",
            "Appended message {} from {} to {}",
            message.id,
            message.sender_id,
            message.receiver_id
        );

        let affected: HashSet<UserId> = message.participants.iter().cloned().collect();
        self.notify(
            &messages,
            &affected,
            UpdateTrigger::MessageAppended,
            std::slice::from_ref(&message.id),
        );

        Ok(message)
    }

    async fn snapshot(&self, participant: &UserId) -> Result<Vec<Message>> {
        self.ensure_open()?;
        let messages = self.messages.read().await;
        Ok(Self::select(&messages, participant))
    }

    async fn subscribe(&self, participant: &UserId) -> Result<Subscription> {
        self.ensure_open()?;
        // Hold the read lock so no mutation slips in between the initial snapshot
        // and the receiver being registered.
        let messages = self.messages.read().await;
        let updates = self.streams.subscribe(participant);
        let initial = Self::select(&messages, participant);

        tracing::debug!(
            target: "quadchat::store::memory",
            "Live query registered for {} ({} messages)",
            participant,
            initial.len()
        );

        Ok(Subscription::new(participant.clone(), initial, updates))
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        self.ensure_open()?;

        let mut messages = self.messages.write().await;
        let Some(position) = messages.iter().position(|m| &m.id == id) else {
            return Ok(());
        };
        let removed = messages.remove(position);

        let affected: HashSet<UserId> = removed.participants.iter().cloned().collect();
        self.notify(
            &messages,
            &affected,
            UpdateTrigger::MessageDeleted,
            std::slice::from_ref(id),
        );

        Ok(())
    }

    async fn mark_read(&self, reader: &UserId, ids: &[MessageId]) -> Result<usize> {
        self.ensure_open()?;

        let wanted: HashSet<&MessageId> = ids.iter().collect();
        let mut messages = self.messages.write().await;
        let mut changed = Vec::new();
        let mut affected = HashSet::new();

        for message in messages.iter_mut() {
            if wanted.contains(&message.id) && message.is_unread_for(reader) {
                message.read = true;
                changed.push(message.id.clone());
                affected.extend(message.participants.iter().cloned());
            }
        }

        if !changed.is_empty() {
            self.notify(&messages, &affected, UpdateTrigger::MessagesRead, &changed);
        }

        Ok(changed.len())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.streams.close_all();
        tracing::debug!(target: "quadchat::store::memory", "In-memory store shut down");
    }
}
