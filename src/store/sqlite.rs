//! Durable conversation store backed by the SQLite database.
//!
//! Writes go straight to the pool. After each committed mutation the store re-reads
//! the result set of every affected participant that has live subscribers and
//! delivers it. Publication is serialized so that a slower re-read can never overtake
//! a newer one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::clock::StoreClock;
use super::streams::{SnapshotStreamManager, SnapshotUpdate, Subscription, UpdateTrigger};
use super::{ConversationStore, Message, MessageDraft, StoreError};
use crate::database::Database;
use crate::types::{MessageId, UserId};

type Result<T> = std::result::Result<T, StoreError>;

pub struct SqliteStore {
    database: Arc<Database>,
    clock: StoreClock,
    streams: SnapshotStreamManager,
    publish_lock: Mutex<()>,
    closed: AtomicBool,
}

impl SqliteStore {
    /// Wraps an initialized database. The clock resumes after the newest stored
    /// message so timestamps stay monotonic across restarts.
    pub async fn new(database: Arc<Database>, stream_buffer: usize) -> Result<Self> {
        let clock = match Message::latest_timestamp(&database).await? {
            Some(latest) => StoreClock::starting_after(latest),
            None => StoreClock::new(),
        };

        Ok(Self {
            database,
            clock,
            streams: SnapshotStreamManager::with_buffer_size(stream_buffer),
            publish_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
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

    async fn publish(
        &self,
        affected: HashSet<UserId>,
        trigger: UpdateTrigger,
        changed: Vec<MessageId>,
    ) {
        let _guard = self.publish_lock.lock().await;

        for participant in affected {
            if !self.streams.has_subscribers(&participant) {
                self.streams.prune(&participant);
                continue;
            }

            let update = match Message::find_by_participant(&participant, &self.database).await {
                Ok(messages) => SnapshotUpdate::Changed {
                    trigger: trigger.clone(),
                    changed: changed.clone(),
                    messages: Arc::new(messages),
                },
                Err(e) => {
                    tracing::warn!(
                        target: "quadchat::store::sqlite",
                        "Failed to refresh snapshot for {}: {}",
                        participant,
                        e
                    );
                    SnapshotUpdate::Interrupted {
                        reason: e.to_string(),
                    }
                }
            };

            self.streams.emit(&participant, update);
        }
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message> {
        self.ensure_open()?;

        let message = draft.into_message(MessageId::random(), self.clock.next());
        message.insert(&self.database).await?;

        tracing::debug!(
            target: "quadchat::store::sqlite",
            "Appended message {} from {} to {}",
            message.id,
            message.sender_id,
            message.receiver_id
        );

        self.publish(
            message.participants.iter().cloned().collect(),
            UpdateTrigger::MessageAppended,
            vec![message.id.clone()],
        )
        .await;

        Ok(message)
    }

    async fn snapshot(&self, participant: &UserId) -> Result<Vec<Message>> {
        self.ensure_open()?;
        Ok(Message::find_by_participant(participant, &self.database).await?)
    }

    async fn subscribe(&self, participant: &UserId) -> Result<Subscription> {
        self.ensure_open()?;

        // Held across registration and the initial read, so no publish can slip
        // between them and deliver a snapshot older than `initial`.
        let _guard = self.publish_lock.lock().await;
        let updates = self.streams.subscribe(participant);
        let initial = Message::find_by_participant(participant, &self.database).await?;

        tracing::debug!(
            target: "quadchat::store::sqlite",
            "Live query registered for {} ({} messages)",
            participant,
            initial.len()
        );

        Ok(Subscription::new(participant.clone(), initial, updates))
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        self.ensure_open()?;

        if let Some(participants) = Message::delete_by_id(id, &self.database).await? {
            self.publish(
                participants.into_iter().collect(),
                UpdateTrigger::MessageDeleted,
                vec![id.clone()],
            )
            .await;
        }

        Ok(())
    }

    async fn mark_read(&self, reader: &UserId, ids: &[MessageId]) -> Result<usize> {
        self.ensure_open()?;

        let touched = Message::mark_read_by_receiver(reader, ids, &self.database).await?;
        if touched.is_empty() {
            return Ok(0);
        }

        let count = touched.len();
        let mut affected = HashSet::new();
        let mut changed = Vec::with_capacity(count);
        for (id, participants) in touched {
            changed.push(id);
            affected.extend(participants);
        }

        self.publish(affected, UpdateTrigger::MessagesRead, changed)
            .await;

        Ok(count)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.streams.close_all();
        self.database.close().await;
        tracing::debug!(target: "quadchat::store::sqlite", "SQLite store shut down");
    }
}
