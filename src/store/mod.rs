//! Conversation Store
//!
//! The single source of truth for direct messages and the live change feed every
//! chat window and inbox reads from. A store persists immutable message records and
//! re-delivers the full, ordered result set of every matching live query after each
//! mutation.

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;

pub mod clock;
pub mod memory;
mod message;
pub mod sqlite;
pub mod streams;

pub use memory::InMemoryStore;
pub use message::{Message, MessageDraft, Participants, ValidationError};
pub use sqlite::SqliteStore;
pub use streams::{SnapshotUpdate, Subscription, UpdateTrigger};

use crate::database::DatabaseError;
use crate::error::{QuadchatError, Result};
use crate::types::{MessageId, UserId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store has been shut down")]
    Closed,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(DatabaseError::Sqlx(err))
    }
}

/// A real-time document store holding direct messages.
///
/// Queries are keyed by single-participant membership: "all messages whose
/// participants contain X, ordered by timestamp ascending". Narrowing down to one
/// conversation is the caller's job.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persists a new message, assigning its id, timestamp and `read = false`.
    ///
    /// The returned record is not the signal that the UI should render it; live
    /// subscribers (the writer included) receive it through their next snapshot.
    async fn append(&self, draft: MessageDraft) -> std::result::Result<Message, StoreError>;

    /// Current result set for `participant`, ascending by timestamp.
    async fn snapshot(&self, participant: &UserId)
    -> std::result::Result<Vec<Message>, StoreError>;

    /// Registers a live query for `participant`.
    async fn subscribe(
        &self,
        participant: &UserId,
    ) -> std::result::Result<Subscription, StoreError>;

    /// Removes a single message. Deleting an id that no longer exists succeeds.
    async fn delete(&self, id: &MessageId) -> std::result::Result<(), StoreError>;

    /// Flips `read` on the given messages addressed to `reader`.
    ///
    /// Ids that are unknown, already read, or addressed to someone else are skipped.
    /// Returns how many messages changed.
    async fn mark_read(
        &self,
        reader: &UserId,
        ids: &[MessageId],
    ) -> std::result::Result<usize, StoreError>;

    /// Closes every live query and rejects further operations.
    async fn shutdown(&self);
}

/// Deletes every message between `current` and `peer`, one document at a time.
///
/// This is not transactional: when some deletions fail the conversation is left
/// partially cleared and the error only reports how many failed.
pub async fn bulk_delete(
    store: &dyn ConversationStore,
    current: &UserId,
    peer: &UserId,
) -> Result<usize> {
    let targets: Vec<MessageId> = store
        .snapshot(current)
        .await?
        .into_iter()
        .filter(|m| m.involves(current, peer))
        .map(|m| m.id)
        .collect();

    let attempted = targets.len();
    let results = join_all(targets.iter().map(|id| store.delete(id))).await;

    let mut failed = 0;
    for (id, result) in targets.iter().zip(results) {
        if let Err(e) = result {
            tracing::warn!(
                target: "quadchat::store::bulk_delete",
                "Failed to delete message {}: {}",
                id,
                e
            );
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(QuadchatError::Clear { failed, attempted });
    }

    tracing::debug!(
        target: "quadchat::store::bulk_delete",
        "Cleared {} messages between {} and {}",
        attempted,
        current,
        peer
    );

    Ok(attempted)
}
