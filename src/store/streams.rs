//! Per-participant broadcast channels for live snapshot delivery.
//!
//! Every mutation in a store re-reads the full result set for each affected
//! participant and pushes it here. Streams are created lazily on subscribe and
//! cleaned up once all receivers are gone.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::Message;
use crate::types::{MessageId, UserId};

pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// What caused a new snapshot to be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTrigger {
    /// A message involving the participant was appended.
    MessageAppended,

    /// One or more messages involving the participant were deleted.
    MessageDeleted,

    /// One or more messages were flipped to `read`.
    MessagesRead,
}

/// A single delivery on a live query.
///
/// `Changed` always carries the complete, re-sorted result set. `changed` lists the
/// ids touched by the mutation so that incremental consumers can skip a full diff.
#[derive(Debug, Clone)]
pub enum SnapshotUpdate {
    Changed {
        trigger: UpdateTrigger,
        changed: Vec<MessageId>,
        messages: Arc<Vec<Message>>,
    },
    /// The store could not produce a fresh snapshot. The query stays registered.
    Interrupted { reason: String },
}

/// A registered live query for all messages involving one participant.
///
/// Holds the snapshot taken at subscription time plus the receiver for later
/// deliveries. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    participant: UserId,
    initial: Vec<Message>,
    updates: broadcast::Receiver<SnapshotUpdate>,
}

impl Subscription {
    pub(crate) fn new(
        participant: UserId,
        initial: Vec<Message>,
        updates: broadcast::Receiver<SnapshotUpdate>,
    ) -> Self {
        Self {
            participant,
            initial,
            updates,
        }
    }

    pub fn participant(&self) -> &UserId {
        &self.participant
    }

    /// Takes the initial snapshot, leaving an empty list behind.
    pub fn take_initial(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.initial)
    }

    /// Waits for the next delivery.
    ///
    /// `Lagged` means deliveries were dropped; since each delivery is a full snapshot
    /// the caller only needs to re-read the current one. `Closed` means the store was
    /// torn down.
    pub async fn recv(&mut self) -> Result<SnapshotUpdate, broadcast::error::RecvError> {
        self.updates.recv().await
    }

    pub fn unsubscribe(self) {
        tracing::debug!(
            target: "quadchat::store::streams",
            "Unsubscribing live query for {}",
            self.participant
        );
    }
}

pub struct SnapshotStreamManager {
    streams: DashMap<UserId, broadcast::Sender<SnapshotUpdate>>,
    buffer_size: usize,
}

impl SnapshotStreamManager {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            streams: DashMap::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn subscribe(&self, participant: &UserId) -> broadcast::Receiver<SnapshotUpdate> {
        self.streams
            .entry(participant.clone())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .subscribe()
    }

    /// Whether anyone is currently listening for `participant`.
    pub fn has_subscribers(&self, participant: &UserId) -> bool {
        self.streams
            .get(participant)
            .map(|sender| sender.receiver_count() > 0)
            .unwrap_or(false)
    }

    pub fn emit(&self, participant: &UserId, update: SnapshotUpdate) {
        if let Some(sender) = self.streams.get(participant) {
            if sender.send(update).is_err() && sender.receiver_count() == 0 {
                drop(sender);
                self.streams.remove(participant);
            }
        }
    }

    /// Forgets the sender for `participant` once its last receiver is gone.
    pub fn prune(&self, participant: &UserId) {
        self.streams
            .remove_if(participant, |_, sender| sender.receiver_count() == 0);
    }

    /// Number of participants that still have a registered sender.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Drops every sender. Live receivers observe `Closed`.
    pub fn close_all(&self) {
        self.streams.clear();
    }
}

impl Default for SnapshotStreamManager {
    fn default() -> Self {
        Self::new()
    }
}
