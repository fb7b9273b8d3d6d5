use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::database::Database;
use crate::store::streams::SnapshotUpdate;
use crate::store::{
    ConversationStore, InMemoryStore, Message, MessageDraft, StoreError, Subscription,
};
use crate::types::{MessageId, UserId};

pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn uid(s: &str) -> UserId {
    UserId::new(s)
}

pub(crate) async fn create_test_database() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(temp_dir.path().join("test.sqlite"))
        .await
        .unwrap();
    (db, temp_dir)
}

/// Waits for the next full snapshot on `sub`, panicking on anything else.
pub(crate) async fn expect_snapshot(sub: &mut Subscription) -> Vec<Message> {
    let update = tokio::time::timeout(TEST_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for snapshot")
        .expect("subscription closed");

    match update {
        SnapshotUpdate::Changed { messages, .. } => messages.as_ref().clone(),
        SnapshotUpdate::Interrupted { reason } => panic!("subscription interrupted: {reason}"),
    }
}

/// Polls `check` until it holds or the test timeout elapses.
pub(crate) async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met before timeout");
}

/// In-memory store with switchable failures.
pub(crate) struct FlakyStore {
    inner: InMemoryStore,
    fail_appends: AtomicBool,
    fail_subscribe: AtomicBool,
    deletes_before_failure: AtomicUsize,
    deletes_limited: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_appends: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            deletes_before_failure: AtomicUsize::new(0),
            deletes_limited: AtomicBool::new(false),
        }
    }

    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub(crate) fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Lets `n` more deletes succeed, then fails every following one.
    pub(crate) fn fail_deletes_after(&self, n: usize) {
        self.deletes_before_failure.store(n, Ordering::SeqCst);
        self.deletes_limited.store(true, Ordering::SeqCst);
    }

    /// Pushes an interruption to every live query for `participant`.
    pub(crate) fn interrupt(&self, participant: &UserId, reason: &str) {
        self.inner.streams().emit(
            participant,
            SnapshotUpdate::Interrupted {
                reason: reason.to_string(),
            },
        );
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Unavailable(format!("injected {what} failure"))
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Self::injected("append"));
        }
        self.inner.append(draft).await
    }

    async fn snapshot(&self, participant: &UserId) -> Result<Vec<Message>, StoreError> {
        self.inner.snapshot(participant).await
    }

    async fn subscribe(&self, participant: &UserId) -> Result<Subscription, StoreError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Self::injected("subscribe"));
        }
        self.inner.subscribe(participant).await
    }

    async fn delete(&self, id: &MessageId) -> Result<(), StoreError> {
        if self.deletes_limited.load(Ordering::SeqCst) {
            let allowed = self.deletes_before_failure.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |left| left.checked_sub(1),
            );
            if allowed.is_err() {
                return Err(Self::injected("delete"));
            }
        }
        self.inner.delete(id).await
    }

    async fn mark_read(&self, reader: &UserId, ids: &[MessageId]) -> Result<usize, StoreError> {
        self.inner.mark_read(reader, ids).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}
