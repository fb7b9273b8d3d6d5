use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;

use crate::chat_list::ConversationList;
use crate::config::{QuadchatConfig, StoreBackend};
use crate::database::Database;
use crate::error::{QuadchatError, Result};
use crate::identity::SessionIdentity;
use crate::init_tracing;
use crate::session::ChatSession;
use crate::store::{ConversationStore, InMemoryStore, SqliteStore};

/// Process-wide handle to the conversation store.
///
/// Created once by the shell and handed to every chat window and inbox. Nothing in
/// the crate reaches for a global; sessions and lists get the store and identity
/// from here.
pub struct ConnectionHandle {
    config: QuadchatConfig,
    store: Arc<dyn ConversationStore>,
    identity: Arc<SessionIdentity>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("config", &self.config)
            .field("store", &"<REDACTED>")
            .field("identity", &self.identity)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ConnectionHandle {
    /// Sets up directories and logging, then opens the configured store.
    pub async fn init(config: QuadchatConfig) -> Result<Self> {
        let data_dir = &config.data_dir;
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))
            .map_err(QuadchatError::from)?;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(QuadchatError::from)?;

        init_tracing(logs_dir)?;

        tracing::debug!(
            target: "quadchat::connection::init",
            "Logging initialized in directory: {:?}",
            logs_dir
        );

        let store: Arc<dyn ConversationStore> = match config.backend {
            StoreBackend::InMemory => {
                Arc::new(InMemoryStore::with_stream_buffer(config.stream_buffer))
            }
            StoreBackend::Sqlite => {
                let database = Arc::new(Database::new(config.database_path()).await?);
                Arc::new(SqliteStore::new(database, config.stream_buffer).await?)
            }
        };

        tracing::info!(
            target: "quadchat::connection::init",
            "Connection ready with {:?} store",
            config.backend
        );

        Ok(Self::with_store(config, store))
    }

    /// Wraps an existing store without touching the filesystem or logging.
    pub fn with_store(config: QuadchatConfig, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            config,
            store,
            identity: Arc::new(SessionIdentity::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QuadchatConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<SessionIdentity> {
        &self.identity
    }

    pub fn store(&self) -> Result<Arc<dyn ConversationStore>> {
        self.ensure_open()?;
        Ok(self.store.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuadchatError::ConnectionClosed);
        }
        Ok(())
    }

    /// A fresh controller for one chat window.
    pub fn open_session(&self) -> Result<ChatSession> {
        self.ensure_open()?;
        Ok(ChatSession::new(
            self.store.clone(),
            self.identity.clone(),
            self.config.send_failure_policy,
        ))
    }

    /// Starts the inbox for the signed-in user.
    pub async fn conversation_list(&self) -> Result<ConversationList> {
        self.ensure_open()?;
        ConversationList::start(
            self.store.clone(),
            self.identity.clone(),
            self.config.initial_reveal,
            self.config.reveal_step,
        )
        .await
    }

    /// Closes every live query and the store. Later calls are no-ops.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.store.shutdown().await;
        tracing::info!(target: "quadchat::connection::teardown", "Connection torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SendOutcome;
    use crate::store::MessageDraft;
    use crate::test_utils::{uid, wait_until};
    use tempfile::TempDir;

    fn create_test_config(backend: StoreBackend) -> (QuadchatConfig, TempDir, TempDir) {
        let data_temp_dir = TempDir::new().expect("Failed to create temp data dir");
        let logs_temp_dir = TempDir::new().expect("Failed to create temp logs dir");
        let config = QuadchatConfig::new(data_temp_dir.path(), logs_temp_dir.path())
            .with_backend(backend);
        (config, data_temp_dir, logs_temp_dir)
    }

    #[tokio::test]
    async fn test_init_creates_directories() {
        let (config, _data, _logs) = create_test_config(StoreBackend::InMemory);
        let connection = ConnectionHandle::init(config.clone()).await.unwrap();

        assert!(config.data_dir.exists());
        assert!(config.logs_dir.exists());
        assert!(connection.store().is_ok());
    }

    #[tokio::test]
    async fn test_sqlite_backend_persists_across_connections() {
        let (config, _data, _logs) = create_test_config(StoreBackend::Sqlite);

        let first = ConnectionHandle::init(config.clone()).await.unwrap();
        first
            .store()
            .unwrap()
            .append(MessageDraft::new(uid("a"), uid("b"), "kept").unwrap())
            .await
            .unwrap();
        first.teardown().await;
        assert!(config.database_path().exists());

        let second = ConnectionHandle::init(config).await.unwrap();
        let snapshot = second.store().unwrap().snapshot(&uid("b")).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "kept");
    }

    #[tokio::test]
    async fn test_session_and_inbox_share_store() {
        let (config, _data, _logs) = create_test_config(StoreBackend::InMemory);
        let connection = ConnectionHandle::init(config).await.unwrap();
        connection.identity().sign_in("a");

        let inbox = connection.conversation_list().await.unwrap();
        let session = connection.open_session().unwrap();
        session.open("b").await.unwrap();

        assert!(matches!(
            session.send("hi").await.unwrap(),
            SendOutcome::Sent(_)
        ));
        wait_until(|| inbox.state().summaries.len() == 1).await;
        assert_eq!(inbox.visible()[0].last_message, "hi");
    }

    #[tokio::test]
    async fn test_teardown_rejects_new_work() {
        let (config, _data, _logs) = create_test_config(StoreBackend::InMemory);
        let connection = ConnectionHandle::init(config).await.unwrap();
        connection.identity().sign_in("a");

        connection.teardown().await;
        connection.teardown().await;

        assert!(matches!(
            connection.open_session(),
            Err(QuadchatError::ConnectionClosed)
        ));
        assert!(matches!(
            connection.conversation_list().await,
            Err(QuadchatError::ConnectionClosed)
        ));
    }
}
