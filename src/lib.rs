//! Real-time direct messaging core.
//!
//! A [`ConnectionHandle`] owns the conversation store. Each chat window drives a
//! [`ChatSession`] and the inbox drives a [`ConversationList`]; both read through a
//! single live query per signed-in user and publish their state on watch channels.

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod chat_list;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod identity;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use crate::chat_list::{ChatListState, ConversationList, PeerSummary, aggregate};
pub use crate::config::{QuadchatConfig, SendFailurePolicy, StoreBackend};
pub use crate::connection::ConnectionHandle;
pub use crate::error::{QuadchatError, Result};
pub use crate::identity::{AuthState, IdentityProvider, SessionIdentity};
pub use crate::session::{
    ChatSession, SendOutcome, SessionError, SessionPhase, SessionState, SkipReason,
};
pub use crate::store::{
    ConversationStore, InMemoryStore, Message, MessageDraft, SqliteStore, bulk_delete,
};
pub use crate::types::{MessageId, UserId};

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceLock::new();
static TRACING_INIT: Mutex<bool> = Mutex::new(false);

/// Installs the stdout and daily-rotated file log layers.
///
/// Only the first call has any effect. When the host process already installed a
/// global subscriber that one is kept and the file layer is skipped.
pub fn init_tracing(logs_dir: &Path) -> Result<()> {
    let mut initialized = TRACING_INIT
        .lock()
        .map_err(|_| QuadchatError::LoggingSetup("tracing init lock poisoned".to_string()))?;
    if *initialized {
        return Ok(());
    }

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("quadchat")
        .filename_suffix("log")
        .build(logs_dir)
        .map_err(|e| QuadchatError::LoggingSetup(e.to_string()))?;

    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let stdout_layer = Layer::new()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_target(true);

    let file_layer = Layer::new()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let installed = Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    if installed.is_ok() {
        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();
    }

    *initialized = true;
    Ok(())
}
