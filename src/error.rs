use crate::database::DatabaseError;
use crate::store::{StoreError, ValidationError};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, QuadchatError>;

#[derive(Error, Debug)]
pub enum QuadchatError {
    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection not initialized or already torn down")]
    ConnectionClosed,

    #[error("Identity has not been resolved yet")]
    IdentityUnresolved,

    #[error("User is not authenticated")]
    NotAuthenticated,

    #[error("No peer selected")]
    NoPeerSelected,

    #[error("Cannot open a conversation with yourself")]
    SelfConversation,

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Failed to write message: {0}")]
    Write(#[source] StoreError),

    #[error("Failed to clear conversation: {failed} of {attempted} deletions failed")]
    Clear { failed: usize, attempted: usize },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
