//! Session identity as seen by the messaging core.
//!
//! Authentication itself happens elsewhere. The shell feeds the outcome into a
//! [`SessionIdentity`] and every session and conversation list reads the current
//! user from it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{QuadchatError, Result};
use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    /// The provider has not yet determined whether anyone is signed in.
    Resolving,
    SignedOut,
    SignedIn(UserId),
}

impl AuthState {
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            AuthState::SignedIn(uid) => Some(uid),
            _ => None,
        }
    }

    /// The signed-in user, or the reason there is none.
    pub fn require_user(&self) -> Result<UserId> {
        match self {
            AuthState::SignedIn(uid) => Ok(uid.clone()),
            AuthState::Resolving => Err(QuadchatError::IdentityUnresolved),
            AuthState::SignedOut => Err(QuadchatError::NotAuthenticated),
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    fn auth_state(&self) -> AuthState;

    /// Receiver that observes every auth state change.
    fn watch(&self) -> watch::Receiver<AuthState>;

    fn current_user_id(&self) -> Option<UserId> {
        self.auth_state().user_id().cloned()
    }
}

/// Identity provider driven by the embedding shell.
#[derive(Debug)]
pub struct SessionIdentity {
    state: watch::Sender<AuthState>,
}

impl SessionIdentity {
    /// Starts in [`AuthState::Resolving`].
    pub fn new() -> Self {
        let (state, _) = watch::channel(AuthState::Resolving);
        Self { state }
    }

    pub fn sign_in(&self, user_id: impl Into<UserId>) {
        let user_id = user_id.into();
        tracing::info!(target: "quadchat::identity", "Signed in as {}", user_id);
        self.state.send_replace(AuthState::SignedIn(user_id));
    }

    pub fn sign_out(&self) {
        tracing::info!(target: "quadchat::identity", "Signed out");
        self.state.send_replace(AuthState::SignedOut);
    }

    pub fn mark_resolving(&self) {
        self.state.send_replace(AuthState::Resolving);
    }
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for SessionIdentity {
    fn auth_state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }
}
