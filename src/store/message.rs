use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MessageId, UserId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("sender and receiver are the same user: {0}")]
    SameParticipant(UserId),
}

/// The unordered pair of users a message belongs to.
///
/// Always holds exactly two distinct ids. They are kept sorted so two pairs built
/// from the same users in either order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participants([UserId; 2]);

impl Participants {
    pub fn new(a: UserId, b: UserId) -> Result<Self, ValidationError> {
        if a == b {
            return Err(ValidationError::SameParticipant(a));
        }
        if a < b { Ok(Self([a, b])) } else { Ok(Self([b, a])) }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.0.contains(user)
    }

    /// The participant that is not `user`, or `None` when `user` is not in the pair.
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        match &self.0 {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserId> {
        self.0.iter()
    }

    /// Stable key naming the conversation between the two participants.
    pub fn conversation_key(&self) -> String {
        format!("{}|{}", self.0[0], self.0[1])
    }
}

/// A single direct message as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub participants: Participants,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    /// True when this message belongs to the conversation between `a` and `b`.
    pub fn involves(&self, a: &UserId, b: &UserId) -> bool {
        self.participants.contains(a) && self.participants.contains(b)
    }

    pub fn is_unread_for(&self, user: &UserId) -> bool {
        &self.receiver_id == user && !self.read
    }
}

/// What a writer hands to [`ConversationStore::append`](super::ConversationStore::append).
///
/// The store assigns the id, the timestamp and the initial `read = false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    sender_id: UserId,
    receiver_id: UserId,
    participants: Participants,
    content: String,
}

impl MessageDraft {
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        content: impl AsRef<str>,
    ) -> Result<Self, ValidationError> {
        let content = content.as_ref().trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let participants = Participants::new(sender_id.clone(), receiver_id.clone())?;

        Ok(Self {
            sender_id,
            receiver_id,
            participants,
            content: content.to_string(),
        })
    }

    pub fn sender_id(&self) -> &UserId {
        &self.sender_id
    }

    pub fn receiver_id(&self) -> &UserId {
        &self.receiver_id
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub(crate) fn into_message(self, id: MessageId, timestamp: DateTime<Utc>) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            participants: self.participants,
            content: self.content,
            timestamp,
            read: false,
        }
    }
}
