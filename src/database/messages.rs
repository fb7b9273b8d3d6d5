use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use super::{
    Database, DatabaseError,
    utils::{create_column_decode_error, parse_timestamp},
};
use crate::store::{Message, Participants};
use crate::types::{MessageId, UserId};

type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug)]
struct MessageRow {
    message: Message,
}

impl<'r, R> sqlx::FromRow<'r, R> for MessageRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    bool: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let sender_id = UserId::new(row.try_get::<String, _>("sender_id")?);
        let receiver_id = UserId::new(row.try_get::<String, _>("receiver_id")?);

        let participants = Participants::new(sender_id.clone(), receiver_id.clone())
            .map_err(|e| create_column_decode_error("receiver_id", &e.to_string()))?;

        let content: String = row.try_get("content")?;
        let timestamp = parse_timestamp(row, "timestamp")?;
        let read: bool = row.try_get("read")?;

        Ok(Self {
            message: Message {
                id: MessageId::from(id),
                sender_id,
                receiver_id,
                participants,
                content,
                timestamp,
                read,
            },
        })
    }
}

/// Sender and receiver of a row touched by a DELETE or UPDATE.
#[derive(Debug, sqlx::FromRow)]
struct TouchedRow {
    id: String,
    sender_id: String,
    receiver_id: String,
}

impl TouchedRow {
    fn into_parts(self) -> (MessageId, [UserId; 2]) {
        (
            MessageId::from(self.id),
            [UserId::new(self.sender_id), UserId::new(self.receiver_id)],
        )
    }
}

impl Message {
    pub(crate) async fn insert(&self, database: &Database) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages
             (id, sender_id, receiver_id, conversation_key, content, timestamp, read)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.id.as_str())
        .bind(self.sender_id.as_str())
        .bind(self.receiver_id.as_str())
        .bind(self.participants.conversation_key())
        .bind(&self.content)
        .bind(self.timestamp.timestamp_millis())
        .bind(self.read)
        .execute(&database.pool)
        .await?;

        Ok(())
    }

    /// All messages whose participants contain `participant`, oldest first.
    pub(crate) async fn find_by_participant(
        participant: &UserId,
        database: &Database,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, sender_id, receiver_id, content, timestamp, read
             FROM messages
             WHERE sender_id = ? OR receiver_id = ?
             ORDER BY timestamp ASC, seq ASC",
        )
        .bind(participant.as_str())
        .bind(participant.as_str())
        .fetch_all(&database.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.message).collect())
    }

    #[cfg(test)]
    pub(crate) async fn count_by_conversation(
        participants: &Participants,
        database: &Database,
    ) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_key = ?")
                .bind(participants.conversation_key())
                .fetch_one(&database.pool)
                .await?;
        Ok(count)
    }

    /// Deletes one message, returning its participants when it existed.
    pub(crate) async fn delete_by_id(
        id: &MessageId,
        database: &Database,
    ) -> Result<Option<[UserId; 2]>> {
        let row = sqlx::query_as::<_, TouchedRow>(
            "DELETE FROM messages WHERE id = ? RETURNING id, sender_id, receiver_id",
        )
        .bind(id.as_str())
        .fetch_optional(&database.pool)
        .await?;

        Ok(row.map(|r| r.into_parts().1))
    }

    /// Marks the given unread messages addressed to `reader` as read.
    pub(crate) async fn mark_read_by_receiver(
        reader: &UserId,
        ids: &[MessageId],
        database: &Database,
    ) -> Result<Vec<(MessageId, [UserId; 2])>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE messages SET read = 1 WHERE read = 0 AND receiver_id = ");
        builder.push_bind(reader.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(") RETURNING id, sender_id, receiver_id");

        let rows = builder
            .build_query_as::<TouchedRow>()
            .fetch_all(&database.pool)
            .await?;

        Ok(rows.into_iter().map(TouchedRow::into_parts).collect())
    }

    /// Timestamp of the newest stored message, if any.
    pub(crate) async fn latest_timestamp(database: &Database) -> Result<Option<DateTime<Utc>>> {
        let (latest,): (Option<i64>,) = sqlx::query_as("SELECT MAX(timestamp) FROM messages")
            .fetch_one(&database.pool)
            .await?;

        match latest {
            None => Ok(None),
            Some(ms) => DateTime::from_timestamp_millis(ms)
                .map(Some)
                .ok_or(DatabaseError::InvalidTimestamp { timestamp: ms }),
        }
    }
}
