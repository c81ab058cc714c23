use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{ChatError, ChatResult, MessageStore};
use parley_protocol::{Message, MessageId, UserId};
use sqlx::FromRow;
use tracing::debug;

use crate::StoragePool;

/// [`MessageStore`] backed by the `messages` table.
#[derive(Clone, Debug)]
pub struct PgMessageStore {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: i64,
    sender_id: String,
    recipient_id: String,
    text: String,
    created_at: DateTime<Utc>,
    read: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            sender_id: UserId(row.sender_id),
            recipient_id: UserId(row.recipient_id),
            text: row.text,
            created_at: row.created_at,
            read: row.read,
        }
    }
}

fn storage_error(err: sqlx::Error) -> ChatError {
    ChatError::persistence(err)
}

impl PgMessageStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create(&self, sender: &UserId, recipient: &UserId, text: &str) -> ChatResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (sender_id, recipient_id, text)
            VALUES ($1, $2, $3)
            RETURNING id, sender_id, recipient_id, text, created_at, read
            "#,
        )
        .bind(sender.as_str())
        .bind(recipient.as_str())
        .bind(text)
        .fetch_one(self.pool.pool())
        .await
        .map_err(storage_error)?;

        debug!(id = row.id, "Message row inserted");
        Ok(row.into())
    }

    async fn find_by_id(&self, id: MessageId) -> ChatResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, recipient_id, text, created_at, read
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(storage_error)?;
        Ok(row.map(Message::from))
    }

    async fn find_conversation(&self, a: &UserId, b: &UserId) -> ChatResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, recipient_id, text, created_at, read
            FROM messages
            WHERE (sender_id = $1 AND recipient_id = $2)
               OR (sender_id = $2 AND recipient_id = $1)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .fetch_all(self.pool.pool())
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn find_all_for_user(&self, user: &UserId) -> ChatResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, recipient_id, text, created_at, read
            FROM messages
            WHERE sender_id = $1 OR recipient_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user.as_str())
        .fetch_all(self.pool.pool())
        .await
        .map_err(storage_error)?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn mark_read(&self, sender: &UserId, recipient: &UserId) -> ChatResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET read = true
            WHERE sender_id = $1 AND recipient_id = $2 AND read = false
            "#,
        )
        .bind(sender.as_str())
        .bind(recipient.as_str())
        .execute(self.pool.pool())
        .await
        .map_err(storage_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_by_id(&self, id: MessageId) -> ChatResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            DELETE FROM messages
            WHERE id = $1
            RETURNING id, sender_id, recipient_id, text, created_at, read
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(storage_error)?;

        row.map(Message::from).ok_or(ChatError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIGRATOR;
    use sqlx::postgres::PgPoolOptions;
    use std::env;

    async fn store() -> anyhow::Result<Option<PgMessageStore>> {
        let Ok(database_url) = env::var("PARLEY_TEST_DATABASE_URL") else {
            eprintln!("skipping Postgres store test: set PARLEY_TEST_DATABASE_URL");
            return Ok(None);
        };
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&database_url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Some(PgMessageStore::new(StoragePool::new(pool))))
    }

    fn unique(prefix: &str) -> UserId {
        UserId::new(format!(
            "{prefix}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[tokio::test]
    async fn conversation_lifecycle_when_database_available() -> anyhow::Result<()> {
        let Some(store) = store().await? else {
            return Ok(());
        };
        let alice = unique("alice");
        let bob = unique("bob");

        let first = store.create(&alice, &bob, "first").await?;
        let second = store.create(&bob, &alice, "second").await?;
        assert!(second.id > first.id);
        assert!(!first.read);

        let conversation = store.find_conversation(&bob, &alice).await?;
        let texts: Vec<_> = conversation.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["first", "second"]);

        assert_eq!(store.mark_read(&alice, &bob).await?, 1);
        assert_eq!(store.mark_read(&alice, &bob).await?, 0);
        assert!(store.find_by_id(first.id).await?.map(|m| m.read).unwrap_or(false));

        let removed = store.delete_by_id(second.id).await?;
        assert_eq!(removed.text, "second");
        assert_eq!(
            store.delete_by_id(second.id).await,
            Err(ChatError::NotFound(second.id))
        );
        assert_eq!(store.find_all_for_user(&bob).await?.len(), 1);
        Ok(())
    }
}
