//! Postgres 消息仓储

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::domain::model::{ChatMessage, ConversationKind, DeliveryStatus};
use crate::domain::repository::MessageRepository;
use crate::error::{ImError, Result};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS im_messages (
        message_id        BIGINT PRIMARY KEY,
        conversation_id   TEXT NOT NULL,
        sender_id         BIGINT NOT NULL,
        receiver_id       BIGINT NOT NULL,
        conversation_kind TEXT NOT NULL,
        content_type      INTEGER NOT NULL,
        content           TEXT NOT NULL,
        client_msg_no     TEXT,
        extra             TEXT,
        sequence_number   BIGINT,
        created_at        TIMESTAMPTZ NOT NULL,
        delivery_status   TEXT NOT NULL,
        read_status       BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_im_messages_conversation_seq
        ON im_messages (conversation_id, sequence_number)
    "#,
];

const SELECT_COLUMNS: &str = "message_id, conversation_id, sender_id, receiver_id, \
     conversation_kind, content_type, content, client_msg_no, extra, sequence_number, \
     created_at, delivery_status, read_status";

pub struct PostgresMessageRepository {
    pool: PgPool,
}

impl PostgresMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// 建表（幂等）
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        info!("message schema ensured");
        Ok(())
    }

    fn row_to_message(row: &PgRow) -> Result<ChatMessage> {
        let kind: String = row.try_get("conversation_kind")?;
        let status: String = row.try_get("delivery_status")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(ChatMessage {
            message_id: row.try_get("message_id")?,
            conversation_id: row.try_get("conversation_id")?,
            sender_id: row.try_get("sender_id")?,
            receiver_id: row.try_get("receiver_id")?,
            conversation_kind: ConversationKind::parse(&kind)
                .ok_or_else(|| ImError::Storage(format!("unknown conversation kind {kind}")))?,
            content_type: row.try_get("content_type")?,
            content: row.try_get("content")?,
            client_msg_no: row.try_get("client_msg_no")?,
            extra: row.try_get("extra")?,
            sequence_number: row.try_get("sequence_number")?,
            timestamp: created_at,
            delivery_status: DeliveryStatus::parse(&status)
                .ok_or_else(|| ImError::Storage(format!("unknown delivery status {status}")))?,
            read: row.try_get("read_status")?,
        })
    }
}

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    async fn save_message(&self, message: &ChatMessage) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO im_messages (
                message_id, conversation_id, sender_id, receiver_id, conversation_kind,
                content_type, content, client_msg_no, extra, sequence_number,
                created_at, delivery_status, read_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message.message_id)
        .bind(&message.conversation_id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(message.conversation_kind.as_str())
        .bind(message.content_type)
        .bind(&message.content)
        .bind(&message.client_msg_no)
        .bind(&message.extra)
        .bind(message.sequence_number)
        .bind(message.timestamp)
        .bind(message.delivery_status.as_str())
        .bind(message.read)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_message(&self, message_id: i64) -> Result<Option<ChatMessage>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM im_messages WHERE message_id = $1");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn mark_read(&self, reader_id: i64, message_ids: &[i64]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE im_messages SET read_status = TRUE \
             WHERE message_id = ANY($1) AND receiver_id = $2 AND conversation_kind = $3 \
             AND read_status = FALSE",
        )
        .bind(message_ids)
        .bind(reader_id)
        .bind(ConversationKind::Private.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_delivery_status(&self, message_id: i64, status: DeliveryStatus) -> Result<()> {
        let allowed_from: Vec<String> = [
            DeliveryStatus::Sending,
            DeliveryStatus::Pushed,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
        ]
        .into_iter()
        .filter(|from| from.can_advance_to(status))
        .map(|from| from.as_str().to_string())
        .collect();

        sqlx::query(
            "UPDATE im_messages SET delivery_status = $2 \
             WHERE message_id = $1 AND delivery_status = ANY($3)",
        )
        .bind(message_id)
        .bind(status.as_str())
        .bind(allowed_from)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn max_sequence(&self, conversation_id: &str) -> Result<i64> {
        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM im_messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn list_recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM im_messages WHERE conversation_id = $1 \
             ORDER BY sequence_number DESC NULLS LAST LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut messages = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}
