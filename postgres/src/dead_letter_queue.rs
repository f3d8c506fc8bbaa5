//! Dead Letter Queue (DLQ) for messages that cannot be decoded.
//!
//! When the processor runs with a dead-letter poison policy, a message whose envelope or
//! entity snapshot keeps failing to decode is written to `failed_messages` and its offset
//! is committed, so one bad record cannot stall the partition. Operators inspect and close
//! entries through [`DeadLetterQueue`].

use crate::user_store::map_sqlx_error;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use user_sync_core::{FailedMessage, MessagePosition, StoreError};

/// Status of a parked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation
    Pending,
    /// Fixed upstream and replayed by an operator
    Resolved,
    /// Permanently discarded
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Query(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The message that failed, with its broker position
    pub message: FailedMessage,

    /// Current status
    pub status: DLQStatus,

    /// When the message was parked
    pub failed_at: DateTime<Utc>,

    /// When the entry was closed (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// Insert a parked message within the caller's transaction.
pub(crate) async fn insert_entry(
    conn: &mut PgConnection,
    failed: &FailedMessage,
) -> Result<i64, StoreError> {
    let attempts = i32::try_from(failed.attempts).unwrap_or(i32::MAX);

    let (id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO failed_messages (
            topic, kafka_partition, kafka_offset, payload, error_message, attempts
        ) VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        ",
    )
    .bind(&failed.position.topic)
    .bind(failed.position.partition)
    .bind(failed.position.offset)
    .bind(failed.payload.as_deref())
    .bind(&failed.error)
    .bind(attempts)
    .fetch_one(conn)
    .await
    .map_err(map_sqlx_error)?;

    tracing::warn!(
        dlq_id = id,
        position = %failed.position,
        error = %failed.error,
        attempts = failed.attempts,
        "Message added to Dead Letter Queue"
    );

    metrics::counter!("user_sync.dlq.added").increment(1);

    Ok(id)
}

/// Operator view over the `failed_messages` table.
///
/// # Example
///
/// ```no_run
/// use user_sync_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for entry in dlq.list_pending(100).await? {
///     println!("{} failed: {}", entry.message.position, entry.message.error);
/// }
/// # Ok(())
/// # }
/// ```
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r"
            SELECT
                id, topic, kafka_partition, kafka_offset, payload, error_message,
                attempts, status, failed_at, resolved_at, resolution_notes
            FROM failed_messages
            WHERE status = $1
            ORDER BY failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Get a specific entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the query fails or the entry does not exist.
    pub async fn get_by_id(&self, id: i64) -> Result<DeadLetterEntry, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, topic, kafka_partition, kafka_offset, payload, error_message,
                attempts, status, failed_at, resolved_at, resolution_notes
            FROM failed_messages
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Self::row_to_entry(&row)
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the update fails.
    pub async fn mark_resolved(&self, id: i64, notes: Option<&str>) -> Result<(), StoreError> {
        self.close(id, DLQStatus::Resolved, notes).await?;

        tracing::info!(dlq_id = id, "DLQ entry marked as resolved");
        metrics::counter!("user_sync.dlq.resolved").increment(1);

        Ok(())
    }

    /// Mark an entry as permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        self.close(id, DLQStatus::Discarded, Some(reason)).await?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");
        metrics::counter!("user_sync.dlq.discarded").increment(1);

        Ok(())
    }

    /// Get count of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(count)
    }

    async fn close(&self, id: i64, status: DLQStatus, notes: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = $1,
                resolved_at = NOW(),
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(status.as_str())
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, StoreError> {
        let status_str: String = row.get("status");
        let attempts: i32 = row.get("attempts");

        Ok(DeadLetterEntry {
            id: row.get("id"),
            message: FailedMessage {
                position: MessagePosition::new(
                    row.get::<String, _>("topic"),
                    row.get("kafka_partition"),
                    row.get("kafka_offset"),
                ),
                payload: row.get("payload"),
                error: row.get("error_message"),
                attempts: u32::try_from(attempts).unwrap_or_default(),
            },
            status: DLQStatus::parse(&status_str)?,
            failed_at: row.get("failed_at"),
            resolved_at: row.get("resolved_at"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}
