//! Durable-cursor event log adapter.
//!
//! Events live in `subscription_events`: the `BIGSERIAL` primary key is
//! the global log position, and `(stream_id, sequence)` is unique so a
//! stream's sequence numbers stay strictly increasing. Cursors live in
//! `subscription_cursors` and are advanced only by ACK; NACK(RETRY)
//! discards the session's read-ahead so the next poll re-reads from the
//! durable position, which is what redelivers the message.

use std::collections::VecDeque;

use async_trait::async_trait;
use modsub::event::EventEnvelope;
use modsub::log::{EventLog, EventLogError, EventLogStream, LogMessage, NackAction};
use modsub::types::{CursorName, LogPosition, SequenceNumber, StreamId};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, warn};

use crate::PostgresConfig;

/// `EventLog` backed by `PostgreSQL` tables.
#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
    config: PostgresConfig,
}

impl PostgresEventLog {
    /// Creates the adapter over an existing pool.
    pub fn new(pool: PgPool, config: PostgresConfig) -> Self {
        Self { pool, config }
    }

    /// Idempotent table setup, run once at startup.
    #[instrument(name = "eventlog.ensure_schema", skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), EventLogError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subscription_events (
                position    BIGSERIAL    PRIMARY KEY,
                stream_id   VARCHAR(255) NOT NULL,
                sequence    BIGINT       NOT NULL,
                event_type  VARCHAR(255) NOT NULL,
                payload     BYTEA        NOT NULL,
                recorded_at TIMESTAMPTZ  NOT NULL DEFAULT now(),
                UNIQUE (stream_id, sequence)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| EventLogError::Connection(err.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subscription_cursors (
                name           VARCHAR(255) PRIMARY KEY,
                stream_prefix  VARCHAR(255) NOT NULL,
                acked_position BIGINT       NOT NULL DEFAULT 0,
                created_at     TIMESTAMPTZ  NOT NULL DEFAULT now(),
                updated_at     TIMESTAMPTZ  NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| EventLogError::Connection(err.to_string()))?;

        debug!("event log schema is in place");
        Ok(())
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(name = "eventlog.append", skip(self, payload), fields(stream = %stream_id, event_type))]
    async fn append(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        payload: Vec<u8>,
    ) -> Result<SequenceNumber, EventLogError> {
        // The next per-stream sequence is computed in the same statement;
        // a concurrent appender to the same stream loses on the
        // (stream_id, sequence) unique constraint.
        let row = sqlx::query(
            "INSERT INTO subscription_events (stream_id, sequence, event_type, payload)
             VALUES (
                 $1,
                 (SELECT COALESCE(MAX(sequence), 0) + 1
                  FROM subscription_events WHERE stream_id = $1),
                 $2,
                 $3
             )
             RETURNING sequence",
        )
        .bind(stream_id.as_ref())
        .bind(event_type)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            let detail = match err.as_database_error() {
                Some(db) if db.is_unique_violation() => {
                    "concurrent append to the same stream, retry".to_string()
                }
                _ => err.to_string(),
            };
            EventLogError::Append {
                stream_id: stream_id.clone(),
                detail,
            }
        })?;

        let sequence: i64 = row.try_get("sequence").map_err(|err| EventLogError::Append {
            stream_id: stream_id.clone(),
            detail: err.to_string(),
        })?;

        u64::try_from(sequence)
            .ok()
            .and_then(|raw| SequenceNumber::try_new(raw).ok())
            .ok_or_else(|| EventLogError::InvalidRecord(format!("sequence {sequence} out of range")))
    }

    #[instrument(name = "eventlog.create_cursor", skip(self), fields(cursor = %name))]
    async fn create_cursor(
        &self,
        name: &CursorName,
        stream_prefix: &str,
    ) -> Result<(), EventLogError> {
        sqlx::query("INSERT INTO subscription_cursors (name, stream_prefix) VALUES ($1, $2)")
            .bind(name.as_ref())
            .bind(stream_prefix)
            .execute(&self.pool)
            .await
            .map_err(|err| match err.as_database_error() {
                Some(db) if db.is_unique_violation() => {
                    EventLogError::CursorAlreadyExists(name.clone())
                }
                _ => EventLogError::CursorSetup(err.to_string()),
            })?;
        Ok(())
    }

    #[instrument(name = "eventlog.connect", skip(self), fields(cursor = %name))]
    async fn connect(&self, name: &CursorName) -> Result<Box<dyn EventLogStream>, EventLogError> {
        let row = sqlx::query(
            "SELECT stream_prefix, acked_position FROM subscription_cursors WHERE name = $1",
        )
        .bind(name.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| EventLogError::Connection(err.to_string()))?
        .ok_or_else(|| EventLogError::UnknownCursor(name.clone()))?;

        let stream_prefix: String = row
            .try_get("stream_prefix")
            .map_err(|err| EventLogError::Connection(err.to_string()))?;
        let acked_position: i64 = row
            .try_get("acked_position")
            .map_err(|err| EventLogError::Connection(err.to_string()))?;

        Ok(Box::new(PostgresLogStream {
            pool: self.pool.clone(),
            config: self.config.clone(),
            name: name.clone(),
            like_pattern: like_prefix_pattern(&stream_prefix),
            acked: acked_position,
            buffer: VecDeque::new(),
        }))
    }
}

/// A connected receive session polling the events table.
struct PostgresLogStream {
    pool: PgPool,
    config: PostgresConfig,
    name: CursorName,
    like_pattern: String,
    // Durable position as last persisted by ACK.
    acked: i64,
    // Read-ahead of delivered-but-unsettled events.
    buffer: VecDeque<EventEnvelope>,
}

impl PostgresLogStream {
    async fn poll_batch(&mut self) -> Result<(), sqlx::Error> {
        let after = self
            .buffer
            .back()
            .map_or(self.acked, |event| position_to_i64(event.position));

        let rows = sqlx::query(
            "SELECT position, stream_id, sequence, event_type, payload
             FROM subscription_events
             WHERE position > $1 AND stream_id LIKE $2
             ORDER BY position
             LIMIT $3",
        )
        .bind(after)
        .bind(&self.like_pattern)
        .bind(self.config.read_batch_size)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let position: i64 = row.try_get("position")?;
            let stream_id: String = row.try_get("stream_id")?;
            let sequence: i64 = row.try_get("sequence")?;
            let event_type: String = row.try_get("event_type")?;
            let payload: Vec<u8> = row.try_get("payload")?;

            match envelope_from_columns(position, &stream_id, sequence, event_type, payload) {
                Ok(envelope) => self.buffer.push_back(envelope),
                // A record we cannot map is unrecoverable through this
                // session; surface it as a dropped subscription.
                Err(err) => return Err(sqlx::Error::Decode(err.to_string().into())),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventLogStream for PostgresLogStream {
    async fn recv(&mut self) -> LogMessage {
        loop {
            if let Some(envelope) = self.buffer.pop_front() {
                return LogMessage::Event(envelope);
            }

            if let Err(err) = self.poll_batch().await {
                warn!(cursor = %self.name, error = %err, "event poll failed, dropping subscription");
                return LogMessage::Dropped {
                    reason: err.to_string(),
                };
            }

            if self.buffer.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    async fn ack(&mut self, envelope: &EventEnvelope) -> Result<(), EventLogError> {
        let position = position_to_i64(envelope.position);

        let result = sqlx::query(
            "UPDATE subscription_cursors
             SET acked_position = GREATEST(acked_position, $2), updated_at = now()
             WHERE name = $1",
        )
        .bind(self.name.as_ref())
        .bind(position)
        .execute(&self.pool)
        .await
        .map_err(|err| EventLogError::AckTransport(err.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(EventLogError::AckTransport(format!(
                "cursor '{}' no longer exists",
                self.name
            )));
        }

        self.acked = self.acked.max(position);
        Ok(())
    }

    async fn nack(
        &mut self,
        envelope: &EventEnvelope,
        reason: &str,
        action: NackAction,
    ) -> Result<(), EventLogError> {
        debug!(
            cursor = %self.name,
            position = %envelope.position,
            %reason,
            ?action,
            "discarding read-ahead for redelivery"
        );
        // The next poll restarts from the durable acked position, so the
        // nacked event is re-read in order.
        self.buffer.clear();
        Ok(())
    }
}

/// Escapes LIKE metacharacters and appends the wildcard.
fn like_prefix_pattern(prefix: &str) -> String {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{escaped}%")
}

fn position_to_i64(position: LogPosition) -> i64 {
    i64::try_from(u64::from(position)).unwrap_or(i64::MAX)
}

/// Maps raw column values back into an envelope.
fn envelope_from_columns(
    position: i64,
    stream_id: &str,
    sequence: i64,
    event_type: String,
    payload: Vec<u8>,
) -> Result<EventEnvelope, EventLogError> {
    let stream_id = StreamId::try_new(stream_id)
        .map_err(|err| EventLogError::InvalidRecord(format!("stored stream_id invalid: {err}")))?;
    let sequence = u64::try_from(sequence)
        .ok()
        .and_then(|raw| SequenceNumber::try_new(raw).ok())
        .ok_or_else(|| EventLogError::InvalidRecord(format!("stored sequence invalid: {sequence}")))?;
    let position = u64::try_from(position)
        .ok()
        .and_then(|raw| LogPosition::try_new(raw).ok())
        .ok_or_else(|| EventLogError::InvalidRecord(format!("stored position invalid: {position}")))?;

    Ok(EventEnvelope::new(
        stream_id, sequence, position, event_type, payload,
    ))
}
