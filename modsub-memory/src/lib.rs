//! In-memory adapters for the modsub pipeline.
//!
//! This crate implements the `EventLog` and `ProjectionStore` ports
//! against plain in-process collections, for tests and development where
//! persistence is not required. The event log reproduces the semantics
//! the pipeline depends on: per-stream sequence numbers, a global
//! position order, durable named cursors advanced only by ACK, and
//! redelivery after NACK(RETRY).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use modsub::event::EventEnvelope;
use modsub::log::{EventLog, EventLogError, EventLogStream, LogMessage, NackAction};
use modsub::store::{ProjectionError, ProjectionStore, SubscriptionRow};
use modsub::types::{
    CursorName, LogPosition, ModId, SequenceNumber, StreamId, Timestamp, UserId,
};
use tracing::debug;

/// How long a connected stream sleeps between polls when no event is
/// pending.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct CursorState {
    stream_prefix: String,
    // Global position of the last acknowledged event; 0 = nothing acked.
    acked: u64,
}

#[derive(Debug, Default)]
struct LogInner {
    // Global order; an event's position is its index + 1.
    events: Vec<EventEnvelope>,
    versions: HashMap<StreamId, SequenceNumber>,
    cursors: HashMap<CursorName, CursorState>,
    dropped: Option<String>,
}

/// Thread-safe in-memory event log.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    inner: Arc<Mutex<LogInner>>,
}

impl InMemoryEventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every connected stream observe a drop signal with the given
    /// reason, as if the server closed the subscription.
    pub fn drop_subscriptions(&self, reason: &str) {
        let mut inner = self.inner.lock().expect("log mutex poisoned");
        inner.dropped = Some(reason.to_string());
    }

    /// Clears a previous drop signal so new sessions can be opened.
    pub fn restore_subscriptions(&self) {
        let mut inner = self.inner.lock().expect("log mutex poisoned");
        inner.dropped = None;
    }

    /// Number of events in the log, across all streams.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("log mutex poisoned").events.len()
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        payload: Vec<u8>,
    ) -> Result<SequenceNumber, EventLogError> {
        let mut inner = self.inner.lock().expect("log mutex poisoned");

        let sequence = inner
            .versions
            .get(stream_id)
            .map_or_else(SequenceNumber::first, |current| current.next());
        let position = LogPosition::try_new(inner.events.len() as u64 + 1)
            .expect("positions start at 1 and only grow");

        inner.events.push(EventEnvelope::new(
            stream_id.clone(),
            sequence,
            position,
            event_type.to_string(),
            payload,
        ));
        inner.versions.insert(stream_id.clone(), sequence);

        Ok(sequence)
    }

    async fn create_cursor(
        &self,
        name: &CursorName,
        stream_prefix: &str,
    ) -> Result<(), EventLogError> {
        let mut inner = self.inner.lock().expect("log mutex poisoned");
        if inner.cursors.contains_key(name) {
            return Err(EventLogError::CursorAlreadyExists(name.clone()));
        }
        inner.cursors.insert(
            name.clone(),
            CursorState {
                stream_prefix: stream_prefix.to_string(),
                acked: 0,
            },
        );
        Ok(())
    }

    async fn connect(&self, name: &CursorName) -> Result<Box<dyn EventLogStream>, EventLogError> {
        let inner = self.inner.lock().expect("log mutex poisoned");
        let cursor = inner
            .cursors
            .get(name)
            .ok_or_else(|| EventLogError::UnknownCursor(name.clone()))?;

        Ok(Box::new(InMemoryLogStream {
            log: Arc::clone(&self.inner),
            name: name.clone(),
            delivered: cursor.acked,
        }))
    }
}

/// A receive session over the in-memory log.
///
/// `delivered` is a read-ahead watermark: events up to it have been
/// handed to the consumer but not necessarily acknowledged. NACK rewinds
/// it to the durable acked position, which is what makes redelivery
/// happen.
struct InMemoryLogStream {
    log: Arc<Mutex<LogInner>>,
    name: CursorName,
    delivered: u64,
}

#[async_trait]
impl EventLogStream for InMemoryLogStream {
    async fn recv(&mut self) -> LogMessage {
        loop {
            {
                let inner = self.log.lock().expect("log mutex poisoned");

                if let Some(reason) = &inner.dropped {
                    return LogMessage::Dropped {
                        reason: reason.clone(),
                    };
                }

                let Some(cursor) = inner.cursors.get(&self.name) else {
                    return LogMessage::Dropped {
                        reason: format!("cursor '{}' was removed", self.name),
                    };
                };

                let start = self.delivered.max(cursor.acked) as usize;
                for event in &inner.events[start.min(inner.events.len())..] {
                    // Events outside the cursor's prefix are skipped but
                    // still advance the watermark.
                    self.delivered = u64::from(event.position);
                    if event.stream_id.as_ref().starts_with(&cursor.stream_prefix) {
                        return LogMessage::Event(event.clone());
                    }
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&mut self, envelope: &EventEnvelope) -> Result<(), EventLogError> {
        let mut inner = self.log.lock().expect("log mutex poisoned");
        let cursor = inner.cursors.get_mut(&self.name).ok_or_else(|| {
            EventLogError::AckTransport(format!("cursor '{}' no longer exists", self.name))
        })?;
        cursor.acked = cursor.acked.max(u64::from(envelope.position));
        Ok(())
    }

    async fn nack(
        &mut self,
        envelope: &EventEnvelope,
        reason: &str,
        action: NackAction,
    ) -> Result<(), EventLogError> {
        let inner = self.log.lock().expect("log mutex poisoned");
        let cursor = inner.cursors.get(&self.name).ok_or_else(|| {
            EventLogError::AckTransport(format!("cursor '{}' no longer exists", self.name))
        })?;
        debug!(
            position = %envelope.position,
            %reason,
            ?action,
            "rewinding to acked position for redelivery"
        );
        self.delivered = cursor.acked;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    last_event_id: SequenceNumber,
    created_at: Timestamp,
    updated_at: Timestamp,
    deleted_at: Option<Timestamp>,
}

/// Thread-safe in-memory projection store with soft-delete semantics.
#[derive(Clone, Default)]
pub struct InMemoryProjectionStore {
    rows: Arc<RwLock<HashMap<(UserId, ModId), StoredRow>>>,
}

impl InMemoryProjectionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a soft-deleted row is retained for the key. Test hook.
    pub fn is_soft_deleted(&self, user_id: &UserId, mod_id: &ModId) -> bool {
        self.rows
            .read()
            .expect("rows lock poisoned")
            .get(&(user_id.clone(), mod_id.clone()))
            .is_some_and(|row| row.deleted_at.is_some())
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn ensure_schema(&self) -> Result<(), ProjectionError> {
        Ok(())
    }

    async fn upsert(&self, row: SubscriptionRow) -> Result<(), ProjectionError> {
        let mut rows = self.rows.write().expect("rows lock poisoned");
        let now = Timestamp::now();
        rows.entry((row.user_id, row.mod_id))
            .and_modify(|stored| {
                // The audit marker never moves backwards, even when an
                // older event is redelivered.
                stored.last_event_id = stored.last_event_id.max(row.last_event_id);
                stored.updated_at = now;
                stored.deleted_at = None;
            })
            .or_insert(StoredRow {
                last_event_id: row.last_event_id,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            });
        Ok(())
    }

    async fn delete_by_key(&self, user_id: &UserId, mod_id: &ModId) -> Result<(), ProjectionError> {
        let mut rows = self.rows.write().expect("rows lock poisoned");
        if let Some(stored) = rows.get_mut(&(user_id.clone(), mod_id.clone())) {
            let now = Timestamp::now();
            stored.deleted_at = Some(now);
            stored.updated_at = now;
        }
        // Absent key: deletion is a no-op, not an error.
        Ok(())
    }

    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<SubscriptionRow>, ProjectionError> {
        let rows = self.rows.read().expect("rows lock poisoned");
        Ok(rows
            .iter()
            .filter(|((user, _), stored)| user == user_id && stored.deleted_at.is_none())
            .map(|((user, module), stored)| {
                SubscriptionRow::new(user.clone(), module.clone(), stored.last_event_id)
            })
            .collect())
    }
}
