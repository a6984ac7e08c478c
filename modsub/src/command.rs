//! Command surface: client intents in, events out.
//!
//! Commands never write the projection. Add/remove serialize the payload,
//! tag it, and append to the user's stream; the projection catches up
//! asynchronously through the consumer. Reads go straight to the
//! projection store and see whatever has already been applied, so
//! read-after-write is eventually consistent.

use crate::event::SubscriptionEvent;
use crate::log::{EventLog, EventLogError};
use crate::store::{ProjectionError, ProjectionStore, SubscriptionRow};
use crate::types::{ModId, StreamId, UserId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

/// Failures surfaced to RPC callers.
///
/// Errors propagate verbatim; there is no translation layer beyond what
/// the transport requires.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The event payload could not be serialized.
    #[error("failed to encode event payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The append was not durably recorded; no partial state exists.
    #[error("append failed: {0}")]
    Append(#[from] EventLogError),

    /// The projection read failed.
    #[error("projection read failed: {0}")]
    Projection(#[from] ProjectionError),
}

/// The three RPC-facing operations.
pub struct SubscriptionCommands {
    log: Arc<dyn EventLog>,
    store: Arc<dyn ProjectionStore>,
}

impl SubscriptionCommands {
    /// Creates the command surface over the given log and store.
    pub fn new(log: Arc<dyn EventLog>, store: Arc<dyn ProjectionStore>) -> Self {
        Self { log, store }
    }

    /// Records the intent to subscribe by appending a
    /// `SUBSCRIPTION_ADDED` event to the user's stream.
    ///
    /// Returns as soon as the append is durable; the projection applies
    /// the event asynchronously.
    #[instrument(skip(self))]
    pub async fn add_subscription(
        &self,
        user_id: UserId,
        mod_id: ModId,
    ) -> Result<(), CommandError> {
        self.append(&user_id, SubscriptionEvent::added(mod_id)).await
    }

    /// Records the intent to unsubscribe by appending a
    /// `SUBSCRIPTION_REMOVED` event to the user's stream.
    #[instrument(skip(self))]
    pub async fn remove_subscription(
        &self,
        user_id: UserId,
        mod_id: ModId,
    ) -> Result<(), CommandError> {
        self.append(&user_id, SubscriptionEvent::removed(mod_id))
            .await
    }

    /// Reads the user's current subscriptions from the projection.
    ///
    /// Immediately consistent with whatever events have already been
    /// applied.
    #[instrument(skip(self))]
    pub async fn subscriptions_by_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<SubscriptionRow>, CommandError> {
        let rows = self.store.query_by_user(user_id).await?;
        info!(user = %user_id, count = rows.len(), "served subscription query");
        Ok(rows)
    }

    async fn append(&self, user_id: &UserId, event: SubscriptionEvent) -> Result<(), CommandError> {
        let stream_id = StreamId::for_user(user_id);
        let payload = event.encode_payload()?;
        let sequence = self
            .log
            .append(&stream_id, event.type_tag(), payload)
            .await?;
        info!(
            stream = %stream_id,
            event_type = event.type_tag(),
            %sequence,
            "appended subscription event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SUBSCRIPTION_ADDED;
    use crate::types::{CursorName, SequenceNumber};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Log double recording appends.
    #[derive(Default)]
    struct RecordingLog {
        appends: Mutex<Vec<(StreamId, String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl EventLog for RecordingLog {
        async fn append(
            &self,
            stream_id: &StreamId,
            event_type: &str,
            payload: Vec<u8>,
        ) -> Result<SequenceNumber, EventLogError> {
            if self.fail {
                return Err(EventLogError::Connection("log offline".to_string()));
            }
            let mut appends = self.appends.lock().unwrap();
            appends.push((stream_id.clone(), event_type.to_string(), payload));
            Ok(SequenceNumber::try_new(appends.len() as u64).unwrap())
        }

        async fn create_cursor(
            &self,
            _name: &CursorName,
            _stream_prefix: &str,
        ) -> Result<(), EventLogError> {
            Ok(())
        }

        async fn connect(
            &self,
            name: &CursorName,
        ) -> Result<Box<dyn crate::log::EventLogStream>, EventLogError> {
            Err(EventLogError::UnknownCursor(name.clone()))
        }
    }

    /// Store double that must never be written by commands.
    #[derive(Default)]
    struct ReadOnlyStore {
        writes: Mutex<u32>,
    }

    #[async_trait]
    impl ProjectionStore for ReadOnlyStore {
        async fn ensure_schema(&self) -> Result<(), ProjectionError> {
            Ok(())
        }

        async fn upsert(&self, _row: SubscriptionRow) -> Result<(), ProjectionError> {
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        async fn delete_by_key(
            &self,
            _user_id: &UserId,
            _mod_id: &ModId,
        ) -> Result<(), ProjectionError> {
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        async fn query_by_user(
            &self,
            user_id: &UserId,
        ) -> Result<Vec<SubscriptionRow>, ProjectionError> {
            Ok(vec![SubscriptionRow::new(
                user_id.clone(),
                ModId::try_new("m1").unwrap(),
                SequenceNumber::first(),
            )])
        }
    }

    fn commands(log: Arc<RecordingLog>, store: Arc<ReadOnlyStore>) -> SubscriptionCommands {
        SubscriptionCommands::new(log, store)
    }

    #[tokio::test]
    async fn add_appends_to_the_user_stream_and_skips_the_store() {
        let log = Arc::new(RecordingLog::default());
        let store = Arc::new(ReadOnlyStore::default());
        let commands = commands(Arc::clone(&log), Arc::clone(&store));

        commands
            .add_subscription(
                UserId::try_new("u1").unwrap(),
                ModId::try_new("m1").unwrap(),
            )
            .await
            .unwrap();

        let appends = log.appends.lock().unwrap();
        assert_eq!(appends.len(), 1);
        let (stream, event_type, payload) = &appends[0];
        assert_eq!(stream.as_ref(), "subscription-u1");
        assert_eq!(event_type, SUBSCRIPTION_ADDED);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(payload).unwrap(),
            serde_json::json!({ "ModID": "m1" })
        );
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn append_failure_propagates_to_the_caller() {
        let log = Arc::new(RecordingLog {
            fail: true,
            ..RecordingLog::default()
        });
        let store = Arc::new(ReadOnlyStore::default());
        let commands = commands(log, store);

        let err = commands
            .remove_subscription(
                UserId::try_new("u1").unwrap(),
                ModId::try_new("m1").unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Append(_)));
    }

    #[tokio::test]
    async fn reads_come_from_the_projection_only() {
        let log = Arc::new(RecordingLog::default());
        let store = Arc::new(ReadOnlyStore::default());
        let commands = commands(Arc::clone(&log), store);

        let user = UserId::try_new("u1").unwrap();
        let rows = commands.subscriptions_by_user(&user).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].mod_id.as_ref(), "m1");
        assert!(log.appends.lock().unwrap().is_empty());
    }
}
