//! Maps received envelopes to projection mutations.
//!
//! The dispatcher is the only writer of the projection store. It decodes
//! each envelope by type tag and applies the corresponding mutation.
//! Re-applying the same envelope leaves the projection unchanged, because
//! upsert and delete-by-key are both idempotent; the dispatcher never
//! assumes exactly-once delivery.

use crate::event::{EventDecodeError, EventEnvelope, SubscriptionEvent};
use crate::store::{ProjectionError, ProjectionStore, SubscriptionRow};
use crate::types::StreamId;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why dispatch of one envelope failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is registered for the envelope's type tag.
    ///
    /// Retrying can never fix this, so it is classified non-retryable.
    #[error("no handler registered for event type '{tag}'")]
    UnknownEventType {
        /// The unrecognized tag.
        tag: String,
    },

    /// The payload bytes are malformed for a known type tag.
    #[error("malformed event payload: {detail}")]
    MalformedPayload {
        /// Parser error detail.
        detail: String,
    },

    /// The envelope's stream does not carry the subscription prefix, so
    /// no user id can be derived.
    #[error("stream '{0}' does not carry the subscription prefix")]
    ForeignStream(StreamId),

    /// The projection store operation failed.
    #[error("projection store error: {0}")]
    Storage(#[from] ProjectionError),
}

impl DispatchError {
    /// Whether redelivery could plausibly succeed.
    ///
    /// Storage and decode failures are transient or fixable; an unknown
    /// type tag or a foreign stream will fail identically forever and
    /// must not stall the cursor.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::MalformedPayload { .. } | Self::Storage(_) => true,
            Self::UnknownEventType { .. } | Self::ForeignStream(_) => false,
        }
    }
}

impl From<EventDecodeError> for DispatchError {
    fn from(err: EventDecodeError) -> Self {
        match err {
            EventDecodeError::UnknownType { tag } => Self::UnknownEventType { tag },
            EventDecodeError::MalformedPayload { detail, .. } => {
                Self::MalformedPayload { detail }
            }
        }
    }
}

/// Applies decoded events to the projection store.
pub struct EventDispatcher {
    store: Arc<dyn ProjectionStore>,
}

impl EventDispatcher {
    /// Creates a dispatcher writing to the given store.
    pub fn new(store: Arc<dyn ProjectionStore>) -> Self {
        Self { store }
    }

    /// Decodes and applies one envelope.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<(), DispatchError> {
        let user_id = envelope
            .user_id()
            .ok_or_else(|| DispatchError::ForeignStream(envelope.stream_id.clone()))?;

        let event = SubscriptionEvent::decode(&envelope.event_type, &envelope.payload)?;

        match event {
            SubscriptionEvent::Added { mod_id } => {
                debug!(user = %user_id, module = %mod_id, sequence = %envelope.sequence, "applying subscription added");
                self.store
                    .upsert(SubscriptionRow::new(user_id, mod_id, envelope.sequence))
                    .await?;
            }
            SubscriptionEvent::Removed { mod_id } => {
                debug!(user = %user_id, module = %mod_id, sequence = %envelope.sequence, "applying subscription removed");
                self.store.delete_by_key(&user_id, &mod_id).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SUBSCRIPTION_ADDED, SUBSCRIPTION_REMOVED};
    use crate::types::{LogPosition, ModId, SequenceNumber, UserId};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minimal projection store double: a map guarded by a mutex, with
    /// soft-delete semantics matching the real adapters.
    #[derive(Default)]
    struct MapStore {
        rows: Mutex<HashMap<(UserId, ModId), (SequenceNumber, bool)>>,
        fail_next: Mutex<bool>,
    }

    impl MapStore {
        fn row(&self, user: &str, module: &str) -> Option<(SequenceNumber, bool)> {
            let key = (
                UserId::try_new(user).unwrap(),
                ModId::try_new(module).unwrap(),
            );
            self.rows.lock().unwrap().get(&key).copied()
        }
    }

    #[async_trait]
    impl ProjectionStore for MapStore {
        async fn ensure_schema(&self) -> Result<(), ProjectionError> {
            Ok(())
        }

        async fn upsert(&self, row: SubscriptionRow) -> Result<(), ProjectionError> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(ProjectionError::Connection("store offline".to_string()));
            }
            let mut rows = self.rows.lock().unwrap();
            let entry = rows
                .entry((row.user_id, row.mod_id))
                .or_insert((row.last_event_id, false));
            entry.0 = entry.0.max(row.last_event_id);
            entry.1 = false;
            Ok(())
        }

        async fn delete_by_key(
            &self,
            user_id: &UserId,
            mod_id: &ModId,
        ) -> Result<(), ProjectionError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(entry) = rows.get_mut(&(user_id.clone(), mod_id.clone())) {
                entry.1 = true;
            }
            Ok(())
        }

        async fn query_by_user(
            &self,
            user_id: &UserId,
        ) -> Result<Vec<SubscriptionRow>, ProjectionError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|((user, _), (_, deleted))| user == user_id && !deleted)
                .map(|((user, module), (seq, _))| {
                    SubscriptionRow::new(user.clone(), module.clone(), *seq)
                })
                .collect())
        }
    }

    fn envelope(stream: &str, seq: u64, event_type: &str, payload: &[u8]) -> EventEnvelope {
        EventEnvelope::new(
            StreamId::try_new(stream).unwrap(),
            SequenceNumber::try_new(seq).unwrap(),
            LogPosition::try_new(seq).unwrap(),
            event_type.to_string(),
            payload.to_vec(),
        )
    }

    fn added(stream: &str, seq: u64, module: &str) -> EventEnvelope {
        envelope(
            stream,
            seq,
            SUBSCRIPTION_ADDED,
            format!("{{\"ModID\":\"{module}\"}}").as_bytes(),
        )
    }

    fn removed(stream: &str, seq: u64, module: &str) -> EventEnvelope {
        envelope(
            stream,
            seq,
            SUBSCRIPTION_REMOVED,
            format!("{{\"ModID\":\"{module}\"}}").as_bytes(),
        )
    }

    #[tokio::test]
    async fn applying_the_same_added_envelope_twice_is_idempotent() {
        let store = Arc::new(MapStore::default());
        let dispatcher = EventDispatcher::new(Arc::clone(&store) as Arc<dyn ProjectionStore>);

        let event = added("subscription-u1", 3, "m1");
        dispatcher.dispatch(&event).await.unwrap();
        dispatcher.dispatch(&event).await.unwrap();

        let user = UserId::try_new("u1").unwrap();
        let rows = store.query_by_user(&user).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(u64::from(rows[0].last_event_id), 3);
    }

    #[tokio::test]
    async fn add_then_remove_leaves_no_visible_row() {
        let store = Arc::new(MapStore::default());
        let dispatcher = EventDispatcher::new(Arc::clone(&store) as Arc<dyn ProjectionStore>);

        dispatcher
            .dispatch(&added("subscription-u1", 1, "m1"))
            .await
            .unwrap();
        dispatcher
            .dispatch(&removed("subscription-u1", 2, "m1"))
            .await
            .unwrap();

        let user = UserId::try_new("u1").unwrap();
        assert!(store.query_by_user(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_of_absent_subscription_succeeds() {
        let store = Arc::new(MapStore::default());
        let dispatcher = EventDispatcher::new(store as Arc<dyn ProjectionStore>);

        dispatcher
            .dispatch(&removed("subscription-u1", 1, "never-added"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn last_event_id_never_decreases() {
        let store = Arc::new(MapStore::default());
        let dispatcher = EventDispatcher::new(Arc::clone(&store) as Arc<dyn ProjectionStore>);

        dispatcher
            .dispatch(&added("subscription-u1", 5, "m1"))
            .await
            .unwrap();
        // Redelivery of an older event for the same row.
        dispatcher
            .dispatch(&added("subscription-u1", 2, "m1"))
            .await
            .unwrap();

        let (seq, deleted) = store.row("u1", "m1").unwrap();
        assert_eq!(u64::from(seq), 5);
        assert!(!deleted);
    }

    #[tokio::test]
    async fn unknown_event_type_is_a_non_retryable_failure() {
        let store = Arc::new(MapStore::default());
        let dispatcher = EventDispatcher::new(store as Arc<dyn ProjectionStore>);

        let err = dispatcher
            .dispatch(&envelope(
                "subscription-u1",
                1,
                "SUBSCRIPTION_PAUSED",
                b"{\"ModID\":\"m1\"}",
            ))
            .await
            .unwrap_err();

        assert!(matches!(&err, DispatchError::UnknownEventType { tag } if tag == "SUBSCRIPTION_PAUSED"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_retryable_failure() {
        let store = Arc::new(MapStore::default());
        let dispatcher = EventDispatcher::new(store as Arc<dyn ProjectionStore>);

        let err = dispatcher
            .dispatch(&envelope("subscription-u1", 1, SUBSCRIPTION_ADDED, b"{"))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::MalformedPayload { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn foreign_stream_is_rejected_without_touching_the_store() {
        let store = Arc::new(MapStore::default());
        let dispatcher = EventDispatcher::new(Arc::clone(&store) as Arc<dyn ProjectionStore>);

        let err = dispatcher
            .dispatch(&added("order-42", 1, "m1"))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::ForeignStream(_)));
        assert!(!err.is_retryable());
        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_surfaces_as_retryable_dispatch_error() {
        let store = Arc::new(MapStore::default());
        *store.fail_next.lock().unwrap() = true;
        let dispatcher = EventDispatcher::new(Arc::clone(&store) as Arc<dyn ProjectionStore>);

        let err = dispatcher
            .dispatch(&added("subscription-u1", 1, "m1"))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Storage(_)));
        assert!(err.is_retryable());
    }
}
