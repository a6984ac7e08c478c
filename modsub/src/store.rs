//! Projection store port.
//!
//! The projection is a single relational table of current subscriptions,
//! keyed by `(user, mod)`. Implementations live in adapter crates; the
//! pipeline only sees this trait and injects it by construction.

use crate::types::{ModId, SequenceNumber, UserId};
use async_trait::async_trait;
use thiserror::Error;

/// One row of the subscription projection.
///
/// `last_event_id` is the per-stream sequence number of the most recent
/// event applied to this row. It is an audit/ordering marker, not a
/// concurrency token, and never decreases across applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    /// Owner of the subscription.
    pub user_id: UserId,
    /// The subscribed mod.
    pub mod_id: ModId,
    /// Sequence number of the last event applied to this row.
    pub last_event_id: SequenceNumber,
}

impl SubscriptionRow {
    /// Creates a new projection row.
    pub const fn new(user_id: UserId, mod_id: ModId, last_event_id: SequenceNumber) -> Self {
        Self {
            user_id,
            mod_id,
            last_event_id,
        }
    }
}

/// Failures at the projection storage layer.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Connectivity to the backing store failed.
    #[error("projection store connection failed: {0}")]
    Connection(String),

    /// The store rejected the operation (constraint violation or similar).
    #[error("projection store rejected the operation: {0}")]
    Constraint(String),

    /// Schema or extension setup failed.
    #[error("projection schema setup failed: {0}")]
    Schema(String),
}

/// Capability interface over the projection table.
///
/// All operations are single atomic actions against the store; the
/// pipeline relies on that atomicity instead of external locking.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Idempotent schema/extension setup, run once at startup before the
    /// consumer begins receiving.
    async fn ensure_schema(&self) -> Result<(), ProjectionError>;

    /// Inserts or replaces the row keyed by `(user_id, mod_id)`.
    ///
    /// A soft-deleted row is revived. Succeeds unconditionally for any
    /// well-formed row.
    async fn upsert(&self, row: SubscriptionRow) -> Result<(), ProjectionError>;

    /// Soft-deletes the row for `(user_id, mod_id)`.
    ///
    /// Deleting an absent key is a successful no-op, not an error.
    async fn delete_by_key(&self, user_id: &UserId, mod_id: &ModId) -> Result<(), ProjectionError>;

    /// Returns all non-deleted rows for the user. Order is not
    /// semantically significant.
    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<SubscriptionRow>, ProjectionError>;
}
