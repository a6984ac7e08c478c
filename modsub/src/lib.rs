//! Mod subscription projection pipeline.
//!
//! This crate maintains a read-optimized projection of "who subscribes to
//! which mod", derived from an append-only per-user event log:
//!
//! - [`command::SubscriptionCommands`] turns client intents into events
//!   appended to `subscription-<user>` streams;
//! - [`consumer::SubscriptionConsumer`] holds a durable named cursor over
//!   those streams and receives events at-least-once, in order;
//! - [`dispatch::EventDispatcher`] applies each event to the projection
//!   with an idempotent upsert or soft delete;
//! - reads are served straight from the projection and are eventually
//!   consistent with appends.
//!
//! Storage backends implement the [`log::EventLog`] and
//! [`store::ProjectionStore`] ports; see the `modsub-postgres` and
//! `modsub-memory` adapter crates.

pub mod command;
pub mod consumer;
pub mod dispatch;
pub mod event;
pub mod log;
pub mod store;
pub mod types;

pub use command::{CommandError, SubscriptionCommands};
pub use consumer::{ConsumerError, ConsumerExit, SubscriptionConsumer};
pub use dispatch::{DispatchError, EventDispatcher};
pub use event::{
    EventDecodeError, EventEnvelope, SubscriptionEvent, SubscriptionPayload, SUBSCRIPTION_ADDED,
    SUBSCRIPTION_REMOVED,
};
pub use log::{EventLog, EventLogError, EventLogStream, LogMessage, NackAction};
pub use store::{ProjectionError, ProjectionStore, SubscriptionRow};
pub use types::{
    CursorName, LogPosition, ModId, SequenceNumber, StreamId, Timestamp, UserId,
    SUBSCRIPTION_STREAM_PREFIX,
};
