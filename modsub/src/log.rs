//! Event log port.
//!
//! The event log is an external collaborator: an append-only, durably
//! ordered store of events partitioned by stream id, with named
//! server-side cursors that survive consumer restarts and advance only on
//! explicit acknowledgement. These traits capture the slice of that
//! contract the pipeline depends on.

use crate::event::EventEnvelope;
use crate::types::{CursorName, SequenceNumber, StreamId};
use async_trait::async_trait;
use thiserror::Error;

/// Failures at the event log layer.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// The durable cursor already exists.
    ///
    /// Expected during idempotent setup; the consumer swallows it.
    #[error("cursor '{0}' already exists")]
    CursorAlreadyExists(CursorName),

    /// Creating the durable cursor failed for any other reason.
    #[error("cursor setup failed: {0}")]
    CursorSetup(String),

    /// No cursor with the given name exists to connect to.
    #[error("unknown cursor '{0}'")]
    UnknownCursor(CursorName),

    /// Connectivity to the log failed.
    #[error("event log connection failed: {0}")]
    Connection(String),

    /// An append was not durably recorded.
    #[error("append to stream '{stream_id}' failed: {detail}")]
    Append {
        /// The stream the append targeted.
        stream_id: StreamId,
        /// Failure detail from the log.
        detail: String,
    },

    /// A stored event record could not be mapped back into an envelope.
    #[error("invalid event record: {0}")]
    InvalidRecord(String),

    /// The acknowledgement transport itself failed.
    ///
    /// Fatal to the consumer loop; escalated to process supervision.
    #[error("acknowledgement transport failed: {0}")]
    AckTransport(String),
}

/// What to do with a negatively acknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Ask the log to redeliver the message.
    Retry,
}

/// One item received from a cursor stream.
#[derive(Debug)]
pub enum LogMessage {
    /// A data event to dispatch.
    Event(EventEnvelope),
    /// The server dropped the subscription; no further receives will
    /// yield events. The caller decides whether to reconnect.
    Dropped {
        /// Why the subscription ended.
        reason: String,
    },
}

/// Append and cursor management surface of the event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends one event to a stream, returning the sequence number the
    /// log assigned. Durable once this returns `Ok`.
    async fn append(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        payload: Vec<u8>,
    ) -> Result<SequenceNumber, EventLogError>;

    /// Creates a durable named cursor over all streams whose id starts
    /// with `stream_prefix`.
    ///
    /// Returns [`EventLogError::CursorAlreadyExists`] when the cursor was
    /// created by a previous run.
    async fn create_cursor(
        &self,
        name: &CursorName,
        stream_prefix: &str,
    ) -> Result<(), EventLogError>;

    /// Opens a pull-based, server-acknowledged receive session on an
    /// existing cursor.
    async fn connect(&self, name: &CursorName) -> Result<Box<dyn EventLogStream>, EventLogError>;
}

/// A connected receive session over a durable cursor.
///
/// Delivery is at-least-once and in log position order. Each received
/// event must be terminated with exactly one of `ack` or `nack` before
/// the next receive.
#[async_trait]
pub trait EventLogStream: Send {
    /// Blocks until the next message is available.
    async fn recv(&mut self) -> LogMessage;

    /// Acknowledges the envelope, advancing the durable cursor past it.
    async fn ack(&mut self, envelope: &EventEnvelope) -> Result<(), EventLogError>;

    /// Negatively acknowledges the envelope, asking the log to redeliver
    /// it. This is a signal to the server, not a local retry loop.
    async fn nack(
        &mut self,
        envelope: &EventEnvelope,
        reason: &str,
        action: NackAction,
    ) -> Result<(), EventLogError>;
}
