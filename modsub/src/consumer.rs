//! The durable subscription consumer.
//!
//! One consumer runs for the lifetime of the process. It maintains a
//! named server-side cursor over all subscription streams, receives one
//! message at a time, dispatches it, and settles it with exactly one of
//! ACK or NACK(RETRY). Per-stream application order therefore matches
//! delivery order.
//!
//! Failure policy:
//! - retryable dispatch failures (malformed payload, storage) are
//!   NACKed so the log redelivers them;
//! - non-retryable dispatch failures (unknown type tag, foreign stream)
//!   are warned about and ACKed away, so a permanently poisoned message
//!   cannot stall the cursor;
//! - any failure of the acknowledgement transport itself is fatal and
//!   propagates to the supervisor, which restarts the consumer from the
//!   durable cursor.

use crate::dispatch::EventDispatcher;
use crate::event::EventEnvelope;
use crate::log::{EventLog, EventLogError, EventLogStream, LogMessage, NackAction};
use crate::types::{CursorName, SUBSCRIPTION_STREAM_PREFIX};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Fatal consumer failures, escalated to process supervision.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Cursor creation failed for a reason other than already-exists.
    #[error("cursor setup failed: {0}")]
    Setup(#[source] EventLogError),

    /// Opening the receive session failed.
    #[error("failed to connect to cursor: {0}")]
    Connect(#[source] EventLogError),

    /// The ACK transport failed.
    #[error("ack failed: {0}")]
    AckTransport(#[source] EventLogError),

    /// The NACK transport failed.
    #[error("nack failed: {0}")]
    NackTransport(#[source] EventLogError),
}

/// How a consumer run ended, when it ended without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The cancellation signal was observed.
    Cancelled,
    /// The log dropped the subscription. The caller decides whether to
    /// reconnect.
    Dropped {
        /// Drop reason reported by the log.
        reason: String,
    },
}

/// Receives subscription events and applies them to the projection.
pub struct SubscriptionConsumer {
    log: Arc<dyn EventLog>,
    dispatcher: EventDispatcher,
    cursor: CursorName,
}

impl SubscriptionConsumer {
    /// Creates a consumer over the given log and dispatcher.
    pub fn new(log: Arc<dyn EventLog>, dispatcher: EventDispatcher, cursor: CursorName) -> Self {
        Self {
            log,
            dispatcher,
            cursor,
        }
    }

    /// Runs the receive loop until cancellation, a drop signal, or a
    /// fatal transport error.
    ///
    /// Cancellation is observed only at the receive point: an in-flight
    /// dispatch/ack sequence always completes, so the loop never
    /// acknowledges without applying or vice versa.
    #[instrument(skip_all, fields(cursor = %self.cursor))]
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<ConsumerExit, ConsumerError> {
        self.ensure_cursor().await?;

        let mut stream = self
            .log
            .connect(&self.cursor)
            .await
            .map_err(ConsumerError::Connect)?;

        info!(prefix = SUBSCRIPTION_STREAM_PREFIX, "receive loop started");

        loop {
            let message = tokio::select! {
                // A closed channel means the supervisor is gone; treat it
                // the same as an explicit cancellation.
                _ = shutdown.changed() => {
                    info!("cancellation received, leaving receive loop");
                    return Ok(ConsumerExit::Cancelled);
                }
                message = stream.recv() => message,
            };

            match message {
                LogMessage::Event(envelope) => {
                    self.settle(stream.as_mut(), &envelope).await?;
                }
                LogMessage::Dropped { reason } => {
                    warn!(%reason, "subscription dropped by the log");
                    return Ok(ConsumerExit::Dropped { reason });
                }
            }
        }
    }

    /// Idempotent cursor setup. Already-exists is the expected outcome on
    /// every run but the first.
    async fn ensure_cursor(&self) -> Result<(), ConsumerError> {
        match self
            .log
            .create_cursor(&self.cursor, SUBSCRIPTION_STREAM_PREFIX)
            .await
        {
            Ok(()) => {
                info!("created durable cursor");
                Ok(())
            }
            Err(EventLogError::CursorAlreadyExists(_)) => {
                debug!("cursor already exists, reusing it");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "cursor setup failed");
                Err(ConsumerError::Setup(err))
            }
        }
    }

    /// Dispatches one envelope and settles it with exactly one of ACK or
    /// NACK(RETRY).
    async fn settle(
        &self,
        stream: &mut dyn EventLogStream,
        envelope: &EventEnvelope,
    ) -> Result<(), ConsumerError> {
        match self.dispatcher.dispatch(envelope).await {
            Ok(()) => stream
                .ack(envelope)
                .await
                .map_err(ConsumerError::AckTransport),
            Err(err) if err.is_retryable() => {
                warn!(
                    stream_id = %envelope.stream_id,
                    sequence = %envelope.sequence,
                    error = %err,
                    "dispatch failed, requesting redelivery"
                );
                stream
                    .nack(envelope, &err.to_string(), NackAction::Retry)
                    .await
                    .map_err(ConsumerError::NackTransport)
            }
            Err(err) => {
                warn!(
                    stream_id = %envelope.stream_id,
                    sequence = %envelope.sequence,
                    error = %err,
                    "dispatch cannot succeed, acknowledging and skipping"
                );
                stream
                    .ack(envelope)
                    .await
                    .map_err(ConsumerError::AckTransport)
            }
        }
    }
}
