//! Event envelope and the subscription event codec.
//!
//! Events travel through the log as opaque payload bytes tagged with a
//! string event type. This module decodes that wire shape into a closed
//! variant set, with an explicit error for unrecognized tags so operators
//! can tell "new event type we don't handle yet" apart from "corrupt
//! payload".

use crate::types::{LogPosition, ModId, SequenceNumber, StreamId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type tag for an event recording that a user subscribed to a mod.
pub const SUBSCRIPTION_ADDED: &str = "SUBSCRIPTION_ADDED";

/// Type tag for an event recording that a user unsubscribed from a mod.
pub const SUBSCRIPTION_REMOVED: &str = "SUBSCRIPTION_REMOVED";

/// Wire format of the event payload.
///
/// The payload carries only the mod id; the user id is derived from the
/// stream name and is never stored in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    /// The mod the subscription refers to.
    #[serde(rename = "ModID")]
    pub mod_id: ModId,
}

/// One recorded event as delivered by the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The stream this event was appended to.
    pub stream_id: StreamId,
    /// Per-stream sequence number assigned by the log.
    pub sequence: SequenceNumber,
    /// Global log position, used to advance the durable cursor.
    pub position: LogPosition,
    /// String type tag identifying the event kind.
    pub event_type: String,
    /// Opaque payload bytes (JSON on the wire).
    pub payload: Vec<u8>,
}

impl EventEnvelope {
    /// Creates a new envelope.
    pub const fn new(
        stream_id: StreamId,
        sequence: SequenceNumber,
        position: LogPosition,
        event_type: String,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            stream_id,
            sequence,
            position,
            event_type,
            payload,
        }
    }

    /// The user id embedded in the stream name, if this is a
    /// subscription stream.
    pub fn user_id(&self) -> Option<UserId> {
        self.stream_id.subscription_user()
    }
}

/// Failure to decode an envelope into a [`SubscriptionEvent`].
#[derive(Debug, Error)]
pub enum EventDecodeError {
    /// The type tag matches no known event kind.
    #[error("no handler registered for event type '{tag}'")]
    UnknownType {
        /// The unrecognized tag, verbatim from the envelope.
        tag: String,
    },

    /// The payload bytes could not be parsed for a known type tag.
    #[error("malformed '{tag}' payload: {detail}")]
    MalformedPayload {
        /// The tag the payload was decoded against.
        tag: String,
        /// Parser error detail.
        detail: String,
    },
}

/// The closed set of subscription event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The user subscribed to a mod.
    Added {
        /// The mod subscribed to.
        mod_id: ModId,
    },
    /// The user unsubscribed from a mod.
    Removed {
        /// The mod unsubscribed from.
        mod_id: ModId,
    },
}

impl SubscriptionEvent {
    /// Creates an `Added` event.
    pub const fn added(mod_id: ModId) -> Self {
        Self::Added { mod_id }
    }

    /// Creates a `Removed` event.
    pub const fn removed(mod_id: ModId) -> Self {
        Self::Removed { mod_id }
    }

    /// The wire type tag for this event kind.
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::Added { .. } => SUBSCRIPTION_ADDED,
            Self::Removed { .. } => SUBSCRIPTION_REMOVED,
        }
    }

    /// The mod id this event refers to.
    pub const fn mod_id(&self) -> &ModId {
        match self {
            Self::Added { mod_id } | Self::Removed { mod_id } => mod_id,
        }
    }

    /// Serializes the payload to its wire form.
    pub fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SubscriptionPayload {
            mod_id: self.mod_id().clone(),
        })
    }

    /// Decodes a `(type tag, payload)` pair from an envelope.
    ///
    /// An unknown tag is reported distinctly from a malformed payload so
    /// the consumer can treat the two differently.
    pub fn decode(event_type: &str, payload: &[u8]) -> Result<Self, EventDecodeError> {
        let parse = |tag: &str| {
            serde_json::from_slice::<SubscriptionPayload>(payload).map_err(|err| {
                EventDecodeError::MalformedPayload {
                    tag: tag.to_string(),
                    detail: err.to_string(),
                }
            })
        };

        match event_type {
            SUBSCRIPTION_ADDED => Ok(Self::Added {
                mod_id: parse(SUBSCRIPTION_ADDED)?.mod_id,
            }),
            SUBSCRIPTION_REMOVED => Ok(Self::Removed {
                mod_id: parse(SUBSCRIPTION_REMOVED)?.mod_id,
            }),
            other => Err(EventDecodeError::UnknownType {
                tag: other.to_string(),
            }),
        }
    }
}
