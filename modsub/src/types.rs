//! Core domain types for the mod subscription service.
//!
//! All identifier types use smart constructors so that a value, once
//! constructed, is always valid - no further validation needed downstream.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// The fixed stream-name prefix for subscription streams.
///
/// A user's subscription history lives in the stream
/// `"subscription-" + userID`. The user id is recovered by stripping this
/// literal prefix, never by splitting on a delimiter.
pub const SUBSCRIPTION_STREAM_PREFIX: &str = "subscription-";

/// Identifies the user that owns a subscription stream.
///
/// Non-empty and at most 50 characters, matching the projection table's
/// `user_id` column width.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 50),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct UserId(String);

/// Identifies the mod a user subscribes to.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ModId(String);

/// A stream identifier in the event log.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamId(String);

impl StreamId {
    /// Builds the subscription stream id for a user.
    pub fn for_user(user_id: &UserId) -> Self {
        Self::try_new(format!("{SUBSCRIPTION_STREAM_PREFIX}{user_id}"))
            .expect("prefixed user id is always a valid stream id")
    }

    /// Recovers the user id from a subscription stream id.
    ///
    /// Returns `None` when the stream does not carry the literal
    /// subscription prefix, or when the remainder is not a valid user id.
    pub fn subscription_user(&self) -> Option<UserId> {
        self.as_ref()
            .strip_prefix(SUBSCRIPTION_STREAM_PREFIX)
            .and_then(|rest| UserId::try_new(rest).ok())
    }
}

/// The durable name of a server-side subscription cursor.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CursorName(String);

/// Per-stream sequence number assigned by the event log.
///
/// Sequence numbers start at 1 and increase strictly within a stream.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The first sequence number in any stream.
    pub fn first() -> Self {
        Self::try_new(1).expect("1 is always a valid sequence number")
    }

    /// Returns the next sequence number after this one.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next sequence number is always valid")
    }
}

/// Global position of an event in the log, across all streams.
///
/// The durable cursor is advanced past this position on acknowledgement.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct LogPosition(u64);

/// A UTC timestamp used for projection row bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Wraps a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// The current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
