//! Domain types for the bus core
//!
//! Strongly-typed identifiers and counters used across the envelope,
//! correlator, entity manager and dispatcher. Base identity types
//! (application and instance names) are re-exported from the crate root.

use nutype::nutype;
use std::time::SystemTime;
use uuid::Uuid;

pub use crate::domain_types::{ApplicationName, InstanceName};

/// Unique identifier for a message
///
/// Generated exactly once per logical message; replies preserve it in their
/// correlation id.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Correlation identifier carried by replies
///
/// Equal to the originating request's [`MessageId`].
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct CorrelationId(Uuid);

impl From<MessageId> for CorrelationId {
    fn from(id: MessageId) -> Self {
        Self::new(id.into_inner())
    }
}

impl CorrelationId {
    /// True when this correlation id refers to the given request message id
    #[must_use]
    pub fn refers_to(&self, id: MessageId) -> bool {
        self.into_inner() == id.into_inner()
    }

    /// The message id this correlation refers to
    #[must_use]
    pub fn as_message_id(&self) -> MessageId {
        MessageId::new(self.into_inner())
    }
}

/// Canonical name of a user message type, as carried on the wire
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct MessageTypeName(String);

impl MessageTypeName {
    /// Builds a type name from a static type constant
    #[must_use]
    pub fn of(name: &str) -> Self {
        Self::new(name.to_string())
    }
}

/// Path of a queue on the transport namespace
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct QueuePath(String);

/// Path of a topic on the transport namespace
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct TopicPath(String);

/// Name of a subscription on a topic
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct SubscriptionName(String);

/// Composite `topic/name` key identifying a subscription in the known-set
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef
))]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    /// Composes the key for a subscription on a topic
    #[must_use]
    pub fn compose(topic: &TopicPath, name: &SubscriptionName) -> Self {
        Self::new(format!("{topic}/{name}"))
    }
}

/// Number of times the transport has delivered an envelope
///
/// Starts at one on first delivery and is incremented by the transport on
/// every redelivery.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct DeliveryAttempt(u32);

impl DeliveryAttempt {
    /// The first delivery
    #[must_use]
    pub fn first() -> Self {
        Self::new(1)
    }

    /// The attempt after this one
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// The raw attempt count
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.into_inner()
    }
}

/// Wall-clock timestamp attached to envelopes and outstanding requests
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into
))]
pub struct MessageTimestamp(SystemTime);

impl MessageTimestamp {
    /// The wrapped system time
    #[must_use]
    pub fn as_system_time(self) -> SystemTime {
        self.into_inner()
    }
}
