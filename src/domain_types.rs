//! Cross-cutting domain types shared by every bus component
//!
//! Strongly-typed values for bus identity to prevent primitive obsession.
//! Component-specific types (message ids, paths, delivery counters) live in
//! [`crate::bus::domain_types`].

use nutype::nutype;

/// Logical name of the application this bus instance belongs to.
///
/// All instances of the same application share competing subscriptions, so
/// the name must be stable across deployments of the same service.
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
pub struct ApplicationName(String);

/// Name of this particular bus instance within its application.
///
/// Distinguishes fan-out subscriptions and reply queues between instances of
/// the same application.
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
pub struct InstanceName(String);
