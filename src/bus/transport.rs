//! Transport abstraction consumed by the bus core
//!
//! The core never talks to a wire protocol directly. A transport driver
//! supplies senders and receivers for named paths plus a namespace manager
//! for entity provisioning. Receivers hand envelopes to the core and take
//! back a [`DispatchOutcome`]; the core itself never acknowledges messages.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::config::BusConfig;
use super::domain_types::{QueuePath, SubscriptionKey, SubscriptionName, TopicPath};
use super::envelope::Envelope;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// The named path does not exist on the namespace
    #[error("path not found: {path}")]
    PathNotFound {
        /// The missing path
        path: String,
    },

    /// A transient fault eligible for retry
    #[error("transient transport failure: {detail}")]
    Transient {
        /// Driver-specific detail, preserved verbatim
        detail: String,
    },

    /// The receiver or connection has been torn down
    #[error("transport closed")]
    Closed,

    /// The driver rejected a send
    #[error("send failed: {detail}")]
    SendFailed {
        /// Driver-specific detail, preserved verbatim
        detail: String,
    },
}

/// Classified result of an entity create attempt
///
/// The entity manager's retry policy keys off this classification:
/// `AlreadyExists` and a confirmed `ConflictPending` mark the entity known,
/// `Transient` retries with backoff, `Fatal` fails immediately.
#[derive(Debug, Error)]
pub enum EntityCreateError {
    /// The entity already exists on the namespace
    #[error("entity already exists")]
    AlreadyExists,

    /// Another creator is racing on the same path
    #[error("a conflicting operation is in progress")]
    ConflictPending,

    /// Transient failure; eligible for retry
    #[error("transient create failure: {source}")]
    Transient {
        /// The underlying transport failure
        #[source]
        source: TransportError,
    },

    /// Non-retryable failure
    #[error("create failed: {source}")]
    Fatal {
        /// The underlying transport failure
        #[source]
        source: TransportError,
    },
}

/// Outcome of a dispatch, returned to the transport pump
///
/// `Ack` completes the delivery; `Nack` abandons it so the transport may
/// redeliver with an incremented delivery count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivery handled; remove the message
    Ack,
    /// Delivery failed; the transport may redeliver
    Nack,
}

/// Provisioning parameters for a queue
#[derive(Debug, Clone)]
pub struct QueueDescriptor {
    /// Delivery-count ceiling before the transport dead-letters
    pub max_delivery_attempts: u32,
    /// Default message TTL on the entity
    pub default_message_time_to_live: Duration,
    /// Peek-lock duration
    pub lock_duration: Duration,
    /// Idle auto-delete window, if enabled
    pub auto_delete_on_idle: Option<Duration>,
    /// Whether expired messages are dead-lettered
    pub enable_dead_lettering_on_message_expiration: bool,
}

impl QueueDescriptor {
    /// Builds the descriptor from bus configuration
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            max_delivery_attempts: config.max_delivery_attempts.as_u32(),
            default_message_time_to_live: config.default_message_time_to_live.as_duration(),
            lock_duration: config.default_message_lock_duration.as_duration(),
            auto_delete_on_idle: config.auto_delete_on_idle.map(|idle| idle.as_duration()),
            enable_dead_lettering_on_message_expiration: config
                .enable_dead_lettering_on_message_expiration,
        }
    }
}

/// Provisioning parameters for a topic
#[derive(Debug, Clone)]
pub struct TopicDescriptor {
    /// Default message TTL on the entity
    pub default_message_time_to_live: Duration,
    /// Idle auto-delete window, if enabled
    pub auto_delete_on_idle: Option<Duration>,
}

impl TopicDescriptor {
    /// Builds the descriptor from bus configuration
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            default_message_time_to_live: config.default_message_time_to_live.as_duration(),
            auto_delete_on_idle: config.auto_delete_on_idle.map(|idle| idle.as_duration()),
        }
    }
}

/// Provisioning parameters for a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionDescriptor {
    /// Delivery-count ceiling before the transport dead-letters
    pub max_delivery_attempts: u32,
    /// Peek-lock duration
    pub lock_duration: Duration,
    /// Idle auto-delete window, if enabled
    pub auto_delete_on_idle: Option<Duration>,
    /// Whether expired messages are dead-lettered
    pub enable_dead_lettering_on_message_expiration: bool,
}

impl SubscriptionDescriptor {
    /// Builds the descriptor from bus configuration
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            max_delivery_attempts: config.max_delivery_attempts.as_u32(),
            lock_duration: config.default_message_lock_duration.as_duration(),
            auto_delete_on_idle: config.auto_delete_on_idle.map(|idle| idle.as_duration()),
            enable_dead_lettering_on_message_expiration: config
                .enable_dead_lettering_on_message_expiration,
        }
    }
}

/// Entity administration surface of a transport connection
#[async_trait]
pub trait NamespaceManager: Send + Sync {
    /// Creates a queue; classification per [`EntityCreateError`]
    async fn create_queue(
        &self,
        path: &QueuePath,
        descriptor: &QueueDescriptor,
    ) -> Result<(), EntityCreateError>;

    /// Probes queue existence
    async fn queue_exists(&self, path: &QueuePath) -> Result<bool, TransportError>;

    /// Lists all queues on the namespace
    async fn list_queues(&self) -> Result<Vec<QueuePath>, TransportError>;

    /// Creates a topic
    async fn create_topic(
        &self,
        path: &TopicPath,
        descriptor: &TopicDescriptor,
    ) -> Result<(), EntityCreateError>;

    /// Probes topic existence
    async fn topic_exists(&self, path: &TopicPath) -> Result<bool, TransportError>;

    /// Lists all topics on the namespace
    async fn list_topics(&self) -> Result<Vec<TopicPath>, TransportError>;

    /// Creates a subscription on an existing topic
    async fn create_subscription(
        &self,
        topic: &TopicPath,
        name: &SubscriptionName,
        descriptor: &SubscriptionDescriptor,
    ) -> Result<(), EntityCreateError>;

    /// Probes subscription existence
    async fn subscription_exists(
        &self,
        topic: &TopicPath,
        name: &SubscriptionName,
    ) -> Result<bool, TransportError>;

    /// Lists all subscriptions as `topic/name` keys
    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionKey>, TransportError>;
}

/// Sends envelopes to one named path
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends one envelope; completes when the transport accepted it
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Receives envelopes from one named path with ack/nack settlement
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Waits for the next delivery.
    ///
    /// Pends until an envelope arrives; returns [`TransportError::Closed`]
    /// once the path is torn down.
    async fn receive(&self) -> Result<Envelope, TransportError>;

    /// Settles a delivery with the dispatch outcome.
    ///
    /// On `Nack` the transport redelivers with an incremented
    /// `Nimbus.DeliveryAttempt`.
    async fn settle(
        &self,
        envelope: Envelope,
        outcome: DispatchOutcome,
    ) -> Result<(), TransportError>;
}

/// Opaque handle to a queue/topic transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// The namespace manager for this connection
    fn namespace_manager(&self) -> Arc<dyn NamespaceManager>;

    /// Sender for a queue path
    async fn queue_sender(&self, path: &QueuePath)
    -> Result<Arc<dyn MessageSender>, TransportError>;

    /// Receiver for a queue path (competing consumers)
    async fn queue_receiver(
        &self,
        path: &QueuePath,
    ) -> Result<Arc<dyn MessageReceiver>, TransportError>;

    /// Sender for a topic path
    async fn topic_sender(&self, path: &TopicPath)
    -> Result<Arc<dyn MessageSender>, TransportError>;

    /// Receiver for a subscription on a topic
    async fn subscription_receiver(
        &self,
        topic: &TopicPath,
        name: &SubscriptionName,
    ) -> Result<Arc<dyn MessageReceiver>, TransportError>;
}
