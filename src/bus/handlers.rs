//! Handler contracts and the dispatch context
//!
//! User handlers implement one of five shape traits, matching the bus's
//! interaction patterns. Context that older bus designs injected through
//! properties (reply path, delivery attempt) is passed explicitly as a
//! [`DispatchContext`] parameter.

use async_trait::async_trait;
use std::collections::HashMap;

use super::domain_types::{
    CorrelationId, DeliveryAttempt, MessageId, MessageTimestamp, QueuePath,
};
use super::envelope::{BusMessage, Envelope, PropertyValue, RequestMessage};
use crate::error::HandlerError;

/// The interaction pattern a handler participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerShape {
    /// Fire-and-forget, single consumer
    Command,
    /// Load-balanced across instances of one application
    CompetingEvent,
    /// Fan-out to every subscriber
    MulticastEvent,
    /// Correlated request with exactly one responder
    Request,
    /// Correlated request where every subscriber may respond
    MulticastRequest,
}

impl HandlerShape {
    /// True for shapes delivered via queues
    #[must_use]
    pub fn uses_queue(self) -> bool {
        matches!(self, Self::Command | Self::Request)
    }
}

/// Per-delivery context passed to every handler
///
/// Carries the envelope metadata a handler may need without exposing the
/// envelope itself.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Id of the delivered message
    pub message_id: MessageId,
    /// Correlation id, when the delivery is part of a request exchange
    pub correlation_id: Option<CorrelationId>,
    /// Where the sender expects replies
    pub sender_reply_to: Option<QueuePath>,
    /// How many times the transport has delivered this message
    pub delivery_attempt: DeliveryAttempt,
    /// When the sender enqueued the message
    pub enqueued_time_utc: MessageTimestamp,
    /// All wire properties, including custom headers
    pub properties: HashMap<String, PropertyValue>,
}

impl DispatchContext {
    /// Extracts the context from a delivered envelope
    #[must_use]
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            message_id: envelope.message_id,
            correlation_id: envelope.correlation_id,
            sender_reply_to: envelope.reply_to.clone(),
            delivery_attempt: envelope.delivery_attempt,
            enqueued_time_utc: envelope.enqueued_time_utc,
            properties: envelope.properties.clone(),
        }
    }
}

/// Handles a fire-and-forget command
#[async_trait]
pub trait CommandHandler<C: BusMessage>: Send + Sync {
    /// Processes one command delivery
    async fn handle(&self, command: C, context: &DispatchContext) -> Result<(), HandlerError>;
}

/// Handles an event on a subscription shared across application instances
#[async_trait]
pub trait CompetingEventHandler<E: BusMessage>: Send + Sync {
    /// Processes one event delivery
    async fn handle(&self, event: E, context: &DispatchContext) -> Result<(), HandlerError>;
}

/// Handles an event delivered to every subscriber
#[async_trait]
pub trait MulticastEventHandler<E: BusMessage>: Send + Sync {
    /// Processes one event delivery
    async fn handle(&self, event: E, context: &DispatchContext) -> Result<(), HandlerError>;
}

/// Handles a request and produces its reply
#[async_trait]
pub trait RequestHandler<R: RequestMessage>: Send + Sync {
    /// Processes one request and returns the reply payload
    async fn handle(
        &self,
        request: R,
        context: &DispatchContext,
    ) -> Result<R::Response, HandlerError>;
}

/// Handles a multicast request; every subscriber's reply reaches the caller
#[async_trait]
pub trait MulticastRequestHandler<R: RequestMessage>: Send + Sync {
    /// Processes one request and returns this subscriber's reply
    async fn handle(
        &self,
        request: R,
        context: &DispatchContext,
    ) -> Result<R::Response, HandlerError>;
}
