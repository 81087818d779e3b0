//! Envelope record and message factory
//!
//! The envelope is the transport-level wrapper around a user payload. It is
//! immutable after construction except for the header updates a transport
//! performs on redelivery. The factory is the only construction path, so
//! message ids are generated exactly once per logical message.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::config::BusConfig;
use super::domain_types::{
    ApplicationName, CorrelationId, DeliveryAttempt, InstanceName, MessageId, MessageTimestamp,
    MessageTypeName, QueuePath,
};
use crate::error::BusError;
use crate::time_provider::SharedClock;

/// Well-known wire property keys
///
/// These keys are part of the wire contract and must appear bit-exact on
/// every envelope crossing the transport.
pub mod wire {
    /// Canonical type name of the payload
    pub const MESSAGE_TYPE: &str = "Nimbus.MessageType";
    /// Application that sent the envelope
    pub const SENDER_APPLICATION_NAME: &str = "Nimbus.SenderApplicationName";
    /// Instance that sent the envelope
    pub const SENDER_INSTANCE_NAME: &str = "Nimbus.SenderInstanceName";
    /// Delivery count, incremented by the transport on redelivery
    pub const DELIVERY_ATTEMPT: &str = "Nimbus.DeliveryAttempt";
    /// Fault marker on replies; the payload carries the serialized error
    pub const FAULTED: &str = "Nimbus.Faulted";
}

/// A message the bus can carry.
///
/// The associated type name is the canonical identifier used for routing,
/// registry lookups and the wire type header. It must be stable across
/// processes.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Canonical, process-stable name of this message type
    const MESSAGE_TYPE: &'static str;
}

/// A message sent with the request/response pattern
pub trait RequestMessage: BusMessage {
    /// The reply type correlated back to the caller
    type Response: BusMessage;
}

/// Primitive value stored in the envelope property map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// String property
    Str(String),
    /// Integer property
    Int(i64),
    /// Boolean property
    Bool(bool),
}

impl PropertyValue {
    /// The string value, when this is a string property
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// The integer value, when this is an integer property
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }
}

/// Transport-level message wrapping a user payload plus metadata
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Unique id, generated once at construction
    pub message_id: MessageId,
    /// On replies, the originating request's message id
    pub correlation_id: Option<CorrelationId>,
    /// Reply path; only set on requests
    pub reply_to: Option<QueuePath>,
    /// Serialized user payload
    pub payload: Bytes,
    /// Wire properties (type header, sender identity, delivery count,
    /// custom headers)
    pub properties: HashMap<String, PropertyValue>,
    /// When the sender enqueued the message
    pub enqueued_time_utc: MessageTimestamp,
    /// Time-to-live relative to the enqueue time
    pub expires_after: Option<Duration>,
    /// Delivery count, starting at one
    pub delivery_attempt: DeliveryAttempt,
}

impl Envelope {
    /// The payload type name from the wire header
    #[must_use]
    pub fn message_type(&self) -> Option<MessageTypeName> {
        self.properties
            .get(wire::MESSAGE_TYPE)
            .and_then(PropertyValue::as_str)
            .map(MessageTypeName::of)
    }

    /// True when the reply carries the fault marker
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(
            self.properties.get(wire::FAULTED),
            Some(PropertyValue::Bool(true))
        )
    }

    /// Deserializes the payload into the given message type
    pub fn decode<M: BusMessage>(&self) -> Result<M, BusError> {
        serde_json::from_slice(&self.payload).map_err(BusError::serialization)
    }

    /// True when the envelope's TTL has elapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: std::time::SystemTime) -> bool {
        match self.expires_after {
            Some(ttl) => now
                .duration_since(self.enqueued_time_utc.as_system_time())
                .is_ok_and(|age| age > ttl),
            None => false,
        }
    }

    /// Returns the envelope as the transport redelivers it, with the
    /// delivery count incremented in both the field and the wire property
    #[must_use]
    pub fn redelivered(mut self) -> Self {
        self.delivery_attempt = self.delivery_attempt.next();
        self.properties.insert(
            wire::DELIVERY_ATTEMPT.to_string(),
            PropertyValue::Int(i64::from(self.delivery_attempt.as_u32())),
        );
        self
    }
}

/// Serialized message body plus its wire type name.
///
/// Produced by request handlers (via the registry's erased invokers) and
/// consumed by the factory when wrapping replies.
#[derive(Debug, Clone)]
pub(crate) struct SerializedMessage {
    pub payload: Bytes,
    pub message_type: MessageTypeName,
}

impl SerializedMessage {
    pub(crate) fn encode<M: BusMessage>(message: &M) -> Result<Self, BusError> {
        let payload = serde_json::to_vec(message).map_err(BusError::serialization)?;
        Ok(Self {
            payload: Bytes::from(payload),
            message_type: MessageTypeName::of(M::MESSAGE_TYPE),
        })
    }
}

/// Builds envelopes for outgoing messages
///
/// Stamps the wire type header, sender identity, enqueue time from the
/// injected clock, and the configured default TTL.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    application_name: ApplicationName,
    instance_name: InstanceName,
    default_ttl: Duration,
    clock: SharedClock,
}

impl MessageFactory {
    /// Creates a factory for the configured bus identity
    #[must_use]
    pub fn new(config: &BusConfig, clock: SharedClock) -> Self {
        Self {
            application_name: config.application_name.clone(),
            instance_name: config.instance_name.clone(),
            default_ttl: config.default_message_time_to_live.as_duration(),
            clock,
        }
    }

    fn base_envelope(&self, body: SerializedMessage) -> Envelope {
        let mut properties = HashMap::new();
        properties.insert(
            wire::MESSAGE_TYPE.to_string(),
            PropertyValue::Str(body.message_type.clone().into_inner()),
        );
        properties.insert(
            wire::SENDER_APPLICATION_NAME.to_string(),
            PropertyValue::Str(self.application_name.to_string()),
        );
        properties.insert(
            wire::SENDER_INSTANCE_NAME.to_string(),
            PropertyValue::Str(self.instance_name.to_string()),
        );
        properties.insert(wire::DELIVERY_ATTEMPT.to_string(), PropertyValue::Int(1));

        Envelope {
            message_id: MessageId::generate(),
            correlation_id: None,
            reply_to: None,
            payload: body.payload,
            properties,
            enqueued_time_utc: MessageTimestamp::new(self.clock.now()),
            expires_after: Some(self.default_ttl),
            delivery_attempt: DeliveryAttempt::first(),
        }
    }

    /// Builds an envelope for a command or event
    pub fn envelope_for<M: BusMessage>(&self, message: &M) -> Result<Envelope, BusError> {
        Ok(self.base_envelope(SerializedMessage::encode(message)?))
    }

    /// Builds a request envelope carrying the reply path
    pub fn request_envelope_for<M: BusMessage>(
        &self,
        message: &M,
        reply_to: QueuePath,
    ) -> Result<Envelope, BusError> {
        let mut envelope = self.base_envelope(SerializedMessage::encode(message)?);
        envelope.reply_to = Some(reply_to);
        Ok(envelope)
    }

    /// Wraps a handler's return value into a reply correlated to the request
    pub(crate) fn reply_envelope(
        &self,
        body: SerializedMessage,
        request: &Envelope,
    ) -> Envelope {
        let mut envelope = self.base_envelope(body);
        envelope.correlation_id = Some(CorrelationId::from(request.message_id));
        envelope
    }

    /// Builds a faulted reply whose payload carries the serialized error
    pub(crate) fn faulted_reply(
        &self,
        detail: &str,
        request: &Envelope,
    ) -> Result<Envelope, BusError> {
        let payload = serde_json::to_vec(detail).map_err(BusError::serialization)?;
        let body = SerializedMessage {
            payload: Bytes::from(payload),
            message_type: MessageTypeName::of("Nimbus.FaultedReply"),
        };
        let mut envelope = self.base_envelope(body);
        envelope.correlation_id = Some(CorrelationId::from(request.message_id));
        envelope
            .properties
            .insert(wire::FAULTED.to_string(), PropertyValue::Bool(true));
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_clock;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct PlaceOrder {
        id: u64,
    }

    impl BusMessage for PlaceOrder {
        const MESSAGE_TYPE: &'static str = "tests.placeorder";
    }

    fn factory() -> MessageFactory {
        let config = BusConfig::for_application("orders", "orders-1").unwrap();
        MessageFactory::new(&config, test_clock())
    }

    #[test]
    fn envelope_carries_wire_properties() {
        let envelope = factory().envelope_for(&PlaceOrder { id: 7 }).unwrap();

        assert_eq!(
            envelope.message_type().unwrap().as_ref(),
            "tests.placeorder"
        );
        assert_eq!(
            envelope
                .properties
                .get(wire::SENDER_APPLICATION_NAME)
                .and_then(PropertyValue::as_str),
            Some("orders")
        );
        assert_eq!(
            envelope
                .properties
                .get(wire::SENDER_INSTANCE_NAME)
                .and_then(PropertyValue::as_str),
            Some("orders-1")
        );
        assert_eq!(
            envelope
                .properties
                .get(wire::DELIVERY_ATTEMPT)
                .and_then(PropertyValue::as_i64),
            Some(1)
        );
    }

    #[test]
    fn message_ids_are_distinct_across_envelopes() {
        let factory = factory();
        let first = factory.envelope_for(&PlaceOrder { id: 7 }).unwrap();
        let second = factory.envelope_for(&PlaceOrder { id: 7 }).unwrap();
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn payload_round_trips_through_decode() {
        let envelope = factory().envelope_for(&PlaceOrder { id: 42 }).unwrap();
        let decoded: PlaceOrder = envelope.decode().unwrap();
        assert_eq!(decoded, PlaceOrder { id: 42 });
    }

    #[test]
    fn reply_preserves_request_id_as_correlation() {
        let factory = factory();
        let mut request = factory.envelope_for(&PlaceOrder { id: 1 }).unwrap();
        request.reply_to = Some(QueuePath::try_new("nimbus.replies.orders.orders-1".to_string()).unwrap());

        let body = SerializedMessage::encode(&PlaceOrder { id: 2 }).unwrap();
        let reply = factory.reply_envelope(body, &request);

        assert!(reply.correlation_id.unwrap().refers_to(request.message_id));
        assert_ne!(reply.message_id, request.message_id);
    }

    #[test]
    fn faulted_reply_carries_marker_and_detail() {
        let factory = factory();
        let request = factory.envelope_for(&PlaceOrder { id: 1 }).unwrap();
        let reply = factory.faulted_reply("order store unavailable", &request).unwrap();

        assert!(reply.is_faulted());
        let detail: String = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(detail, "order store unavailable");
    }

    #[test]
    fn redelivery_increments_attempt_and_property() {
        let envelope = factory().envelope_for(&PlaceOrder { id: 1 }).unwrap();
        let redelivered = envelope.redelivered();

        assert_eq!(redelivered.delivery_attempt.as_u32(), 2);
        assert_eq!(
            redelivered
                .properties
                .get(wire::DELIVERY_ATTEMPT)
                .and_then(PropertyValue::as_i64),
            Some(2)
        );
    }

    #[test]
    fn expiry_follows_ttl() {
        let factory = factory();
        let envelope = factory.envelope_for(&PlaceOrder { id: 1 }).unwrap();
        let enqueued = envelope.enqueued_time_utc.as_system_time();

        assert!(!envelope.is_expired(enqueued));
        let past_ttl = enqueued + envelope.expires_after.unwrap() + Duration::from_secs(1);
        assert!(envelope.is_expired(past_ttl));
    }
}
