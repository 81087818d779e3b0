//! Error taxonomy for bus operations
//!
//! One top-level [`BusError`] covers everything a caller of the broker facade
//! can observe. Component-internal errors ([`TransportError`],
//! `EntityCreateError`) are defined next to their traits and converted at the
//! seam, preserving the original error data verbatim.

#![allow(clippy::module_name_repetitions)]

use std::time::Duration;
use thiserror::Error;

use crate::bus::domain_types::{MessageId, MessageTypeName};
use crate::bus::transport::TransportError;

/// Error type raised by a user handler.
///
/// Handlers surface their own domain failures; the bus wraps them without
/// losing the source chain.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by bus operations
#[derive(Debug, Error)]
pub enum BusError {
    /// The message type was never registered with the type provider.
    /// Fatal to the call; never retried.
    #[error("unknown message type: {message_type}")]
    UnknownMessageType {
        /// The unregistered type name
        message_type: MessageTypeName,
    },

    /// Envelope construction or payload decode failed
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying serde failure
        #[source]
        source: serde_json::Error,
    },

    /// Creating a queue, topic or subscription exhausted its retries
    #[error("entity creation failed for '{path}' after {retry_count} attempts")]
    EntityCreationFailed {
        /// The transport path that could not be provisioned
        path: String,
        /// Number of create attempts made
        retry_count: u32,
        /// The final transport error, when one was observed
        #[source]
        source: Option<TransportError>,
    },

    /// Deadline exceeded on a request or a bulk namespace fetch
    #[error("'{operation}' timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// The reply envelope carried a fault marker from the remote handler
    #[error("request failed remotely: {detail}")]
    RequestFailedRemotely {
        /// Serialized remote error detail, verbatim
        detail: String,
    },

    /// The caller cancelled an in-flight request
    #[error("request {message_id} was cancelled")]
    RequestCancelled {
        /// Id of the cancelled request
        message_id: MessageId,
    },

    /// Transport-level failure; transient kinds are retried per policy and
    /// surface here only on exhaustion
    #[error("transport error: {source}")]
    Transport {
        /// The underlying transport failure
        #[from]
        source: TransportError,
    },

    /// A user handler returned an error; propagated to the inbound error
    /// interceptors and reported to the transport as a nack
    #[error("handler '{handler}' failed")]
    Handler {
        /// Type name of the failing handler
        handler: &'static str,
        /// The handler's own error
        #[source]
        source: HandlerError,
    },

    /// Aggregate of multiple handler failures in an event fan-out
    #[error("{} of {total} handlers failed during dispatch", failures.len())]
    DispatchComposite {
        /// Every individual handler failure, in handler order
        failures: Vec<BusError>,
        /// Number of handlers invoked
        total: usize,
    },

    /// The envelope is missing required wire properties
    #[error("malformed envelope: {message}")]
    MalformedEnvelope {
        /// What was missing or invalid
        message: String,
    },

    /// Invalid bus configuration or wiring
    #[error("configuration error: {message}")]
    Config {
        /// What is misconfigured
        message: String,
    },
}

impl BusError {
    pub(crate) fn serialization(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }

    /// True when the error is the timeout kind
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
