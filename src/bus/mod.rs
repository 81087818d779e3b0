//! Message bus core
//!
//! The dispatch, correlation and broker-plumbing engine sitting between
//! user-authored handlers and the underlying queue/topic transport. It
//! mediates four interaction patterns:
//!
//! - **Commands**: fire-and-forget, single consumer
//! - **Competing events**: load-balanced across instances sharing a
//!   subscription
//! - **Multicast events**: fan-out to every subscriber
//! - **Request/response**: correlated RPC over queues, including a
//!   multicast variant collecting a stream of replies
//!
//! ## Core components
//!
//! - [`Bus`](broker::Bus): the user-facing facade (`send`, `publish`,
//!   `request`, `multicast_request`)
//! - [`MessageDispatcher`](dispatcher::MessageDispatcher): converts received
//!   envelopes into handler invocations, one variant per handler shape
//! - [`RequestCorrelator`](correlator::RequestCorrelator): outstanding
//!   request registry with TTLs and a periodic reaper
//! - [`EntityManager`](entity_manager::EntityManager): lazy, idempotent
//!   provisioning of queues, topics and subscriptions
//! - [`PathRouter`](router::PathRouter): pure message-type to path mapping
//! - Interceptor chains around every send and dispatch, with mirrored
//!   before/after ordering
//!
//! ## Message flow
//!
//! ```text
//! caller -> Bus -> PathRouter -> MessageFactory -> OutboundChain -> Transport
//!                                      |
//!                            (requests) RequestCorrelator <- ReplyPump
//!
//! Transport -> MessagePump -> MessageDispatcher -> InboundChain -> handlers
//!                   |                                   |
//!              dead letter                       reply via OutboundChain
//! ```

#![allow(
    clippy::match_same_arms,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::struct_field_names,
    clippy::trivially_copy_pass_by_ref,
    clippy::type_complexity
)]

pub mod broker;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod domain_types;
pub mod entity_manager;
pub mod envelope;
pub mod handlers;
pub mod interceptor;
pub mod memory;
pub mod pipeline;
pub mod pump;
pub mod registry;
pub mod router;
pub mod scope;
pub mod transport;

pub use broker::{Bus, BusBuilder};
pub use config::{BusConfig, BusConfigBuilder, ConfigError};
pub use correlator::{MulticastResponseHandle, RequestCorrelator, ResponseHandle};
pub use dispatcher::{DispatchResult, DispatcherFactory, MessageDispatcher};
pub use domain_types::*;
pub use entity_manager::EntityManager;
pub use envelope::{BusMessage, Envelope, MessageFactory, PropertyValue, RequestMessage, wire};
pub use handlers::{
    CommandHandler, CompetingEventHandler, DispatchContext, HandlerShape, MulticastEventHandler,
    MulticastRequestHandler, RequestHandler,
};
pub use interceptor::{
    InboundChain, InboundInterceptor, InboundInterceptorFactory, NoInterceptors, OutboundChain,
    OutboundInterceptor, OutboundInterceptorFactory,
};
pub use memory::{CreateFault, InMemoryNamespace, InMemoryTransport};
pub use registry::{
    HandlerBinding, HandlerMap, HandlerRegistration, KnownMessageTypeVerifier, TypeProvider,
};
pub use router::{DEAD_LETTER_OFFICE, PathRouter};
pub use scope::{
    CountingResolver, DependencyResolver, DependencyScope, NoopResolver, ScopeGuard,
};
pub use transport::{
    DispatchOutcome, EntityCreateError, MessageReceiver, MessageSender, NamespaceManager,
    QueueDescriptor, SubscriptionDescriptor, TopicDescriptor, Transport, TransportError,
};
