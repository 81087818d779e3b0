//! Handler registry and type provider
//!
//! Dispatch is driven by a registry keyed by handler shape plus message type
//! name. Registration erases the concrete handler behind an invoker that
//! closes over the shape: the invoker decodes the payload, constructs the
//! handler through its factory inside the dispatch scope, and runs it. The
//! map is built once at startup from the [`TypeProvider`] and is immutable
//! thereafter.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::domain_types::MessageTypeName;
use super::envelope::{BusMessage, Envelope, RequestMessage, SerializedMessage};
use super::handlers::{
    CommandHandler, CompetingEventHandler, DispatchContext, HandlerShape, MulticastEventHandler,
    MulticastRequestHandler, RequestHandler,
};
use super::scope::DependencyScope;
use crate::error::BusError;

/// Type-erased handler invocation for one registered handler
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    /// Concrete handler type name; the registry's stable ordering key
    fn handler_name(&self) -> &'static str;

    /// Decodes the payload, constructs the handler in `scope` and runs it.
    ///
    /// Request shapes return the serialized reply body.
    async fn invoke(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> Result<Option<SerializedMessage>, BusError>;
}

struct CommandInvoker<C: BusMessage> {
    handler_name: &'static str,
    factory: Arc<dyn Fn(&dyn DependencyScope) -> Arc<dyn CommandHandler<C>> + Send + Sync>,
}

#[async_trait]
impl<C: BusMessage> ErasedHandler for CommandInvoker<C> {
    fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    async fn invoke(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> Result<Option<SerializedMessage>, BusError> {
        let command: C = envelope.decode()?;
        let handler = (self.factory)(scope);
        handler
            .handle(command, context)
            .await
            .map_err(|source| BusError::Handler {
                handler: self.handler_name,
                source,
            })?;
        Ok(None)
    }
}

struct CompetingEventInvoker<E: BusMessage> {
    handler_name: &'static str,
    factory: Arc<dyn Fn(&dyn DependencyScope) -> Arc<dyn CompetingEventHandler<E>> + Send + Sync>,
}

#[async_trait]
impl<E: BusMessage> ErasedHandler for CompetingEventInvoker<E> {
    fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    async fn invoke(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> Result<Option<SerializedMessage>, BusError> {
        let event: E = envelope.decode()?;
        let handler = (self.factory)(scope);
        handler
            .handle(event, context)
            .await
            .map_err(|source| BusError::Handler {
                handler: self.handler_name,
                source,
            })?;
        Ok(None)
    }
}

struct MulticastEventInvoker<E: BusMessage> {
    handler_name: &'static str,
    factory: Arc<dyn Fn(&dyn DependencyScope) -> Arc<dyn MulticastEventHandler<E>> + Send + Sync>,
}

#[async_trait]
impl<E: BusMessage> ErasedHandler for MulticastEventInvoker<E> {
    fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    async fn invoke(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> Result<Option<SerializedMessage>, BusError> {
        let event: E = envelope.decode()?;
        let handler = (self.factory)(scope);
        handler
            .handle(event, context)
            .await
            .map_err(|source| BusError::Handler {
                handler: self.handler_name,
                source,
            })?;
        Ok(None)
    }
}

struct RequestInvoker<R: RequestMessage> {
    handler_name: &'static str,
    factory: Arc<dyn Fn(&dyn DependencyScope) -> Arc<dyn RequestHandler<R>> + Send + Sync>,
}

#[async_trait]
impl<R: RequestMessage> ErasedHandler for RequestInvoker<R> {
    fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    async fn invoke(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> Result<Option<SerializedMessage>, BusError> {
        let request: R = envelope.decode()?;
        let handler = (self.factory)(scope);
        let response = handler
            .handle(request, context)
            .await
            .map_err(|source| BusError::Handler {
                handler: self.handler_name,
                source,
            })?;
        Ok(Some(SerializedMessage::encode(&response)?))
    }
}

struct MulticastRequestInvoker<R: RequestMessage> {
    handler_name: &'static str,
    factory: Arc<dyn Fn(&dyn DependencyScope) -> Arc<dyn MulticastRequestHandler<R>> + Send + Sync>,
}

#[async_trait]
impl<R: RequestMessage> ErasedHandler for MulticastRequestInvoker<R> {
    fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    async fn invoke(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> Result<Option<SerializedMessage>, BusError> {
        let request: R = envelope.decode()?;
        let handler = (self.factory)(scope);
        let response = handler
            .handle(request, context)
            .await
            .map_err(|source| BusError::Handler {
                handler: self.handler_name,
                source,
            })?;
        Ok(Some(SerializedMessage::encode(&response)?))
    }
}

/// One registered handler: shape, message type and erased invoker
pub struct HandlerBinding {
    shape: HandlerShape,
    message_type: MessageTypeName,
    invoker: Arc<dyn ErasedHandler>,
}

impl HandlerBinding {
    /// The handler's interaction shape
    #[must_use]
    pub fn shape(&self) -> HandlerShape {
        self.shape
    }

    /// The handled message type
    #[must_use]
    pub fn message_type(&self) -> &MessageTypeName {
        &self.message_type
    }
}

impl std::fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("shape", &self.shape)
            .field("message_type", &self.message_type)
            .field("handler", &self.invoker.handler_name())
            .finish()
    }
}

/// Enumerates handler bindings and handled message types.
///
/// Queried once at startup; the bus never consults it again.
pub trait TypeProvider: Send + Sync {
    /// All registered handler bindings
    fn bindings(&self) -> &[HandlerBinding];

    /// Message types handled via queues (commands and requests)
    fn queue_message_types(&self) -> &HashSet<MessageTypeName>;

    /// Message types handled via topics (events and multicast requests)
    fn topic_message_types(&self) -> &HashSet<MessageTypeName>;
}

/// Builder-style handler registration; the default [`TypeProvider`]
#[derive(Default)]
pub struct HandlerRegistration {
    bindings: Vec<HandlerBinding>,
    queue_types: HashSet<MessageTypeName>,
    topic_types: HashSet<MessageTypeName>,
}

impl HandlerRegistration {
    /// Starts an empty registration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&mut self, shape: HandlerShape, message_type: MessageTypeName, invoker: Arc<dyn ErasedHandler>) {
        if shape.uses_queue() {
            self.queue_types.insert(message_type.clone());
        } else {
            self.topic_types.insert(message_type.clone());
        }
        self.bindings.push(HandlerBinding {
            shape,
            message_type,
            invoker,
        });
    }

    /// Registers a command handler
    #[must_use]
    pub fn handle_command<C, H, F>(mut self, factory: F) -> Self
    where
        C: BusMessage,
        H: CommandHandler<C> + 'static,
        F: Fn(&dyn DependencyScope) -> H + Send + Sync + 'static,
    {
        let invoker = CommandInvoker::<C> {
            handler_name: std::any::type_name::<H>(),
            factory: Arc::new(move |scope| Arc::new(factory(scope))),
        };
        self.bind(
            HandlerShape::Command,
            MessageTypeName::of(C::MESSAGE_TYPE),
            Arc::new(invoker),
        );
        self
    }

    /// Registers a competing event handler
    #[must_use]
    pub fn handle_competing_event<E, H, F>(mut self, factory: F) -> Self
    where
        E: BusMessage,
        H: CompetingEventHandler<E> + 'static,
        F: Fn(&dyn DependencyScope) -> H + Send + Sync + 'static,
    {
        let invoker = CompetingEventInvoker::<E> {
            handler_name: std::any::type_name::<H>(),
            factory: Arc::new(move |scope| Arc::new(factory(scope))),
        };
        self.bind(
            HandlerShape::CompetingEvent,
            MessageTypeName::of(E::MESSAGE_TYPE),
            Arc::new(invoker),
        );
        self
    }

    /// Registers a multicast event handler
    #[must_use]
    pub fn handle_multicast_event<E, H, F>(mut self, factory: F) -> Self
    where
        E: BusMessage,
        H: MulticastEventHandler<E> + 'static,
        F: Fn(&dyn DependencyScope) -> H + Send + Sync + 'static,
    {
        let invoker = MulticastEventInvoker::<E> {
            handler_name: std::any::type_name::<H>(),
            factory: Arc::new(move |scope| Arc::new(factory(scope))),
        };
        self.bind(
            HandlerShape::MulticastEvent,
            MessageTypeName::of(E::MESSAGE_TYPE),
            Arc::new(invoker),
        );
        self
    }

    /// Registers the request handler for a request type
    #[must_use]
    pub fn handle_request<R, H, F>(mut self, factory: F) -> Self
    where
        R: RequestMessage,
        H: RequestHandler<R> + 'static,
        F: Fn(&dyn DependencyScope) -> H + Send + Sync + 'static,
    {
        let invoker = RequestInvoker::<R> {
            handler_name: std::any::type_name::<H>(),
            factory: Arc::new(move |scope| Arc::new(factory(scope))),
        };
        self.bind(
            HandlerShape::Request,
            MessageTypeName::of(R::MESSAGE_TYPE),
            Arc::new(invoker),
        );
        self
    }

    /// Registers a multicast request handler
    #[must_use]
    pub fn handle_multicast_request<R, H, F>(mut self, factory: F) -> Self
    where
        R: RequestMessage,
        H: MulticastRequestHandler<R> + 'static,
        F: Fn(&dyn DependencyScope) -> H + Send + Sync + 'static,
    {
        let invoker = MulticastRequestInvoker::<R> {
            handler_name: std::any::type_name::<H>(),
            factory: Arc::new(move |scope| Arc::new(factory(scope))),
        };
        self.bind(
            HandlerShape::MulticastRequest,
            MessageTypeName::of(R::MESSAGE_TYPE),
            Arc::new(invoker),
        );
        self
    }
}

impl TypeProvider for HandlerRegistration {
    fn bindings(&self) -> &[HandlerBinding] {
        &self.bindings
    }

    fn queue_message_types(&self) -> &HashSet<MessageTypeName> {
        &self.queue_types
    }

    fn topic_message_types(&self) -> &HashSet<MessageTypeName> {
        &self.topic_types
    }
}

/// Immutable map from (shape, message type) to ordered handler invokers
pub struct HandlerMap {
    entries: HashMap<(HandlerShape, MessageTypeName), Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerMap {
    /// Builds the map from a type provider, validating shape constraints
    pub fn from_provider(provider: &dyn TypeProvider) -> Result<Self, BusError> {
        let mut entries: HashMap<(HandlerShape, MessageTypeName), Vec<Arc<dyn ErasedHandler>>> =
            HashMap::new();
        let mut shapes_by_type: HashMap<MessageTypeName, HandlerShape> = HashMap::new();

        for binding in provider.bindings() {
            if let Some(existing) = shapes_by_type.get(&binding.message_type) {
                if *existing != binding.shape {
                    return Err(BusError::Config {
                        message: format!(
                            "message type '{}' is registered with conflicting shapes {existing:?} and {:?}",
                            binding.message_type, binding.shape
                        ),
                    });
                }
            } else {
                shapes_by_type.insert(binding.message_type.clone(), binding.shape);
            }

            entries
                .entry((binding.shape, binding.message_type.clone()))
                .or_default()
                .push(Arc::clone(&binding.invoker));
        }

        for ((shape, message_type), handlers) in &mut entries {
            // Stable ordering by handler type name
            handlers.sort_by_key(|handler| handler.handler_name());

            if *shape == HandlerShape::Request && handlers.len() != 1 {
                return Err(BusError::Config {
                    message: format!(
                        "request type '{message_type}' requires exactly one handler, found {}",
                        handlers.len()
                    ),
                });
            }
        }

        Ok(Self { entries })
    }

    /// Handlers registered for one shape and message type
    pub(crate) fn handlers_for(
        &self,
        shape: HandlerShape,
        message_type: &MessageTypeName,
    ) -> Option<&[Arc<dyn ErasedHandler>]> {
        self.entries
            .get(&(shape, message_type.clone()))
            .map(Vec::as_slice)
    }

    /// Every message type registered under the given shape
    pub(crate) fn message_types_for(&self, shape: HandlerShape) -> Vec<MessageTypeName> {
        self.entries
            .keys()
            .filter(|(entry_shape, _)| *entry_shape == shape)
            .map(|(_, message_type)| message_type.clone())
            .collect()
    }
}

/// Pre-flight check refusing message types the provider never registered
#[derive(Debug, Clone)]
pub struct KnownMessageTypeVerifier {
    queue_types: HashSet<MessageTypeName>,
    topic_types: HashSet<MessageTypeName>,
}

impl KnownMessageTypeVerifier {
    /// Snapshots the provider's registered types
    #[must_use]
    pub fn from_provider(provider: &dyn TypeProvider) -> Self {
        Self {
            queue_types: provider.queue_message_types().clone(),
            topic_types: provider.topic_message_types().clone(),
        }
    }

    /// Verifies a type is handled via a queue
    pub fn assert_valid_for_queue(&self, message_type: &MessageTypeName) -> Result<(), BusError> {
        if self.queue_types.contains(message_type) {
            Ok(())
        } else {
            Err(BusError::UnknownMessageType {
                message_type: message_type.clone(),
            })
        }
    }

    /// Verifies a type is handled via a topic
    pub fn assert_valid_for_topic(&self, message_type: &MessageTypeName) -> Result<(), BusError> {
        if self.topic_types.contains(message_type) {
            Ok(())
        } else {
            Err(BusError::UnknownMessageType {
                message_type: message_type.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct PlaceOrder {
        id: u64,
    }

    impl BusMessage for PlaceOrder {
        const MESSAGE_TYPE: &'static str = "tests.placeorder";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "tests.ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong;

    impl BusMessage for Pong {
        const MESSAGE_TYPE: &'static str = "tests.pong";
    }

    impl RequestMessage for Ping {
        type Response = Pong;
    }

    struct OrderHandler;

    #[async_trait]
    impl CommandHandler<PlaceOrder> for OrderHandler {
        async fn handle(
            &self,
            _command: PlaceOrder,
            _context: &DispatchContext,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct PingHandler;

    #[async_trait]
    impl RequestHandler<Ping> for PingHandler {
        async fn handle(
            &self,
            _request: Ping,
            _context: &DispatchContext,
        ) -> Result<Pong, HandlerError> {
            Ok(Pong)
        }
    }

    #[test]
    fn registration_tracks_queue_and_topic_types() {
        let registration = HandlerRegistration::new()
            .handle_command(|_| OrderHandler)
            .handle_request(|_| PingHandler);

        assert!(
            registration
                .queue_message_types()
                .contains(&MessageTypeName::of("tests.placeorder"))
        );
        assert!(
            registration
                .queue_message_types()
                .contains(&MessageTypeName::of("tests.ping"))
        );
        assert!(registration.topic_message_types().is_empty());
    }

    #[test]
    fn map_rejects_duplicate_request_handlers() {
        let registration = HandlerRegistration::new()
            .handle_request(|_| PingHandler)
            .handle_request(|_| PingHandler);

        assert!(matches!(
            HandlerMap::from_provider(&registration),
            Err(BusError::Config { .. })
        ));
    }

    #[test]
    fn map_rejects_conflicting_shapes_for_one_type() {
        struct OrderEventHandler;

        #[async_trait]
        impl CompetingEventHandler<PlaceOrder> for OrderEventHandler {
            async fn handle(
                &self,
                _event: PlaceOrder,
                _context: &DispatchContext,
            ) -> Result<(), HandlerError> {
                Ok(())
            }
        }

        let registration = HandlerRegistration::new()
            .handle_command(|_| OrderHandler)
            .handle_competing_event(|_| OrderEventHandler);

        assert!(matches!(
            HandlerMap::from_provider(&registration),
            Err(BusError::Config { .. })
        ));
    }

    #[test]
    fn verifier_refuses_unregistered_types() {
        let registration = HandlerRegistration::new().handle_command(|_| OrderHandler);
        let verifier = KnownMessageTypeVerifier::from_provider(&registration);

        assert!(
            verifier
                .assert_valid_for_queue(&MessageTypeName::of("tests.placeorder"))
                .is_ok()
        );
        assert!(matches!(
            verifier.assert_valid_for_queue(&MessageTypeName::of("tests.unknown")),
            Err(BusError::UnknownMessageType { .. })
        ));
        assert!(
            verifier
                .assert_valid_for_topic(&MessageTypeName::of("tests.placeorder"))
                .is_err()
        );
    }
}
