//! Broker facade
//!
//! The user-facing entry points: `send`, `publish`, `request` and
//! `multicast_request`, plus the builder that wires every component and the
//! start/shutdown lifecycle that provisions entities and spawns pumps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::BusConfig;
use super::correlator::RequestCorrelator;
use super::dispatcher::DispatcherFactory;
use super::domain_types::{MessageTypeName, QueuePath};
use super::entity_manager::EntityManager;
use super::envelope::{BusMessage, MessageFactory, RequestMessage};
use super::handlers::HandlerShape;
use super::interceptor::{
    InboundInterceptorFactory, NoInterceptors, OutboundInterceptorFactory,
};
use super::pipeline::{OutboundPipeline, SendKind};
use super::pump::{MessagePump, ReplyPump};
use super::registry::{HandlerMap, HandlerRegistration, KnownMessageTypeVerifier, TypeProvider};
use super::router::PathRouter;
use super::scope::{DependencyResolver, NoopResolver};
use super::transport::Transport;
use crate::error::BusError;
use crate::time_provider::{SharedClock, system_clock};

struct BusInner {
    config: BusConfig,
    clock: SharedClock,
    transport: Arc<dyn Transport>,
    router: PathRouter,
    factory: MessageFactory,
    verifier: KnownMessageTypeVerifier,
    map: Arc<HandlerMap>,
    correlator: Arc<RequestCorrelator>,
    entities: Arc<EntityManager>,
    pipeline: Arc<OutboundPipeline>,
    dispatchers: DispatcherFactory,
    reply_queue: QueuePath,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The message bus
///
/// Cheap to clone; all clones share the same transport connection, entity
/// known-sets and correlator.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Starts a builder
    #[must_use]
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    /// Provisions infrastructure for every registered handler and spawns
    /// the pumps.
    ///
    /// Idempotent; a second call is a no-op.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("bus already started");
            return Ok(());
        }
        info!(
            application = %self.inner.config.application_name,
            instance = %self.inner.config.instance_name,
            "starting bus"
        );

        let provisioned = self.provision().await;
        if provisioned.is_err() {
            self.inner.started.store(false, Ordering::SeqCst);
        }
        provisioned
    }

    async fn provision(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        let shutdown = inner.shutdown.subscribe();
        let mut tasks = inner.tasks.lock().await;

        // Dead letter office is an ordinary queue at a well-known path
        let dead_letter_path = inner.router.dead_letter_path();
        inner.entities.ensure_queue(&dead_letter_path).await?;
        let dead_letter = inner.transport.queue_sender(&dead_letter_path).await?;

        // Reply queue and its correlator pump
        inner.entities.ensure_queue(&inner.reply_queue).await?;
        let reply_receiver = inner.transport.queue_receiver(&inner.reply_queue).await?;
        tasks.push(
            ReplyPump {
                label: inner.reply_queue.to_string(),
                receiver: reply_receiver,
                correlator: Arc::clone(&inner.correlator),
            }
            .spawn(shutdown.clone()),
        );
        tasks.push(inner.correlator.spawn_reaper(shutdown.clone()));

        // Queue-handled shapes: one queue and one pump per message type
        for shape in [HandlerShape::Command, HandlerShape::Request] {
            for message_type in inner.map.message_types_for(shape) {
                let path = inner.router.queue_path(&message_type);
                inner.entities.ensure_queue(&path).await?;
                let receiver = inner.transport.queue_receiver(&path).await?;
                tasks.push(
                    MessagePump {
                        label: path.to_string(),
                        receiver,
                        dispatcher: inner.dispatchers.create(shape),
                        dead_letter: Arc::clone(&dead_letter),
                        max_delivery_attempts: inner.config.max_delivery_attempts.as_u32(),
                    }
                    .spawn(shutdown.clone()),
                );
                debug!(path = %path, shape = ?shape, "queue pump provisioned");
            }
        }

        // Topic-handled shapes: shared subscription for competing events,
        // per-instance subscription for fan-out shapes
        for shape in [
            HandlerShape::CompetingEvent,
            HandlerShape::MulticastEvent,
            HandlerShape::MulticastRequest,
        ] {
            for message_type in inner.map.message_types_for(shape) {
                let topic = inner.router.topic_path(&message_type);
                let subscription = match shape {
                    HandlerShape::CompetingEvent => inner
                        .router
                        .competing_subscription(&inner.config.application_name),
                    _ => inner.router.instance_subscription(
                        &inner.config.application_name,
                        &inner.config.instance_name,
                    ),
                };
                inner
                    .entities
                    .ensure_subscription(&topic, &subscription)
                    .await?;
                let receiver = inner
                    .transport
                    .subscription_receiver(&topic, &subscription)
                    .await?;
                tasks.push(
                    MessagePump {
                        label: format!("{topic}/{subscription}"),
                        receiver,
                        dispatcher: inner.dispatchers.create(shape),
                        dead_letter: Arc::clone(&dead_letter),
                        max_delivery_attempts: inner.config.max_delivery_attempts.as_u32(),
                    }
                    .spawn(shutdown.clone()),
                );
                debug!(topic = %topic, subscription = %subscription, shape = ?shape, "subscription pump provisioned");
            }
        }

        info!(pumps = tasks.len(), "bus started");
        Ok(())
    }

    /// Stops the pumps and the reaper, draining in-flight dispatches
    pub async fn shutdown(&self) -> Result<(), BusError> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down bus");
        let _ = self.inner.shutdown.send(true);

        let mut tasks = self.inner.tasks.lock().await;
        let joined = futures::future::join_all(tasks.drain(..)).await;
        for result in joined {
            if let Err(join_error) = result {
                warn!(error = %join_error, "pump task ended abnormally");
            }
        }
        info!("bus stopped");
        Ok(())
    }

    /// Sends a command to its queue (fire-and-forget)
    pub async fn send<C: BusMessage>(&self, command: C) -> Result<(), BusError> {
        let message_type = MessageTypeName::of(C::MESSAGE_TYPE);
        self.inner.verifier.assert_valid_for_queue(&message_type)?;

        let path = self.inner.router.queue_path(&message_type);
        self.inner.entities.ensure_queue(&path).await?;

        let envelope = self.inner.factory.envelope_for(&command)?;
        debug!(message_id = %envelope.message_id, path = %path, "sending command");
        self.inner
            .pipeline
            .send_to_queue(&path, envelope, SendKind::Send)
            .await
    }

    /// Publishes an event to its topic
    pub async fn publish<E: BusMessage>(&self, event: E) -> Result<(), BusError> {
        let message_type = MessageTypeName::of(E::MESSAGE_TYPE);
        self.inner.verifier.assert_valid_for_topic(&message_type)?;

        let path = self.inner.router.topic_path(&message_type);
        self.inner.entities.ensure_topic(&path).await?;

        let envelope = self.inner.factory.envelope_for(&event)?;
        debug!(message_id = %envelope.message_id, path = %path, "publishing event");
        self.inner
            .pipeline
            .send_to_topic(&path, envelope, SendKind::Send)
            .await
    }

    /// Sends a request and awaits its correlated reply.
    ///
    /// `timeout` defaults to the configured response timeout. Requires a
    /// started bus (the reply pump completes the wait).
    pub async fn request<R: RequestMessage>(
        &self,
        request: R,
        timeout: Option<Duration>,
    ) -> Result<R::Response, BusError> {
        self.assert_started("request")?;
        let message_type = MessageTypeName::of(R::MESSAGE_TYPE);
        self.inner.verifier.assert_valid_for_queue(&message_type)?;

        let path = self.inner.router.queue_path(&message_type);
        self.inner.entities.ensure_queue(&path).await?;

        let timeout =
            timeout.unwrap_or_else(|| self.inner.config.default_response_timeout.as_duration());
        let envelope = self
            .inner
            .factory
            .request_envelope_for(&request, self.inner.reply_queue.clone())?;
        let expires_at = self.inner.clock.now() + timeout;

        // Correlation is recorded between envelope build and send
        let handle = self
            .inner
            .correlator
            .record_request::<R::Response>(envelope.message_id, expires_at);

        debug!(message_id = %envelope.message_id, path = %path, ?timeout, "sending request");
        if let Err(send_error) = self
            .inner
            .pipeline
            .send_to_queue(&path, envelope, SendKind::Request)
            .await
        {
            handle.cancel();
            return Err(send_error);
        }

        handle.wait_for_response(timeout).await
    }

    /// Publishes a request to a topic and collects every reply arriving
    /// within the window
    pub async fn multicast_request<R: RequestMessage>(
        &self,
        request: R,
        timeout: Duration,
    ) -> Result<Vec<R::Response>, BusError> {
        self.assert_started("multicast request")?;
        let message_type = MessageTypeName::of(R::MESSAGE_TYPE);
        self.inner.verifier.assert_valid_for_topic(&message_type)?;

        let path = self.inner.router.topic_path(&message_type);
        self.inner.entities.ensure_topic(&path).await?;

        let envelope = self
            .inner
            .factory
            .request_envelope_for(&request, self.inner.reply_queue.clone())?;
        let expires_at = self.inner.clock.now() + timeout;
        let message_id = envelope.message_id;

        let handle = self
            .inner
            .correlator
            .record_multicast_request::<R::Response>(message_id, expires_at);

        debug!(message_id = %message_id, path = %path, ?timeout, "sending multicast request");
        if let Err(send_error) = self
            .inner
            .pipeline
            .send_to_topic(&path, envelope, SendKind::Request)
            .await
        {
            self.inner.correlator.remove(message_id);
            return Err(send_error);
        }

        Ok(handle.collect_responses(timeout).await)
    }

    /// Number of requests currently awaiting replies
    #[must_use]
    pub fn outstanding_requests(&self) -> usize {
        self.inner.correlator.outstanding_count()
    }

    fn assert_started(&self, operation: &str) -> Result<(), BusError> {
        if self.inner.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Config {
                message: format!("bus must be started before '{operation}'"),
            })
        }
    }
}

/// Wires configuration, transport, handlers and interceptors into a [`Bus`]
pub struct BusBuilder {
    config: Option<BusConfig>,
    transport: Option<Arc<dyn Transport>>,
    resolver: Arc<dyn DependencyResolver>,
    clock: SharedClock,
    provider: Option<Box<dyn TypeProvider>>,
    inbound: Arc<dyn InboundInterceptorFactory>,
    outbound: Arc<dyn OutboundInterceptorFactory>,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusBuilder {
    /// Creates a builder with no transport, no handlers and no interceptors
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: None,
            transport: None,
            resolver: Arc::new(NoopResolver),
            clock: system_clock(),
            provider: None,
            inbound: Arc::new(NoInterceptors),
            outbound: Arc::new(NoInterceptors),
        }
    }

    /// Sets the bus configuration (required)
    #[must_use]
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the transport (required)
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the handler registration
    #[must_use]
    pub fn with_handlers(mut self, registration: HandlerRegistration) -> Self {
        self.provider = Some(Box::new(registration));
        self
    }

    /// Sets a custom type provider in place of a registration
    #[must_use]
    pub fn with_type_provider(mut self, provider: Box<dyn TypeProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the dependency resolver (defaults to no-op scopes)
    #[must_use]
    pub fn with_dependency_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the clock (defaults to the system clock)
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the inbound interceptor factory
    #[must_use]
    pub fn with_inbound_interceptors(
        mut self,
        factory: Arc<dyn InboundInterceptorFactory>,
    ) -> Self {
        self.inbound = factory;
        self
    }

    /// Sets the outbound interceptor factory
    #[must_use]
    pub fn with_outbound_interceptors(
        mut self,
        factory: Arc<dyn OutboundInterceptorFactory>,
    ) -> Self {
        self.outbound = factory;
        self
    }

    /// Validates the wiring and builds the bus
    pub fn build(self) -> Result<Bus, BusError> {
        let config = self.config.ok_or_else(|| BusError::Config {
            message: "bus configuration is required".to_string(),
        })?;
        let transport = self.transport.ok_or_else(|| BusError::Config {
            message: "a transport is required".to_string(),
        })?;
        let provider = self
            .provider
            .unwrap_or_else(|| Box::new(HandlerRegistration::new()));

        // The provider is queried exactly once, here
        let map = Arc::new(HandlerMap::from_provider(provider.as_ref())?);
        let verifier = KnownMessageTypeVerifier::from_provider(provider.as_ref());

        let router = PathRouter::new(config.global_prefix.clone());
        let factory = MessageFactory::new(&config, Arc::clone(&self.clock));
        let correlator = Arc::new(RequestCorrelator::new(Arc::clone(&self.clock)));
        let entities = Arc::new(EntityManager::new(
            transport.namespace_manager(),
            config.clone(),
            Arc::clone(&self.clock),
        ));
        let pipeline = Arc::new(OutboundPipeline::new(
            Arc::clone(&transport),
            Arc::clone(&self.outbound),
            Arc::clone(&self.resolver),
        ));
        let dispatchers = DispatcherFactory::new(
            Arc::clone(&map),
            Arc::clone(&self.resolver),
            Arc::clone(&self.inbound),
            Arc::clone(&pipeline),
            factory.clone(),
        );
        let reply_queue =
            router.reply_queue_path(&config.application_name, &config.instance_name);
        let (shutdown, _) = watch::channel(false);

        Ok(Bus {
            inner: Arc::new(BusInner {
                config,
                clock: self.clock,
                transport,
                router,
                factory,
                verifier,
                map,
                correlator,
                entities,
                pipeline,
                dispatchers,
                reply_queue,
                shutdown,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryTransport;

    #[test]
    fn build_requires_config_and_transport() {
        assert!(matches!(
            Bus::builder().build(),
            Err(BusError::Config { .. })
        ));

        let config = BusConfig::for_application("tests", "tests-1").unwrap();
        assert!(matches!(
            Bus::builder().with_config(config).build(),
            Err(BusError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn request_requires_started_bus() {
        use crate::bus::envelope::{BusMessage, RequestMessage};
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Serialize, Deserialize)]
        struct Ping;
        #[derive(Debug, Serialize, Deserialize)]
        struct Pong;

        impl BusMessage for Ping {
            const MESSAGE_TYPE: &'static str = "tests.ping";
        }
        impl BusMessage for Pong {
            const MESSAGE_TYPE: &'static str = "tests.pong";
        }
        impl RequestMessage for Ping {
            type Response = Pong;
        }

        let bus = Bus::builder()
            .with_config(BusConfig::for_application("tests", "tests-1").unwrap())
            .with_transport(Arc::new(InMemoryTransport::new()))
            .build()
            .unwrap();

        let result = bus.request(Ping, None).await;
        assert!(matches!(result, Err(BusError::Config { .. })));
    }
}
