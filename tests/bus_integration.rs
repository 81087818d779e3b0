//! End-to-end bus tests over the in-memory transport
//!
//! Exercises the broker facade with real pumps: command dispatch, event
//! fan-out with composite failures and dead-lettering, interceptor ordering
//! and scope containment.

use async_trait::async_trait;
use nimbus::HandlerError;
use nimbus::bus::{
    Bus, BusConfig, BusMessage, CommandHandler, CompetingEventHandler, CountingResolver,
    DispatchContext, Envelope, HandlerRegistration, InMemoryTransport, InboundInterceptorFactory,
    MulticastEventHandler, OutboundInterceptor, OutboundInterceptorFactory, QueuePath,
};
use nimbus::error::BusError;
use nimbus::test_clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlaceOrder {
    id: u64,
}

impl BusMessage for PlaceOrder {
    const MESSAGE_TYPE: &'static str = "orders.placeorder";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    id: u64,
}

impl BusMessage for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "orders.orderplaced";
}

#[derive(Debug, Serialize, Deserialize)]
struct Unregistered;

impl BusMessage for Unregistered {
    const MESSAGE_TYPE: &'static str = "orders.unregistered";
}

/// Command handler recording every order id it sees
struct RecordingOrderHandler {
    seen: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl CommandHandler<PlaceOrder> for RecordingOrderHandler {
    async fn handle(
        &self,
        command: PlaceOrder,
        _context: &DispatchContext,
    ) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(command.id);
        Ok(())
    }
}

struct CountingEventHandler {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl CompetingEventHandler<OrderPlaced> for CountingEventHandler {
    async fn handle(
        &self,
        _event: OrderPlaced,
        _context: &DispatchContext,
    ) -> Result<(), HandlerError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingEventHandler {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl CompetingEventHandler<OrderPlaced> for FailingEventHandler {
    async fn handle(
        &self,
        _event: OrderPlaced,
        _context: &DispatchContext,
    ) -> Result<(), HandlerError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Err("billing ledger unavailable".into())
    }
}

struct CountingMulticastHandler {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl MulticastEventHandler<OrderPlaced> for CountingMulticastHandler {
    async fn handle(
        &self,
        _event: OrderPlaced,
        _context: &DispatchContext,
    ) -> Result<(), HandlerError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn bus_on(transport: &InMemoryTransport, instance: &str, handlers: HandlerRegistration) -> Bus {
    Bus::builder()
        .with_config(BusConfig::for_application("orders", instance).unwrap())
        .with_transport(Arc::new(transport.clone()))
        .with_handlers(handlers)
        .with_clock(test_clock())
        .build()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn command_dispatch_invokes_handler_per_send() {
    let transport = InMemoryTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_for_handler = Arc::clone(&seen);

    let bus = bus_on(
        &transport,
        "orders-1",
        HandlerRegistration::new().handle_command(move |_| RecordingOrderHandler {
            seen: Arc::clone(&seen_for_handler),
        }),
    );
    bus.start().await.unwrap();

    bus.send(PlaceOrder { id: 7 }).await.unwrap();
    wait_until("first order handled", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap().as_slice(), &[7]);

    bus.send(PlaceOrder { id: 8 }).await.unwrap();
    wait_until("second order handled", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(seen.lock().unwrap().as_slice(), &[7, 8]);

    bus.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn unregistered_message_type_is_refused() {
    let transport = InMemoryTransport::new();
    let bus = bus_on(&transport, "orders-1", HandlerRegistration::new());
    bus.start().await.unwrap();

    match bus.send(Unregistered).await {
        Err(BusError::UnknownMessageType { message_type }) => {
            assert_eq!(message_type.as_ref(), "orders.unregistered");
        }
        other => panic!("expected unknown-type refusal, got {other:?}"),
    }

    bus.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn event_fanout_runs_all_handlers_and_dead_letters_on_persistent_failure() {
    let transport = InMemoryTransport::new();
    let good_one = Arc::new(AtomicUsize::new(0));
    let good_two = Arc::new(AtomicUsize::new(0));
    let failing = Arc::new(AtomicUsize::new(0));

    let (h1, h2, h3) = (
        Arc::clone(&good_one),
        Arc::clone(&good_two),
        Arc::clone(&failing),
    );
    let bus = bus_on(
        &transport,
        "orders-1",
        HandlerRegistration::new()
            .handle_competing_event(move |_| CountingEventHandler {
                hits: Arc::clone(&h1),
            })
            .handle_competing_event(move |_| CountingEventHandler {
                hits: Arc::clone(&h2),
            })
            .handle_competing_event(move |_| FailingEventHandler {
                hits: Arc::clone(&h3),
            }),
    );
    bus.start().await.unwrap();

    bus.publish(OrderPlaced { id: 7 }).await.unwrap();

    // The failing handler nacks the dispatch; after the configured five
    // delivery attempts the transport pump forwards to the dead letter office
    let namespace = transport.namespace();
    let dead_letter_path = QueuePath::try_new("deadletteroffice".to_string()).unwrap();
    wait_until("message dead-lettered", || {
        namespace.queue_depth(&dead_letter_path) == Some(1)
    })
    .await;

    // Retry bound: exactly five deliveries, each running every handler
    assert_eq!(failing.load(Ordering::SeqCst), 5);
    assert_eq!(good_one.load(Ordering::SeqCst), 5);
    assert_eq!(good_two.load(Ordering::SeqCst), 5);

    bus.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn competing_events_are_load_balanced_across_instances() {
    let transport = InMemoryTransport::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let mut buses = Vec::new();
    for instance in ["orders-1", "orders-2"] {
        let hits = Arc::clone(&hits);
        let bus = bus_on(
            &transport,
            instance,
            HandlerRegistration::new().handle_competing_event(move |_| CountingEventHandler {
                hits: Arc::clone(&hits),
            }),
        );
        bus.start().await.unwrap();
        buses.push(bus);
    }

    buses[0].publish(OrderPlaced { id: 1 }).await.unwrap();
    wait_until("event handled once", || hits.load(Ordering::SeqCst) == 1).await;

    // Give the other instance a chance to (wrongly) receive it too
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    for bus in &buses {
        bus.shutdown().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn multicast_events_reach_every_instance() {
    let transport = InMemoryTransport::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let mut buses = Vec::new();
    for instance in ["orders-1", "orders-2"] {
        let hits = Arc::clone(&hits);
        let bus = bus_on(
            &transport,
            instance,
            HandlerRegistration::new().handle_multicast_event(move |_| {
                CountingMulticastHandler {
                    hits: Arc::clone(&hits),
                }
            }),
        );
        bus.start().await.unwrap();
        buses.push(bus);
    }

    buses[0].publish(OrderPlaced { id: 1 }).await.unwrap();
    wait_until("event fanned out to both instances", || {
        hits.load(Ordering::SeqCst) == 2
    })
    .await;

    for bus in &buses {
        bus.shutdown().await.unwrap();
    }
}

/// Outbound interceptor that records its hook invocations
struct TracingInterceptor {
    name: &'static str,
    priority: i32,
    log: Arc<Mutex<Vec<(&'static str, &'static str)>>>,
}

#[async_trait]
impl OutboundInterceptor for TracingInterceptor {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &'static str {
        self.name
    }

    async fn on_sending(&self, _envelope: &mut Envelope) -> Result<(), BusError> {
        self.log.lock().unwrap().push((self.name, "before"));
        Ok(())
    }

    async fn on_sent(&self, _envelope: &Envelope) {
        self.log.lock().unwrap().push((self.name, "after"));
    }
}

struct TracingInterceptorFactory {
    log: Arc<Mutex<Vec<(&'static str, &'static str)>>>,
}

impl OutboundInterceptorFactory for TracingInterceptorFactory {
    fn create(
        &self,
        _scope: &dyn nimbus::bus::DependencyScope,
        _envelope: &Envelope,
    ) -> Vec<Arc<dyn OutboundInterceptor>> {
        vec![
            Arc::new(TracingInterceptor {
                name: "audit",
                priority: 0,
                log: Arc::clone(&self.log),
            }),
            Arc::new(TracingInterceptor {
                name: "metrics",
                priority: 10,
                log: Arc::clone(&self.log),
            }),
        ]
    }
}

#[test_log::test(tokio::test)]
async fn outbound_interceptor_ordering_is_mirrored() {
    let transport = InMemoryTransport::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_for_handler = Arc::clone(&seen);

    let bus = Bus::builder()
        .with_config(BusConfig::for_application("orders", "orders-1").unwrap())
        .with_transport(Arc::new(transport.clone()))
        .with_handlers(HandlerRegistration::new().handle_command(move |_| {
            RecordingOrderHandler {
                seen: Arc::clone(&seen_for_handler),
            }
        }))
        .with_outbound_interceptors(Arc::new(TracingInterceptorFactory {
            log: Arc::clone(&log),
        }))
        .with_clock(test_clock())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.send(PlaceOrder { id: 1 }).await.unwrap();

    let calls = log.lock().unwrap().clone();
    // metrics (priority 10) wraps audit: before-hooks in order, after-hooks
    // exactly reversed
    assert_eq!(
        calls,
        vec![
            ("metrics", "before"),
            ("audit", "before"),
            ("audit", "after"),
            ("metrics", "after"),
        ]
    );

    bus.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn scopes_are_balanced_across_dispatch_and_send_paths() {
    let transport = InMemoryTransport::new();
    let resolver = Arc::new(CountingResolver::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let failing = Arc::new(AtomicUsize::new(0));

    let (h1, h2) = (Arc::clone(&hits), Arc::clone(&failing));
    let bus = Bus::builder()
        .with_config(BusConfig::for_application("orders", "orders-1").unwrap())
        .with_transport(Arc::new(transport.clone()))
        .with_handlers(
            HandlerRegistration::new()
                .handle_competing_event(move |_| CountingEventHandler {
                    hits: Arc::clone(&h1),
                })
                .handle_competing_event(move |_| FailingEventHandler {
                    hits: Arc::clone(&h2),
                }),
        )
        .with_dependency_resolver(Arc::clone(&resolver) as Arc<dyn nimbus::bus::DependencyResolver>)
        .with_clock(test_clock())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(OrderPlaced { id: 1 }).await.unwrap();

    let namespace = transport.namespace();
    let dead_letter_path = QueuePath::try_new("deadletteroffice".to_string()).unwrap();
    wait_until("failing event dead-lettered", || {
        namespace.queue_depth(&dead_letter_path) == Some(1)
    })
    .await;

    bus.shutdown().await.unwrap();

    // Every scope opened (per send and per dispatch, including the failed
    // ones) was closed
    assert!(resolver.opened() > 0);
    assert_eq!(resolver.opened(), resolver.closed());
}

/// Inbound interceptors also mirror ordering; verified through a dispatch
struct InboundProbe {
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl nimbus::bus::InboundInterceptor for InboundProbe {
    fn name(&self) -> &'static str {
        "probe"
    }

    async fn on_handling(
        &self,
        _envelope: &Envelope,
        _context: &DispatchContext,
    ) -> Result<(), BusError> {
        self.log.lock().unwrap().push("handling");
        Ok(())
    }

    async fn on_handled(&self, _envelope: &Envelope, _context: &DispatchContext) {
        self.log.lock().unwrap().push("handled");
    }

    async fn on_error(
        &self,
        _envelope: &Envelope,
        _context: &DispatchContext,
        _error: &BusError,
    ) {
        self.log.lock().unwrap().push("error");
    }
}

struct InboundProbeFactory {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl InboundInterceptorFactory for InboundProbeFactory {
    fn create(
        &self,
        _scope: &dyn nimbus::bus::DependencyScope,
        _envelope: &Envelope,
    ) -> Vec<Arc<dyn nimbus::bus::InboundInterceptor>> {
        vec![Arc::new(InboundProbe {
            log: Arc::clone(&self.log),
        })]
    }
}

#[test_log::test(tokio::test)]
async fn inbound_interceptors_wrap_the_handler() {
    let transport = InMemoryTransport::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_for_handler = Arc::clone(&seen);

    let bus = Bus::builder()
        .with_config(BusConfig::for_application("orders", "orders-1").unwrap())
        .with_transport(Arc::new(transport.clone()))
        .with_handlers(HandlerRegistration::new().handle_command(move |_| {
            RecordingOrderHandler {
                seen: Arc::clone(&seen_for_handler),
            }
        }))
        .with_inbound_interceptors(Arc::new(InboundProbeFactory {
            log: Arc::clone(&log),
        }))
        .with_clock(test_clock())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.send(PlaceOrder { id: 1 }).await.unwrap();
    wait_until("command handled", || seen.lock().unwrap().len() == 1).await;

    assert_eq!(log.lock().unwrap().as_slice(), &["handling", "handled"]);

    bus.shutdown().await.unwrap();
}
