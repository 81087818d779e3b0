//! In-process transport implementation
//!
//! Backs the test suite and serves as the reference driver: queues with
//! competing consumers, topics with per-subscription fan-out, nack
//! redelivery with incremented delivery counts, and scripted create faults
//! for exercising the entity manager's classification paths.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::trace;

use super::domain_types::{QueuePath, SubscriptionKey, SubscriptionName, TopicPath};
use super::envelope::Envelope;
use super::transport::{
    DispatchOutcome, EntityCreateError, MessageReceiver, MessageSender, NamespaceManager,
    QueueDescriptor, SubscriptionDescriptor, TopicDescriptor, Transport, TransportError,
};

/// A create failure scripted against a path, consumed one per attempt
#[derive(Debug, Clone)]
pub enum CreateFault {
    /// Simulates a racing creator: the create call reports a conflict while
    /// the entity appears on the namespace (as the racer's create lands)
    ConflictPending,
    /// Transient failure; the entity is not created
    Transient(String),
    /// Non-retryable failure
    Fatal(String),
}

#[derive(Debug)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl MemoryQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    fn push(&self, envelope: Envelope) {
        self.messages
            .lock()
            .expect("queue mutex poisoned")
            .push_back(envelope);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Envelope> {
        self.messages
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()
    }

    fn depth(&self) -> usize {
        self.messages.lock().expect("queue mutex poisoned").len()
    }

    async fn next(&self) -> Envelope {
        loop {
            // Register interest before checking, so a push between the check
            // and the await cannot be lost
            let notified = self.notify.notified();
            if let Some(envelope) = self.pop() {
                // Wake the next competing consumer if messages remain
                if self.depth() > 0 {
                    self.notify.notify_one();
                }
                return envelope;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct MemoryTopic {
    subscriptions: DashMap<SubscriptionName, Arc<MemoryQueue>>,
}

impl MemoryTopic {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: DashMap::new(),
        })
    }
}

/// Namespace state shared by all handles of one in-memory transport
#[derive(Debug, Default)]
pub struct InMemoryNamespace {
    queues: DashMap<QueuePath, Arc<MemoryQueue>>,
    topics: DashMap<TopicPath, Arc<MemoryTopic>>,
    create_faults: DashMap<String, Mutex<VecDeque<CreateFault>>>,
    create_calls: DashMap<String, AtomicU64>,
}

impl InMemoryNamespace {
    fn record_create_call(&self, path: &str) {
        self.create_calls
            .entry(path.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);
    }

    fn next_fault(&self, path: &str) -> Option<CreateFault> {
        self.create_faults.get(path).and_then(|faults| {
            faults
                .lock()
                .expect("fault queue mutex poisoned")
                .pop_front()
        })
    }

    /// Scripts a create failure for the next create attempt on `path`
    pub fn inject_create_fault(&self, path: &str, fault: CreateFault) {
        self.create_faults
            .entry(path.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .expect("fault queue mutex poisoned")
            .push_back(fault);
    }

    /// Number of create calls observed for `path`
    #[must_use]
    pub fn create_calls(&self, path: &str) -> u64 {
        self.create_calls
            .get(path)
            .map_or(0, |calls| calls.load(Ordering::SeqCst))
    }

    /// Current depth of a queue, if it exists
    #[must_use]
    pub fn queue_depth(&self, path: &QueuePath) -> Option<usize> {
        self.queues.get(path).map(|queue| queue.depth())
    }
}

fn apply_fault(fault: CreateFault, install_racer: impl FnOnce()) -> EntityCreateError {
    match fault {
        CreateFault::ConflictPending => {
            install_racer();
            EntityCreateError::ConflictPending
        }
        CreateFault::Transient(detail) => EntityCreateError::Transient {
            source: TransportError::Transient { detail },
        },
        CreateFault::Fatal(detail) => EntityCreateError::Fatal {
            source: TransportError::SendFailed { detail },
        },
    }
}

#[async_trait]
impl NamespaceManager for InMemoryNamespace {
    async fn create_queue(
        &self,
        path: &QueuePath,
        _descriptor: &QueueDescriptor,
    ) -> Result<(), EntityCreateError> {
        self.record_create_call(path.as_ref());
        if let Some(fault) = self.next_fault(path.as_ref()) {
            return Err(apply_fault(fault, || {
                self.queues.entry(path.clone()).or_insert_with(MemoryQueue::new);
            }));
        }
        if self.queues.contains_key(path) {
            return Err(EntityCreateError::AlreadyExists);
        }
        self.queues.insert(path.clone(), MemoryQueue::new());
        trace!(path = %path, "queue created");
        Ok(())
    }

    async fn queue_exists(&self, path: &QueuePath) -> Result<bool, TransportError> {
        Ok(self.queues.contains_key(path))
    }

    async fn list_queues(&self) -> Result<Vec<QueuePath>, TransportError> {
        Ok(self.queues.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn create_topic(
        &self,
        path: &TopicPath,
        _descriptor: &TopicDescriptor,
    ) -> Result<(), EntityCreateError> {
        self.record_create_call(path.as_ref());
        if let Some(fault) = self.next_fault(path.as_ref()) {
            return Err(apply_fault(fault, || {
                self.topics.entry(path.clone()).or_insert_with(MemoryTopic::new);
            }));
        }
        if self.topics.contains_key(path) {
            return Err(EntityCreateError::AlreadyExists);
        }
        self.topics.insert(path.clone(), MemoryTopic::new());
        trace!(path = %path, "topic created");
        Ok(())
    }

    async fn topic_exists(&self, path: &TopicPath) -> Result<bool, TransportError> {
        Ok(self.topics.contains_key(path))
    }

    async fn list_topics(&self) -> Result<Vec<TopicPath>, TransportError> {
        Ok(self.topics.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn create_subscription(
        &self,
        topic: &TopicPath,
        name: &SubscriptionName,
        _descriptor: &SubscriptionDescriptor,
    ) -> Result<(), EntityCreateError> {
        let key = SubscriptionKey::compose(topic, name);
        self.record_create_call(key.as_ref());
        let entry = self
            .topics
            .get(topic)
            .ok_or(EntityCreateError::Fatal {
                source: TransportError::PathNotFound {
                    path: topic.to_string(),
                },
            })?;
        if let Some(fault) = self.next_fault(key.as_ref()) {
            return Err(apply_fault(fault, || {
                entry
                    .subscriptions
                    .entry(name.clone())
                    .or_insert_with(MemoryQueue::new);
            }));
        }
        if entry.subscriptions.contains_key(name) {
            return Err(EntityCreateError::AlreadyExists);
        }
        entry.subscriptions.insert(name.clone(), MemoryQueue::new());
        trace!(topic = %topic, subscription = %name, "subscription created");
        Ok(())
    }

    async fn subscription_exists(
        &self,
        topic: &TopicPath,
        name: &SubscriptionName,
    ) -> Result<bool, TransportError> {
        Ok(self
            .topics
            .get(topic)
            .is_some_and(|entry| entry.subscriptions.contains_key(name)))
    }

    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionKey>, TransportError> {
        let mut keys = Vec::new();
        for topic in &self.topics {
            for subscription in &topic.subscriptions {
                keys.push(SubscriptionKey::compose(topic.key(), subscription.key()));
            }
        }
        Ok(keys)
    }
}

struct MemoryQueueSender {
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl MessageSender for MemoryQueueSender {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.queue.push(envelope);
        Ok(())
    }
}

struct MemoryTopicSender {
    topic: Arc<MemoryTopic>,
}

#[async_trait]
impl MessageSender for MemoryTopicSender {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        for subscription in &self.topic.subscriptions {
            subscription.value().push(envelope.clone());
        }
        Ok(())
    }
}

struct MemoryReceiver {
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive(&self) -> Result<Envelope, TransportError> {
        Ok(self.queue.next().await)
    }

    async fn settle(
        &self,
        envelope: Envelope,
        outcome: DispatchOutcome,
    ) -> Result<(), TransportError> {
        match outcome {
            DispatchOutcome::Ack => Ok(()),
            DispatchOutcome::Nack => {
                self.queue.push(envelope.redelivered());
                Ok(())
            }
        }
    }
}

/// In-process transport over shared memory queues
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    namespace: Arc<InMemoryNamespace>,
}

impl InMemoryTransport {
    /// Creates a fresh, empty transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared namespace, exposed for fault injection and assertions
    #[must_use]
    pub fn namespace(&self) -> Arc<InMemoryNamespace> {
        Arc::clone(&self.namespace)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn namespace_manager(&self) -> Arc<dyn NamespaceManager> {
        Arc::clone(&self.namespace) as Arc<dyn NamespaceManager>
    }

    async fn queue_sender(
        &self,
        path: &QueuePath,
    ) -> Result<Arc<dyn MessageSender>, TransportError> {
        let queue = self
            .namespace
            .queues
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::PathNotFound {
                path: path.to_string(),
            })?;
        Ok(Arc::new(MemoryQueueSender { queue }))
    }

    async fn queue_receiver(
        &self,
        path: &QueuePath,
    ) -> Result<Arc<dyn MessageReceiver>, TransportError> {
        let queue = self
            .namespace
            .queues
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::PathNotFound {
                path: path.to_string(),
            })?;
        Ok(Arc::new(MemoryReceiver { queue }))
    }

    async fn topic_sender(
        &self,
        path: &TopicPath,
    ) -> Result<Arc<dyn MessageSender>, TransportError> {
        let topic = self
            .namespace
            .topics
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::PathNotFound {
                path: path.to_string(),
            })?;
        Ok(Arc::new(MemoryTopicSender { topic }))
    }

    async fn subscription_receiver(
        &self,
        topic: &TopicPath,
        name: &SubscriptionName,
    ) -> Result<Arc<dyn MessageReceiver>, TransportError> {
        let queue = self
            .namespace
            .topics
            .get(topic)
            .and_then(|entry| {
                entry
                    .subscriptions
                    .get(name)
                    .map(|subscription| Arc::clone(subscription.value()))
            })
            .ok_or_else(|| TransportError::PathNotFound {
                path: SubscriptionKey::compose(topic, name).to_string(),
            })?;
        Ok(Arc::new(MemoryReceiver { queue }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::config::BusConfig;
    use crate::bus::envelope::{BusMessage, MessageFactory};
    use crate::time_provider::test_clock;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "tests.ping";
    }

    fn envelope() -> Envelope {
        let config = BusConfig::for_application("tests", "tests-1").unwrap();
        MessageFactory::new(&config, test_clock())
            .envelope_for(&Ping)
            .unwrap()
    }

    fn queue_descriptor() -> QueueDescriptor {
        QueueDescriptor::from_config(&BusConfig::for_application("tests", "tests-1").unwrap())
    }

    #[tokio::test]
    async fn queue_round_trip() {
        let transport = InMemoryTransport::new();
        let path = QueuePath::try_new("tests.q1".to_string()).unwrap();
        transport
            .namespace_manager()
            .create_queue(&path, &queue_descriptor())
            .await
            .unwrap();

        let sent = envelope();
        let id = sent.message_id;
        transport.queue_sender(&path).await.unwrap().send(sent).await.unwrap();

        let received = transport
            .queue_receiver(&path)
            .await
            .unwrap()
            .receive()
            .await
            .unwrap();
        assert_eq!(received.message_id, id);
    }

    #[tokio::test]
    async fn topic_fans_out_to_every_subscription() {
        let transport = InMemoryTransport::new();
        let topic = TopicPath::try_new("tests.t1".to_string()).unwrap();
        let namespace = transport.namespace_manager();
        namespace
            .create_topic(
                &topic,
                &TopicDescriptor::from_config(
                    &BusConfig::for_application("tests", "tests-1").unwrap(),
                ),
            )
            .await
            .unwrap();

        let descriptor = SubscriptionDescriptor::from_config(
            &BusConfig::for_application("tests", "tests-1").unwrap(),
        );
        for name in ["a", "b"] {
            namespace
                .create_subscription(
                    &topic,
                    &SubscriptionName::try_new(name.to_string()).unwrap(),
                    &descriptor,
                )
                .await
                .unwrap();
        }

        transport
            .topic_sender(&topic)
            .await
            .unwrap()
            .send(envelope())
            .await
            .unwrap();

        for name in ["a", "b"] {
            let receiver = transport
                .subscription_receiver(&topic, &SubscriptionName::try_new(name.to_string()).unwrap())
                .await
                .unwrap();
            receiver.receive().await.unwrap();
        }
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let transport = InMemoryTransport::new();
        let path = QueuePath::try_new("tests.q2".to_string()).unwrap();
        transport
            .namespace_manager()
            .create_queue(&path, &queue_descriptor())
            .await
            .unwrap();

        transport
            .queue_sender(&path)
            .await
            .unwrap()
            .send(envelope())
            .await
            .unwrap();

        let receiver = transport.queue_receiver(&path).await.unwrap();
        let first = receiver.receive().await.unwrap();
        assert_eq!(first.delivery_attempt.as_u32(), 1);

        receiver.settle(first, DispatchOutcome::Nack).await.unwrap();

        let second = receiver.receive().await.unwrap();
        assert_eq!(second.delivery_attempt.as_u32(), 2);
    }

    #[tokio::test]
    async fn conflict_fault_installs_racing_entity() {
        let transport = InMemoryTransport::new();
        let namespace = transport.namespace();
        let path = QueuePath::try_new("tests.q3".to_string()).unwrap();
        namespace.inject_create_fault("tests.q3", CreateFault::ConflictPending);

        let result = namespace.create_queue(&path, &queue_descriptor()).await;
        assert!(matches!(result, Err(EntityCreateError::ConflictPending)));
        assert!(namespace.queue_exists(&path).await.unwrap());
    }
}
