//! Lazy, idempotent provisioning of transport entities
//!
//! A concurrent fleet of bus instances calls `ensure_*` without
//! coordinating. Existence is double-checked under a per-path lock, create
//! results are classified, and transient failures retry with linear backoff
//! (attempt *k* waits *k* seconds). Entities once known stay known for the
//! life of the process.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info};

use super::config::BusConfig;
use super::domain_types::{QueuePath, SubscriptionKey, SubscriptionName, TopicPath};
use super::transport::{
    EntityCreateError, NamespaceManager, QueueDescriptor, SubscriptionDescriptor, TopicDescriptor,
    TransportError,
};
use crate::error::BusError;
use crate::time_provider::SharedClock;

/// Create attempts before a transient failure is surfaced
const MAX_CREATE_ATTEMPTS: u32 = 5;

/// Bounds a namespace fetch by the configured default timeout
async fn bounded<T>(
    timeout: Duration,
    fetch: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, BusError> {
    match tokio::time::timeout(timeout, fetch).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BusError::Timeout {
            operation: "namespace warm-up".to_string(),
            timeout,
        }),
    }
}

enum EntityRef<'a> {
    Queue(&'a QueuePath),
    Topic(&'a TopicPath),
    Subscription(&'a TopicPath, &'a SubscriptionName),
}

impl EntityRef<'_> {
    fn path(&self) -> String {
        match self {
            Self::Queue(path) => path.to_string(),
            Self::Topic(path) => path.to_string(),
            Self::Subscription(topic, name) => SubscriptionKey::compose(topic, name).to_string(),
        }
    }
}

/// Provisions queues, topics and subscriptions exactly once per process
pub struct EntityManager {
    namespace: Arc<dyn NamespaceManager>,
    config: BusConfig,
    clock: SharedClock,
    known_queues: DashSet<QueuePath>,
    known_topics: DashSet<TopicPath>,
    known_subscriptions: DashSet<SubscriptionKey>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
    warm: OnceCell<()>,
}

impl EntityManager {
    /// Creates a manager over the given namespace
    #[must_use]
    pub fn new(
        namespace: Arc<dyn NamespaceManager>,
        config: BusConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            namespace,
            config,
            clock,
            known_queues: DashSet::new(),
            known_topics: DashSet::new(),
            known_subscriptions: DashSet::new(),
            path_locks: DashMap::new(),
            warm: OnceCell::new(),
        }
    }

    /// Ensures a queue exists, creating it if needed
    pub async fn ensure_queue(&self, path: &QueuePath) -> Result<(), BusError> {
        self.warm_up().await?;
        if self.known_queues.contains(path) {
            return Ok(());
        }

        let lock = self.lock_for(path.as_ref());
        let _guard = lock.lock().await;
        if self.known_queues.contains(path) {
            return Ok(());
        }

        self.create_with_retry(EntityRef::Queue(path)).await?;
        self.known_queues.insert(path.clone());
        Ok(())
    }

    /// Ensures a topic exists, creating it if needed
    pub async fn ensure_topic(&self, path: &TopicPath) -> Result<(), BusError> {
        self.warm_up().await?;
        if self.known_topics.contains(path) {
            return Ok(());
        }

        let lock = self.lock_for(path.as_ref());
        let _guard = lock.lock().await;
        if self.known_topics.contains(path) {
            return Ok(());
        }

        self.create_with_retry(EntityRef::Topic(path)).await?;
        self.known_topics.insert(path.clone());
        Ok(())
    }

    /// Ensures a subscription exists, creating its topic first
    pub async fn ensure_subscription(
        &self,
        topic: &TopicPath,
        name: &SubscriptionName,
    ) -> Result<(), BusError> {
        self.ensure_topic(topic).await?;

        let key = SubscriptionKey::compose(topic, name);
        if self.known_subscriptions.contains(&key) {
            return Ok(());
        }

        let lock = self.lock_for(key.as_ref());
        let _guard = lock.lock().await;
        if self.known_subscriptions.contains(&key) {
            return Ok(());
        }

        self.create_with_retry(EntityRef::Subscription(topic, name))
            .await?;
        self.known_subscriptions.insert(key);
        Ok(())
    }

    /// True once a queue is in the known-set
    #[must_use]
    pub fn is_queue_known(&self, path: &QueuePath) -> bool {
        self.known_queues.contains(path)
    }

    /// True once a topic is in the known-set
    #[must_use]
    pub fn is_topic_known(&self, path: &TopicPath) -> bool {
        self.known_topics.contains(path)
    }

    /// True once a subscription is in the known-set
    #[must_use]
    pub fn is_subscription_known(&self, topic: &TopicPath, name: &SubscriptionName) -> bool {
        self.known_subscriptions
            .contains(&SubscriptionKey::compose(topic, name))
    }

    fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One bulk fetch per process, bounded by the configured default timeout
    async fn warm_up(&self) -> Result<(), BusError> {
        self.warm
            .get_or_try_init(|| async {
                let timeout = self.config.default_timeout.as_duration();

                let queues = bounded(timeout, self.namespace.list_queues()).await?;
                for queue in queues {
                    self.known_queues.insert(queue);
                }

                let topics = bounded(timeout, self.namespace.list_topics()).await?;
                for topic in topics {
                    self.known_topics.insert(topic);
                }

                let subscriptions = bounded(timeout, self.namespace.list_subscriptions()).await?;
                for subscription in subscriptions {
                    self.known_subscriptions.insert(subscription);
                }

                info!(
                    queues = self.known_queues.len(),
                    topics = self.known_topics.len(),
                    subscriptions = self.known_subscriptions.len(),
                    "namespace warm-up complete"
                );
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn attempt_create(&self, entity: &EntityRef<'_>) -> Result<(), EntityCreateError> {
        match entity {
            EntityRef::Queue(path) => {
                let descriptor = QueueDescriptor::from_config(&self.config);
                self.namespace.create_queue(path, &descriptor).await
            }
            EntityRef::Topic(path) => {
                let descriptor = TopicDescriptor::from_config(&self.config);
                self.namespace.create_topic(path, &descriptor).await
            }
            EntityRef::Subscription(topic, name) => {
                let descriptor = SubscriptionDescriptor::from_config(&self.config);
                self.namespace
                    .create_subscription(topic, name, &descriptor)
                    .await
            }
        }
    }

    async fn probe_exists(&self, entity: &EntityRef<'_>) -> Result<bool, TransportError> {
        match entity {
            EntityRef::Queue(path) => self.namespace.queue_exists(path).await,
            EntityRef::Topic(path) => self.namespace.topic_exists(path).await,
            EntityRef::Subscription(topic, name) => {
                self.namespace.subscription_exists(topic, name).await
            }
        }
    }

    async fn create_with_retry(&self, entity: EntityRef<'_>) -> Result<(), BusError> {
        let path = entity.path();
        let mut attempt: u32 = 1;
        loop {
            match self.attempt_create(&entity).await {
                Ok(()) => {
                    debug!(path = %path, "entity created");
                    return Ok(());
                }
                Err(EntityCreateError::AlreadyExists) => {
                    debug!(path = %path, "entity already existed");
                    return Ok(());
                }
                Err(EntityCreateError::ConflictPending) => {
                    // A racing creator got there first; trust the namespace
                    match self.probe_exists(&entity).await {
                        Ok(true) => {
                            debug!(path = %path, "entity created by racing caller");
                            return Ok(());
                        }
                        Ok(false) => {
                            error!(path = %path, "conflicting create never materialized");
                            return Err(BusError::EntityCreationFailed {
                                path,
                                retry_count: attempt,
                                source: None,
                            });
                        }
                        Err(probe_error) => {
                            error!(path = %path, error = %probe_error, "existence probe failed");
                            return Err(BusError::EntityCreationFailed {
                                path,
                                retry_count: attempt,
                                source: Some(probe_error),
                            });
                        }
                    }
                }
                Err(EntityCreateError::Transient { source }) => {
                    error!(
                        path = %path,
                        attempt,
                        error = %source,
                        "transient failure creating entity"
                    );
                    if attempt >= MAX_CREATE_ATTEMPTS {
                        return Err(BusError::EntityCreationFailed {
                            path,
                            retry_count: attempt,
                            source: Some(source),
                        });
                    }
                    // Linear backoff: attempt k waits k seconds
                    self.clock.sleep(Duration::from_secs(u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(EntityCreateError::Fatal { source }) => {
                    error!(path = %path, error = %source, "entity creation failed");
                    return Err(BusError::EntityCreationFailed {
                        path,
                        retry_count: attempt,
                        source: Some(source),
                    });
                }
            }
        }
    }
}
