//! Request/response correlator
//!
//! Maps outstanding request ids to pending completions so asynchronous reply
//! traffic can be awaited like a synchronous call. Each record owns its own
//! completion primitive; the map supports concurrent insert, remove and
//! lookup. A periodic reaper is the single source of timeout truth.

use bytes::Bytes;
use dashmap::DashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::domain_types::{MessageId, MessageTypeName};
use super::envelope::{BusMessage, Envelope};
use crate::error::BusError;
use crate::time_provider::SharedClock;

/// How often the reaper scans for expired records
pub(crate) const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Local backstop past the deadline before a waiter gives up on the reaper
const WAIT_GRACE: Duration = Duration::from_secs(2);

enum Completion {
    Single(Option<oneshot::Sender<Result<Bytes, BusError>>>),
    Stream(mpsc::UnboundedSender<Bytes>),
}

struct OutstandingRequest {
    expires_at: SystemTime,
    /// Original wait window, kept for accurate timeout reporting
    window: Duration,
    expected_response_type: MessageTypeName,
    completion: Completion,
}

/// Registry of outstanding requests awaiting replies
pub struct RequestCorrelator {
    outstanding: DashMap<MessageId, OutstandingRequest>,
    clock: SharedClock,
}

impl RequestCorrelator {
    /// Creates an empty correlator
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            outstanding: DashMap::new(),
            clock,
        }
    }

    /// Records an outstanding request and returns the handle its caller
    /// awaits
    pub fn record_request<R: BusMessage>(
        self: &Arc<Self>,
        message_id: MessageId,
        expires_at: SystemTime,
    ) -> ResponseHandle<R> {
        let (sender, receiver) = oneshot::channel();
        let window = expires_at
            .duration_since(self.clock.now())
            .unwrap_or_default();
        self.outstanding.insert(
            message_id,
            OutstandingRequest {
                expires_at,
                window,
                expected_response_type: MessageTypeName::of(R::MESSAGE_TYPE),
                completion: Completion::Single(Some(sender)),
            },
        );
        trace!(message_id = %message_id, "request recorded");
        ResponseHandle {
            message_id,
            receiver,
            correlator: Arc::clone(self),
            _marker: PhantomData,
        }
    }

    /// Records a multicast request whose handle collects a stream of replies
    pub fn record_multicast_request<R: BusMessage>(
        self: &Arc<Self>,
        message_id: MessageId,
        expires_at: SystemTime,
    ) -> MulticastResponseHandle<R> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let window = expires_at
            .duration_since(self.clock.now())
            .unwrap_or_default();
        self.outstanding.insert(
            message_id,
            OutstandingRequest {
                expires_at,
                window,
                expected_response_type: MessageTypeName::of(R::MESSAGE_TYPE),
                completion: Completion::Stream(sender),
            },
        );
        trace!(message_id = %message_id, "multicast request recorded");
        MulticastResponseHandle {
            message_id,
            receiver,
            correlator: Arc::clone(self),
            _marker: PhantomData,
        }
    }

    /// Attempts to complete an outstanding request from a reply envelope.
    ///
    /// Envelopes without a matching, unexpired record are dropped silently.
    pub fn try_complete(&self, envelope: &Envelope) {
        let Some(correlation_id) = envelope.correlation_id else {
            debug!(message_id = %envelope.message_id, "reply without correlation id dropped");
            return;
        };
        let request_id = correlation_id.as_message_id();

        let now = self.clock.now();
        let faulted = envelope.is_faulted();

        // Peek first: expired records belong to the reaper, and stream
        // completions keep their record alive across replies
        {
            let Some(record) = self.outstanding.get(&request_id) else {
                debug!(request_id = %request_id, "no outstanding request; reply dropped");
                return;
            };
            if record.expires_at < now {
                debug!(request_id = %request_id, "reply arrived after expiry; dropped");
                return;
            }
            if !faulted {
                if let Some(reply_type) = envelope.message_type() {
                    if reply_type != record.expected_response_type {
                        warn!(
                            request_id = %request_id,
                            expected = %record.expected_response_type,
                            received = %reply_type,
                            "reply type mismatch; dropped"
                        );
                        return;
                    }
                }
            }
            if let Completion::Stream(sender) = &record.completion {
                if faulted {
                    warn!(request_id = %request_id, "faulted multicast reply ignored");
                } else if sender.send(envelope.payload.clone()).is_err() {
                    debug!(request_id = %request_id, "multicast collector gone");
                }
                return;
            }
        }

        // Single-shot completion: the record is consumed
        if let Some((_, mut record)) = self.outstanding.remove(&request_id) {
            if let Completion::Single(sender) = &mut record.completion {
                if let Some(sender) = sender.take() {
                    let result = if faulted {
                        Err(BusError::RequestFailedRemotely {
                            detail: fault_detail(envelope),
                        })
                    } else {
                        Ok(envelope.payload.clone())
                    };
                    if sender.send(result).is_err() {
                        debug!(request_id = %request_id, "request waiter gone");
                    }
                }
            }
        }
    }

    /// Cancels an outstanding request, signalling its waiter
    pub fn cancel(&self, message_id: MessageId) {
        if let Some((_, mut record)) = self.outstanding.remove(&message_id) {
            if let Completion::Single(sender) = &mut record.completion {
                if let Some(sender) = sender.take() {
                    let _ = sender.send(Err(BusError::RequestCancelled { message_id }));
                }
            }
            trace!(message_id = %message_id, "request cancelled");
        }
    }

    pub(crate) fn remove(&self, message_id: MessageId) {
        self.outstanding.remove(&message_id);
    }

    /// Number of requests currently awaiting replies
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    fn reap(&self) {
        let now = self.clock.now();
        let expired: Vec<MessageId> = self
            .outstanding
            .iter()
            .filter(|entry| entry.expires_at < now)
            .map(|entry| *entry.key())
            .collect();

        for message_id in expired {
            if let Some((_, mut record)) = self.outstanding.remove(&message_id) {
                match &mut record.completion {
                    Completion::Single(sender) => {
                        if let Some(sender) = sender.take() {
                            let timeout = BusError::Timeout {
                                operation: "request".to_string(),
                                timeout: record.window,
                            };
                            if sender.send(Err(timeout)).is_err() {
                                debug!(message_id = %message_id, "timed-out waiter already gone");
                            }
                        }
                    }
                    // Dropping the sender closes the collector's stream
                    Completion::Stream(_) => {}
                }
                debug!(message_id = %message_id, "outstanding request expired");
            }
        }
    }

    /// Spawns the periodic reaper.
    ///
    /// Reaper failures are logged and never propagate; the task ends when
    /// the shutdown signal fires.
    pub(crate) fn spawn_reaper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = correlator.clock.sleep(REAPER_INTERVAL) => correlator.reap(),
                }
            }
            debug!("correlator reaper stopped");
        })
    }
}

fn fault_detail(envelope: &Envelope) -> String {
    serde_json::from_slice::<String>(&envelope.payload)
        .unwrap_or_else(|_| String::from_utf8_lossy(&envelope.payload).into_owned())
}

/// Caller-side handle for one outstanding request
pub struct ResponseHandle<R> {
    message_id: MessageId,
    receiver: oneshot::Receiver<Result<Bytes, BusError>>,
    correlator: Arc<RequestCorrelator>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: BusMessage> ResponseHandle<R> {
    /// The request's message id
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Awaits the reply up to `timeout`.
    ///
    /// The reaper signals the timeout; a local backstop slightly past the
    /// deadline covers a stalled reaper.
    pub async fn wait_for_response(self, timeout: Duration) -> Result<R, BusError> {
        let backstop = timeout.saturating_add(WAIT_GRACE);
        match tokio::time::timeout(backstop, self.receiver).await {
            Ok(Ok(Ok(payload))) => {
                serde_json::from_slice(&payload).map_err(BusError::serialization)
            }
            Ok(Ok(Err(error))) => Err(error),
            // Sender dropped without a signal, or the backstop elapsed
            Ok(Err(_)) | Err(_) => {
                self.correlator.remove(self.message_id);
                Err(BusError::Timeout {
                    operation: "request".to_string(),
                    timeout,
                })
            }
        }
    }

    /// Cancels the request.
    ///
    /// The correlator entry is removed; the already-sent envelope is not
    /// recalled.
    pub fn cancel(self) {
        self.correlator.cancel(self.message_id);
    }
}

/// Caller-side handle collecting multicast replies until the window closes
pub struct MulticastResponseHandle<R> {
    message_id: MessageId,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    correlator: Arc<RequestCorrelator>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: BusMessage> MulticastResponseHandle<R> {
    /// The request's message id
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Collects every reply arriving before the window closes
    pub async fn collect_responses(mut self, window: Duration) -> Vec<R> {
        let deadline = tokio::time::Instant::now() + window;
        let mut responses = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(payload)) => match serde_json::from_slice(&payload) {
                    Ok(response) => responses.push(response),
                    Err(error) => {
                        warn!(request_id = %self.message_id, %error, "undecodable multicast reply skipped");
                    }
                },
                Ok(None) | Err(_) => break,
            }
        }
        self.correlator.remove(self.message_id);
        responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::config::BusConfig;
    use crate::bus::envelope::MessageFactory;
    use crate::bus::envelope::SerializedMessage;
    use crate::time_provider::test_clock;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pong {
        ts: u64,
    }

    impl BusMessage for Pong {
        const MESSAGE_TYPE: &'static str = "tests.pong";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "tests.ping";
    }

    fn factory() -> MessageFactory {
        let config = BusConfig::for_application("tests", "tests-1").unwrap();
        MessageFactory::new(&config, test_clock())
    }

    fn correlator() -> Arc<RequestCorrelator> {
        Arc::new(RequestCorrelator::new(test_clock()))
    }

    fn far_future() -> SystemTime {
        SystemTime::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn reply_completes_outstanding_request() {
        let correlator = correlator();
        let factory = factory();

        let request = factory.envelope_for(&Ping).unwrap();
        let handle = correlator.record_request::<Pong>(request.message_id, far_future());

        let body = SerializedMessage::encode(&Pong { ts: 42 }).unwrap();
        let reply = factory.reply_envelope(body, &request);
        correlator.try_complete(&reply);

        let response = handle.wait_for_response(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response, Pong { ts: 42 });
        assert_eq!(correlator.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn uncorrelated_reply_is_dropped() {
        let correlator = correlator();
        let factory = factory();

        let request = factory.envelope_for(&Ping).unwrap();
        let _handle = correlator.record_request::<Pong>(request.message_id, far_future());

        let unrelated = factory.envelope_for(&Ping).unwrap();
        let body = SerializedMessage::encode(&Pong { ts: 1 }).unwrap();
        let reply = factory.reply_envelope(body, &unrelated);
        correlator.try_complete(&reply);

        assert_eq!(correlator.outstanding_count(), 1);
    }

    #[tokio::test]
    async fn faulted_reply_surfaces_remote_error() {
        let correlator = correlator();
        let factory = factory();

        let request = factory.envelope_for(&Ping).unwrap();
        let handle = correlator.record_request::<Pong>(request.message_id, far_future());

        let reply = factory.faulted_reply("handler exploded", &request).unwrap();
        correlator.try_complete(&reply);

        match handle.wait_for_response(Duration::from_secs(1)).await {
            Err(BusError::RequestFailedRemotely { detail }) => {
                assert_eq!(detail, "handler exploded");
            }
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reaper_times_out_expired_requests() {
        let correlator = correlator();
        let factory = factory();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = correlator.spawn_reaper(shutdown_rx);

        let request = factory.envelope_for(&Ping).unwrap();
        let handle = correlator
            .record_request::<Pong>(request.message_id, SystemTime::now() - Duration::from_secs(1));

        let result = handle.wait_for_response(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));
        assert_eq!(correlator.outstanding_count(), 0);

        shutdown_tx.send(true).unwrap();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_signals_the_waiter() {
        let correlator = correlator();
        let factory = factory();

        let request = factory.envelope_for(&Ping).unwrap();
        let handle = correlator.record_request::<Pong>(request.message_id, far_future());
        correlator.cancel(request.message_id);

        match handle.wait_for_response(Duration::from_secs(1)).await {
            Err(BusError::RequestCancelled { message_id }) => {
                assert_eq!(message_id, request.message_id);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(correlator.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn multicast_collects_all_replies_in_window() {
        let correlator = correlator();
        let factory = factory();

        let request = factory.envelope_for(&Ping).unwrap();
        let handle =
            correlator.record_multicast_request::<Pong>(request.message_id, far_future());

        for ts in [1, 2] {
            let body = SerializedMessage::encode(&Pong { ts }).unwrap();
            let reply = factory.reply_envelope(body, &request);
            correlator.try_complete(&reply);
        }

        let mut responses = handle.collect_responses(Duration::from_millis(100)).await;
        responses.sort_by_key(|pong| pong.ts);
        assert_eq!(responses, vec![Pong { ts: 1 }, Pong { ts: 2 }]);
        assert_eq!(correlator.outstanding_count(), 0);
    }
}
