//! Transport pumps
//!
//! A pump drives one receiver: it waits for deliveries, hands them to its
//! dispatcher, and settles each delivery with the returned outcome. Messages
//! whose delivery count is exhausted are forwarded to the dead letter office
//! instead of being dispatched again. The reply pump is the special case
//! feeding the correlator.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::correlator::RequestCorrelator;
use super::dispatcher::MessageDispatcher;
use super::envelope::Envelope;
use super::transport::{DispatchOutcome, MessageReceiver, MessageSender, TransportError};

/// Pause after a receive error before polling again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct MessagePump {
    pub label: String,
    pub receiver: Arc<dyn MessageReceiver>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub dead_letter: Arc<dyn MessageSender>,
    pub max_delivery_attempts: u32,
}

impl MessagePump {
    pub(crate) fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(pump = %self.label, "pump started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = self.receiver.receive() => match received {
                        Ok(envelope) => self.handle_delivery(envelope).await,
                        Err(TransportError::Closed) => {
                            info!(pump = %self.label, "receiver closed");
                            break;
                        }
                        Err(transport_error) => {
                            warn!(pump = %self.label, error = %transport_error, "receive failed");
                            tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
            info!(pump = %self.label, "pump stopped");
        })
    }

    async fn handle_delivery(&self, envelope: Envelope) {
        if envelope.delivery_attempt.as_u32() > self.max_delivery_attempts {
            warn!(
                pump = %self.label,
                message_id = %envelope.message_id,
                attempts = envelope.delivery_attempt.as_u32(),
                "delivery count exhausted; dead-lettering"
            );
            match self.dead_letter.send(envelope.clone()).await {
                Ok(()) => {
                    if let Err(settle_error) = self
                        .receiver
                        .settle(envelope, DispatchOutcome::Ack)
                        .await
                    {
                        error!(pump = %self.label, error = %settle_error, "settle failed");
                    }
                }
                Err(send_error) => {
                    // Keep the message alive rather than lose it
                    error!(pump = %self.label, error = %send_error, "dead-letter send failed");
                    if let Err(settle_error) = self
                        .receiver
                        .settle(envelope, DispatchOutcome::Nack)
                        .await
                    {
                        error!(pump = %self.label, error = %settle_error, "settle failed");
                    }
                }
            }
            return;
        }

        let result = self.dispatcher.dispatch(&envelope).await;
        if let Some(dispatch_error) = &result.error {
            warn!(
                pump = %self.label,
                message_id = %envelope.message_id,
                outcome = ?result.outcome,
                error = %dispatch_error,
                "dispatch failed"
            );
        }
        if let Err(settle_error) = self.receiver.settle(envelope, result.outcome).await {
            error!(pump = %self.label, error = %settle_error, "settle failed");
        }
    }
}

/// Pump for the instance's reply queue, completing outstanding requests
pub(crate) struct ReplyPump {
    pub label: String,
    pub receiver: Arc<dyn MessageReceiver>,
    pub correlator: Arc<RequestCorrelator>,
}

impl ReplyPump {
    pub(crate) fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(pump = %self.label, "reply pump started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = self.receiver.receive() => match received {
                        Ok(envelope) => {
                            self.correlator.try_complete(&envelope);
                            // Unmatched replies are dropped by contract
                            if let Err(settle_error) = self
                                .receiver
                                .settle(envelope, DispatchOutcome::Ack)
                                .await
                            {
                                error!(pump = %self.label, error = %settle_error, "settle failed");
                            }
                        }
                        Err(TransportError::Closed) => {
                            debug!(pump = %self.label, "reply receiver closed");
                            break;
                        }
                        Err(transport_error) => {
                            warn!(pump = %self.label, error = %transport_error, "receive failed");
                            tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
            info!(pump = %self.label, "reply pump stopped");
        })
    }
}
