//! Outbound send pipeline
//!
//! Every outgoing envelope, whether from the broker facade or a dispatcher's
//! reply, flows through here: a fresh dependency scope, the ordered outbound
//! interceptor chain, then the transport sender. Request sends run the
//! request-specific hooks.

use std::sync::Arc;
use tracing::trace;

use super::domain_types::{QueuePath, TopicPath};
use super::envelope::Envelope;
use super::interceptor::{OutboundChain, OutboundInterceptorFactory};
use super::scope::{DependencyResolver, ScopeGuard};
use super::transport::Transport;
use crate::error::BusError;

/// Hook family an outbound operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendKind {
    /// Plain send: `on_sending` / `on_sent` / `on_error`
    Send,
    /// Request send: the `on_request_*` hooks
    Request,
}

pub(crate) struct OutboundPipeline {
    transport: Arc<dyn Transport>,
    interceptors: Arc<dyn OutboundInterceptorFactory>,
    resolver: Arc<dyn DependencyResolver>,
}

impl OutboundPipeline {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        interceptors: Arc<dyn OutboundInterceptorFactory>,
        resolver: Arc<dyn DependencyResolver>,
    ) -> Self {
        Self {
            transport,
            interceptors,
            resolver,
        }
    }

    pub(crate) async fn send_to_queue(
        &self,
        path: &QueuePath,
        envelope: Envelope,
        kind: SendKind,
    ) -> Result<(), BusError> {
        let sender = self.transport.queue_sender(path).await?;
        let scope = ScopeGuard::open(self.resolver.as_ref());
        let chain = OutboundChain::new(self.interceptors.create(scope.scope(), &envelope));
        let mut envelope = envelope;
        trace!(path = %path, message_id = %envelope.message_id, "sending to queue");
        match kind {
            SendKind::Send => {
                chain
                    .send(&mut envelope, move |outgoing| async move {
                        sender.send(outgoing).await.map_err(BusError::from)
                    })
                    .await
            }
            SendKind::Request => {
                chain
                    .send_request(&mut envelope, move |outgoing| async move {
                        sender.send(outgoing).await.map_err(BusError::from)
                    })
                    .await
            }
        }
    }

    pub(crate) async fn send_to_topic(
        &self,
        path: &TopicPath,
        envelope: Envelope,
        kind: SendKind,
    ) -> Result<(), BusError> {
        let sender = self.transport.topic_sender(path).await?;
        let scope = ScopeGuard::open(self.resolver.as_ref());
        let chain = OutboundChain::new(self.interceptors.create(scope.scope(), &envelope));
        let mut envelope = envelope;
        trace!(path = %path, message_id = %envelope.message_id, "publishing to topic");
        match kind {
            SendKind::Send => {
                chain
                    .send(&mut envelope, move |outgoing| async move {
                        sender.send(outgoing).await.map_err(BusError::from)
                    })
                    .await
            }
            SendKind::Request => {
                chain
                    .send_request(&mut envelope, move |outgoing| async move {
                        sender.send(outgoing).await.map_err(BusError::from)
                    })
                    .await
            }
        }
    }
}
