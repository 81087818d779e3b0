//! Dispatcher family
//!
//! Converts received envelopes into handler invocations. One dispatcher per
//! handler shape, all sharing the same control flow: type-header lookup,
//! child scope, dispatch context, inbound interceptor chain, handler
//! invocation, shape-specific post-processing. The outcome travels back to
//! the transport pump; the dispatcher never acknowledges anything itself.

use std::sync::Arc;
use tracing::{debug, warn};

use super::envelope::{Envelope, MessageFactory, SerializedMessage};
use super::handlers::{DispatchContext, HandlerShape};
use super::interceptor::{InboundChain, InboundInterceptorFactory};
use super::pipeline::{OutboundPipeline, SendKind};
use super::registry::HandlerMap;
use super::scope::{DependencyResolver, ScopeGuard};
use super::transport::DispatchOutcome;
use crate::error::BusError;

/// Outcome of one dispatch plus the failure that produced it, if any
#[derive(Debug)]
pub struct DispatchResult {
    /// Ack or nack, handed to the transport
    pub outcome: DispatchOutcome,
    /// The dispatch failure, when one occurred
    pub error: Option<BusError>,
}

impl DispatchResult {
    fn ack() -> Self {
        Self {
            outcome: DispatchOutcome::Ack,
            error: None,
        }
    }

    fn ack_with_error(error: BusError) -> Self {
        Self {
            outcome: DispatchOutcome::Ack,
            error: Some(error),
        }
    }

    fn nack(error: BusError) -> Self {
        Self {
            outcome: DispatchOutcome::Nack,
            error: Some(error),
        }
    }
}

/// Flattens an error and its source chain into one detail string
fn error_detail(error: &BusError) -> String {
    let mut detail = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

/// Shape-keyed dispatcher converting envelopes into handler invocations
pub struct MessageDispatcher {
    shape: HandlerShape,
    map: Arc<HandlerMap>,
    resolver: Arc<dyn DependencyResolver>,
    inbound: Arc<dyn InboundInterceptorFactory>,
    pipeline: Arc<OutboundPipeline>,
    factory: MessageFactory,
}

impl MessageDispatcher {
    /// Dispatches one delivered envelope
    pub async fn dispatch(&self, envelope: &Envelope) -> DispatchResult {
        let Some(message_type) = envelope.message_type() else {
            return DispatchResult::nack(BusError::MalformedEnvelope {
                message: "missing message type header".to_string(),
            });
        };

        let Some(handlers) = self.map.handlers_for(self.shape, &message_type) else {
            return DispatchResult::nack(BusError::UnknownMessageType { message_type });
        };

        // Scope lives for the whole dispatch; the guard closes it on every
        // exit path
        let scope = ScopeGuard::open(self.resolver.as_ref());
        let context = DispatchContext::from_envelope(envelope);
        let chain = InboundChain::new(self.inbound.create(scope.scope(), envelope));

        debug!(
            message_id = %envelope.message_id,
            message_type = %message_type,
            shape = ?self.shape,
            handlers = handlers.len(),
            "dispatching"
        );

        match self.shape {
            HandlerShape::Command => {
                self.dispatch_plain(handlers, &scope, &chain, envelope, &context)
                    .await
            }
            HandlerShape::CompetingEvent | HandlerShape::MulticastEvent => {
                self.dispatch_fanout(handlers, &scope, &chain, envelope, &context)
                    .await
            }
            HandlerShape::Request => {
                self.dispatch_request(handlers, &scope, &chain, envelope, &context)
                    .await
            }
            HandlerShape::MulticastRequest => {
                self.dispatch_multicast_request(handlers, &scope, &chain, envelope, &context)
                    .await
            }
        }
    }

    async fn dispatch_plain(
        &self,
        handlers: &[Arc<dyn super::registry::ErasedHandler>],
        scope: &ScopeGuard,
        chain: &InboundChain,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> DispatchResult {
        let result = chain
            .dispatch(envelope, context, move || async move {
                for handler in handlers {
                    handler.invoke(scope.scope(), envelope, context).await?;
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => DispatchResult::ack(),
            Err(error) => DispatchResult::nack(error),
        }
    }

    async fn dispatch_fanout(
        &self,
        handlers: &[Arc<dyn super::registry::ErasedHandler>],
        scope: &ScopeGuard,
        chain: &InboundChain,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> DispatchResult {
        let total = handlers.len();
        let result = chain
            .dispatch(envelope, context, move || async move {
                // Every handler runs; failures are aggregated so the
                // transport can redeliver while survivors still complete
                let mut failures = Vec::new();
                for handler in handlers {
                    if let Err(error) = handler.invoke(scope.scope(), envelope, context).await {
                        warn!(
                            message_id = %envelope.message_id,
                            handler = handler.handler_name(),
                            %error,
                            "event handler failed"
                        );
                        failures.push(error);
                    }
                }
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(BusError::DispatchComposite { failures, total })
                }
            })
            .await;

        match result {
            Ok(()) => DispatchResult::ack(),
            Err(error) => DispatchResult::nack(error),
        }
    }

    async fn dispatch_request(
        &self,
        handlers: &[Arc<dyn super::registry::ErasedHandler>],
        scope: &ScopeGuard,
        chain: &InboundChain,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> DispatchResult {
        let Some(reply_to) = envelope.reply_to.clone() else {
            return DispatchResult::nack(BusError::MalformedEnvelope {
                message: "request without a reply-to path".to_string(),
            });
        };
        // Cardinality is validated when the map is built
        let Some(handler) = handlers.first() else {
            return DispatchResult::nack(BusError::MalformedEnvelope {
                message: "request handler missing from registry".to_string(),
            });
        };

        let result = chain
            .dispatch(envelope, context, move || async move {
                handler.invoke(scope.scope(), envelope, context).await
            })
            .await;

        match result {
            Ok(reply_body) => {
                let Some(body) = reply_body else {
                    return DispatchResult::nack(BusError::MalformedEnvelope {
                        message: "request handler produced no reply".to_string(),
                    });
                };
                let reply = self.factory.reply_envelope(body, envelope);
                match self
                    .pipeline
                    .send_to_queue(&reply_to, reply, SendKind::Send)
                    .await
                {
                    Ok(()) => DispatchResult::ack(),
                    // Lost replies are worth a redelivery
                    Err(error) => DispatchResult::nack(error),
                }
            }
            Err(error) => {
                // Surface the failure to the caller instead of letting its
                // correlator time out; the delivery itself is settled
                let detail = error_detail(&error);
                let faulted = self
                    .factory
                    .faulted_reply(&detail, envelope)
                    .map(|reply| (reply_to.clone(), reply));
                match faulted {
                    Ok((path, reply)) => {
                        if let Err(send_error) = self
                            .pipeline
                            .send_to_queue(&path, reply, SendKind::Send)
                            .await
                        {
                            warn!(
                                message_id = %envelope.message_id,
                                error = %send_error,
                                "failed to send faulted reply"
                            );
                            return DispatchResult::nack(error);
                        }
                        DispatchResult::ack_with_error(error)
                    }
                    Err(_) => DispatchResult::nack(error),
                }
            }
        }
    }

    async fn dispatch_multicast_request(
        &self,
        handlers: &[Arc<dyn super::registry::ErasedHandler>],
        scope: &ScopeGuard,
        chain: &InboundChain,
        envelope: &Envelope,
        context: &DispatchContext,
    ) -> DispatchResult {
        let Some(reply_to) = envelope.reply_to.clone() else {
            return DispatchResult::nack(BusError::MalformedEnvelope {
                message: "multicast request without a reply-to path".to_string(),
            });
        };

        let result = chain
            .dispatch(envelope, context, move || async move {
                // Handlers that fail simply do not reply; redelivering the
                // whole fan-out would duplicate the survivors' replies
                let mut replies: Vec<SerializedMessage> = Vec::new();
                for handler in handlers {
                    match handler.invoke(scope.scope(), envelope, context).await {
                        Ok(Some(body)) => replies.push(body),
                        Ok(None) => {}
                        Err(error) => {
                            warn!(
                                message_id = %envelope.message_id,
                                handler = handler.handler_name(),
                                %error,
                                "multicast request handler failed"
                            );
                        }
                    }
                }
                Ok(replies)
            })
            .await;

        let replies = match result {
            Ok(replies) => replies,
            Err(error) => return DispatchResult::nack(error),
        };

        for body in replies {
            let reply = self.factory.reply_envelope(body, envelope);
            if let Err(error) = self
                .pipeline
                .send_to_queue(&reply_to, reply, SendKind::Send)
                .await
            {
                warn!(
                    message_id = %envelope.message_id,
                    error = %error,
                    "failed to send multicast reply"
                );
            }
        }
        DispatchResult::ack()
    }
}

/// Creates the dispatcher variant for each handler shape
pub struct DispatcherFactory {
    map: Arc<HandlerMap>,
    resolver: Arc<dyn DependencyResolver>,
    inbound: Arc<dyn InboundInterceptorFactory>,
    pipeline: Arc<OutboundPipeline>,
    factory: MessageFactory,
}

impl DispatcherFactory {
    pub(crate) fn new(
        map: Arc<HandlerMap>,
        resolver: Arc<dyn DependencyResolver>,
        inbound: Arc<dyn InboundInterceptorFactory>,
        pipeline: Arc<OutboundPipeline>,
        factory: MessageFactory,
    ) -> Self {
        Self {
            map,
            resolver,
            inbound,
            pipeline,
            factory,
        }
    }

    /// The dispatcher for one handler shape
    #[must_use]
    pub fn create(&self, shape: HandlerShape) -> Arc<MessageDispatcher> {
        Arc::new(MessageDispatcher {
            shape,
            map: Arc::clone(&self.map),
            resolver: Arc::clone(&self.resolver),
            inbound: Arc::clone(&self.inbound),
            pipeline: Arc::clone(&self.pipeline),
            factory: self.factory.clone(),
        })
    }
}
