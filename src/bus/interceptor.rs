//! Interceptor hooks around send and dispatch operations
//!
//! Interceptors are built per envelope inside the operation's dependency
//! scope and live for that one operation. Ordering is explicit: priority
//! descending, then type name ascending, so chains are stable and
//! deterministic. Before-hooks run in declared order, after-hooks and error
//! hooks in reverse, and the original error is always rethrown verbatim.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use super::envelope::Envelope;
use super::handlers::DispatchContext;
use super::scope::DependencyScope;
use crate::error::BusError;

/// Hooks around outbound sends
///
/// The request variants fire on the request/response path in place of the
/// plain send hooks.
#[async_trait]
pub trait OutboundInterceptor: Send + Sync {
    /// Ordering priority; higher runs earlier in the before phase
    fn priority(&self) -> i32 {
        0
    }

    /// Stable name used as the ordering tiebreak and for diagnostics
    fn name(&self) -> &'static str;

    /// Before a send; may amend the envelope
    async fn on_sending(&self, _envelope: &mut Envelope) -> Result<(), BusError> {
        Ok(())
    }

    /// After a successful send
    async fn on_sent(&self, _envelope: &Envelope) {}

    /// After a failed send; the original error is rethrown afterwards
    async fn on_error(&self, _envelope: &Envelope, _error: &BusError) {}

    /// Before a request send; may amend the envelope
    async fn on_request_sending(&self, _envelope: &mut Envelope) -> Result<(), BusError> {
        Ok(())
    }

    /// After a successful request send
    async fn on_request_sent(&self, _envelope: &Envelope) {}

    /// After a failed request send
    async fn on_request_sending_error(&self, _envelope: &Envelope, _error: &BusError) {}
}

/// Hooks around inbound dispatches
#[async_trait]
pub trait InboundInterceptor: Send + Sync {
    /// Ordering priority; higher runs earlier in the before phase
    fn priority(&self) -> i32 {
        0
    }

    /// Stable name used as the ordering tiebreak and for diagnostics
    fn name(&self) -> &'static str;

    /// Before the handlers run
    async fn on_handling(
        &self,
        _envelope: &Envelope,
        _context: &DispatchContext,
    ) -> Result<(), BusError> {
        Ok(())
    }

    /// After the handlers completed successfully
    async fn on_handled(&self, _envelope: &Envelope, _context: &DispatchContext) {}

    /// After a handler failure; the original error propagates afterwards
    async fn on_error(
        &self,
        _envelope: &Envelope,
        _context: &DispatchContext,
        _error: &BusError,
    ) {
    }
}

/// Builds the outbound chain for one send operation
pub trait OutboundInterceptorFactory: Send + Sync {
    /// Returns the interceptors for this envelope, unordered
    fn create(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
    ) -> Vec<Arc<dyn OutboundInterceptor>>;
}

/// Builds the inbound chain for one dispatch operation
pub trait InboundInterceptorFactory: Send + Sync {
    /// Returns the interceptors for this envelope, unordered
    fn create(
        &self,
        scope: &dyn DependencyScope,
        envelope: &Envelope,
    ) -> Vec<Arc<dyn InboundInterceptor>>;
}

/// Factory producing no interceptors
#[derive(Debug, Clone, Default)]
pub struct NoInterceptors;

impl OutboundInterceptorFactory for NoInterceptors {
    fn create(
        &self,
        _scope: &dyn DependencyScope,
        _envelope: &Envelope,
    ) -> Vec<Arc<dyn OutboundInterceptor>> {
        Vec::new()
    }
}

impl InboundInterceptorFactory for NoInterceptors {
    fn create(
        &self,
        _scope: &dyn DependencyScope,
        _envelope: &Envelope,
    ) -> Vec<Arc<dyn InboundInterceptor>> {
        Vec::new()
    }
}

fn order_outbound(interceptors: &mut [Arc<dyn OutboundInterceptor>]) {
    interceptors.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.name().cmp(b.name()))
    });
}

fn order_inbound(interceptors: &mut [Arc<dyn InboundInterceptor>]) {
    interceptors.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.name().cmp(b.name()))
    });
}

/// Ordered outbound chain for one operation
pub struct OutboundChain {
    interceptors: Vec<Arc<dyn OutboundInterceptor>>,
}

impl OutboundChain {
    /// Orders and wraps the factory output
    #[must_use]
    pub fn new(mut interceptors: Vec<Arc<dyn OutboundInterceptor>>) -> Self {
        order_outbound(&mut interceptors);
        Self { interceptors }
    }

    /// Runs a send through the chain.
    ///
    /// Before-hooks in order, then the guarded send, then after-hooks in
    /// reverse. On failure the error hooks run in reverse and the original
    /// error is returned untouched.
    pub async fn send<F, Fut>(&self, envelope: &mut Envelope, send: F) -> Result<(), BusError>
    where
        F: FnOnce(Envelope) -> Fut + Send,
        Fut: Future<Output = Result<(), BusError>> + Send,
    {
        for interceptor in &self.interceptors {
            if let Err(error) = interceptor.on_sending(envelope).await {
                for inner in self.interceptors.iter().rev() {
                    inner.on_error(envelope, &error).await;
                }
                return Err(error);
            }
        }
        match send(envelope.clone()).await {
            Ok(()) => {
                for interceptor in self.interceptors.iter().rev() {
                    interceptor.on_sent(envelope).await;
                }
                Ok(())
            }
            Err(error) => {
                for interceptor in self.interceptors.iter().rev() {
                    interceptor.on_error(envelope, &error).await;
                }
                Err(error)
            }
        }
    }

    /// Runs a request send through the chain, using the request hooks
    pub async fn send_request<F, Fut>(
        &self,
        envelope: &mut Envelope,
        send: F,
    ) -> Result<(), BusError>
    where
        F: FnOnce(Envelope) -> Fut + Send,
        Fut: Future<Output = Result<(), BusError>> + Send,
    {
        for interceptor in &self.interceptors {
            if let Err(error) = interceptor.on_request_sending(envelope).await {
                for inner in self.interceptors.iter().rev() {
                    inner.on_request_sending_error(envelope, &error).await;
                }
                return Err(error);
            }
        }
        match send(envelope.clone()).await {
            Ok(()) => {
                for interceptor in self.interceptors.iter().rev() {
                    interceptor.on_request_sent(envelope).await;
                }
                Ok(())
            }
            Err(error) => {
                for interceptor in self.interceptors.iter().rev() {
                    interceptor.on_request_sending_error(envelope, &error).await;
                }
                Err(error)
            }
        }
    }
}

/// Ordered inbound chain for one dispatch
pub struct InboundChain {
    interceptors: Vec<Arc<dyn InboundInterceptor>>,
}

impl InboundChain {
    /// Orders and wraps the factory output
    #[must_use]
    pub fn new(mut interceptors: Vec<Arc<dyn InboundInterceptor>>) -> Self {
        order_inbound(&mut interceptors);
        Self { interceptors }
    }

    /// Runs a dispatch through the chain with mirrored hook ordering.
    ///
    /// The guarded operation's value passes through on success; on failure
    /// the error hooks run in reverse and the original error is returned.
    pub async fn dispatch<T, F, Fut>(
        &self,
        envelope: &Envelope,
        context: &DispatchContext,
        handle: F,
    ) -> Result<T, BusError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, BusError>> + Send,
    {
        for interceptor in &self.interceptors {
            if let Err(error) = interceptor.on_handling(envelope, context).await {
                for inner in self.interceptors.iter().rev() {
                    inner.on_error(envelope, context, &error).await;
                }
                return Err(error);
            }
        }
        match handle().await {
            Ok(value) => {
                for interceptor in self.interceptors.iter().rev() {
                    interceptor.on_handled(envelope, context).await;
                }
                Ok(value)
            }
            Err(error) => {
                for interceptor in self.interceptors.iter().rev() {
                    interceptor.on_error(envelope, context, &error).await;
                }
                Err(error)
            }
        }
    }
}
