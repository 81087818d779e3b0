//! Dependency scopes for dispatch and send operations
//!
//! Every dispatch and every send runs inside a child scope obtained from the
//! application's resolver. Handler factories and interceptor factories
//! receive the scope and downcast it (via [`DependencyScope::as_any`]) to
//! whatever concrete container the application wired in. The guard releases
//! the scope on every exit path, including panics and handler failures.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A child scope with guaranteed release
///
/// Implementations typically wrap an application container's scope handle.
/// `close` is called exactly once by the owning [`ScopeGuard`].
pub trait DependencyScope: Send + Sync {
    /// Concrete-type access for handler and interceptor factories
    fn as_any(&self) -> &dyn Any;

    /// Releases the scope's resources
    fn close(&self) {}
}

/// Creates child scopes for dispatch and send operations
pub trait DependencyResolver: Send + Sync {
    /// Opens a new child scope
    fn create_child_scope(&self) -> Box<dyn DependencyScope>;
}

/// RAII owner of a child scope
///
/// Dropping the guard closes the scope, so early returns, handler errors and
/// panics all release it.
pub struct ScopeGuard {
    scope: Option<Box<dyn DependencyScope>>,
}

impl ScopeGuard {
    /// Opens a child scope from the resolver
    #[must_use]
    pub fn open(resolver: &dyn DependencyResolver) -> Self {
        Self {
            scope: Some(resolver.create_child_scope()),
        }
    }

    /// The guarded scope
    #[must_use]
    pub fn scope(&self) -> &dyn DependencyScope {
        self.scope
            .as_deref()
            .expect("scope present until the guard drops")
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.close();
        }
    }
}

/// Resolver for applications without a dependency container
#[derive(Debug, Clone, Default)]
pub struct NoopResolver;

struct NoopScope;

impl DependencyScope for NoopScope {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl DependencyResolver for NoopResolver {
    fn create_child_scope(&self) -> Box<dyn DependencyScope> {
        Box::new(NoopScope)
    }
}

/// Resolver that counts scope opens and closes
///
/// Test support for the scope-containment property: opened must equal closed
/// on every dispatch path.
#[derive(Debug, Default)]
pub struct CountingResolver {
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl CountingResolver {
    /// Creates a fresh counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes opened so far
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Scopes closed so far
    #[must_use]
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

struct CountingScope {
    closed: Arc<AtomicUsize>,
}

impl DependencyScope for CountingScope {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl DependencyResolver for CountingResolver {
    fn create_child_scope(&self) -> Box<dyn DependencyScope> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingScope {
            closed: Arc::clone(&self.closed),
        })
    }
}
