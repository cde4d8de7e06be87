//! Handler registry.

use async_trait::async_trait;
use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A named capability the dispatcher can invoke.
///
/// Handlers are opaque business functions; failures are reported as
/// `anyhow::Error` and surface on the wire as `HANDLER_ERROR`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, params: Vec<Value>) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, params: Vec<Value>) -> anyhow::Result<Value> {
        (self.f)(params).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

#[derive(Clone)]
pub struct HandlerRegistration {
    pub method: String,
    pub handler: Arc<dyn Handler>,
    /// Identical (method, params) entries in one batch share a single invocation.
    pub cacheable: bool,
    pub default_timeout: Option<Duration>,
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("method", &self.method)
            .field("cacheable", &self.cacheable)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

type HandlerMap = HashMap<String, Arc<HandlerRegistration>>;

/// Read-mostly method table. Readers take a lock-free snapshot; writers swap in a copy.
pub struct HandlerRegistry {
    handlers: ArcSwap<HandlerMap>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Installs or replaces the entry for `registration.method`; last write wins.
    pub fn register(&self, registration: HandlerRegistration) {
        let registration = Arc::new(registration);
        self.handlers.rcu(|current| {
            let mut next = HandlerMap::clone(current);
            next.insert(registration.method.clone(), registration.clone());
            next
        });
    }

    pub fn unregister(&self, method: &str) -> Option<Arc<HandlerRegistration>> {
        let mut removed = None;
        self.handlers.rcu(|current| {
            let mut next = HandlerMap::clone(current);
            removed = next.remove(method);
            next
        });
        removed
    }

    pub fn get(&self, method: &str) -> Option<Arc<HandlerRegistration>> {
        self.handlers.load().get(method).cloned()
    }

    /// Consistent view of the whole table, used for the duration of one batch.
    pub(crate) fn snapshot(&self) -> Arc<HandlerMap> {
        self.handlers.load_full()
    }

    pub fn has(&self, method: &str) -> bool {
        self.handlers.load().contains_key(method)
    }

    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.handlers.load().len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
