//! Module executor registry.
//!
//! Business modules register one handler per `(module, action)` pair. The
//! queue looks handlers up at dispatch time; unknown pairs fail fast with
//! [`QueueError::UnsupportedOperation`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::operation::Payload;
use crate::error::QueueError;

/// Executes one kind of operation against the remote system.
#[async_trait]
pub trait ModuleExecutor: Send + Sync {
    /// Execute the operation described by `payload`.
    async fn execute(&self, payload: &Payload) -> Result<(), QueueError>;
}

/// Adapter turning an async closure into a [`ModuleExecutor`].
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F> {
    /// Wrap `f`.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ModuleExecutor for FnExecutor<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    async fn execute(&self, payload: &Payload) -> Result<(), QueueError> {
        (self.0)(payload.clone()).await
    }
}

/// Handlers keyed by `(module, action)`.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    handlers: HashMap<(String, String), Arc<dyn ModuleExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `module.action`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidOperation` for empty names and
    /// `QueueError::DuplicateHandler` if the pair is already taken.
    pub fn register(
        &mut self,
        module: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn ModuleExecutor>,
    ) -> Result<(), QueueError> {
        let module = module.into();
        let action = action.into();
        if module.trim().is_empty() || action.trim().is_empty() {
            return Err(QueueError::InvalidOperation(
                "handler module and action must not be empty".to_string(),
            ));
        }

        let key = (module, action);
        if self.handlers.contains_key(&key) {
            let (module, action) = key;
            return Err(QueueError::DuplicateHandler { module, action });
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Register an async closure for `module.action`.
    ///
    /// # Errors
    ///
    /// Same as [`ExecutorRegistry::register`].
    pub fn register_fn<F, Fut>(
        &mut self,
        module: impl Into<String>,
        action: impl Into<String>,
        f: F,
    ) -> Result<(), QueueError>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        self.register(module, action, Arc::new(FnExecutor::new(f)))
    }

    /// Find the handler for `module.action`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::UnsupportedOperation` when nothing is registered.
    pub fn resolve(&self, module: &str, action: &str) -> Result<Arc<dyn ModuleExecutor>, QueueError> {
        self.handlers
            .get(&(module.to_string(), action.to_string()))
            .cloned()
            .ok_or_else(|| QueueError::UnsupportedOperation {
                module: module.to_string(),
                action: action.to_string(),
            })
    }

    /// Whether a handler exists for `module.action`.
    #[must_use]
    pub fn supports(&self, module: &str, action: &str) -> bool {
        self.handlers
            .contains_key(&(module.to_string(), action.to_string()))
    }

    /// Registered pairs, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("handlers", &self.keys())
            .finish()
    }
}
