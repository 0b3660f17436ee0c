//! Handler registry
//!
//! Resolves `(kind, name)` to a handler. Registration and lookup are safe to
//! interleave from any number of tasks; concurrent registration of the same
//! key resolves deterministically (first wins).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreError;
use crate::spec::WorkKind;

/// Run-scoped context available to handlers that want it.
///
/// The cancellation token fires when the run is cancelled; handlers observe
/// it at their own suspension points (or ignore it and run to completion).
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub run_id: Uuid,
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(run_id: Uuid, cancellation: CancellationToken) -> Self {
        Self {
            run_id,
            cancellation,
        }
    }
}

/// A registered unit of work.
///
/// Handlers take JSON params and return JSON. They may suspend on I/O; the
/// executor treats both quick and long-running handlers as "runs to
/// completion". Handlers that need the run id or cancellation override
/// [`invoke_with_context`](Handler::invoke_with_context); plain handlers just
/// implement [`invoke`](Handler::invoke).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, params: serde_json::Value) -> Result<serde_json::Value, CoreError>;

    async fn invoke_with_context(
        &self,
        _ctx: HandlerContext,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        self.invoke(params).await
    }
}

/// Adapt an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, CoreError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, CoreError>> + Send,
{
    async fn invoke(&self, params: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        (self.f)(params).await
    }
}

/// Convenience constructor for closure-backed handlers.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value, CoreError>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// `(kind, name)` already registered and override not requested.
    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered { kind: WorkKind, name: String },
}

struct Registration {
    handler: Arc<dyn Handler>,
    metadata: BTreeMap<String, serde_json::Value>,
}

/// Name → handler resolution for tasks, operations, and workflows.
pub struct Registry {
    entries: DashMap<(WorkKind, String), Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a handler.
    ///
    /// Fails with [`RegistryError::AlreadyRegistered`] when the key exists,
    /// unless `register_override` is used.
    pub fn register(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        self.register_with_metadata(kind, name, handler, BTreeMap::new())
    }

    /// Register a handler with metadata attached.
    pub fn register_with_metadata(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match self.entries.entry((kind, name.clone())) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered { kind, name }),
            Entry::Vacant(vacant) => {
                vacant.insert(Registration { handler, metadata });
                Ok(())
            }
        }
    }

    /// Register a handler, replacing any existing entry.
    pub fn register_override(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) {
        self.entries.insert(
            (kind, name.into()),
            Registration {
                handler,
                metadata: BTreeMap::new(),
            },
        );
    }

    pub fn get(&self, kind: WorkKind, name: &str) -> Option<Arc<dyn Handler>> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|entry| Arc::clone(&entry.handler))
    }

    pub fn get_metadata(
        &self,
        kind: WorkKind,
        name: &str,
    ) -> Option<BTreeMap<String, serde_json::Value>> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|entry| entry.metadata.clone())
    }

    pub fn has(&self, kind: WorkKind, name: &str) -> bool {
        self.entries.contains_key(&(kind, name.to_string()))
    }

    /// List registered `(kind, name)` pairs, optionally filtered by kind,
    /// sorted by name within kind.
    pub fn list(&self, kind: Option<WorkKind>) -> Vec<(WorkKind, String)> {
        let mut entries: Vec<(WorkKind, String)> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|(k, _)| kind.is_none_or(|want| *k == want))
            .collect();
        entries.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
        entries
    }

    /// Remove a registration. Returns whether it existed.
    pub fn unregister(&self, kind: WorkKind, name: &str) -> bool {
        self.entries.remove(&(kind, name.to_string())).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.list(None))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_handler() -> Arc<dyn Handler> {
        handler_fn(|params| async move { Ok(params) })
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = Registry::new();
        registry
            .register(WorkKind::Task, "echo", echo_handler())
            .unwrap();

        assert!(registry.has(WorkKind::Task, "echo"));
        assert!(!registry.has(WorkKind::Operation, "echo"));

        let handler = registry.get(WorkKind::Task, "echo").unwrap();
        let out = handler.invoke(json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = Registry::new();
        registry
            .register(WorkKind::Task, "echo", echo_handler())
            .unwrap();

        let err = registry
            .register(WorkKind::Task, "echo", echo_handler())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));

        // Override replaces without error.
        registry.register_override(WorkKind::Task, "echo", echo_handler());
    }

    #[test]
    fn test_same_name_different_kind() {
        let registry = Registry::new();
        registry
            .register(WorkKind::Task, "ingest", echo_handler())
            .unwrap();
        registry
            .register(WorkKind::Operation, "ingest", echo_handler())
            .unwrap();

        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_list_and_unregister() {
        let registry = Registry::new();
        registry
            .register(WorkKind::Task, "b_task", echo_handler())
            .unwrap();
        registry
            .register(WorkKind::Task, "a_task", echo_handler())
            .unwrap();
        registry
            .register(WorkKind::Workflow, "etl", echo_handler())
            .unwrap();

        let tasks = registry.list(Some(WorkKind::Task));
        assert_eq!(
            tasks,
            vec![
                (WorkKind::Task, "a_task".to_string()),
                (WorkKind::Task, "b_task".to_string()),
            ]
        );
        assert_eq!(registry.list(None).len(), 3);

        assert!(registry.unregister(WorkKind::Workflow, "etl"));
        assert!(!registry.unregister(WorkKind::Workflow, "etl"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_registration_first_wins() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.register(WorkKind::Task, "contended", echo_handler())
            }));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();

        assert_eq!(successes, 1);
        assert!(registry.has(WorkKind::Task, "contended"));
    }
}
