//! Typed handler registry.
//!
//! External code registers a typed async function per job type; the registry
//! stores an erased wrapper that deserializes the raw payload bytes before
//! dispatch. A payload that fails to deserialize becomes a job failure.

use crate::error::JobError;
use crate::job::JobContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Erased handler stored in the registry.
pub type JobHandler =
    Arc<dyn Fn(JobContext, Vec<u8>) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Registry mapping `job_type` to its handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for a job type.
    ///
    /// Registering the same type twice overwrites the previous handler.
    pub fn register<P, F, Fut>(&self, job_type: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let job_type = job_type.into();

        let erased: JobHandler = Arc::new(move |ctx, payload| {
            match serde_json::from_slice::<P>(&payload) {
                Ok(typed) => handler(ctx, typed).boxed(),
                Err(e) => futures::future::ready(Err(JobError::Serialization(e))).boxed(),
            }
        });

        self.handlers.write().insert(job_type.clone(), erased);
        info!(job_type = %job_type, "Registered job handler");
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<JobHandler> {
        self.handlers.read().get(job_type).cloned()
    }

    /// Returns true if a handler is registered for the type.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    /// Snapshot of registered job types.
    ///
    /// Returns a defensive copy: callers may mutate the result freely.
    pub fn list_handlers(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns true if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRecord;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct SumPayload {
        a: i64,
        b: i64,
    }

    fn context() -> JobContext {
        JobRecord::builder("sum").build().to_context("worker-1")
    }

    #[tokio::test]
    async fn test_dispatch_deserializes_payload() {
        let registry = HandlerRegistry::new();
        registry.register("sum", |_ctx, payload: SumPayload| async move {
            assert_eq!(payload.a + payload.b, 5);
            Ok(())
        });

        let handler = registry.get("sum").unwrap();
        let result = handler(context(), br#"{"a":2,"b":3}"#.to_vec()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bad_payload_becomes_handler_error() {
        let registry = HandlerRegistry::new();
        registry.register("sum", |_ctx, _payload: SumPayload| async move { Ok(()) });

        let handler = registry.get("sum").unwrap();
        let result = handler(context(), b"not json".to_vec()).await;
        assert!(matches!(result, Err(JobError::Serialization(_))));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = HandlerRegistry::new();
        registry.register("sum", |_ctx, _p: SumPayload| async move { Ok(()) });
        registry.register("sum", |_ctx, _p: SumPayload| async move {
            Err(JobError::ExecutionFailed("second".into()))
        });

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_handlers_is_a_defensive_copy() {
        let registry = HandlerRegistry::new();
        registry.register("a", |_ctx, _p: SumPayload| async move { Ok(()) });
        registry.register("b", |_ctx, _p: SumPayload| async move { Ok(()) });

        let mut listed = registry.list_handlers();
        listed.clear();
        listed.push("bogus".to_string());

        assert_eq!(registry.list_handlers(), vec!["a", "b"]);
        assert!(!registry.contains("bogus"));
    }

    #[test]
    fn test_unknown_type_absent() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }
}
