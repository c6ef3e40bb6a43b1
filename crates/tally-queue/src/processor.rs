//! Handler dispatch
//!
//! A [`ProcessorRegistry`] maps job type tags to handlers. Handlers must be
//! safe to re-run from scratch: a retry always starts the whole unit of work
//! again.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::job::{JobId, JobRecord};
use crate::queue::JobQueue;

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
    #[error("Invalid payload for {job_type}: {source}")]
    InvalidPayload {
        job_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0:#}")]
    Handler(anyhow::Error),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Progress callback handed to a running handler.
///
/// Reports are written through to the job record; a rejected or failed write
/// is logged and never fails the handler.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    queue: Option<Arc<JobQueue>>,
}

impl ProgressReporter {
    pub fn new(queue: Arc<JobQueue>, job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            queue: Some(queue),
        }
    }

    /// Reporter that drops every report
    pub fn detached(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            queue: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn report(&self, pct: i64) {
        let Some(queue) = &self.queue else {
            return;
        };
        if let Err(e) = queue.update_progress(&self.job_id, pct).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to record job progress");
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("attached", &self.queue.is_some())
            .finish()
    }
}

/// Work for one job type
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        payload: serde_json::Value,
        progress: ProgressReporter,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn handle(
        &self,
        payload: serde_json::Value,
        progress: ProgressReporter,
    ) -> anyhow::Result<serde_json::Value> {
        (self.0)(payload, progress).await
    }
}

/// The worker-facing side: execute a claimed job.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        job: &JobRecord,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, ProcessorError>;
}

/// Registry of handlers keyed by job type
#[derive(Default)]
pub struct ProcessorRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the type.
    pub fn register<H: JobHandler + 'static>(&self, job_type: &str, handler: H) {
        self.handlers
            .write()
            .expect("Processor registry RwLock poisoned")
            .insert(job_type.to_string(), Arc::new(handler));
    }

    /// Register an async closure over the raw JSON payload.
    pub fn register_fn<F, Fut>(&self, job_type: &str, f: F)
    where
        F: Fn(serde_json::Value, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.register(job_type, FnHandler(f));
    }

    /// Register a handler over a typed payload. Payloads that do not
    /// deserialize into `P` fail the attempt like any handler error.
    pub fn register_typed<P, F, Fut>(&self, job_type: &str, f: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.register(
            job_type,
            TypedHandler {
                f,
                job_type: job_type.to_string(),
                _payload: PhantomData::<fn() -> P>,
            },
        );
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers
            .read()
            .expect("Processor registry RwLock poisoned")
            .contains_key(job_type)
    }

    /// Registered type tags, sorted
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .expect("Processor registry RwLock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[async_trait]
impl Processor for ProcessorRegistry {
    async fn process(
        &self,
        job: &JobRecord,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, ProcessorError> {
        let handler = self
            .handlers
            .read()
            .expect("Processor registry RwLock poisoned")
            .get(&job.job_type)
            .cloned()
            .ok_or_else(|| ProcessorError::UnknownJobType(job.job_type.clone()))?;

        match handler.handle(job.payload.clone(), progress).await {
            Ok(value) => Ok(value),
            Err(e) => match e.downcast::<ProcessorError>() {
                Ok(inner) => Err(inner),
                Err(e) => Err(ProcessorError::Handler(e)),
            },
        }
    }
}

struct TypedHandler<P, F> {
    f: F,
    job_type: String,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn handle(
        &self,
        payload: serde_json::Value,
        progress: ProgressReporter,
    ) -> anyhow::Result<serde_json::Value> {
        let typed: P = serde_json::from_value(payload).map_err(|source| {
            ProcessorError::InvalidPayload {
                job_type: self.job_type.clone(),
                source,
            }
        })?;
        (self.f)(typed, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    fn job(job_type: &str, payload: serde_json::Value) -> JobRecord {
        JobRecord::new(job_type, payload, &JobOptions::new(), Utc::now())
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Numbers {
        phone_numbers: Vec<String>,
    }

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let registry = ProcessorRegistry::new();
        registry.register_fn("echo", |payload, _progress| async move { Ok(payload) });
        registry.register_fn("double", |payload, _progress| async move {
            let n = payload["n"].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });

        let job = job("double", json!({"n": 21}));
        let out = registry
            .process(&job, ProgressReporter::detached(job.id.clone()))
            .await
            .unwrap();
        assert_eq!(out, json!(42));
        assert_eq!(registry.job_types(), vec!["double", "echo"]);
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let registry = ProcessorRegistry::new();
        let job = job("process_erp_customers", json!({}));
        let err = registry
            .process(&job, ProgressReporter::detached(job.id.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::UnknownJobType(ref t) if t == "process_erp_customers"));
        assert_eq!(err.to_string(), "Unknown job type: process_erp_customers");
    }

    #[tokio::test]
    async fn test_handler_error_keeps_context() {
        let registry = ProcessorRegistry::new();
        registry.register_fn("flaky", |_payload, _progress| async move {
            Err(anyhow::anyhow!("connection reset").context("ERP request failed"))
        });

        let job = job("flaky", json!({}));
        let err = registry
            .process(&job, ProgressReporter::detached(job.id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "ERP request failed: connection reset");
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let registry = ProcessorRegistry::new();
        registry.register_typed("count", |payload: Numbers, _progress| async move {
            Ok(json!(payload.phone_numbers.len()))
        });

        let ok = job("count", json!({"phoneNumbers": ["+1", "+2"]}));
        assert_eq!(
            registry
                .process(&ok, ProgressReporter::detached(ok.id.clone()))
                .await
                .unwrap(),
            json!(2)
        );

        let bad = job("count", json!({"phoneNumbers": 7}));
        let err = registry
            .process(&bad, ProgressReporter::detached(bad.id.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidPayload { .. }));
    }
}
