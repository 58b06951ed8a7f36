//! Job dispatch registry.
//!
//! The engine persists a [`JobDetails`] descriptor, not code. At execution
//! time the descriptor is resolved against this registry, which maps handler
//! type names to [`JobHandler`] implementations. A descriptor naming an
//! unregistered handler or an unsupported method fails terminally: it cannot
//! succeed on replay, so the retry filter leaves it alone.

use crate::jobs::{JobDetails, JobParameter, DEFAULT_METHOD};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Failure kind recorded when no handler is registered under the descriptor's
/// class name.
pub const ERROR_KIND_HANDLER_NOT_FOUND: &str = "JobHandlerNotFound";
/// Failure kind recorded when the handler does not support the descriptor's
/// method name.
pub const ERROR_KIND_METHOD_NOT_FOUND: &str = "JobMethodNotFound";

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("no job handler registered for '{0}'")]
    HandlerNotFound(String),
    #[error("job handler '{class_name}' has no method '{method_name}'")]
    MethodNotFound {
        class_name: String,
        method_name: String,
    },
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::HandlerNotFound(_) => ERROR_KIND_HANDLER_NOT_FOUND,
            DispatchError::MethodNotFound { .. } => ERROR_KIND_METHOD_NOT_FOUND,
        }
    }
}

/// Execution context handed to a handler. Long-running handlers should poll
/// [`JobRunContext::is_cancellation_requested`] and return early when set.
pub struct JobRunContext {
    job_id: Uuid,
    method_name: String,
    params: Vec<JobParameter>,
    cancellation: CancellationToken,
}

impl JobRunContext {
    pub(crate) fn new(
        job_id: Uuid,
        method_name: String,
        params: Vec<JobParameter>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            method_name,
            params,
            cancellation,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn params(&self) -> &[JobParameter] {
        &self.params
    }

    /// Deserialize the `index`-th captured argument.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let param = self
            .params
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("job has no argument at index {index}"))?;
        serde_json::from_value(param.value.clone())
            .map_err(|e| anyhow::anyhow!("argument {index} has unexpected shape: {e}"))
    }

    /// True once the job was deleted while running; the handler should stop.
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Work executed on a blocking worker thread.
pub trait JobHandler: Send + Sync {
    fn run(&self, ctx: &JobRunContext) -> anyhow::Result<()>;

    /// Method names this handler supports; descriptors with other methods
    /// fail with [`ERROR_KIND_METHOD_NOT_FOUND`].
    fn methods(&self) -> &[&str] {
        &[DEFAULT_METHOD]
    }
}

/// Maps handler type names to implementations.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class_name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap()
            .insert(class_name.into(), handler);
    }

    pub fn resolve(&self, details: &JobDetails) -> Result<Arc<dyn JobHandler>, DispatchError> {
        let handlers = self.handlers.read().unwrap();
        let handler = handlers
            .get(&details.class_name)
            .ok_or_else(|| DispatchError::HandlerNotFound(details.class_name.clone()))?;
        if !handler.methods().contains(&details.method_name.as_str()) {
            return Err(DispatchError::MethodNotFound {
                class_name: details.class_name.clone(),
                method_name: details.method_name.clone(),
            });
        }
        Ok(Arc::clone(handler))
    }
}
