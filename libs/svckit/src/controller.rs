//! Model Controller - dispatches management operations to registered step handlers

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::container::ServiceContainer;
use crate::model::{ManagementModel, PathAddress};
use crate::operation::{
    Operation, OperationContext, OperationError, OperationFailure, OperationReport,
    OperationStepHandler, DEFAULT_VERIFICATION_TIMEOUT,
};
use crate::process::ProcessInfo;

/// Handlers are keyed by the addressed resource type and the operation name.
type HandlerKey = (String, String);

struct ControllerInner {
    model: ManagementModel,
    container: ServiceContainer,
    process: ProcessInfo,
    handlers: DashMap<HandlerKey, Arc<dyn OperationStepHandler>>,
    verification_timeout: Duration,
    // one transaction at a time
    lock: Mutex<()>,
}

/// Host-side entry point for management operations.
#[derive(Clone)]
pub struct ModelController {
    inner: Arc<ControllerInner>,
}

impl ModelController {
    pub fn new(container: ServiceContainer, process: ProcessInfo) -> Self {
        Self::with_verification_timeout(container, process, DEFAULT_VERIFICATION_TIMEOUT)
    }

    pub fn with_verification_timeout(
        container: ServiceContainer,
        process: ProcessInfo,
        verification_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                model: ManagementModel::new(),
                container,
                process,
                handlers: DashMap::new(),
                verification_timeout,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Register (or replace) the handler for `operation` on resources of `resource_type`.
    pub fn register_handler(
        &self,
        resource_type: impl Into<String>,
        operation: impl Into<String>,
        handler: impl OperationStepHandler,
    ) {
        let key = (resource_type.into(), operation.into());
        tracing::debug!(resource = %key.0, operation = %key.1, "Registered operation handler");
        self.inner.handlers.insert(key, Arc::new(handler));
    }

    fn handler_for(&self, op: &Operation) -> Option<Arc<dyn OperationStepHandler>> {
        let key = (op.resource_type()?.to_string(), op.name.clone());
        self.inner.handlers.get(&key).map(|h| Arc::clone(h.value()))
    }

    /// Run a batch of operations as one transaction.
    pub async fn execute(
        &self,
        ops: impl IntoIterator<Item = Operation>,
    ) -> Result<OperationReport, OperationFailure> {
        let _guard = self.inner.lock.lock().await;

        let mut ctx = OperationContext::new(
            self.inner.model.clone(),
            self.inner.container.clone(),
            self.inner.process,
        )
        .with_verification_timeout(self.inner.verification_timeout);

        for (idx, op) in ops.into_iter().enumerate() {
            let Some(handler) = self.handler_for(&op) else {
                return Err(OperationFailure::new(
                    Uuid::now_v7(),
                    Some(idx),
                    OperationError::HandlerNotFound {
                        operation: op.name,
                        address: op.address,
                    },
                ));
            };
            ctx.add_step(op, handler);
        }

        ctx.execute().await
    }

    pub async fn execute_one(&self, op: Operation) -> Result<OperationReport, OperationFailure> {
        self.execute([op]).await
    }

    /// JSON view of the resource at `address`.
    pub fn read_resource(&self, address: &PathAddress) -> Option<Value> {
        self.inner
            .model
            .read_resource(address)
            .map(|node| node.to_json())
    }

    pub fn model(&self) -> &ManagementModel {
        &self.inner.model
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.inner.container
    }

    pub fn process(&self) -> ProcessInfo {
        self.inner.process
    }

    pub fn verification_timeout(&self) -> Duration {
        self.inner.verification_timeout
    }
}

impl std::fmt::Debug for ModelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelController")
            .field("process", &self.inner.process)
            .field("handlers", &self.inner.handlers.len())
            .finish_non_exhaustive()
    }
}
