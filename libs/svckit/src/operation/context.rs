//! Operation Context - drives a batch of steps through MODEL, RUNTIME and VERIFYING, then
//! commits or rolls back.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::verify::{spawn_verification, VerificationRequest, DEFAULT_VERIFICATION_TIMEOUT};
use super::{Operation, OperationError, OperationFailure, OperationStepHandler, TransactionState};
use crate::container::{ContainerError, ServiceContainer, ServiceTarget};
use crate::model::{ManagementModel, ModelNode, PathAddress};
use crate::process::ProcessInfo;
use crate::service::{ServiceDescriptor, ServiceName};

struct Step {
    op: Operation,
    handler: Arc<dyn OperationStepHandler>,
}

/// Subtree state to put back at `address` on rollback.
struct UndoRecord {
    address: PathAddress,
    previous: Option<ModelNode>,
}

impl UndoRecord {
    /// Record the addressed node, or the shallowest missing ancestor so intermediate nodes
    /// created by the step disappear too.
    fn capture(root: &ModelNode, address: &PathAddress) -> Self {
        let mut node = root;
        let mut prefix = PathAddress::root();
        for element in address.elements() {
            prefix = prefix.append(element.clone());
            match node.child(element) {
                Some(child) => node = child,
                None => {
                    return Self {
                        address: prefix,
                        previous: None,
                    }
                }
            }
        }
        Self {
            address: prefix,
            previous: Some(node.clone()),
        }
    }
}

/// What a step's runtime work sees: its container target, process metadata and the
/// verification registry.
pub struct RuntimeContext {
    step: usize,
    process: ProcessInfo,
    target: ServiceTarget,
    verification_timeout: Duration,
    verifications: Mutex<Vec<VerificationRequest>>,
    cancel: CancellationToken,
}

impl RuntimeContext {
    fn new(
        step: usize,
        process: ProcessInfo,
        target: ServiceTarget,
        verification_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            step,
            process,
            target,
            verification_timeout,
            verifications: Mutex::new(Vec::new()),
            cancel,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }

    /// Journaled mutation target; everything added through it is removed on rollback.
    pub fn service_target(&self) -> &ServiceTarget {
        &self.target
    }

    pub fn container(&self) -> &ServiceContainer {
        self.target.container()
    }

    pub fn verification_timeout(&self) -> Duration {
        self.verification_timeout
    }

    /// Cancelled when the transaction gives up.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn push_verification(&self, request: VerificationRequest) {
        self.verifications.lock().push(request);
    }

    fn take_verifications(&self) -> Vec<VerificationRequest> {
        std::mem::take(&mut *self.verifications.lock())
    }
}

/// Summary of a committed transaction.
#[derive(Clone, Debug, Serialize)]
pub struct OperationReport {
    pub transaction: Uuid,
    pub steps: usize,
    pub installed: Vec<ServiceName>,
    pub removed: Vec<ServiceName>,
    pub state: TransactionState,
}

/// One operation transaction.
///
/// All MODEL work completes before any RUNTIME work starts. A failure anywhere rolls back
/// container changes (dependents first) and then model changes (reverse order), leaving the
/// model exactly as it was.
pub struct OperationContext {
    id: Uuid,
    model: ManagementModel,
    container: ServiceContainer,
    process: ProcessInfo,
    verification_timeout: Duration,
    steps: Vec<Step>,
    state: TransactionState,
    cancel: CancellationToken,
}

impl OperationContext {
    pub fn new(model: ManagementModel, container: ServiceContainer, process: ProcessInfo) -> Self {
        Self {
            id: Uuid::now_v7(),
            model,
            container,
            process,
            verification_timeout: DEFAULT_VERIFICATION_TIMEOUT,
            steps: Vec::new(),
            state: TransactionState::ModelPending,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout = timeout;
        self
    }

    pub fn add_step(&mut self, op: Operation, handler: Arc<dyn OperationStepHandler>) {
        self.steps.push(Step { op, handler });
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Run the transaction to completion.
    pub async fn execute(mut self) -> Result<OperationReport, OperationFailure> {
        tracing::info!(transaction = %self.id, steps = self.steps.len(), "Executing operation");

        let (undo, resources) = self.run_model_phase()?;

        let runtime = self.runtime_contexts();
        if let Err((step, error)) = self.run_runtime_phase(&runtime, &resources).await {
            return Err(self.roll_back(&runtime, undo, Some(step), error).await);
        }

        if let Err((step, error)) = self.run_verification_phase(&runtime).await {
            return Err(self.roll_back(&runtime, undo, Some(step), error).await);
        }

        let mut installed = Vec::new();
        let mut removed = Vec::new();
        for ctx in &runtime {
            let (added, dropped) = ctx.target.drain();
            installed.extend(added);
            removed.extend(dropped.into_iter().map(|d| d.name));
        }

        self.state = TransactionState::Committed;
        tracing::info!(
            transaction = %self.id,
            installed = installed.len(),
            removed = removed.len(),
            "Operation committed"
        );
        Ok(OperationReport {
            transaction: self.id,
            steps: self.steps.len(),
            installed,
            removed,
            state: self.state,
        })
    }

    /// MODEL phase: apply every step under one write lock. A failing step leaves the
    /// model untouched.
    #[allow(clippy::type_complexity)]
    fn run_model_phase(&mut self) -> Result<(Vec<UndoRecord>, Vec<ModelNode>), OperationFailure> {
        tracing::info!(transaction = %self.id, "Phase: model");
        self.state = TransactionState::ModelPending;

        let mut root = self.model.write();
        let mut undo: Vec<UndoRecord> = Vec::with_capacity(self.steps.len());
        let mut resources = Vec::with_capacity(self.steps.len());

        for (idx, step) in self.steps.iter().enumerate() {
            let record = UndoRecord::capture(&root, &step.op.address);
            if let Err(error) = step.handler.execute_model(&step.op, &mut root) {
                tracing::warn!(transaction = %self.id, step = idx, error = %error, "Model step failed");
                root.restore(&record.address, record.previous);
                for r in undo.into_iter().rev() {
                    root.restore(&r.address, r.previous);
                }
                self.state = TransactionState::RolledBack;
                return Err(OperationFailure::new(self.id, Some(idx), error));
            }
            tracing::debug!(transaction = %self.id, step = idx, op = %step.op.name, address = %step.op.address, "Model step applied");
            undo.push(record);
            resources.push(root.navigate(&step.op.address).cloned().unwrap_or_default());
        }

        Ok((undo, resources))
    }

    fn runtime_contexts(&self) -> Vec<RuntimeContext> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.handler.requires_runtime(&self.process))
            .map(|(idx, _)| {
                RuntimeContext::new(
                    idx,
                    self.process,
                    self.container.target(),
                    self.verification_timeout,
                    self.cancel.child_token(),
                )
            })
            .collect()
    }

    /// RUNTIME phase: every step that needs it runs concurrently.
    async fn run_runtime_phase(
        &mut self,
        runtime: &[RuntimeContext],
        resources: &[ModelNode],
    ) -> Result<(), (usize, OperationError)> {
        self.state = TransactionState::RuntimePending;
        if runtime.is_empty() {
            tracing::debug!(transaction = %self.id, "No runtime work required");
            return Ok(());
        }
        tracing::info!(transaction = %self.id, steps = runtime.len(), "Phase: runtime");

        let steps = &self.steps;
        let results = join_all(runtime.iter().map(|ctx| {
            let step = &steps[ctx.step];
            step.handler
                .execute_runtime(ctx, &step.op, &resources[ctx.step])
        }))
        .await;

        for (ctx, res) in runtime.iter().zip(results) {
            if let Err(error) = res {
                tracing::warn!(transaction = %self.id, step = ctx.step, error = %error, "Runtime step failed");
                return Err((ctx.step, error));
            }
        }
        Ok(())
    }

    /// VERIFYING phase: await every registered verification; the first failure cancels the rest.
    async fn run_verification_phase(
        &mut self,
        runtime: &[RuntimeContext],
    ) -> Result<(), (usize, OperationError)> {
        self.state = TransactionState::Verifying;
        let mut pending: FuturesUnordered<_> = runtime
            .iter()
            .flat_map(RuntimeContext::take_verifications)
            .map(|request| {
                spawn_verification(&self.container, request, self.cancel.child_token()).outcome()
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        tracing::info!(transaction = %self.id, verifications = pending.len(), "Phase: verify");

        while let Some((step, res)) = pending.next().await {
            if let Err(error) = res {
                self.cancel.cancel();
                return Err((step, error));
            }
        }
        Ok(())
    }

    async fn roll_back(
        &mut self,
        runtime: &[RuntimeContext],
        undo: Vec<UndoRecord>,
        step: Option<usize>,
        error: OperationError,
    ) -> OperationFailure {
        self.state = TransactionState::RollingBack;
        self.cancel.cancel();
        tracing::warn!(transaction = %self.id, step = ?step, error = %error, "Phase: rollback");

        let mut added: Vec<ServiceName> = Vec::new();
        let mut removed: Vec<ServiceDescriptor> = Vec::new();
        for ctx in runtime {
            let (a, r) = ctx.target.drain();
            added.extend(a);
            removed.extend(r);
        }

        let mut incomplete: Vec<ContainerError> = Vec::new();

        // one pass over the union so cross-step edges are ordered dependents-first
        if let Err(err) = self.container.discard_all(&added).await {
            tracing::error!(transaction = %self.id, error = %err, "Failed to remove installed services");
            incomplete.push(err);
        }

        // removals were journaled dependents-first; reinstall dependencies first
        for descriptor in removed.into_iter().rev() {
            let name = descriptor.name.clone();
            match self.container.install(descriptor) {
                Ok(_) => tracing::debug!(service = %name, "Service reinstalled"),
                Err(ContainerError::DuplicateService(_)) => {}
                Err(err) => {
                    tracing::error!(service = %name, error = %err, "Failed to reinstall service");
                    incomplete.push(err);
                }
            }
        }

        {
            let mut root = self.model.write();
            for record in undo.into_iter().rev() {
                root.restore(&record.address, record.previous);
            }
        }

        self.state = TransactionState::RolledBack;
        tracing::info!(
            transaction = %self.id,
            clean = incomplete.is_empty(),
            "Operation rolled back"
        );
        OperationFailure {
            rollback: incomplete,
            ..OperationFailure::new(self.id, step, error)
        }
    }
}
