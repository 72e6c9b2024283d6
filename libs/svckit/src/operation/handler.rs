use async_trait::async_trait;

use super::{Operation, OperationError, RuntimeContext};
use crate::model::ModelNode;
use crate::process::ProcessInfo;

/// One step of an operation transaction as the context drives it.
///
/// `execute_model` runs under the model write lock and must not block. `execute_runtime`
/// runs only when `requires_runtime` holds for the current process.
#[async_trait]
pub trait OperationStepHandler: Send + Sync + 'static {
    /// Apply the change to the model. `root` is the whole tree; only the subtree at
    /// `op.address` is recorded for undo.
    fn execute_model(&self, op: &Operation, root: &mut ModelNode) -> Result<(), OperationError>;

    fn requires_runtime(&self, process: &ProcessInfo) -> bool {
        process.default_requires_runtime()
    }

    /// `resource` is the addressed node after the MODEL phase (empty if it was removed).
    async fn execute_runtime(
        &self,
        _ctx: &RuntimeContext,
        _op: &Operation,
        _resource: &ModelNode,
    ) -> Result<(), OperationError> {
        Ok(())
    }
}

/// Handler for operations that create a resource and materialize it as services.
#[async_trait]
pub trait AddStepHandler: Send + Sync + 'static {
    /// Write the new resource's attributes. The node already exists and is defined.
    fn populate_model(&self, op: &Operation, resource: &mut ModelNode)
        -> Result<(), OperationError>;

    fn requires_runtime(&self, process: &ProcessInfo) -> bool {
        process.default_requires_runtime()
    }

    /// Install services through `ctx.service_target()` and register what must reach UP.
    async fn perform_runtime(
        &self,
        ctx: &RuntimeContext,
        op: &Operation,
        resource: &ModelNode,
    ) -> Result<(), OperationError>;
}

/// Adapts an [`AddStepHandler`] to the step contract: refuses existing resources and
/// creates the node before populating it.
pub struct AddStep<H>(pub H);

#[async_trait]
impl<H: AddStepHandler> OperationStepHandler for AddStep<H> {
    fn execute_model(&self, op: &Operation, root: &mut ModelNode) -> Result<(), OperationError> {
        if op.address.is_root() {
            return Err(OperationError::validation("cannot add the root resource"));
        }
        if root.navigate(&op.address).is_some_and(ModelNode::is_defined) {
            return Err(OperationError::validation(format!(
                "resource {} already exists",
                op.address
            )));
        }

        let resource = op
            .address
            .elements()
            .iter()
            .fold(root, |node, e| node.get_or_create_child(e));
        resource.set_empty_object();
        self.0.populate_model(op, resource)
    }

    fn requires_runtime(&self, process: &ProcessInfo) -> bool {
        self.0.requires_runtime(process)
    }

    async fn execute_runtime(
        &self,
        ctx: &RuntimeContext,
        op: &Operation,
        resource: &ModelNode,
    ) -> Result<(), OperationError> {
        self.0.perform_runtime(ctx, op, resource).await
    }
}
