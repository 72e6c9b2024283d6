use std::sync::Arc;

use async_trait::async_trait;
use svckit::operation::{
    add_verify_installation_step, AddStep, AddStepHandler, OperationStepHandler, RuntimeContext,
    ADD, REMOVE,
};
use svckit::{
    ModelController, ModelNode, Operation, OperationError, PathAddress, PathElement, ProcessInfo,
    ProcessType, RunningMode, ServiceName,
};

use crate::channel::{
    install_management_channel_services, ChannelNames, ChannelRegistryService,
    OperationHandlerFactory,
};
use crate::config::NativeRemotingConfig;
use crate::services::HostServiceNames;

pub const RESOURCE_TYPE: &str = "management-interface";

/// `/core-service=management/management-interface=<interface>`
pub fn interface_address(interface: &str) -> PathAddress {
    PathAddress::new([
        PathElement::new("core-service", "management"),
        PathElement::new(RESOURCE_TYPE, interface),
    ])
}

/// Runtime work is skipped only for an embedded server booted admin-only.
fn interface_requires_runtime(process: &ProcessInfo) -> bool {
    process.process_type != ProcessType::EmbeddedServer
        || process.running_mode != RunningMode::AdminOnly
}

/// Adds the native remoting management interface: a channel registry on the endpoint plus
/// the management channel and its operation handler.
pub struct NativeRemotingAddHandler {
    endpoint: ServiceName,
    channel: String,
    host: HostServiceNames,
    factory: Arc<dyn OperationHandlerFactory>,
}

impl NativeRemotingAddHandler {
    pub fn new(
        endpoint: ServiceName,
        channel: impl Into<String>,
        host: HostServiceNames,
        factory: Arc<dyn OperationHandlerFactory>,
    ) -> Self {
        Self {
            endpoint,
            channel: channel.into(),
            host,
            factory,
        }
    }
}

#[async_trait]
impl AddStepHandler for NativeRemotingAddHandler {
    fn populate_model(
        &self,
        _op: &Operation,
        resource: &mut ModelNode,
    ) -> Result<(), OperationError> {
        resource.set_empty_object();
        Ok(())
    }

    fn requires_runtime(&self, process: &ProcessInfo) -> bool {
        interface_requires_runtime(process)
    }

    async fn perform_runtime(
        &self,
        ctx: &RuntimeContext,
        op: &Operation,
        _resource: &ModelNode,
    ) -> Result<(), OperationError> {
        let target = ctx.service_target();
        ChannelRegistryService::install(target, &self.endpoint)?;
        let watched = install_management_channel_services(
            target,
            &self.endpoint,
            Arc::clone(&self.factory),
            &self.host.controller,
            &self.channel,
            &self.host.executor,
            &self.host.scheduled_executor,
        )
        .await?;
        tracing::debug!(address = %op.address, endpoint = %self.endpoint, "Native interface services installed");
        add_verify_installation_step(ctx, watched);
        Ok(())
    }
}

/// Removes the interface resource and, at runtime, its channel services.
pub struct NativeRemotingRemoveHandler {
    names: ChannelNames,
}

impl NativeRemotingRemoveHandler {
    pub fn new(names: ChannelNames) -> Self {
        Self { names }
    }
}

#[async_trait]
impl OperationStepHandler for NativeRemotingRemoveHandler {
    fn execute_model(&self, op: &Operation, root: &mut ModelNode) -> Result<(), OperationError> {
        let missing = || OperationError::validation(format!("resource {} not found", op.address));
        if !root.navigate(&op.address).is_some_and(ModelNode::is_defined) {
            return Err(missing());
        }
        let (Some(parent), Some(last)) = (op.address.parent(), op.address.last()) else {
            return Err(missing());
        };
        root.navigate_mut(&parent)
            .and_then(|node| node.remove_child(last))
            .map(drop)
            .ok_or_else(missing)
    }

    fn requires_runtime(&self, process: &ProcessInfo) -> bool {
        interface_requires_runtime(process)
    }

    async fn execute_runtime(
        &self,
        ctx: &RuntimeContext,
        _op: &Operation,
        _resource: &ModelNode,
    ) -> Result<(), OperationError> {
        ctx.service_target().remove(&self.names.installed()).await?;
        Ok(())
    }
}

/// Register the add/remove handlers for the configured interface; returns its address.
pub fn register(
    controller: &ModelController,
    config: &NativeRemotingConfig,
    host: &HostServiceNames,
    factory: Arc<dyn OperationHandlerFactory>,
) -> anyhow::Result<PathAddress> {
    let endpoint = config.endpoint_name()?;
    let names = ChannelNames::new(&endpoint, &config.channel)?;

    controller.register_handler(
        RESOURCE_TYPE,
        ADD,
        AddStep(NativeRemotingAddHandler::new(
            endpoint,
            config.channel.clone(),
            host.clone(),
            factory,
        )),
    );
    controller.register_handler(RESOURCE_TYPE, REMOVE, NativeRemotingRemoveHandler::new(names));

    let address = interface_address(&config.interface);
    tracing::info!(%address, "Native remoting handlers registered");
    Ok(address)
}
