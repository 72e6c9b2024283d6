//! Management channel services opened on a remoting endpoint.
//!
//! For endpoint `ep1` and channel `mgmt` the services are:
//!
//! - `ep1/management-channel-registry`: channels currently open on the endpoint
//! - `ep1/mgmt/operation-handler`: dispatches incoming requests to the controller
//! - `ep1/mgmt`: the channel itself, UP once registered
//!
//! The channel depends on the endpoint, the registry and its operation handler; the handler
//! depends on the controller and both executors.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use svckit::{
    ContainerError, Operation, OperationError, OperationReport, Service, ServiceDescriptor,
    ServiceInstance, ServiceName, ServiceNameError, ServiceTarget,
};
use thiserror::Error;

use crate::services::{ControllerService, ExecutorService, ScheduledExecutorService};

pub const CHANNEL_REGISTRY: &str = "management-channel-registry";
pub const OPERATION_HANDLER: &str = "operation-handler";

/// Name of the channel service for `channel` on `endpoint`.
pub fn channel_service_name(
    endpoint: &ServiceName,
    channel: &str,
) -> Result<ServiceName, ServiceNameError> {
    endpoint.append(channel)
}

/// Every service name involved in one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelNames {
    pub endpoint: ServiceName,
    pub registry: ServiceName,
    pub handler: ServiceName,
    pub channel: ServiceName,
    channel_name: String,
}

impl ChannelNames {
    pub fn new(endpoint: &ServiceName, channel: &str) -> Result<Self, ServiceNameError> {
        let channel_service = channel_service_name(endpoint, channel)?;
        Ok(Self {
            endpoint: endpoint.clone(),
            registry: endpoint.append(CHANNEL_REGISTRY)?,
            handler: channel_service.append(OPERATION_HANDLER)?,
            channel: channel_service,
            channel_name: channel.to_string(),
        })
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Everything the channel installs, dependents first.
    pub fn installed(&self) -> [ServiceName; 3] {
        [
            self.channel.clone(),
            self.handler.clone(),
            self.registry.clone(),
        ]
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel '{channel}' is already open on {endpoint}")]
    AlreadyRegistered {
        endpoint: ServiceName,
        channel: String,
    },
}

/// Channels currently open on one endpoint.
pub struct ChannelRegistryService {
    endpoint: ServiceName,
    channels: Mutex<BTreeSet<String>>,
}

impl ChannelRegistryService {
    pub fn new(endpoint: ServiceName) -> Self {
        Self {
            endpoint,
            channels: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn register(&self, channel: &str) -> Result<(), ChannelError> {
        if !self.channels.lock().insert(channel.to_string()) {
            return Err(ChannelError::AlreadyRegistered {
                endpoint: self.endpoint.clone(),
                channel: channel.to_string(),
            });
        }
        tracing::debug!(endpoint = %self.endpoint, channel, "Channel registered");
        Ok(())
    }

    pub fn unregister(&self, channel: &str) -> bool {
        self.channels.lock().remove(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().iter().cloned().collect()
    }

    /// Install the registry for `endpoint`; it depends on the endpoint service.
    pub fn install(
        target: &ServiceTarget,
        endpoint: &ServiceName,
    ) -> Result<ServiceName, OperationError> {
        let name = endpoint
            .append(CHANNEL_REGISTRY)
            .map_err(anyhow::Error::from)?;
        let owner = endpoint.clone();
        target.add(
            ServiceDescriptor::from_fn(name.clone(), move |_| {
                Ok(ServiceInstance::new(ChannelRegistryService::new(owner.clone())))
            })
            .requires(endpoint.clone()),
        )?;
        Ok(name)
    }
}

#[async_trait]
impl Service for ChannelRegistryService {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let open = std::mem::take(&mut *self.channels.lock());
        if !open.is_empty() {
            tracing::warn!(endpoint = %self.endpoint, ?open, "Registry stopped with open channels");
        }
        Ok(())
    }
}

/// Produces the service that answers requests arriving on a channel.
pub trait OperationHandlerFactory: Send + Sync + 'static {
    fn new_instance(
        &self,
        controller: Arc<ControllerService>,
        executor: Arc<ExecutorService>,
        scheduled_executor: Arc<ScheduledExecutorService>,
    ) -> anyhow::Result<ServiceInstance>;
}

/// Default factory: requests are executed against the local controller.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientOperationHandlerFactory;

impl OperationHandlerFactory for ClientOperationHandlerFactory {
    fn new_instance(
        &self,
        controller: Arc<ControllerService>,
        executor: Arc<ExecutorService>,
        scheduled_executor: Arc<ScheduledExecutorService>,
    ) -> anyhow::Result<ServiceInstance> {
        Ok(ServiceInstance::new(ClientOperationHandlerService {
            controller,
            executor,
            scheduled_executor,
        }))
    }
}

pub struct ClientOperationHandlerService {
    controller: Arc<ControllerService>,
    executor: Arc<ExecutorService>,
    scheduled_executor: Arc<ScheduledExecutorService>,
}

impl ClientOperationHandlerService {
    /// Run a request batch on the executor as one transaction.
    pub async fn handle(&self, ops: Vec<Operation>) -> anyhow::Result<OperationReport> {
        let controller = self.controller.controller().clone();
        let report = crate::services::run_on(&self.executor, async move {
            controller.execute(ops).await
        })
        .await??;
        Ok(report)
    }

    pub fn scheduled_executor(&self) -> &ScheduledExecutorService {
        &self.scheduled_executor
    }
}

#[async_trait]
impl Service for ClientOperationHandlerService {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The channel: registered with the endpoint's registry while UP.
pub struct ManagementChannelService {
    endpoint: ServiceName,
    channel: String,
    registry: Arc<ChannelRegistryService>,
}

#[async_trait]
impl Service for ManagementChannelService {
    async fn start(&self) -> anyhow::Result<()> {
        self.registry.register(&self.channel)?;
        tracing::info!(endpoint = %self.endpoint, channel = %self.channel, "Management channel open");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.registry.unregister(&self.channel);
        tracing::info!(endpoint = %self.endpoint, channel = %self.channel, "Management channel closed");
        Ok(())
    }
}

/// Install the operation handler and channel services for `channel` on `endpoint`.
///
/// The registry must already be installed (or installed through the same target). On failure
/// the services this call added are removed again. Returns the names to watch.
pub async fn install_management_channel_services(
    target: &ServiceTarget,
    endpoint: &ServiceName,
    factory: Arc<dyn OperationHandlerFactory>,
    controller: &ServiceName,
    channel: &str,
    executor: &ServiceName,
    scheduled_executor: &ServiceName,
) -> Result<Vec<ServiceName>, OperationError> {
    let names = ChannelNames::new(endpoint, channel).map_err(anyhow::Error::from)?;
    let mark = target.mark();
    let wired = add_handler(target, &names, factory, controller, executor, scheduled_executor)
        .and_then(|()| add_channel(target, &names));
    match wired {
        Ok(()) => Ok(vec![names.channel]),
        Err(err) => {
            if let Err(undo) = target.undo_since(mark).await {
                tracing::warn!(error = %undo, "Failed to undo partial channel installation");
            }
            Err(err.into())
        }
    }
}

fn add_handler(
    target: &ServiceTarget,
    names: &ChannelNames,
    factory: Arc<dyn OperationHandlerFactory>,
    controller: &ServiceName,
    executor: &ServiceName,
    scheduled_executor: &ServiceName,
) -> Result<(), ContainerError> {
    let deps = [
        controller.clone(),
        executor.clone(),
        scheduled_executor.clone(),
    ];
    let [c, e, s] = deps.clone();
    target.add(
        ServiceDescriptor::from_fn(names.handler.clone(), move |injected| {
            factory.new_instance(injected.get(&c)?, injected.get(&e)?, injected.get(&s)?)
        })
        .requires_all(deps),
    )?;
    Ok(())
}

fn add_channel(target: &ServiceTarget, names: &ChannelNames) -> Result<(), ContainerError> {
    let endpoint = names.endpoint.clone();
    let registry = names.registry.clone();
    let channel = names.channel_name().to_string();
    target.add(
        ServiceDescriptor::from_fn(names.channel.clone(), move |injected| {
            Ok(ServiceInstance::new(ManagementChannelService {
                endpoint: endpoint.clone(),
                channel: channel.clone(),
                registry: injected.get(&registry)?,
            }))
        })
        .requires_all([
            names.endpoint.clone(),
            names.registry.clone(),
            names.handler.clone(),
        ]),
    )?;
    Ok(())
}
