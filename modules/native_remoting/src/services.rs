//! Host services the management channel depends on.
//!
//! These are thin on purpose: they hold what they were given and log their lifecycle.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use svckit::operation::await_installation;
use svckit::{
    ContainerError, ModelController, OperationError, Service, ServiceContainer, ServiceDescriptor,
    ServiceInstance, ServiceName, ServiceTarget,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const EXECUTOR: &str = "server/executor";
pub const SCHEDULED_EXECUTOR: &str = "server/scheduled-executor";
pub const CONTROLLER: &str = "server/controller";

/// Well-known names of the host services.
#[derive(Clone, Debug)]
pub struct HostServiceNames {
    pub executor: ServiceName,
    pub scheduled_executor: ServiceName,
    pub controller: ServiceName,
}

impl HostServiceNames {
    pub fn standard() -> anyhow::Result<Self> {
        Ok(Self {
            executor: ServiceName::parse(EXECUTOR)?,
            scheduled_executor: ServiceName::parse(SCHEDULED_EXECUTOR)?,
            controller: ServiceName::parse(CONTROLLER)?,
        })
    }
}

/// Runs management work off the caller's task.
pub struct ExecutorService {
    handle: Handle,
}

impl ExecutorService {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(task)
    }
}

#[async_trait]
impl Service for ExecutorService {
    async fn start(&self) -> anyhow::Result<()> {
        tracing::debug!("Executor started");
        Ok(())
    }
}

/// Runs delayed management work (timeouts, heartbeats).
pub struct ScheduledExecutorService {
    handle: Handle,
}

impl ScheduledExecutorService {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn schedule<F>(&self, delay: Duration, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await
        })
    }
}

#[async_trait]
impl Service for ScheduledExecutorService {
    async fn start(&self) -> anyhow::Result<()> {
        tracing::debug!("Scheduled executor started");
        Ok(())
    }
}

/// Exposes the model controller to channel handlers.
pub struct ControllerService {
    controller: ModelController,
}

impl ControllerService {
    pub fn new(controller: ModelController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &ModelController {
        &self.controller
    }
}

#[async_trait]
impl Service for ControllerService {
    async fn start(&self) -> anyhow::Result<()> {
        tracing::debug!(process = ?self.controller.process(), "Controller started");
        Ok(())
    }
}

/// The transport endpoint channels are opened on.
pub struct RemotingEndpointService {
    name: ServiceName,
}

impl RemotingEndpointService {
    pub fn name(&self) -> &ServiceName {
        &self.name
    }
}

#[async_trait]
impl Service for RemotingEndpointService {
    async fn start(&self) -> anyhow::Result<()> {
        tracing::info!(endpoint = %self.name, "Remoting endpoint started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!(endpoint = %self.name, "Remoting endpoint stopped");
        Ok(())
    }
}

/// Install executor, scheduled executor, controller and the remoting endpoint.
///
/// Returns the installed names; callers usually wait for them before accepting operations.
pub fn install_host_services(
    target: &ServiceTarget,
    names: &HostServiceNames,
    controller: ModelController,
    endpoint: &ServiceName,
) -> Result<Vec<ServiceName>, ContainerError> {
    let handle = target.container().runtime().clone();

    let executor_handle = handle.clone();
    target.add(ServiceDescriptor::from_fn(names.executor.clone(), move |_| {
        Ok(ServiceInstance::new(ExecutorService::new(executor_handle.clone())))
    }))?;

    let scheduled_handle = handle;
    target.add(ServiceDescriptor::from_fn(
        names.scheduled_executor.clone(),
        move |_| {
            Ok(ServiceInstance::new(ScheduledExecutorService::new(
                scheduled_handle.clone(),
            )))
        },
    ))?;

    target.add(ServiceDescriptor::from_fn(names.controller.clone(), move |_| {
        Ok(ServiceInstance::new(ControllerService::new(controller.clone())))
    }))?;

    let endpoint_name = endpoint.clone();
    target.add(ServiceDescriptor::from_fn(endpoint.clone(), move |_| {
        Ok(ServiceInstance::new(RemotingEndpointService {
            name: endpoint_name.clone(),
        }))
    }))?;

    Ok(vec![
        names.executor.clone(),
        names.scheduled_executor.clone(),
        names.controller.clone(),
        endpoint.clone(),
    ])
}

/// Install the host services outside any operation and wait until they are UP.
pub async fn start_host_services(
    container: &ServiceContainer,
    names: &HostServiceNames,
    controller: ModelController,
    endpoint: &ServiceName,
    timeout: Duration,
) -> Result<Vec<ServiceName>, OperationError> {
    tracing::info!("Phase: host services");
    let installed = install_host_services(&container.target(), names, controller, endpoint)?;
    let watched = installed.iter().cloned().collect();
    await_installation(container, &watched, timeout, &CancellationToken::new()).await?;
    tracing::info!(count = installed.len(), "Host services UP");
    Ok(installed)
}

/// Spawn on the executor and wait for the result.
pub async fn run_on<F, T>(executor: &ExecutorService, task: F) -> anyhow::Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    executor.spawn(task).await.context("executor task panicked")
}
