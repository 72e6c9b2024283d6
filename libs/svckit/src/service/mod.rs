//! Service contracts: what the container runs and how instances are produced.

mod name;

pub use name::{ServiceName, ServiceNameError};

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// A runnable unit managed by the container.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Bring the service up. The container marks it UP once this returns `Ok`.
    async fn start(&self) -> anyhow::Result<()>;

    /// Called on removal and container shutdown. Errors are logged, never propagated.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A started (or about to be started) service together with its injectable value.
///
/// The same allocation is viewed both as a [`Service`] (for lifecycle calls) and as
/// `dyn Any` (so dependents can receive it with its concrete type).
#[derive(Clone)]
pub struct ServiceInstance {
    service: Arc<dyn Service>,
    value: Arc<dyn Any + Send + Sync>,
}

impl ServiceInstance {
    pub fn new<S: Service>(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    pub fn from_arc<S: Service>(service: Arc<S>) -> Self {
        Self {
            service: service.clone(),
            value: service,
        }
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn value(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.value)
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance").finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("dependency '{0}' was not declared or is not running")]
    Missing(ServiceName),
    #[error("dependency '{name}' is not a {expected}")]
    TypeMismatch {
        name: ServiceName,
        expected: &'static str,
    },
}

/// Resolved dependency values handed to a [`ServiceFactory`].
#[derive(Default)]
pub struct Injected {
    values: HashMap<ServiceName, Arc<dyn Any + Send + Sync>>,
}

impl Injected {
    pub(crate) fn insert(&mut self, name: ServiceName, value: Arc<dyn Any + Send + Sync>) {
        self.values.insert(name, value);
    }

    /// Typed access to a declared dependency.
    pub fn get<T: Send + Sync + 'static>(&self, name: &ServiceName) -> Result<Arc<T>, InjectionError> {
        let value = self
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| InjectionError::Missing(name.clone()))?;
        value
            .downcast::<T>()
            .map_err(|_| InjectionError::TypeMismatch {
                name: name.clone(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Strategy producing a service instance from its injected dependencies.
pub trait ServiceFactory: Send + Sync + 'static {
    fn create(&self, deps: &Injected) -> anyhow::Result<ServiceInstance>;
}

impl<F> ServiceFactory for F
where
    F: Fn(&Injected) -> anyhow::Result<ServiceInstance> + Send + Sync + 'static,
{
    fn create(&self, deps: &Injected) -> anyhow::Result<ServiceInstance> {
        self(deps)
    }
}

/// Recipe for one container entry.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    pub dependencies: BTreeSet<ServiceName>,
    pub factory: Arc<dyn ServiceFactory>,
}

impl ServiceDescriptor {
    pub fn new(name: ServiceName, factory: impl ServiceFactory) -> Self {
        Self {
            name,
            dependencies: BTreeSet::new(),
            factory: Arc::new(factory),
        }
    }

    /// Descriptor whose factory is a closure over the injected dependencies.
    pub fn from_fn<F>(name: ServiceName, factory: F) -> Self
    where
        F: Fn(&Injected) -> anyhow::Result<ServiceInstance> + Send + Sync + 'static,
    {
        Self::new(name, factory)
    }

    /// Descriptor for a service that needs no injection.
    pub fn of_value<S: Service + Clone>(name: ServiceName, service: S) -> Self {
        Self::from_fn(name, move |_| Ok(ServiceInstance::new(service.clone())))
    }

    pub fn requires(mut self, dependency: ServiceName) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn requires_all(mut self, dependencies: impl IntoIterator<Item = ServiceName>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Lifecycle state of a container entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Down,
    Starting,
    Up,
    Failed,
    Removing,
}

impl ServiceState {
    /// Down and Starting are the only states a watcher keeps waiting on.
    pub fn is_settled(self) -> bool {
        !matches!(self, ServiceState::Down | ServiceState::Starting)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Down => "DOWN",
            ServiceState::Starting => "STARTING",
            ServiceState::Up => "UP",
            ServiceState::Failed => "FAILED",
            ServiceState::Removing => "REMOVING",
        };
        f.write_str(s)
    }
}

/// Published state of an entry; `failure` is set only in [`ServiceState::Failed`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub failure: Option<Arc<str>>,
}

impl ServiceStatus {
    pub(crate) fn new(state: ServiceState) -> Self {
        Self {
            state,
            failure: None,
        }
    }

    pub(crate) fn failed(cause: &anyhow::Error) -> Self {
        Self {
            state: ServiceState::Failed,
            failure: Some(format!("{cause:#}").into()),
        }
    }
}
