//! Service Container - arena of named services started in dependency order.
//!
//! Structural mutations (install/remove of a name) are serialized through one table lock.
//! Starts run as Tokio tasks, concurrently wherever the dependency graph allows: a service
//! becomes eligible once every dependency is UP.

mod graph;
mod target;

pub use target::ServiceTarget;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::service::{
    Injected, ServiceDescriptor, ServiceInstance, ServiceName, ServiceState, ServiceStatus,
};

/// Typed handle into the container table.
///
/// The generation guards against a slot being reused by a later install of another service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServiceId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("service '{0}' is already installed")]
    DuplicateService(ServiceName),
    #[error("cyclic dependency detected: {}", fmt_path(.path))]
    CycleDetected { path: Vec<ServiceName> },
    #[error("service '{0}' is not installed")]
    NotInstalled(ServiceName),
    #[error("service '{service}' still has dependents: {}", fmt_path(.dependents))]
    HasDependents {
        service: ServiceName,
        dependents: Vec<ServiceName>,
    },
}

fn fmt_path(names: &[ServiceName]) -> String {
    names
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

struct Entry {
    descriptor: ServiceDescriptor,
    state: ServiceState,
    dependents: BTreeSet<ServiceName>,
    instance: Option<ServiceInstance>,
    status_tx: watch::Sender<ServiceStatus>,
    start_cancel: CancellationToken,
}

impl Entry {
    fn name(&self) -> &ServiceName {
        &self.descriptor.name
    }

    /// Not running and not about to run.
    fn is_idle(&self) -> bool {
        !matches!(self.state, ServiceState::Up | ServiceState::Starting)
    }

    fn publish(&mut self, status: ServiceStatus) {
        self.state = status.state;
        self.status_tx.send_replace(status);
    }
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<ServiceName, ServiceId>,
}

impl Table {
    fn get(&self, name: &ServiceName) -> Option<&Entry> {
        let id = self.index.get(name)?;
        self.by_id(*id)
    }

    fn get_mut(&mut self, name: &ServiceName) -> Option<&mut Entry> {
        let id = *self.index.get(name)?;
        self.by_id_mut(id)
    }

    fn by_id(&self, id: ServiceId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn by_id_mut(&mut self, id: ServiceId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn insert(&mut self, entry: Entry) -> ServiceId {
        let name = entry.name().clone();
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = Some(entry);
                ServiceId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ServiceId {
                    index,
                    generation: 0,
                }
            }
        };
        self.index.insert(name, id);
        id
    }

    fn remove(&mut self, name: &ServiceName) -> Option<Entry> {
        let id = self.index.remove(name)?;
        let entry = self.slots.get_mut(id.index as usize)?.entry.take()?;
        self.free.push(id.index);
        for dep in &entry.descriptor.dependencies {
            if let Some(d) = self.get_mut(dep) {
                d.dependents.remove(name);
            }
        }
        Some(entry)
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(|s| s.entry.as_ref())
    }

    fn deps_of(&self, name: &ServiceName) -> Option<&BTreeSet<ServiceName>> {
        self.get(name).map(|e| &e.descriptor.dependencies)
    }
}

struct Inner {
    table: Mutex<Table>,
    runtime: Handle,
    shutdown: CancellationToken,
}

/// Runtime registry resolving and starting named, interdependent services.
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.inner.table.lock();
        let services: Vec<String> = table
            .entries()
            .map(|e| format!("{}={}", e.name(), e.state))
            .collect();
        f.debug_struct("ServiceContainer")
            .field("services", &services)
            .finish()
    }
}

impl ServiceContainer {
    /// Create a container bound to the current Tokio runtime.
    ///
    /// Panics when called outside a runtime; use [`ServiceContainer::with_runtime`] there.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                runtime,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Mutation target that records what it installs and removes.
    pub fn target(&self) -> ServiceTarget {
        ServiceTarget::new(self.clone())
    }

    /// Add one entry in state DOWN and schedule whatever became startable.
    pub(crate) fn install(&self, descriptor: ServiceDescriptor) -> Result<ServiceId, ContainerError> {
        let id = {
            let mut table = self.inner.table.lock();
            let name = descriptor.name.clone();
            if table.index.contains_key(&name) {
                return Err(ContainerError::DuplicateService(name));
            }

            let cycle = graph::find_cycle(&descriptor.name, |n| {
                if *n == descriptor.name {
                    Some(&descriptor.dependencies)
                } else {
                    table.deps_of(n)
                }
            });
            if let Some(path) = cycle {
                return Err(ContainerError::CycleDetected { path });
            }

            // Entries may already declare a dependency on a name installed later.
            let dependents: BTreeSet<ServiceName> = table
                .entries()
                .filter(|e| e.descriptor.dependencies.contains(&name))
                .map(|e| e.name().clone())
                .collect();
            for dep in &descriptor.dependencies {
                if let Some(d) = table.get_mut(dep) {
                    d.dependents.insert(name.clone());
                }
            }

            tracing::debug!(
                service = %name,
                deps = ?descriptor.dependencies.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Service installed"
            );

            let (status_tx, _) = watch::channel(ServiceStatus::new(ServiceState::Down));
            table.insert(Entry {
                descriptor,
                state: ServiceState::Down,
                dependents,
                instance: None,
                status_tx,
                start_cancel: self.inner.shutdown.child_token(),
            })
        };
        self.schedule();
        Ok(id)
    }

    /// Start every DOWN service whose dependencies are all UP.
    fn schedule(&self) {
        let mut table = self.inner.table.lock();

        let ready: Vec<ServiceName> = table
            .entries()
            .filter(|e| e.state == ServiceState::Down)
            .filter(|e| {
                e.descriptor
                    .dependencies
                    .iter()
                    .all(|d| table.get(d).is_some_and(|dep| dep.state == ServiceState::Up))
            })
            .map(|e| e.name().clone())
            .collect();

        for name in ready {
            let mut deps = Injected::default();
            let Some(entry) = table.get(&name) else {
                continue;
            };
            for d in &entry.descriptor.dependencies {
                if let Some(value) = table
                    .get(d)
                    .and_then(|e| e.instance.as_ref())
                    .map(ServiceInstance::value)
                {
                    deps.insert(d.clone(), value);
                }
            }

            let Some(&id) = table.index.get(&name) else {
                continue;
            };
            let Some(entry) = table.get_mut(&name) else {
                continue;
            };
            entry.publish(ServiceStatus::new(ServiceState::Starting));
            let factory = Arc::clone(&entry.descriptor.factory);
            let cancel = entry.start_cancel.clone();
            tracing::debug!(service = %name, "Starting service");

            let container = self.clone();
            self.inner.runtime.spawn(async move {
                let started = tokio::select! {
                    _ = cancel.cancelled() => None,
                    res = async {
                        let instance = factory.create(&deps)?;
                        instance.service().start().await?;
                        Ok::<_, anyhow::Error>(instance)
                    } => Some(res),
                };
                container.finish_start(id, name, started).await;
            });
        }
    }

    async fn finish_start(
        &self,
        id: ServiceId,
        name: ServiceName,
        started: Option<anyhow::Result<ServiceInstance>>,
    ) {
        let orphan = {
            let mut table = self.inner.table.lock();
            match table.by_id_mut(id) {
                Some(entry) if entry.state == ServiceState::Starting => match started {
                    Some(Ok(instance)) => {
                        entry.instance = Some(instance);
                        entry.publish(ServiceStatus::new(ServiceState::Up));
                        tracing::info!(service = %name, "Service is UP");
                        None
                    }
                    Some(Err(err)) => {
                        tracing::warn!(service = %name, error = %err, "Service failed to start");
                        entry.publish(ServiceStatus::failed(&err));
                        None
                    }
                    None => None,
                },
                // slot removed while starting
                _ => started.and_then(Result::ok),
            }
        };

        if let Some(instance) = orphan {
            tracing::debug!(service = %name, "Stopping instance started after removal");
            if let Err(err) = instance.service().stop().await {
                tracing::warn!(service = %name, error = %err, "Failed to stop orphaned instance");
            }
        }

        self.schedule();
    }

    /// Remove one service. Fails if it is not installed or still has dependents.
    pub async fn remove(&self, name: &ServiceName) -> Result<ServiceDescriptor, ContainerError> {
        if !self.contains(name) {
            return Err(ContainerError::NotInstalled(name.clone()));
        }
        let mut removed = self.remove_all(std::slice::from_ref(name)).await?;
        removed
            .pop()
            .ok_or_else(|| ContainerError::NotInstalled(name.clone()))
    }

    /// Remove a set of services, dependents before dependencies.
    ///
    /// Names that are not installed are skipped, so repeating a removal is harmless. Fails
    /// before touching anything when an installed dependent outside the set would be left
    /// behind. Returns the removed descriptors in removal order.
    pub async fn remove_all(
        &self,
        names: &[ServiceName],
    ) -> Result<Vec<ServiceDescriptor>, ContainerError> {
        self.remove_set(names, false).await
    }

    /// Rollback flavour of [`ServiceContainer::remove_all`].
    ///
    /// Dependents outside the set that are DOWN, FAILED or REMOVING lose their edge to the
    /// removed names and stay installed, waiting for those names to come back. Only UP or
    /// STARTING dependents refuse the removal.
    pub(crate) async fn discard_all(
        &self,
        names: &[ServiceName],
    ) -> Result<Vec<ServiceDescriptor>, ContainerError> {
        self.remove_set(names, true).await
    }

    async fn remove_set(
        &self,
        names: &[ServiceName],
        detach_idle: bool,
    ) -> Result<Vec<ServiceDescriptor>, ContainerError> {
        let order = {
            let mut table = self.inner.table.lock();
            let present: Vec<ServiceName> = names
                .iter()
                .filter(|n| table.get(n).is_some())
                .cloned()
                .collect();
            let set: BTreeSet<&ServiceName> = present.iter().collect();

            let mut detached: Vec<(ServiceName, Vec<ServiceName>)> = Vec::new();
            for n in &present {
                let Some(entry) = table.get(n) else {
                    continue;
                };
                let (idle, active): (Vec<ServiceName>, Vec<ServiceName>) = entry
                    .dependents
                    .iter()
                    .filter(|d| !set.contains(d))
                    .cloned()
                    .partition(|d| detach_idle && table.get(d).is_some_and(Entry::is_idle));
                if !active.is_empty() {
                    return Err(ContainerError::HasDependents {
                        service: n.clone(),
                        dependents: active,
                    });
                }
                if !idle.is_empty() {
                    detached.push((n.clone(), idle));
                }
            }

            for (name, idle) in detached {
                tracing::debug!(
                    service = %name,
                    dependents = ?idle.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "Detaching idle dependents"
                );
                if let Some(entry) = table.get_mut(&name) {
                    for d in &idle {
                        entry.dependents.remove(d);
                    }
                }
            }
            graph::removal_order(&present, |n| table.deps_of(n))
        };

        let mut removed = Vec::with_capacity(order.len());
        for name in order {
            if let Some(descriptor) = self.remove_one(&name).await? {
                removed.push(descriptor);
            }
        }
        Ok(removed)
    }

    async fn remove_one(
        &self,
        name: &ServiceName,
    ) -> Result<Option<ServiceDescriptor>, ContainerError> {
        let instance = {
            let mut table = self.inner.table.lock();
            let Some(entry) = table.get_mut(name) else {
                return Ok(None);
            };
            if !entry.dependents.is_empty() {
                return Err(ContainerError::HasDependents {
                    service: name.clone(),
                    dependents: entry.dependents.iter().cloned().collect(),
                });
            }
            entry.start_cancel.cancel();
            entry.publish(ServiceStatus::new(ServiceState::Removing));
            entry.instance.take()
        };

        if let Some(instance) = instance {
            if let Err(err) = instance.service().stop().await {
                tracing::warn!(service = %name, error = %err, "Failed to stop service");
            }
        }

        let entry = self.inner.table.lock().remove(name);
        tracing::debug!(service = %name, "Service removed");
        Ok(entry.map(|e| e.descriptor))
    }

    /// Stop and remove everything, dependents first.
    pub async fn shutdown(&self) {
        tracing::info!("Container shutdown");
        let names = self.names();
        if let Err(err) = self.remove_all(&names).await {
            tracing::warn!(error = %err, "Container shutdown incomplete");
        }
        self.inner.shutdown.cancel();
    }

    pub fn contains(&self, name: &ServiceName) -> bool {
        self.inner.table.lock().get(name).is_some()
    }

    pub fn state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.inner.table.lock().get(name).map(|e| e.state)
    }

    pub fn state_of(&self, id: ServiceId) -> Option<ServiceState> {
        self.inner.table.lock().by_id(id).map(|e| e.state)
    }

    pub fn status(&self, name: &ServiceName) -> Option<ServiceStatus> {
        self.inner
            .table
            .lock()
            .get(name)
            .map(|e| e.status_tx.borrow().clone())
    }

    /// Subscribe to status changes. The channel closes when the service is removed.
    pub fn watch(&self, name: &ServiceName) -> Option<watch::Receiver<ServiceStatus>> {
        self.inner
            .table
            .lock()
            .get(name)
            .map(|e| e.status_tx.subscribe())
    }

    pub fn dependents(&self, name: &ServiceName) -> BTreeSet<ServiceName> {
        self.inner
            .table
            .lock()
            .get(name)
            .map(|e| e.dependents.clone())
            .unwrap_or_default()
    }

    /// Typed value of a running service.
    pub fn value<T: Send + Sync + 'static>(&self, name: &ServiceName) -> Option<Arc<T>> {
        let table = self.inner.table.lock();
        let instance = table.get(name)?.instance.as_ref()?;
        instance.value().downcast::<T>().ok()
    }

    /// Installed names, sorted.
    pub fn names(&self) -> Vec<ServiceName> {
        let table = self.inner.table.lock();
        let mut names: Vec<ServiceName> = table.entries().map(|e| e.name().clone()).collect();
        names.sort();
        names
    }

    /// Name → state view of the whole table.
    pub fn snapshot(&self) -> BTreeMap<ServiceName, ServiceState> {
        self.inner
            .table
            .lock()
            .entries()
            .map(|e| (e.name().clone(), e.state))
            .collect()
    }

    /// Order `names` dependents-first using the installed dependency edges.
    pub fn removal_order(&self, names: &[ServiceName]) -> Vec<ServiceName> {
        let table = self.inner.table.lock();
        graph::removal_order(names, |n| table.deps_of(n))
    }

    /// Runtime that runs service starts and verifications.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }
}

#[cfg(test)]
mod tests;
