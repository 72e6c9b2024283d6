use std::sync::Arc;

use parking_lot::Mutex;

use super::{ContainerError, ServiceContainer, ServiceId};
use crate::service::{ServiceDescriptor, ServiceName};

#[derive(Default)]
struct Journal {
    added: Vec<ServiceName>,
    removed: Vec<ServiceDescriptor>,
}

/// Mutation handle over the container that journals its own changes.
///
/// The operation context hands one target to each step; on rollback it removes what the
/// target added and reinstalls what the target removed.
#[derive(Clone)]
pub struct ServiceTarget {
    container: ServiceContainer,
    journal: Arc<Mutex<Journal>>,
}

impl ServiceTarget {
    pub(crate) fn new(container: ServiceContainer) -> Self {
        Self {
            container,
            journal: Arc::new(Mutex::new(Journal::default())),
        }
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    pub fn add(&self, descriptor: ServiceDescriptor) -> Result<ServiceId, ContainerError> {
        let name = descriptor.name.clone();
        let id = self.container.install(descriptor)?;
        self.journal.lock().added.push(name);
        Ok(id)
    }

    /// Remove services (dependents first) and remember their descriptors.
    pub async fn remove(&self, names: &[ServiceName]) -> Result<(), ContainerError> {
        let removed = self.container.remove_all(names).await?;
        let mut journal = self.journal.lock();
        for descriptor in removed {
            // removing something this target added just cancels the addition
            let before = journal.added.len();
            journal.added.retain(|n| *n != descriptor.name);
            if journal.added.len() == before {
                journal.removed.push(descriptor);
            }
        }
        Ok(())
    }

    /// Names added through this target, in install order.
    pub fn added(&self) -> Vec<ServiceName> {
        self.journal.lock().added.clone()
    }

    /// Position to pass to [`ServiceTarget::undo_since`].
    pub fn mark(&self) -> usize {
        self.journal.lock().added.len()
    }

    /// Remove every service added after `mark`, dependents first. Idle dependents installed
    /// elsewhere are detached rather than blocking the undo.
    pub async fn undo_since(&self, mark: usize) -> Result<(), ContainerError> {
        let names: Vec<ServiceName> = {
            let journal = self.journal.lock();
            journal.added.get(mark..).map(<[_]>::to_vec).unwrap_or_default()
        };
        if names.is_empty() {
            return Ok(());
        }
        self.container.discard_all(&names).await?;
        self.journal.lock().added.truncate(mark);
        Ok(())
    }

    /// Take the whole journal: additions in install order, removals in removal order.
    pub(crate) fn drain(&self) -> (Vec<ServiceName>, Vec<ServiceDescriptor>) {
        let mut journal = self.journal.lock();
        (
            std::mem::take(&mut journal.added),
            std::mem::take(&mut journal.removed),
        )
    }
}
