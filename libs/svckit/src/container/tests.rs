use super::*;
use crate::service::{Service, ServiceInstance};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/* --------------------------- Test helpers ------------------------- */

#[derive(Clone, Default)]
struct Probe {
    started: Arc<AtomicUsize>,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for Probe {
    async fn start(&self) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl Service for Failing {
    async fn start(&self) -> anyhow::Result<()> {
        anyhow::bail!("port already bound")
    }
}

struct Hanging;

#[async_trait]
impl Service for Hanging {
    async fn start(&self) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn n(s: &str) -> ServiceName {
    ServiceName::parse(s).unwrap()
}

async fn settle(container: &ServiceContainer, name: &ServiceName) -> Option<ServiceState> {
    for _ in 0..100 {
        match container.state(name) {
            Some(s) if s.is_settled() => return Some(s),
            None => return None,
            _ => tokio::task::yield_now().await,
        }
    }
    container.state(name)
}

/* ------------------------------- Tests ---------------------------- */

#[tokio::test]
async fn starts_in_dependency_order() {
    let container = ServiceContainer::new();
    let target = container.target();
    let probe = Probe::default();

    // dependent first: it must wait until its dependency is UP
    target
        .add(ServiceDescriptor::of_value(n("app"), probe.clone()).requires(n("executor")))
        .unwrap();
    assert_eq!(container.state(&n("app")), Some(ServiceState::Down));

    target
        .add(ServiceDescriptor::of_value(n("executor"), probe.clone()))
        .unwrap();

    assert_eq!(settle(&container, &n("app")).await, Some(ServiceState::Up));
    assert_eq!(container.state(&n("executor")), Some(ServiceState::Up));
    assert_eq!(probe.started.load(Ordering::SeqCst), 2);
    assert_eq!(
        container.dependents(&n("executor")).into_iter().collect::<Vec<_>>(),
        vec![n("app")]
    );
}

#[tokio::test]
async fn factory_receives_typed_dependencies() {
    let container = ServiceContainer::new();
    let target = container.target();
    let probe = Probe::default();
    target
        .add(ServiceDescriptor::of_value(n("executor"), probe.clone()))
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_factory = seen.clone();
    target
        .add(
            ServiceDescriptor::from_fn(n("handler"), move |deps| {
                let executor = deps.get::<Probe>(&n("executor"))?;
                seen_in_factory.store(executor.started.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(ServiceInstance::new(Probe::default()))
            })
            .requires(n("executor")),
        )
        .unwrap();

    assert_eq!(settle(&container, &n("handler")).await, Some(ServiceState::Up));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(container.value::<Probe>(&n("executor")).is_some());
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let container = ServiceContainer::new();
    let target = container.target();
    target
        .add(ServiceDescriptor::of_value(n("a"), Probe::default()))
        .unwrap();
    let err = target
        .add(ServiceDescriptor::of_value(n("a"), Probe::default()))
        .unwrap_err();
    assert_eq!(err, ContainerError::DuplicateService(n("a")));
    assert_eq!(target.added(), vec![n("a")]);
}

#[tokio::test]
async fn cycle_is_rejected_on_install() {
    let container = ServiceContainer::new();
    let target = container.target();
    target
        .add(ServiceDescriptor::of_value(n("a"), Probe::default()).requires(n("b")))
        .unwrap();
    let err = target
        .add(ServiceDescriptor::of_value(n("b"), Probe::default()).requires(n("a")))
        .unwrap_err();
    match err {
        ContainerError::CycleDetected { path } => {
            assert_eq!(path, vec![n("b"), n("a"), n("b")]);
            let msg = ContainerError::CycleDetected { path }.to_string();
            assert!(msg.contains("b -> a -> b"));
        }
        other => panic!("expected CycleDetected, got: {other:?}"),
    }
    assert!(!container.contains(&n("b")));
}

#[tokio::test]
async fn failed_start_is_reported_and_blocks_dependents() {
    let container = ServiceContainer::new();
    let target = container.target();
    target
        .add(ServiceDescriptor::of_value(n("b"), Probe::default()).requires(n("a")))
        .unwrap();
    target
        .add(ServiceDescriptor::from_fn(n("a"), |_| Ok(ServiceInstance::new(Failing))))
        .unwrap();

    assert_eq!(settle(&container, &n("a")).await, Some(ServiceState::Failed));
    let status = container.status(&n("a")).unwrap();
    assert_eq!(status.failure.as_deref(), Some("port already bound"));
    assert_eq!(container.state(&n("b")), Some(ServiceState::Down));
}

#[tokio::test]
async fn factory_error_marks_failed() {
    let container = ServiceContainer::new();
    container
        .target()
        .add(ServiceDescriptor::from_fn(n("a"), |_| {
            Err(anyhow::anyhow!("bad wiring"))
        }))
        .unwrap();
    assert_eq!(settle(&container, &n("a")).await, Some(ServiceState::Failed));
}

#[tokio::test]
async fn remove_refuses_when_dependents_remain() {
    let container = ServiceContainer::new();
    let target = container.target();
    target
        .add(ServiceDescriptor::of_value(n("a"), Probe::default()))
        .unwrap();
    target
        .add(ServiceDescriptor::of_value(n("b"), Probe::default()).requires(n("a")))
        .unwrap();

    let err = container.remove(&n("a")).await.unwrap_err();
    assert_eq!(
        err,
        ContainerError::HasDependents {
            service: n("a"),
            dependents: vec![n("b")],
        }
    );
    assert!(container.contains(&n("a")));

    assert_eq!(
        container.remove(&n("missing")).await.unwrap_err(),
        ContainerError::NotInstalled(n("missing"))
    );
}

#[tokio::test]
async fn remove_all_stops_dependents_first_and_is_idempotent() {
    let container = ServiceContainer::new();
    let target = container.target();
    let probe = Probe::default();
    target
        .add(ServiceDescriptor::of_value(n("a"), probe.clone()))
        .unwrap();
    target
        .add(ServiceDescriptor::of_value(n("b"), probe.clone()).requires(n("a")))
        .unwrap();
    settle(&container, &n("b")).await;

    let removed = container.remove_all(&[n("a"), n("b")]).await.unwrap();
    let order: Vec<_> = removed.into_iter().map(|d| d.name).collect();
    assert_eq!(order, vec![n("b"), n("a")]);
    assert_eq!(probe.stopped.load(Ordering::SeqCst), 2);
    assert!(container.snapshot().is_empty());

    // second pass is a no-op
    assert!(container.remove_all(&[n("a"), n("b")]).await.unwrap().is_empty());
}

#[tokio::test]
async fn discard_detaches_idle_dependents_only() {
    let container = ServiceContainer::new();
    let target = container.target();
    let waiter = Probe::default();
    target
        .add(ServiceDescriptor::of_value(n("waiter"), waiter.clone()).requires(n("extra")))
        .unwrap();
    target
        .add(ServiceDescriptor::from_fn(n("extra"), |_| Ok(ServiceInstance::new(Failing))))
        .unwrap();
    assert_eq!(settle(&container, &n("extra")).await, Some(ServiceState::Failed));
    assert_eq!(container.state(&n("waiter")), Some(ServiceState::Down));

    // strict removal still refuses
    assert!(matches!(
        container.remove_all(&[n("extra")]).await,
        Err(ContainerError::HasDependents { .. })
    ));

    let removed = container.discard_all(&[n("extra")]).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(!container.contains(&n("extra")));
    assert_eq!(container.state(&n("waiter")), Some(ServiceState::Down));

    // the edge comes back with the name
    target
        .add(ServiceDescriptor::of_value(n("extra"), Probe::default()))
        .unwrap();
    assert_eq!(settle(&container, &n("waiter")).await, Some(ServiceState::Up));
    assert_eq!(waiter.started.load(Ordering::SeqCst), 1);
    assert!(container.dependents(&n("extra")).contains(&n("waiter")));

    let err = container.discard_all(&[n("extra")]).await.unwrap_err();
    assert_eq!(
        err,
        ContainerError::HasDependents {
            service: n("extra"),
            dependents: vec![n("waiter")],
        }
    );
    assert!(container.contains(&n("extra")));
}

#[tokio::test]
async fn watch_channel_closes_on_removal() {
    let container = ServiceContainer::new();
    container
        .target()
        .add(ServiceDescriptor::from_fn(n("slow"), |_| Ok(ServiceInstance::new(Hanging))))
        .unwrap();
    let mut rx = container.watch(&n("slow")).unwrap();
    assert_eq!(settle(&container, &n("slow")).await, Some(ServiceState::Starting));

    container.remove(&n("slow")).await.unwrap();
    // drain until the sender is gone
    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        while rx.changed().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok());
    assert!(!container.contains(&n("slow")));
}

#[tokio::test]
async fn slot_reuse_invalidates_old_handle() {
    let container = ServiceContainer::new();
    let target = container.target();
    let old = target
        .add(ServiceDescriptor::of_value(n("a"), Probe::default()))
        .unwrap();
    container.remove(&n("a")).await.unwrap();
    let new = target
        .add(ServiceDescriptor::of_value(n("b"), Probe::default()))
        .unwrap();

    assert_ne!(old, new);
    assert!(container.state_of(old).is_none());
    assert!(container.state_of(new).is_some());
}

#[tokio::test]
async fn shutdown_empties_the_table() {
    let container = ServiceContainer::new();
    let target = container.target();
    let probe = Probe::default();
    for (name, dep) in [("a", None), ("b", Some("a")), ("c", Some("b"))] {
        let mut desc = ServiceDescriptor::of_value(n(name), probe.clone());
        if let Some(dep) = dep {
            desc = desc.requires(n(dep));
        }
        target.add(desc).unwrap();
    }
    settle(&container, &n("c")).await;

    container.shutdown().await;
    assert!(container.names().is_empty());
    assert_eq!(probe.stopped.load(Ordering::SeqCst), 3);
}
