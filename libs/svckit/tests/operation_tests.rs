//! End-to-end transaction tests: MODEL + RUNTIME + verification + rollback

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use svckit::operation::{
    add_verify_installation_step, AddStep, AddStepHandler, OperationStepHandler, RuntimeContext,
};
use svckit::{
    ContainerError, FailureKind, ManagementModel, ModelNode, Operation, OperationContext,
    OperationError, PathAddress, ProcessInfo, ProcessType, RunningMode, Service,
    ServiceContainer, ServiceDescriptor, ServiceInstance, ServiceName, ServiceState,
    TransactionState,
};

// ---------- Test services ----------

#[derive(Clone, Copy)]
enum Behaviour {
    Ready,
    Fail,
    Hang,
}

#[derive(Clone)]
struct TestService {
    behaviour: Behaviour,
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for TestService {
    async fn start(&self) -> anyhow::Result<()> {
        match self.behaviour {
            Behaviour::Ready => Ok(()),
            Behaviour::Fail => anyhow::bail!("port already bound"),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn n(s: &str) -> ServiceName {
    ServiceName::parse(s).unwrap()
}

fn addr(s: &str) -> PathAddress {
    s.parse().unwrap()
}

fn descriptor(name: &str, deps: &[&str], behaviour: Behaviour) -> ServiceDescriptor {
    let service = TestService {
        behaviour,
        stopped: Arc::default(),
    };
    ServiceDescriptor::of_value(n(name), service).requires_all(deps.iter().map(|d| n(d)))
}

type Planned = (&'static str, Vec<&'static str>, Behaviour);

fn svc(name: &'static str, deps: &[&'static str], behaviour: Behaviour) -> Planned {
    (name, deps.to_vec(), behaviour)
}

/// Install services outside any transaction and wait for them to settle.
async fn preinstall(container: &ServiceContainer, services: Vec<Planned>) {
    let target = container.target();
    for (name, deps, behaviour) in &services {
        target.add(descriptor(name, deps, *behaviour)).unwrap();
    }
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

// ---------- Test handlers ----------

/// Adds a resource and installs a fixed service graph, watching `watch`.
struct InstallGraph {
    services: Vec<Planned>,
    watch: Vec<&'static str>,
}

impl InstallGraph {
    fn new(services: Vec<Planned>, watch: &[&'static str]) -> Self {
        Self {
            services,
            watch: watch.to_vec(),
        }
    }
}

#[async_trait]
impl AddStepHandler for InstallGraph {
    fn populate_model(&self, _op: &Operation, resource: &mut ModelNode) -> Result<(), OperationError> {
        resource.set_attribute("services", json!(self.services.len()));
        Ok(())
    }

    async fn perform_runtime(
        &self,
        ctx: &RuntimeContext,
        _op: &Operation,
        _resource: &ModelNode,
    ) -> Result<(), OperationError> {
        for (name, deps, behaviour) in &self.services {
            ctx.service_target().add(descriptor(name, deps, *behaviour))?;
        }
        add_verify_installation_step(ctx, self.watch.iter().map(|w| n(w)));
        Ok(())
    }
}

/// Removes a resource and the named services.
struct RemoveGraph {
    services: Vec<&'static str>,
}

#[async_trait]
impl OperationStepHandler for RemoveGraph {
    fn execute_model(&self, op: &Operation, root: &mut ModelNode) -> Result<(), OperationError> {
        let (Some(parent), Some(last)) = (op.address.parent(), op.address.last()) else {
            return Err(OperationError::validation("cannot remove the root"));
        };
        root.navigate_mut(&parent)
            .and_then(|p| p.remove_child(last))
            .map(|_| ())
            .ok_or_else(|| OperationError::validation(format!("{} not found", op.address)))
    }

    async fn execute_runtime(
        &self,
        ctx: &RuntimeContext,
        _op: &Operation,
        _resource: &ModelNode,
    ) -> Result<(), OperationError> {
        let names: Vec<_> = self.services.iter().map(|s| n(s)).collect();
        ctx.service_target().remove(&names).await?;
        Ok(())
    }
}

/// Runtime step that always fails after installing one service.
struct InstallThenFail(&'static str);

#[async_trait]
impl AddStepHandler for InstallThenFail {
    fn populate_model(&self, _op: &Operation, _resource: &mut ModelNode) -> Result<(), OperationError> {
        Ok(())
    }

    async fn perform_runtime(
        &self,
        ctx: &RuntimeContext,
        _op: &Operation,
        _resource: &ModelNode,
    ) -> Result<(), OperationError> {
        ctx.service_target()
            .add(descriptor(self.0, &[], Behaviour::Ready))?;
        Err(anyhow::anyhow!("listener configuration rejected").into())
    }
}

fn context(model: &ManagementModel, container: &ServiceContainer) -> OperationContext {
    OperationContext::new(model.clone(), container.clone(), ProcessInfo::default())
}

// ---------- Tests ----------

#[tokio::test]
async fn admin_only_process_leaves_container_untouched() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();
    let process = ProcessInfo::new(ProcessType::StandaloneServer, RunningMode::AdminOnly);

    let mut ctx = OperationContext::new(model.clone(), container.clone(), process);
    ctx.add_step(
        Operation::add(addr("/subsystem=remoting")),
        Arc::new(AddStep(InstallGraph::new(
            vec![svc("remoting", &[], Behaviour::Ready)],
            &["remoting"],
        ))),
    );
    let report = ctx.execute().await.unwrap();

    assert_eq!(report.state, TransactionState::Committed);
    assert!(report.installed.is_empty());
    assert!(container.names().is_empty());
    assert!(model.read_resource(&addr("/subsystem=remoting")).is_some());
}

#[tokio::test]
async fn successful_add_leaves_every_installed_name_up() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();

    let mut ctx = context(&model, &container);
    ctx.add_step(
        Operation::add(addr("/subsystem=remoting/connector=http")),
        Arc::new(AddStep(InstallGraph::new(
            vec![
                svc("remoting/endpoint", &[], Behaviour::Ready),
                svc("remoting/connector/http", &["remoting/endpoint"], Behaviour::Ready),
            ],
            &["remoting/connector/http"],
        ))),
    );
    let report = ctx.execute().await.unwrap();

    assert_eq!(
        report.installed,
        vec![n("remoting/endpoint"), n("remoting/connector/http")]
    );
    for name in &report.installed {
        assert_eq!(container.state(name), Some(ServiceState::Up));
    }
    let node = model
        .read_resource(&addr("/subsystem=remoting/connector=http"))
        .unwrap();
    assert_eq!(node.get_attribute("services"), Some(&json!(2)));
}

#[tokio::test]
async fn failed_service_rolls_back_everything_the_operation_added() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();
    preinstall(&container, vec![svc("executor", &[], Behaviour::Ready)]).await;
    let before = model.snapshot();

    let mut ctx = context(&model, &container);
    ctx.add_step(
        Operation::add(addr("/socket-binding=http")),
        Arc::new(AddStep(InstallGraph::new(
            vec![
                svc("http/acceptor", &["executor"], Behaviour::Ready),
                svc("http/listener", &["http/acceptor"], Behaviour::Fail),
            ],
            &["http/acceptor", "http/listener"],
        ))),
    );
    let failure = ctx.execute().await.unwrap_err();

    assert_eq!(failure.kind(), FailureKind::ServiceFailure);
    assert_eq!(failure.step, Some(0));
    match &failure.error {
        OperationError::ServiceFailure { service, cause } => {
            assert_eq!(service, &n("http/listener"));
            assert_eq!(cause, "port already bound");
        }
        other => panic!("expected ServiceFailure, got {other:?}"),
    }
    assert!(!container.contains(&n("http/acceptor")));
    assert!(!container.contains(&n("http/listener")));
    assert_eq!(container.state(&n("executor")), Some(ServiceState::Up));
    assert_eq!(model.snapshot(), before);
    assert!(failure.rolled_back_cleanly());
}

#[tokio::test]
async fn rollback_detaches_waiting_dependents_installed_earlier() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();
    // waits for a name nobody has installed yet
    preinstall(&container, vec![svc("waiter", &["extra"], Behaviour::Ready)]).await;
    assert_eq!(container.state(&n("waiter")), Some(ServiceState::Down));

    let mut ctx = context(&model, &container);
    ctx.add_step(
        Operation::add(addr("/subsystem=extra")),
        Arc::new(AddStep(InstallGraph::new(
            vec![svc("extra", &[], Behaviour::Fail)],
            &["extra"],
        ))),
    );
    let failure = ctx.execute().await.unwrap_err();

    assert_eq!(failure.kind(), FailureKind::ServiceFailure);
    assert!(failure.rolled_back_cleanly(), "{}", failure.cause_chain());
    assert_eq!(container.names(), vec![n("waiter")]);
    assert_eq!(container.state(&n("waiter")), Some(ServiceState::Down));
    assert!(model.read_resource(&addr("/subsystem=extra")).is_none());
}

#[tokio::test]
async fn rollback_blocked_by_running_dependent_is_reported() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();
    preinstall(&container, vec![svc("waiter", &["extra"], Behaviour::Ready)]).await;

    // "broken" only starts once "waiter" is UP on top of "extra"
    let mut ctx = context(&model, &container);
    ctx.add_step(
        Operation::add(addr("/subsystem=extra")),
        Arc::new(AddStep(InstallGraph::new(
            vec![
                svc("extra", &[], Behaviour::Ready),
                svc("broken", &["waiter"], Behaviour::Fail),
            ],
            &["broken"],
        ))),
    );
    let failure = ctx.execute().await.unwrap_err();

    assert_eq!(failure.kind(), FailureKind::ServiceFailure);
    assert!(!failure.rolled_back_cleanly());
    assert!(matches!(
        failure.rollback.as_slice(),
        [ContainerError::HasDependents { service, dependents }]
            if service == &n("extra") && dependents == &vec![n("waiter")]
    ));
    assert!(failure.cause_chain().contains("rollback incomplete"));
    assert_eq!(container.state(&n("waiter")), Some(ServiceState::Up));
    assert!(model.read_resource(&addr("/subsystem=extra")).is_none());
}

#[tokio::test(start_paused = true)]
async fn deadline_elapsed_removes_partial_installation() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();

    let mut ctx = context(&model, &container).with_verification_timeout(Duration::from_secs(5));
    ctx.add_step(
        Operation::add(addr("/subsystem=jmx")),
        Arc::new(AddStep(InstallGraph::new(
            vec![
                svc("jmx/registry", &[], Behaviour::Ready),
                svc("jmx/connector", &["jmx/registry"], Behaviour::Hang),
            ],
            &["jmx/connector"],
        ))),
    );

    let started = tokio::time::Instant::now();
    let failure = ctx.execute().await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(5));
    match &failure.error {
        OperationError::VerificationTimeout { pending, .. } => {
            assert_eq!(pending, &vec![n("jmx/connector")])
        }
        other => panic!("expected VerificationTimeout, got {other:?}"),
    }
    assert!(container.names().is_empty());
    assert!(model.read_resource(&addr("/subsystem=jmx")).is_none());
}

#[tokio::test]
async fn duplicate_install_keeps_prior_committed_services() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();

    let mut first = context(&model, &container);
    first.add_step(
        Operation::add(addr("/subsystem=base")),
        Arc::new(AddStep(InstallGraph::new(
            vec![
                svc("base", &[], Behaviour::Ready),
                svc("base/user", &["base"], Behaviour::Ready),
            ],
            &["base/user"],
        ))),
    );
    first.execute().await.unwrap();

    let mut second = context(&model, &container);
    second.add_step(
        Operation::add(addr("/subsystem=extra")),
        Arc::new(AddStep(InstallGraph::new(
            vec![svc("extra", &["base"], Behaviour::Ready)],
            &["extra"],
        ))),
    );
    second.add_step(
        Operation::add(addr("/subsystem=extra-again")),
        Arc::new(AddStep(InstallGraph::new(
            vec![svc("extra", &[], Behaviour::Ready)],
            &["extra"],
        ))),
    );
    let failure = second.execute().await.unwrap_err();

    assert_eq!(failure.kind(), FailureKind::Installation);
    assert_eq!(failure.step, Some(1));
    assert!(failure.cause_chain().contains("service 'extra' is already installed"));
    assert!(!container.contains(&n("extra")));
    assert_eq!(container.state(&n("base")), Some(ServiceState::Up));
    assert_eq!(container.state(&n("base/user")), Some(ServiceState::Up));
    assert_eq!(
        container.dependents(&n("base")).into_iter().collect::<Vec<_>>(),
        vec![n("base/user")]
    );
    assert!(model.read_resource(&addr("/subsystem=base")).is_some());
    assert!(model.read_resource(&addr("/subsystem=extra")).is_none());
}

#[tokio::test]
async fn runtime_error_in_one_step_rolls_back_concurrent_steps() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();

    let mut ctx = context(&model, &container);
    ctx.add_step(
        Operation::add(addr("/subsystem=ok")),
        Arc::new(AddStep(InstallGraph::new(
            vec![svc("ok", &[], Behaviour::Ready)],
            &["ok"],
        ))),
    );
    ctx.add_step(
        Operation::add(addr("/subsystem=bad")),
        Arc::new(AddStep(InstallThenFail("bad"))),
    );
    let failure = ctx.execute().await.unwrap_err();

    assert_eq!(failure.kind(), FailureKind::Runtime);
    assert_eq!(failure.step, Some(1));
    assert_eq!(failure.cause_chain(), "listener configuration rejected");
    assert!(container.names().is_empty());
    assert_eq!(model.snapshot(), ModelNode::new());
}

#[tokio::test]
async fn first_verification_failure_cancels_the_others() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();

    // default deadline is long; only cancellation makes this return quickly
    let mut ctx = context(&model, &container);
    ctx.add_step(
        Operation::add(addr("/subsystem=slow")),
        Arc::new(AddStep(InstallGraph::new(
            vec![svc("slow", &[], Behaviour::Hang)],
            &["slow"],
        ))),
    );
    ctx.add_step(
        Operation::add(addr("/subsystem=broken")),
        Arc::new(AddStep(InstallGraph::new(
            vec![svc("broken", &[], Behaviour::Fail)],
            &["broken"],
        ))),
    );

    let failure = tokio::time::timeout(Duration::from_secs(5), ctx.execute())
        .await
        .expect("transaction should not wait for the slow verification")
        .unwrap_err();
    assert_eq!(failure.kind(), FailureKind::ServiceFailure);
    assert_eq!(failure.step, Some(1));
    assert!(container.names().is_empty());
}

#[tokio::test]
async fn rolled_back_remove_reinstalls_services() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();

    let mut add = context(&model, &container);
    add.add_step(
        Operation::add(addr("/subsystem=mail")),
        Arc::new(AddStep(InstallGraph::new(
            vec![
                svc("mail/session", &[], Behaviour::Ready),
                svc("mail/smtp", &["mail/session"], Behaviour::Ready),
            ],
            &["mail/smtp"],
        ))),
    );
    add.execute().await.unwrap();
    let committed = model.snapshot();

    let mut tx = context(&model, &container);
    tx.add_step(
        Operation::remove(addr("/subsystem=mail")),
        Arc::new(RemoveGraph {
            services: vec!["mail/session", "mail/smtp"],
        }),
    );
    tx.add_step(
        Operation::add(addr("/subsystem=bad")),
        Arc::new(AddStep(InstallThenFail("bad"))),
    );
    tx.execute().await.unwrap_err();

    assert_eq!(model.snapshot(), committed);
    assert_eq!(container.names(), vec![n("mail/session"), n("mail/smtp")]);
    assert_eq!(container.dependents(&n("mail/session")).len(), 1);
    for _ in 0..100 {
        if container.state(&n("mail/smtp")) == Some(ServiceState::Up) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(container.state(&n("mail/smtp")), Some(ServiceState::Up));
}

#[tokio::test]
async fn committed_remove_reports_removed_names() {
    let model = ManagementModel::new();
    let container = ServiceContainer::new();
    preinstall(&container, vec![svc("cache", &[], Behaviour::Ready)]).await;

    // record the resource without touching the container
    let admin = ProcessInfo::new(ProcessType::StandaloneServer, RunningMode::AdminOnly);
    let mut seed = OperationContext::new(model.clone(), container.clone(), admin);
    seed.add_step(
        Operation::add(addr("/subsystem=cache")),
        Arc::new(AddStep(InstallGraph::new(vec![], &[]))),
    );
    seed.execute().await.unwrap();

    let mut tx = context(&model, &container);
    tx.add_step(
        Operation::remove(addr("/subsystem=cache")),
        Arc::new(RemoveGraph {
            services: vec!["cache"],
        }),
    );
    let report = tx.execute().await.unwrap();

    assert_eq!(report.removed, vec![n("cache")]);
    assert!(container.names().is_empty());
    assert!(model.read_resource(&addr("/subsystem=cache")).is_none());
}

#[tokio::test]
async fn factory_values_flow_between_services() {
    struct Port(u16);

    #[async_trait]
    impl Service for Port {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let container = ServiceContainer::new();
    let target = container.target();
    target
        .add(ServiceDescriptor::from_fn(n("port"), |_| {
            Ok(ServiceInstance::new(Port(9990)))
        }))
        .unwrap();
    target
        .add(
            ServiceDescriptor::from_fn(n("listener"), |deps| {
                let port = deps.get::<Port>(&n("port"))?;
                Ok(ServiceInstance::new(Port(port.0 + 1)))
            })
            .requires(n("port")),
        )
        .unwrap();

    let watched = [n("listener")].into_iter().collect();
    svckit::operation::await_installation(
        &container,
        &watched,
        Duration::from_secs(1),
        &tokio_util::sync::CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(container.value::<Port>(&n("listener")).map(|p| p.0), Some(9991));
}
