//! # svckit - Service container and transactional management operations
//!
//! Two layers:
//!
//! - **Container**: named services with declared dependencies, started concurrently in
//!   dependency order and observable through per-service status channels.
//! - **Operations**: management requests applied in two phases. The MODEL phase edits the
//!   in-memory configuration tree; the RUNTIME phase installs services when the process is
//!   actually running, and registered verifications hold the commit until those services
//!   are UP. Any failure rolls both phases back.
//!
//! ## Example
//!
//! ```rust,ignore
//! use svckit::operation::{add_verify_installation_step, AddStep, AddStepHandler};
//!
//! struct ConnectorAdd;
//!
//! #[async_trait::async_trait]
//! impl AddStepHandler for ConnectorAdd {
//!     fn populate_model(&self, _op: &Operation, _node: &mut ModelNode) -> Result<(), OperationError> {
//!         Ok(())
//!     }
//!
//!     async fn perform_runtime(&self, ctx: &RuntimeContext, _op: &Operation, _node: &ModelNode)
//!         -> Result<(), OperationError>
//!     {
//!         let name = ServiceName::parse("remoting/connector").map_err(anyhow::Error::from)?;
//!         ctx.service_target().add(ServiceDescriptor::of_value(name.clone(), Connector))?;
//!         add_verify_installation_step(ctx, [name]);
//!         Ok(())
//!     }
//! }
//!
//! controller.register_handler("connector", "add", AddStep(ConnectorAdd));
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod container;
pub mod controller;
pub mod model;
pub mod operation;
pub mod process;
pub mod service;

pub use container::{ContainerError, ServiceContainer, ServiceId, ServiceTarget};
pub use controller::ModelController;
pub use model::{ManagementModel, ModelNode, PathAddress, PathElement, PathError};
pub use operation::{
    FailureKind, Operation, OperationContext, OperationError, OperationFailure, OperationReport,
    TransactionState,
};
pub use process::{ProcessInfo, ProcessType, RunningMode};
pub use service::{
    InjectionError, Injected, Service, ServiceDescriptor, ServiceFactory, ServiceInstance,
    ServiceName, ServiceNameError, ServiceState, ServiceStatus,
};
