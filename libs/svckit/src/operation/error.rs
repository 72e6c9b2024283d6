use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::container::ContainerError;
use crate::model::PathAddress;
use crate::service::ServiceName;

/// Why an operation step failed.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Bad input to the MODEL phase; nothing reached the container.
    #[error("invalid operation: {0}")]
    ModelValidation(String),

    #[error("failed to install services")]
    Installation(#[from] ContainerError),

    #[error("service '{service}' failed to start: {cause}")]
    ServiceFailure { service: ServiceName, cause: String },

    #[error(
        "services not UP after {}ms: {}",
        .timeout.as_millis(),
        .pending.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )]
    VerificationTimeout {
        pending: Vec<ServiceName>,
        timeout: Duration,
    },

    #[error("no '{operation}' handler registered for {address}")]
    HandlerNotFound {
        operation: String,
        address: PathAddress,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    ModelValidation,
    Installation,
    ServiceFailure,
    VerificationTimeout,
    HandlerNotFound,
    Cancelled,
    Runtime,
}

impl OperationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OperationError::ModelValidation(_) => FailureKind::ModelValidation,
            OperationError::Installation(_) => FailureKind::Installation,
            OperationError::ServiceFailure { .. } => FailureKind::ServiceFailure,
            OperationError::VerificationTimeout { .. } => FailureKind::VerificationTimeout,
            OperationError::HandlerNotFound { .. } => FailureKind::HandlerNotFound,
            OperationError::Cancelled => FailureKind::Cancelled,
            OperationError::Runtime(_) => FailureKind::Runtime,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        OperationError::ModelValidation(msg.into())
    }
}

/// Failed batch: the transaction was rolled back and the model is unchanged.
#[derive(Debug, Error)]
#[error("operation failed in transaction {transaction}")]
pub struct OperationFailure {
    pub transaction: Uuid,
    /// Index of the failing step, when one step can be blamed.
    pub step: Option<usize>,
    #[source]
    pub error: OperationError,
    /// Container errors hit while rolling back; empty when the rollback was clean.
    pub rollback: Vec<ContainerError>,
}

impl OperationFailure {
    pub fn new(transaction: Uuid, step: Option<usize>, error: OperationError) -> Self {
        Self {
            transaction,
            step,
            error,
            rollback: Vec::new(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }

    /// `false` when the rollback itself left container changes behind.
    pub fn rolled_back_cleanly(&self) -> bool {
        self.rollback.is_empty()
    }

    /// `outer: inner: innermost` rendering of the error and its sources, followed by any
    /// rollback errors.
    pub fn cause_chain(&self) -> String {
        let mut parts = vec![self.error.to_string()];
        let mut source = std::error::Error::source(&self.error);
        while let Some(err) = source {
            parts.push(err.to_string());
            source = err.source();
        }
        let mut chain = parts.join(": ");
        for err in &self.rollback {
            chain.push_str("; rollback incomplete: ");
            chain.push_str(&err.to_string());
        }
        chain
    }
}
