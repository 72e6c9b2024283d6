//! Management operations: two-phase (MODEL, then RUNTIME) transactions over the model tree
//! and the service container.

mod context;
mod error;
mod handler;
mod verify;

pub use context::{OperationContext, OperationReport, RuntimeContext};
pub use error::{FailureKind, OperationError, OperationFailure};
pub use handler::{AddStep, AddStepHandler, OperationStepHandler};
pub use verify::{
    add_verify_installation_step, add_verify_installation_step_with_timeout, await_installation,
    VerificationRequest, DEFAULT_VERIFICATION_TIMEOUT,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::PathAddress;

pub const ADD: &str = "add";
pub const REMOVE: &str = "remove";

/// One management request: an operation name applied to a resource address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub address: PathAddress,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>, address: PathAddress) -> Self {
        Self {
            name: name.into(),
            address,
            params: Map::new(),
        }
    }

    pub fn add(address: PathAddress) -> Self {
        Self::new(ADD, address)
    }

    pub fn remove(address: PathAddress) -> Self {
        Self::new(REMOVE, address)
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Key of the addressed resource (`management-interface` for `/.../management-interface=x`).
    pub fn resource_type(&self) -> Option<&str> {
        self.address.last().map(|e| e.key.as_str())
    }
}

/// Progress of one operation transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionState {
    ModelPending,
    RuntimePending,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_from_json() {
        let op: Operation = serde_json::from_value(json!({
            "name": "add",
            "address": "/core-service=management/management-interface=native-remoting-interface",
        }))
        .unwrap();
        assert_eq!(op.name, ADD);
        assert_eq!(op.resource_type(), Some("management-interface"));
        assert!(op.params.is_empty());

        let op = Operation::remove(op.address.clone()).with_param("force", json!(true));
        assert_eq!(op.param("force"), Some(&json!(true)));
    }
}
