//! Process metadata consulted by `requires_runtime` predicates.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessType {
    #[default]
    StandaloneServer,
    DomainServer,
    EmbeddedServer,
    SelfContained,
    HostController,
    EmbeddedHostController,
    ApplicationClient,
}

impl ProcessType {
    pub fn is_server(self) -> bool {
        matches!(
            self,
            ProcessType::StandaloneServer
                | ProcessType::DomainServer
                | ProcessType::EmbeddedServer
                | ProcessType::SelfContained
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunningMode {
    #[default]
    Normal,
    AdminOnly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_type: ProcessType,
    pub running_mode: RunningMode,
}

impl ProcessInfo {
    pub fn new(process_type: ProcessType, running_mode: RunningMode) -> Self {
        Self {
            process_type,
            running_mode,
        }
    }

    /// Runtime work happens only for servers running in normal mode unless a handler says otherwise.
    pub fn default_requires_runtime(&self) -> bool {
        self.process_type.is_server() && self.running_mode == RunningMode::Normal
    }
}
