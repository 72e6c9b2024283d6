use serde::{Deserialize, Serialize};
use svckit::{ServiceName, ServiceNameError};

/// Configuration for the native_remoting module
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NativeRemotingConfig {
    /// Service name of the remoting endpoint the channel is opened on.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Channel name; also the last segment of the channel service name.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Interface name under `/core-service=management/management-interface=...`.
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for NativeRemotingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            channel: default_channel(),
            interface: default_interface(),
        }
    }
}

impl NativeRemotingConfig {
    pub fn endpoint_name(&self) -> Result<ServiceName, ServiceNameError> {
        ServiceName::parse(&self.endpoint)
    }
}

fn default_endpoint() -> String {
    "remoting/endpoint".to_string()
}

fn default_channel() -> String {
    "management".to_string()
}

fn default_interface() -> String {
    "native-remoting-interface".to_string()
}
