//! Process bootstrap for management servers: layered configuration, logging, home dir
//! resolution and shutdown signals.

pub mod config;
pub mod config_provider;
pub mod logging;
pub mod paths;
pub mod signals;

pub use config::{
    default_logging_config, AppConfig, CliArgs, ContainerConfig, LoggingConfig, Section,
    ServerConfig, ENV_PREFIX,
};
pub use config_provider::{module_config_or_default, AppConfigProvider, ConfigProvider};
pub use logging::init_logging;
pub use signals::{wait_for_shutdown, wait_for_shutdown_or, ShutdownReason};
