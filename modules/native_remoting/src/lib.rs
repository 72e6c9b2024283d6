//! Native remoting management interface.
//!
//! Adding `/core-service=management/management-interface=native-remoting-interface` installs a
//! management channel on the configured remoting endpoint and holds the operation until the
//! channel is UP. The host must already run the services in [`services`].

pub mod channel;
pub mod config;
pub mod handler;
pub mod services;

pub use channel::{
    channel_service_name, install_management_channel_services, ChannelNames,
    ChannelRegistryService, ClientOperationHandlerFactory, ClientOperationHandlerService,
    OperationHandlerFactory,
};
pub use config::NativeRemotingConfig;
pub use handler::{
    interface_address, register, NativeRemotingAddHandler, NativeRemotingRemoveHandler,
};
pub use services::{
    install_host_services, start_host_services, ControllerService, ExecutorService,
    HostServiceNames, ScheduledExecutorService,
};

pub const MODULE_NAME: &str = "native_remoting";
