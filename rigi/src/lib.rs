pub mod broker;
mod config;
mod hosted_service;
mod logging;
pub mod manager;
pub mod mapper;
mod outbound;
mod recovery;
mod shutdown;
mod uuid_wrapper;
mod value;

pub use crate::config::GenericConfig;
pub use hosted_service::HostedService;
pub use logging::{LogConfig, LogFileConfig, LogTopic};
pub use outbound::*;
pub use recovery::{Recovery, RetryPolicy};
pub use shutdown::*;
pub use value::*;

pub mod prelude {
    pub use crate::hosted_service::ServiceBuilderExtensions as HostedServiceServiceBuilderExtensions;
    pub use crate::hosted_service::ServiceCollectionExtensions as HostedServiceServiceCollectionExtensions;
}

pub extern "C" fn register(collection: &mut minfac::ServiceCollection) {
    broker::register_services(collection);
    mapper::register_services(collection);
    manager::register_services(collection);
}
