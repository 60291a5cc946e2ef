use minfac::ServiceCollection;

mod runtime;
mod shutdown;
mod store;
mod telemetry;

pub use runtime::*;
pub use store::JsonCatalogStore;

pub extern "C" fn register(c: &mut ServiceCollection) {
    shutdown::register_services(c);
}
