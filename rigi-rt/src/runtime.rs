use std::{
    any::Any,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use minfac::{Registered, Resolvable, ServiceCollection, ServiceProvider};
use rigi::{mapper::StoreAccess, GenericConfig, HostedService, LogConfig, SystemTerminator};
use tokio::runtime::Builder;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use crate::store::JsonCatalogStore;

/// Composition root: collects the service registrations of all crates and
/// turns them into a running system. The root directory provides the
/// configuration (`*.json`) and the camera catalog (`catalog.json`).
pub struct Runtime {
    services: ServiceCollection,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::with_root(std::env::var("RIGI_ROOT").unwrap_or_else(|_| "data".into()))
    }
}

impl Runtime {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        std::fs::create_dir_all(&root).unwrap_or_else(|_| panic!("Can't create root dir {root:?}"));
        let config = GenericConfig::new(&root).expect("Invalid config");
        let store =
            JsonCatalogStore::open(root.join("catalog.json")).expect("Found invalid catalog.json");

        let mut services = ServiceCollection::new();
        services.register_instance(config);
        services
            .with::<Registered<GenericConfig>>()
            .register(|config| LogConfig::from(&config));
        services.register_instance(StoreAccess::new(Arc::new(store)));

        rigi::register(&mut services);
        rigi_sensor::register(&mut services);
        rigi_detect::register(&mut services);
        crate::register(&mut services);

        Self { services }
    }

    pub fn register(mut self, registrar: extern "C" fn(&mut ServiceCollection)) -> Self {
        (registrar)(&mut self.services);
        self
    }

    pub fn register_instance(mut self, instance: impl Clone + Send + Sync + Any) -> Self {
        self.services.register_instance(instance);
        self
    }

    /// Builds the provider and the tokio runtime and initialises tracing.
    /// As the outermost layer, this is allowed to panic on wiring errors.
    pub fn configure(self) -> ConfiguredRuntime {
        let tokio = Builder::new_multi_thread()
            .thread_name("rigi")
            .enable_all()
            .build()
            .expect("Tokio runtime can be built");

        let provider = self.services.build().expect("has all dependencies");
        let log_guard = crate::telemetry::init(&provider);

        ConfiguredRuntime {
            tokio,
            provider,
            _log_guard: log_guard,
        }
    }

    pub fn run(self) {
        self.configure().run(async {})
    }
}

pub struct ConfiguredRuntime {
    tokio: tokio::runtime::Runtime,
    pub provider: ServiceProvider,
    _log_guard: Option<WorkerGuard>,
}

impl ConfiguredRuntime {
    /// Runs all hosted services until `other` finishes, then triggers the
    /// system shutdown and waits for them to drain.
    pub fn run_until_finished<TFut: futures::Future>(self, other: TFut) -> TFut::Output {
        let terminator = self
            .provider
            .get::<SystemTerminator>()
            .expect("Registered by the runtime");
        self.run_and_return(async move {
            let r = other.await;
            terminator.shutdown();
            r
        })
    }

    pub fn run(self, other: impl futures::Future<Output = ()>) {
        self.run_and_return(other);
    }

    fn run_and_return<TFut: futures::Future>(self, other: TFut) -> TFut::Output {
        info!("Tokio runtime has started");
        let (r, _) = self.tokio.block_on(futures::future::join(other, async {
            let mut tasks: FuturesUnordered<_> = self
                .provider
                .get_all::<HostedService>()
                .filter_map(|service| {
                    let name = service.get_name().to_owned();
                    match service.call((&self.provider).into()) {
                        Ok(handle) => Some(async move { (name, handle.await) }.boxed()),
                        Err(e) => {
                            error!("Failed to start hosted service '{name}': {e}");
                            None
                        }
                    }
                })
                .collect();

            while let Some((name, finished)) = tasks.next().await {
                match finished.map_err(anyhow::Error::from).and_then(|r| r) {
                    Ok(()) => {
                        info!("Hosted service '{name}' stopped, {} remaining", tasks.len())
                    }
                    Err(e) => error!("Hosted service '{name}' failed: {e:?}"),
                }
            }
        }));
        info!("Tokio runtime has ended");
        r
    }
}

/// Convenience wrapper for integration tests: a temporary root directory
/// with a [`Runtime`] built from it. Keeps the directory alive for as long
/// as the runtime is used.
pub struct TempRuntime {
    dir: tempfile::TempDir,
    runtime: Runtime,
}

impl TempRuntime {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let runtime = Runtime::with_root(dir.path());
        Ok(Self { dir, runtime })
    }

    /// Replaces `config.json` and rebuilds the internal [`Runtime`]. Call
    /// before any `register*`, otherwise those registrations are lost with
    /// the rebuilt service collection.
    pub fn config_json(mut self, config_json: impl AsRef<[u8]>) -> std::io::Result<Self> {
        std::fs::write(self.dir.path().join("config.json"), config_json)?;
        self.runtime = Runtime::with_root(self.dir.path());
        Ok(self)
    }

    /// Replaces `catalog.json`; same rebuild caveat as
    /// [`TempRuntime::config_json`].
    pub fn catalog_json(mut self, catalog_json: impl AsRef<[u8]>) -> std::io::Result<Self> {
        std::fs::write(self.dir.path().join("catalog.json"), catalog_json)?;
        self.runtime = Runtime::with_root(self.dir.path());
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn register(self, registrar: extern "C" fn(&mut ServiceCollection)) -> Self {
        let Self { dir, runtime } = self;
        Self {
            dir,
            runtime: runtime.register(registrar),
        }
    }

    pub fn register_instance(self, instance: impl Clone + Send + Sync + Any) -> Self {
        let Self { dir, runtime } = self;
        Self {
            dir,
            runtime: runtime.register_instance(instance),
        }
    }

    /// Runs the runtime until the provided future finishes, resolving the
    /// closure's dependencies from the provider:
    ///
    /// `temp.run_until(|Registered(broker): Registered<Arc<Broker>>| async move { ... })`
    pub fn run_until<T, TDeps, TFut, F>(self, f: F) -> T
    where
        TDeps: Resolvable,
        TFut: futures::Future<Output = T>,
        F: FnOnce(TDeps) -> TFut,
    {
        let configured = self.runtime.configure();
        let deps = configured
            .provider
            .resolve::<TDeps>()
            .expect("Missing dependencies for TempRuntime::run_until");
        let result = configured.run_until_finished(f(deps));
        drop(self.dir);
        result
    }
}
