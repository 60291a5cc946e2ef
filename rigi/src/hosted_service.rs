use std::{future::Future, io};

use anyhow::Result;
use minfac::{Resolvable, ServiceBuilder, ServiceCollection, WeakServiceProvider};
use tokio::task::JoinHandle;

pub(crate) type HostedServiceResult = Result<()>;

/// A named long-running task spawned by the runtime after the provider is
/// built. Every long-lived activity (data-manager pump, sensor pump,
/// detection monitor) registers itself as one of these.
#[derive(Clone)]
pub struct HostedService(Box<dyn SpawnWithProvider<HostedServiceResult>>);

impl HostedService {
    fn new(inner: Box<dyn SpawnWithProvider<HostedServiceResult>>) -> Self {
        Self(inner)
    }

    pub fn get_name(&self) -> &str {
        self.0.get_name()
    }

    pub fn call(
        &self,
        provider: WeakServiceProvider,
    ) -> io::Result<JoinHandle<HostedServiceResult>> {
        self.0.spawn(provider)
    }
}

pub trait ServiceBuilderExtensions {
    type Dependency: Send;

    fn register_hosted_service<TFut>(
        &mut self,
        name: &'static str,
        handler: fn(Self::Dependency) -> TFut,
    ) where
        TFut: Future<Output = HostedServiceResult> + Send + 'static;
}

impl<TDep> ServiceBuilderExtensions for ServiceBuilder<'_, TDep>
where
    TDep: Resolvable + Send + 'static,
    TDep::ItemPreChecked: Send,
{
    type Dependency = TDep::ItemPreChecked;

    fn register_hosted_service<TFut>(
        &mut self,
        name: &'static str,
        handler: fn(TDep::ItemPreChecked) -> TFut,
    ) where
        TFut: Future<Output = HostedServiceResult> + Send + 'static,
    {
        self.0.register_instance(HostedService::new(Box::new(
            DependentSpawner::<HostedServiceResult, TDep, TFut> { name, handler },
        )))
    }
}

pub trait ServiceCollectionExtensions {
    fn register_hosted_service<TFut>(&mut self, name: &'static str, handler: fn() -> TFut)
    where
        TFut: Future<Output = HostedServiceResult> + Send + 'static;
}

impl ServiceCollectionExtensions for ServiceCollection {
    fn register_hosted_service<TFut>(&mut self, name: &'static str, handler: fn() -> TFut)
    where
        TFut: Future<Output = HostedServiceResult> + Send + 'static,
    {
        self.register_instance(HostedService::new(Box::new(FreeSpawner::<
            HostedServiceResult,
            TFut,
        > {
            name,
            handler,
        })))
    }
}

trait SpawnWithProvider<T>: Send + Sync {
    fn clone_box(&self) -> Box<dyn SpawnWithProvider<T>>;
    fn spawn(&self, provider: WeakServiceProvider) -> io::Result<JoinHandle<T>>;
    fn get_name(&self) -> &str;
}

impl<T> Clone for Box<dyn SpawnWithProvider<T>> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

struct FreeSpawner<T, TFut: Future<Output = T> + Send> {
    name: &'static str,
    handler: fn() -> TFut,
}

impl<T: 'static + Send, TFut> SpawnWithProvider<T> for FreeSpawner<T, TFut>
where
    TFut: Future<Output = T> + Send + 'static,
{
    fn spawn(&self, _provider: WeakServiceProvider) -> io::Result<JoinHandle<T>> {
        Ok(tokio::task::spawn((self.handler)()))
    }

    fn clone_box(&self) -> Box<dyn SpawnWithProvider<T>> {
        Box::new(FreeSpawner::<T, TFut> {
            handler: self.handler,
            name: self.name,
        })
    }

    fn get_name(&self) -> &str {
        self.name
    }
}

struct DependentSpawner<T, TDep: Resolvable, TFut: Future<Output = T> + Send> {
    name: &'static str,
    handler: fn(TDep::ItemPreChecked) -> TFut,
}

impl<T: 'static + Send, TDep, TFut> SpawnWithProvider<T> for DependentSpawner<T, TDep, TFut>
where
    TDep: Resolvable + Send + 'static,
    TDep::ItemPreChecked: Send,
    TFut: Future<Output = T> + Send + 'static,
{
    fn spawn(&self, provider: WeakServiceProvider) -> io::Result<JoinHandle<T>> {
        Ok(tokio::task::spawn((self.handler)(
            provider.resolve_unchecked::<TDep>(),
        )))
    }

    fn clone_box(&self) -> Box<dyn SpawnWithProvider<T>> {
        Box::new(DependentSpawner::<T, TDep, TFut> {
            handler: self.handler,
            name: self.name,
        })
    }

    fn get_name(&self) -> &str {
        self.name
    }
}
