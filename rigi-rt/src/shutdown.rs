use std::{pin::Pin, sync::Arc};

use futures::{
    future::Shared,
    stream::{AbortHandle, Abortable},
    Future, FutureExt,
};
use minfac::{Registered, ServiceCollection};
use rigi::{SystemShutdown, SystemTerminator};

type SharedSignal = Shared<Pin<Box<dyn Future<Output = ()> + 'static + Send + Sync>>>;

/// The shutdown signal resolves on ctrl-c, or earlier when a
/// [`SystemTerminator`] fires (integration tests stop the runtime that
/// way).
pub(super) fn register_services(c: &mut ServiceCollection) {
    c.register_shared(|| {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let signal: Pin<Box<dyn Future<Output = ()> + Send + Sync>> = Box::pin(async {
            Abortable::new(tokio::signal::ctrl_c(), abort_registration)
                .await
                .ok();
        });
        Arc::new(SignalState(abort_handle, signal.shared()))
    });

    c.with::<Registered<Arc<SignalState>>>()
        .register(|s| SystemTerminator::new(s.0.clone()));
    c.with::<Registered<Arc<SignalState>>>()
        .register(|s| SystemShutdown::new(s.1.clone()));
}

struct SignalState(AbortHandle, SharedSignal);
