use std::{
    pin::Pin,
    task::{self, Poll},
};

use futures::{future::Shared, stream::AbortHandle, Future, FutureExt};

type SharedSignal = Shared<Pin<Box<dyn Future<Output = ()> + 'static + Send + Sync>>>;

/// Resolves when the process is asked to stop. Usually backed by ctrl-c;
/// tests drive it through [`SystemTerminator`]. Cloneable so every hosted
/// service can await its own copy.
#[derive(Clone)]
pub struct SystemShutdown(SharedSignal);

impl SystemShutdown {
    pub fn new(inner: SharedSignal) -> Self {
        Self(inner)
    }

    /// Runs `fut` until completion or shutdown, whichever comes first.
    pub async fn wrap<TFut: Future>(&self, fut: TFut) -> Option<TFut::Output> {
        let signal = self.clone();
        futures::pin_mut!(fut);
        match futures::future::select(signal, fut).await {
            futures::future::Either::Left(_) => None,
            futures::future::Either::Right((x, _)) => Some(x),
        }
    }
}

impl Future for SystemShutdown {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

/// Counterpart of [`SystemShutdown`] for initiating the stop.
pub struct SystemTerminator(AbortHandle);

impl SystemTerminator {
    pub fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }

    pub fn shutdown(&self) {
        self.0.abort();
    }
}
