use std::{sync::Arc, time::Duration};

use image::RgbImage;

/// Budget for establishing the stream connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Budget for a single frame read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("Stream could not be opened: {0}")]
    Open(String),

    #[error("Frame read failed: {0}")]
    Read(String),
}

/// Live video source with its own internal read thread, as provided by the
/// external RTSP collaborator. `read_latest` must not block beyond
/// [`READ_TIMEOUT`] and returns `None` when no new frame is available yet.
pub trait FrameSource: Send {
    fn read_latest(&mut self) -> Result<Option<RgbImage>, CaptureError>;
}

type CaptureOpener = dyn Fn(&str) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync;

/// Opens frame sources for camera URLs. Implementations must respect
/// [`CONNECT_TIMEOUT`].
#[derive(Clone)]
pub struct CaptureFactory(Arc<CaptureOpener>);

impl CaptureFactory {
    pub fn new(
        opener: impl Fn(&str) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(opener))
    }

    /// Placeholder for deployments without a capture backend.
    pub fn unavailable() -> Self {
        Self::new(|url| Err(CaptureError::Open(format!("No capture backend for {url}"))))
    }

    pub fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        (self.0)(url)
    }
}
