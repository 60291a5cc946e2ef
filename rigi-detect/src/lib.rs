use std::sync::Arc;

use minfac::{Registered, ServiceCollection};
use rigi::{
    broker::Broker,
    mapper::StoreAccess,
    prelude::*,
    GenericConfig, SystemShutdown,
};
use tracing::{error, info};

mod camera_status;
mod capture;
mod detector;
mod frame_cache;
mod monitor;

pub use camera_status::{check_all_cameras, run_camera_status_monitor, CameraProbeConfig};
pub use capture::*;
pub use detector::*;
pub use frame_cache::*;
pub use monitor::*;

pub extern "C" fn register(c: &mut ServiceCollection) {
    c.register_shared(|| Arc::new(FrameCache::new()));
    // Deployments with an inference or capture backend register their own
    // factories instead of these placeholders.
    c.register(DetectorFactory::unavailable);
    c.register(CaptureFactory::unavailable);
    c.with::<Registered<GenericConfig>>()
        .register(|config| DetectionConfig::from(&config));
    c.with::<Registered<GenericConfig>>()
        .register(|config| CameraProbeConfig::from(&config));

    c.with::<(
        (Registered<Arc<Broker>>, Registered<StoreAccess>),
        (Registered<Arc<FrameCache>>, Registered<DetectionConfig>),
        (Registered<DetectorFactory>, Registered<CaptureFactory>),
    )>()
    .register_shared(|((broker, store), (cache, config), (detectors, captures))| {
        Arc::new(DetectionMonitor::new(
            broker, store, cache, detectors, captures, config,
        ))
    });

    c.with::<(Registered<Arc<DetectionMonitor>>, Registered<SystemShutdown>)>()
        .register_hosted_service("Person Detection Monitor", hosted_detection_monitor);
    c.with::<(
        Registered<StoreAccess>,
        Registered<CameraProbeConfig>,
        Registered<SystemShutdown>,
    )>()
    .register_hosted_service("Camera Status Monitor", camera_status::hosted_camera_status_monitor);
}

async fn hosted_detection_monitor(
    (monitor, shutdown): (Arc<DetectionMonitor>, SystemShutdown),
) -> anyhow::Result<()> {
    if monitor.auto_monitor_enabled() {
        if let Err(e) = monitor.start().await {
            error!("Detection monitor failed to start, staying idle: {e}");
        }
    } else {
        info!("Automatic person detection is disabled");
    }
    shutdown.await;
    monitor.stop().await;
    Ok(())
}
