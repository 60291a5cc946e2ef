use std::time::Duration;

use rigi::{
    mapper::{CameraStatus, StoreAccess},
    GenericConfig, SystemShutdown,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// `cameras` section of the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraProbeConfig {
    pub check_timeout_s: f64,
    pub check_interval_s: f64,
    pub enabled: bool,
}

impl Default for CameraProbeConfig {
    fn default() -> Self {
        Self {
            check_timeout_s: 3.0,
            check_interval_s: 300.0,
            enabled: true,
        }
    }
}

impl From<&GenericConfig> for CameraProbeConfig {
    fn from(config: &GenericConfig) -> Self {
        config.get_or_default("cameras")
    }
}

pub(crate) async fn hosted_camera_status_monitor(
    (store, config, shutdown): (StoreAccess, CameraProbeConfig, SystemShutdown),
) -> anyhow::Result<()> {
    if !config.enabled {
        info!("Camera status monitoring is disabled");
        return Ok(());
    }
    run_camera_status_monitor(store, config, shutdown).await;
    Ok(())
}

/// Periodically probes every stored camera endpoint and writes status
/// changes back to the store. An unreachable store skips the round; the
/// next interval retries.
pub async fn run_camera_status_monitor(
    store: StoreAccess,
    config: CameraProbeConfig,
    shutdown: SystemShutdown,
) {
    let interval = Duration::from_secs_f64(config.check_interval_s.max(1.0));
    let timeout = Duration::from_secs_f64(config.check_timeout_s.max(0.1));
    info!("Camera status monitor started, checking every {interval:?}");

    loop {
        check_all_cameras(&store, timeout).await;
        if shutdown.wrap(tokio::time::sleep(interval)).await.is_none() {
            break;
        }
    }
    info!("Camera status monitor stopped");
}

pub async fn check_all_cameras(store: &StoreAccess, timeout: Duration) -> usize {
    let mut session = match store.open().await {
        Ok(session) => session,
        Err(e) => {
            warn!("Camera status check skipped, store unavailable: {e}");
            return 0;
        }
    };
    let cameras = match session.cameras().await {
        Ok(cameras) => cameras,
        Err(e) => {
            warn!("Camera status check skipped, store unavailable: {e}");
            return 0;
        }
    };

    let mut changed = 0;
    let mut online = 0;
    for camera in &cameras {
        let status = if probe_endpoint(&camera.url, timeout).await {
            CameraStatus::Online
        } else {
            CameraStatus::Offline
        };
        if status == CameraStatus::Online {
            online += 1;
        } else {
            warn!(
                "Camera offline: {} ({}) - {}",
                camera.name, camera.id, camera.url
            );
        }
        if status != camera.status {
            changed += 1;
            if let Err(e) = session.update_camera_status(&camera.id, status).await {
                warn!("Could not persist status of camera {}: {e}", camera.id);
            }
        }
    }

    info!(
        "Camera status check completed: {online}/{} online, {changed} status changed",
        cameras.len()
    );
    changed
}

/// TCP reachability of the stream endpoint. RTSP defaults to port 554,
/// HTTP-style URLs to 80.
async fn probe_endpoint(url: &str, timeout: Duration) -> bool {
    let Some((host, port)) = endpoint_of(url) else {
        debug!("Cannot derive an endpoint from '{url}'");
        return false;
    };
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host.as_str(), port))).await,
        Ok(Ok(_))
    )
}

fn endpoint_of(url: &str) -> Option<(String, u16)> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }

    let default_port = match scheme {
        "rtsp" | "rtsps" => 554,
        "https" => 443,
        _ => 80,
    };
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_owned(), port.parse().unwrap_or(default_port))),
        None => Some((authority.to_owned(), default_port)),
    }
}
