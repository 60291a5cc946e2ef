use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use image::RgbImage;
use rigi::{
    broker::{Broker, AI_ALERT_CHANNEL},
    mapper::{CameraRecord, CameraStatus, StorageError, StoreAccess},
    GenericConfig, Payload,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    capture::{CaptureError, CaptureFactory, FrameSource},
    detector::{annotate, Detector, DetectorFactory},
    frame_cache::FrameCache,
};

/// `detection` section of the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_path: Option<PathBuf>,
    pub interval_s: f64,
    pub auto_monitor: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            interval_s: 0.1,
            auto_monitor: false,
        }
    }
}

impl From<&GenericConfig> for DetectionConfig {
    fn from(config: &GenericConfig) -> Self {
        let mut parsed = config.get_or_default::<DetectionConfig>("detection");
        parsed.model_path = parsed
            .model_path
            .map(|path| config.instrument_relative(path));
        parsed
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MonitorError {
    #[error("No detection model configured")]
    ModelNotConfigured,

    #[error("Detector unavailable: {0}")]
    Detector(#[source] anyhow::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("No camera bound in AI settings")]
    NoCameraBound,

    #[error("AI detection is disabled in settings")]
    Disabled,

    #[error("Bound camera '{0}' not found")]
    CameraNotFound(String),

    #[error("Bound camera '{0}' is offline")]
    CameraOffline(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub is_running: bool,
    pub check_interval_seconds: f64,
    pub last_check_time: Option<DateTime<Utc>>,
    pub total_detections: u64,
    pub total_persons_detected: u64,
    pub camera_name: Option<String>,
}

#[derive(Debug, Default)]
struct MonitorShared {
    detection_count: AtomicU64,
    persons_total: AtomicU64,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

/// Background person-detection over the camera bound in the AI settings.
/// `start` resolves the binding, loads the detector and opens the stream;
/// any failure is reported and leaves the monitor observable as
/// not-running. The loop stores every processed frame in the frame cache
/// and publishes an `ai_alert` whenever persons are found.
pub struct DetectionMonitor {
    broker: Arc<Broker>,
    store: StoreAccess,
    cache: Arc<FrameCache>,
    detectors: DetectorFactory,
    captures: CaptureFactory,
    config: DetectionConfig,
    running: Mutex<Option<RunningLoop>>,
    camera: Mutex<Option<CameraRecord>>,
    shared: Arc<MonitorShared>,
}

impl DetectionMonitor {
    pub fn new(
        broker: Arc<Broker>,
        store: StoreAccess,
        cache: Arc<FrameCache>,
        detectors: DetectorFactory,
        captures: CaptureFactory,
        config: DetectionConfig,
    ) -> Self {
        Self {
            broker,
            store,
            cache,
            detectors,
            captures,
            config,
            running: Default::default(),
            camera: Default::default(),
            shared: Default::default(),
        }
    }

    pub fn auto_monitor_enabled(&self) -> bool {
        self.config.auto_monitor
    }

    pub async fn start(&self) -> Result<(), MonitorError> {
        if self.running.lock().expect("Not poisoned").is_some() {
            warn!("Detection monitor is already running");
            return Ok(());
        }

        let model_path = self
            .config
            .model_path
            .as_deref()
            .ok_or(MonitorError::ModelNotConfigured)?;

        let mut session = self.store.open().await?;
        let settings = session
            .ai_settings()
            .await?
            .ok_or(MonitorError::NoCameraBound)?;
        if !settings.enabled {
            return Err(MonitorError::Disabled);
        }
        let camera_id = settings.camera_id.ok_or(MonitorError::NoCameraBound)?;

        let camera = session
            .cameras()
            .await?
            .into_iter()
            .find(|c| c.id == camera_id)
            .ok_or_else(|| MonitorError::CameraNotFound(camera_id.clone()))?;
        if camera.status != CameraStatus::Online {
            return Err(MonitorError::CameraOffline(camera.name));
        }

        let detector = self
            .detectors
            .load(model_path, settings.confidence_threshold as f32)
            .map_err(MonitorError::Detector)?;
        let source = self.captures.open(&camera.url)?;

        let interval = Duration::from_secs_f64(self.config.interval_s.max(0.001));
        let (stop, stop_rx) = watch::channel(false);
        let join = tokio::spawn(detection_loop(
            detector,
            source,
            camera.clone(),
            interval,
            self.broker.clone(),
            self.cache.clone(),
            self.shared.clone(),
            stop_rx,
        ));

        *self.camera.lock().expect("Not poisoned") = Some(camera);
        *self.running.lock().expect("Not poisoned") = Some(RunningLoop { stop, join });
        info!(
            "Person detection monitor started, running every {:?}",
            interval
        );
        Ok(())
    }

    /// Stops the loop, releases the capture (dropped with the loop) and
    /// clears the camera binding. Cached frames stay readable.
    pub async fn stop(&self) {
        let running = self.running.lock().expect("Not poisoned").take();
        match running {
            Some(running) => {
                running.stop.send(true).ok();
                running.join.await.ok();
                info!("Person detection monitor stopped");
            }
            None => warn!("Detection monitor is not running"),
        }
        *self.camera.lock().expect("Not poisoned") = None;
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            is_running: self.running.lock().expect("Not poisoned").is_some(),
            check_interval_seconds: self.config.interval_s,
            last_check_time: *self.shared.last_check.lock().expect("Not poisoned"),
            total_detections: self.shared.detection_count.load(Ordering::Relaxed),
            total_persons_detected: self.shared.persons_total.load(Ordering::Relaxed),
            camera_name: self
                .camera
                .lock()
                .expect("Not poisoned")
                .as_ref()
                .map(|c| c.name.clone()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn detection_loop(
    mut detector: Box<dyn Detector>,
    mut source: Box<dyn FrameSource>,
    camera: CameraRecord,
    interval: Duration,
    broker: Arc<Broker>,
    cache: Arc<FrameCache>,
    shared: Arc<MonitorShared>,
    mut stop: watch::Receiver<bool>,
) {
    info!("Detection loop started for camera '{}'", camera.name);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                run_detection_cycle(
                    detector.as_mut(),
                    source.as_mut(),
                    &camera,
                    &broker,
                    &cache,
                    &shared,
                );
            }
        }
    }
    info!("Detection loop stopped for camera '{}'", camera.name);
}

fn run_detection_cycle(
    detector: &mut dyn Detector,
    source: &mut dyn FrameSource,
    camera: &CameraRecord,
    broker: &Broker,
    cache: &FrameCache,
    shared: &MonitorShared,
) {
    shared.detection_count.fetch_add(1, Ordering::Relaxed);

    let frame: RgbImage = match source.read_latest() {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!("No new frame from camera '{}'", camera.name);
            return;
        }
        Err(e) => {
            warn!("Frame capture failed on '{}', skipping cycle: {e}", camera.name);
            return;
        }
    };

    let detections = match detector.detect(&frame) {
        Ok(detections) => detections,
        Err(e) => {
            warn!("Detection failed on '{}', skipping cycle: {e}", camera.name);
            return;
        }
    };

    let annotated = annotate(&frame, &detections);
    let captured_at = Utc::now();
    cache.store(&camera.id, &frame, &annotated, captured_at, &detections);
    *shared.last_check.lock().expect("Not poisoned") = Some(captured_at);

    let persons: Vec<_> = detections.into_iter().filter(|d| d.is_person()).collect();
    if persons.is_empty() {
        debug!("No persons detected on camera '{}'", camera.name);
        return;
    }

    shared
        .persons_total
        .fetch_add(persons.len() as u64, Ordering::Relaxed);
    info!(
        "Detected {} person(s) on camera '{}' ({})",
        persons.len(),
        camera.name,
        camera.id
    );

    let confidence = persons.iter().map(|p| p.score).fold(0.0f32, f32::max);
    let severity = if persons.len() > 1 { "high" } else { "medium" };
    let payload: Payload = serde_json::from_value(json!({
        "alert_type": "person_detected",
        "severity": severity,
        "camera_id": camera.id,
        "camera_name": camera.name,
        "person_count": persons.len(),
        "detections": persons,
        "timestamp": captured_at.to_rfc3339(),
        "confidence": confidence,
    }))
    .expect("Literal is an object");

    match broker.publish(AI_ALERT_CHANNEL, payload) {
        Ok(result) if !result.success => {
            error!("Alert publish rejected: {:?}", result.errors)
        }
        Ok(_) => {}
        Err(e) => error!("Alert publish failed: {e}"),
    }
}
