use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use chrono::{DateTime, Utc};
use image::RgbImage;
use tracing::{debug, info};

use crate::detector::Detection;

/// What a stream consumer gets back for a camera.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub frame: RgbImage,
    pub captured_at: DateTime<Utc>,
    /// Present when the annotated frame was requested.
    pub detections: Option<Vec<Detection>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FrameInfo {
    pub camera_id: String,
    pub has_raw: bool,
    pub has_drawn: bool,
    pub captured_at: Option<DateTime<Utc>>,
    pub age_seconds: Option<f64>,
    pub detection_count: usize,
    pub person_count: usize,
}

#[derive(Debug)]
struct CameraFrames {
    raw: RgbImage,
    annotated: RgbImage,
    captured_at: DateTime<Utc>,
    detections: Vec<Detection>,
}

/// Last captured frame per camera, raw and with detection overlays.
/// Partitioned by camera id with one lock per camera; writes store copies
/// and reads hand out copies, so no consumer ever aliases the detection
/// loop's buffers. Entries persist until an explicit clear.
#[derive(Debug, Default)]
pub struct FrameCache {
    slots: RwLock<HashMap<String, Arc<Mutex<Option<CameraFrames>>>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, camera_id: &str) -> Arc<Mutex<Option<CameraFrames>>> {
        if let Some(slot) = self.slots.read().expect("Not poisoned").get(camera_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .expect("Not poisoned")
            .entry(camera_id.to_owned())
            .or_default()
            .clone()
    }

    pub fn store(
        &self,
        camera_id: &str,
        raw: &RgbImage,
        annotated: &RgbImage,
        captured_at: DateTime<Utc>,
        detections: &[Detection],
    ) {
        let slot = self.slot(camera_id);
        *slot.lock().expect("Not poisoned") = Some(CameraFrames {
            raw: raw.clone(),
            annotated: annotated.clone(),
            captured_at,
            detections: detections.to_vec(),
        });
    }

    /// Latest frame for a camera; `drawn` selects the annotated variant
    /// (which also carries the detection list). Absence is a regular
    /// `None`, not an error.
    pub fn read_latest(&self, camera_id: &str, drawn: bool) -> Option<FrameSnapshot> {
        let slot = self.slot(camera_id);
        let guard = slot.lock().expect("Not poisoned");
        let frames = match guard.as_ref() {
            Some(frames) => frames,
            None => {
                debug!("No frames stored for camera {camera_id}");
                return None;
            }
        };
        Some(FrameSnapshot {
            frame: if drawn {
                frames.annotated.clone()
            } else {
                frames.raw.clone()
            },
            captured_at: frames.captured_at,
            detections: drawn.then(|| frames.detections.clone()),
        })
    }

    pub fn info(&self, camera_id: &str) -> FrameInfo {
        let slot = self.slot(camera_id);
        let guard = slot.lock().expect("Not poisoned");
        match guard.as_ref() {
            Some(frames) => FrameInfo {
                camera_id: camera_id.to_owned(),
                has_raw: true,
                has_drawn: true,
                captured_at: Some(frames.captured_at),
                age_seconds: Some(
                    (Utc::now() - frames.captured_at)
                        .to_std()
                        .unwrap_or_default()
                        .as_secs_f64(),
                ),
                detection_count: frames.detections.len(),
                person_count: frames.detections.iter().filter(|d| d.is_person()).count(),
            },
            None => FrameInfo {
                camera_id: camera_id.to_owned(),
                has_raw: false,
                has_drawn: false,
                captured_at: None,
                age_seconds: None,
                detection_count: 0,
                person_count: 0,
            },
        }
    }

    /// Drops the stored frames for one camera, or for all of them.
    pub fn clear(&self, camera_id: Option<&str>) {
        match camera_id {
            Some(camera_id) => {
                let slot = self.slot(camera_id);
                *slot.lock().expect("Not poisoned") = None;
                info!("Cleared frame storage for camera {camera_id}");
            }
            None => {
                for slot in self.slots.read().expect("Not poisoned").values() {
                    *slot.lock().expect("Not poisoned") = None;
                }
                info!("Cleared all frame storage");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::PERSON_CLASS_ID;

    fn image(value: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, image::Rgb([value, value, value]))
    }

    fn person(score: f32) -> Detection {
        Detection {
            bbox: [0.0, 0.0, 2.0, 2.0],
            score,
            class_name: "person".into(),
            class_id: PERSON_CLASS_ID,
        }
    }

    #[test]
    fn absent_camera_reads_as_none() {
        let cache = FrameCache::new();
        assert!(cache.read_latest("cam-1", true).is_none());
        let info = cache.info("cam-1");
        assert!(!info.has_raw);
        assert_eq!(info.person_count, 0);
    }

    #[test]
    fn reads_return_the_requested_variant() {
        let cache = FrameCache::new();
        cache.store("cam-1", &image(0), &image(255), Utc::now(), &[person(0.9)]);

        let raw = cache.read_latest("cam-1", false).unwrap();
        assert_eq!(raw.frame.get_pixel(0, 0).0, [0, 0, 0]);
        assert!(raw.detections.is_none());

        let drawn = cache.read_latest("cam-1", true).unwrap();
        assert_eq!(drawn.frame.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(drawn.detections.unwrap().len(), 1);
    }

    #[test]
    fn reads_are_copies() {
        let cache = FrameCache::new();
        cache.store("cam-1", &image(10), &image(10), Utc::now(), &[]);

        let mut snapshot = cache.read_latest("cam-1", false).unwrap();
        snapshot.frame.put_pixel(0, 0, image::Rgb([9, 9, 9]));

        let unchanged = cache.read_latest("cam-1", false).unwrap();
        assert_eq!(unchanged.frame.get_pixel(0, 0).0, [10, 10, 10]);
    }

    #[test]
    fn last_writer_wins_per_camera() {
        let cache = FrameCache::new();
        cache.store("cam-1", &image(1), &image(1), Utc::now(), &[]);
        cache.store("cam-1", &image(2), &image(2), Utc::now(), &[person(0.5)]);

        let snapshot = cache.read_latest("cam-1", false).unwrap();
        assert_eq!(snapshot.frame.get_pixel(0, 0).0, [2, 2, 2]);
        assert_eq!(cache.info("cam-1").detection_count, 1);
    }

    #[test]
    fn info_counts_persons() {
        let cache = FrameCache::new();
        let other = Detection {
            bbox: [0.0; 4],
            score: 0.8,
            class_name: "bicycle".into(),
            class_id: 1,
        };
        cache.store(
            "cam-1",
            &image(0),
            &image(0),
            Utc::now(),
            &[person(0.9), person(0.7), other],
        );
        let info = cache.info("cam-1");
        assert_eq!(info.detection_count, 3);
        assert_eq!(info.person_count, 2);
        assert!(info.age_seconds.unwrap() < 5.0);
    }

    #[test]
    fn clear_specific_and_all() {
        let cache = FrameCache::new();
        cache.store("cam-1", &image(0), &image(0), Utc::now(), &[]);
        cache.store("cam-2", &image(0), &image(0), Utc::now(), &[]);

        cache.clear(Some("cam-1"));
        assert!(cache.read_latest("cam-1", true).is_none());
        assert!(cache.read_latest("cam-2", true).is_some());

        cache.clear(None);
        assert!(cache.read_latest("cam-2", true).is_none());
    }
}
