use std::{collections::BTreeSet, sync::Arc};

use indexmap::IndexMap;
use minfac::{Registered, ServiceCollection};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info};

use crate::{
    broker::{AI_ALERT_CHANNEL, ANGLE_CHANNEL, DIRECTION_CHANNEL},
    recovery::Recovery,
    value::{get_f64, get_str, Payload},
};

#[cfg(any(test, feature = "unstable"))]
mod memory;
mod store;

#[cfg(any(test, feature = "unstable"))]
pub use memory::MemoryStore;
pub use store::*;

pub(crate) fn register_services(c: &mut ServiceCollection) {
    c.with::<(Registered<StoreAccess>, Registered<Arc<Recovery>>)>()
        .register(|(store, recovery)| CameraMapper::new(store, recovery));
}

/// Camera as attached to dispatched events and outbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub id: String,
    pub name: String,
    pub url: String,
    pub status: CameraStatus,
    pub directions: Vec<String>,
}

impl From<CameraRecord> for CameraDescriptor {
    fn from(record: CameraRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            url: record.url,
            status: record.status,
            directions: record.directions,
        }
    }
}

/// Angle range with its resolved cameras, for "current state" snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AngleRangeOverview {
    pub id: String,
    pub name: String,
    pub min_angle: f64,
    pub max_angle: f64,
    pub cameras: Vec<CameraDescriptor>,
}

/// Resolves events to the cameras responsible for them via the relational
/// store. Every operation is total: storage faults are retried, degraded to
/// the last cached result and finally to an empty list, but never surface.
#[derive(Clone)]
pub struct CameraMapper {
    store: StoreAccess,
    recovery: Arc<Recovery>,
}

impl CameraMapper {
    pub fn new(store: StoreAccess, recovery: Arc<Recovery>) -> Self {
        info!("Camera mapper initialized");
        Self { store, recovery }
    }

    /// Stored direction strings accepted for a direction-of-travel term.
    /// The turn commands additionally match their short forms.
    fn acceptable_directions(direction: &str) -> SmallVec<[&str; 2]> {
        match direction {
            "turn_left" => smallvec!["turn_left", "left"],
            "turn_right" => smallvec!["turn_right", "right"],
            other => smallvec![other],
        }
    }

    pub async fn cameras_by_direction(&self, direction: &str) -> Vec<CameraDescriptor> {
        let operation = format!("cameras_by_direction({direction})");
        let store = self.store.clone();
        let result = self
            .recovery
            .run_cached(&operation, || {
                let store = store.clone();
                async move {
                    let accepted = Self::acceptable_directions(direction);
                    let cameras = store.open().await?.cameras().await?;
                    Ok::<_, StorageError>(
                        cameras
                            .into_iter()
                            .filter(|c| {
                                c.enabled
                                    && c.directions
                                        .iter()
                                        .any(|d| accepted.contains(&d.as_str()))
                            })
                            .map(CameraDescriptor::from)
                            .collect::<Vec<_>>(),
                    )
                }
            })
            .await
            .unwrap_or_default();

        debug!(
            "Found {} cameras for direction '{direction}'",
            result.len()
        );
        result
    }

    /// Cameras associated with any enabled angle range containing `angle`.
    /// A camera referenced by several matching ranges appears once.
    pub async fn cameras_by_angle(&self, angle: f64) -> Vec<CameraDescriptor> {
        let operation = format!("cameras_by_angle({angle})");
        let store = self.store.clone();
        let result = self
            .recovery
            .run_cached(&operation, || {
                let store = store.clone();
                async move {
                    let mut session = store.open().await?;
                    let camera_ids: BTreeSet<String> = session
                        .angle_ranges()
                        .await?
                        .into_iter()
                        .filter(|r| r.enabled && r.contains(angle))
                        .flat_map(|r| r.camera_ids)
                        .collect();

                    if camera_ids.is_empty() {
                        return Ok::<_, StorageError>(Vec::new());
                    }

                    Ok(session
                        .cameras()
                        .await?
                        .into_iter()
                        .filter(|c| c.enabled && camera_ids.contains(&c.id))
                        .map(CameraDescriptor::from)
                        .collect())
                }
            })
            .await
            .unwrap_or_default();

        debug!("Found {} cameras for angle {angle}°", result.len());
        result
    }

    /// Reserved: alerts carry their camera context in the payload, so no
    /// relational resolution happens yet. The signature must not change
    /// when an implementation arrives.
    pub async fn cameras_by_alert(&self, alert: &Payload) -> Vec<CameraDescriptor> {
        debug!(
            "Alert camera mapping requested for '{}', returning none",
            get_str(alert, "alert_type").unwrap_or("unknown")
        );
        Vec::new()
    }

    /// Per-command camera lists, sent to freshly connected consumers.
    pub async fn all_direction_mappings(&self) -> IndexMap<String, Vec<CameraDescriptor>> {
        let mut mappings = IndexMap::new();
        for direction in crate::broker::VALID_COMMANDS {
            mappings.insert(
                direction.to_owned(),
                self.cameras_by_direction(direction).await,
            );
        }
        mappings
    }

    pub async fn all_angle_ranges(&self) -> Vec<AngleRangeOverview> {
        let operation = "all_angle_ranges";
        let store = self.store.clone();
        let ranges = self
            .recovery
            .run_cached(operation, || {
                let store = store.clone();
                async move {
                    let ranges = store.open().await?.angle_ranges().await?;
                    Ok::<_, StorageError>(
                        ranges.into_iter().filter(|r| r.enabled).collect::<Vec<_>>(),
                    )
                }
            })
            .await
            .unwrap_or_default();

        let mut result = Vec::with_capacity(ranges.len());
        for range in ranges {
            let midpoint = (range.min_angle + range.max_angle) / 2.0;
            result.push(AngleRangeOverview {
                cameras: self.cameras_by_angle(midpoint).await,
                id: range.id,
                name: range.name,
                min_angle: range.min_angle,
                max_angle: range.max_angle,
            });
        }
        result
    }

    /// Camera resolution as used by the data manager: the channel decides
    /// which lookup applies. Unknown channels resolve to no cameras.
    pub async fn resolve_for_event(&self, channel: &str, payload: &Payload) -> Vec<CameraDescriptor> {
        match channel {
            DIRECTION_CHANNEL => match get_str(payload, "command") {
                Some(command) => self.cameras_by_direction(command).await,
                None => Vec::new(),
            },
            ANGLE_CHANNEL => match get_f64(payload, "angle") {
                Some(angle) => self.cameras_by_angle(angle).await,
                None => Vec::new(),
            },
            AI_ALERT_CHANNEL => self.cameras_by_alert(payload).await,
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn camera(id: &str, directions: &[&str], enabled: bool) -> CameraRecord {
        CameraRecord {
            id: id.to_owned(),
            name: format!("Camera {id}"),
            url: format!("rtsp://cams/{id}"),
            enabled,
            status: CameraStatus::Online,
            directions: directions.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn range(id: &str, min: f64, max: f64, cameras: &[&str], enabled: bool) -> AngleRangeRecord {
        AngleRangeRecord {
            id: id.to_owned(),
            name: format!("Range {id}"),
            min_angle: min,
            max_angle: max,
            enabled,
            camera_ids: cameras.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn mapper_with(catalog: Catalog) -> (CameraMapper, MemoryStore) {
        let store = MemoryStore::new(catalog);
        let mapper = CameraMapper::new(
            StoreAccess::new(Arc::new(store.clone())),
            Arc::new(Recovery::new()),
        );
        (mapper, store)
    }

    #[tokio::test]
    async fn direction_alias_matches_once() {
        let (mapper, _) = mapper_with(Catalog {
            cameras: vec![
                camera("a", &["turn_left", "left"], true),
                camera("b", &["left"], true),
                camera("c", &["right"], true),
                camera("d", &["turn_left"], false),
            ],
            ..Default::default()
        });

        let cameras = mapper.cameras_by_direction("turn_left").await;
        let ids: Vec<_> = cameras.iter().map(|c| c.id.as_str()).collect();
        // "a" matches both acceptable strings but appears once; disabled
        // "d" is filtered
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn unmapped_direction_matches_itself() {
        let (mapper, _) = mapper_with(Catalog {
            cameras: vec![camera("f", &["forward"], true)],
            ..Default::default()
        });
        assert_eq!(mapper.cameras_by_direction("forward").await.len(), 1);
        assert!(mapper.cameras_by_direction("backward").await.is_empty());
    }

    #[tokio::test]
    async fn angle_lookup_unions_ranges() {
        let (mapper, _) = mapper_with(Catalog {
            cameras: vec![
                camera("a", &[], true),
                camera("b", &[], true),
                camera("c", &[], false),
            ],
            angle_ranges: vec![
                range("r1", 0.0, 90.0, &["a", "c"], true),
                range("r2", 45.0, 180.0, &["a", "b"], true),
                range("r3", 0.0, 360.0, &["b"], false),
            ],
            ..Default::default()
        });

        let cameras = mapper.cameras_by_angle(50.0).await;
        let ids: Vec<_> = cameras.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        assert!(mapper.cameras_by_angle(-10.0).await.is_empty());
    }

    #[tokio::test]
    async fn angle_range_bounds_are_inclusive() {
        let (mapper, _) = mapper_with(Catalog {
            cameras: vec![camera("a", &[], true)],
            angle_ranges: vec![range("r", -45.0, 45.0, &["a"], true)],
            ..Default::default()
        });
        assert_eq!(mapper.cameras_by_angle(-45.0).await.len(), 1);
        assert_eq!(mapper.cameras_by_angle(45.0).await.len(), 1);
        assert!(mapper.cameras_by_angle(45.01).await.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_degrades_to_cached_result() {
        let (mapper, store) = mapper_with(Catalog {
            cameras: vec![camera("a", &["forward"], true)],
            ..Default::default()
        });

        assert_eq!(mapper.cameras_by_direction("forward").await.len(), 1);

        // All retry attempts fail, the previous result is served
        store.fail_times(10);
        assert_eq!(mapper.cameras_by_direction("forward").await.len(), 1);
    }

    #[tokio::test]
    async fn storage_failure_without_cache_yields_empty() {
        let (mapper, store) = mapper_with(Default::default());
        store.fail_times(10);
        assert!(mapper.cameras_by_direction("forward").await.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_retry_budget() {
        let (mapper, store) = mapper_with(Catalog {
            cameras: vec![camera("a", &["forward"], true)],
            ..Default::default()
        });
        store.fail_times(2);
        assert_eq!(mapper.cameras_by_direction("forward").await.len(), 1);
    }

    #[tokio::test]
    async fn alert_resolution_is_reserved() {
        let (mapper, _) = mapper_with(Default::default());
        let alert: Payload =
            serde_json::from_value(json!({"alert_type": "person_detected"})).unwrap();
        assert!(mapper.cameras_by_alert(&alert).await.is_empty());
    }

    #[tokio::test]
    async fn state_snapshots() {
        let (mapper, _) = mapper_with(Catalog {
            cameras: vec![camera("a", &["forward"], true)],
            angle_ranges: vec![
                range("r1", 0.0, 90.0, &["a"], true),
                range("r2", 0.0, 90.0, &["a"], false),
            ],
            ..Default::default()
        });

        let mappings = mapper.all_direction_mappings().await;
        assert_eq!(mappings.len(), 5);
        assert_eq!(mappings["forward"].len(), 1);
        assert!(mappings["backward"].is_empty());

        let ranges = mapper.all_angle_ranges().await;
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].cameras.len(), 1);
    }

    #[tokio::test]
    async fn event_resolution_follows_channel() {
        let (mapper, _) = mapper_with(Catalog {
            cameras: vec![camera("a", &["forward"], true)],
            angle_ranges: vec![range("r", 0.0, 90.0, &["a"], true)],
            ..Default::default()
        });

        let direction: Payload = serde_json::from_value(json!({"command": "forward"})).unwrap();
        assert_eq!(
            mapper
                .resolve_for_event(DIRECTION_CHANNEL, &direction)
                .await
                .len(),
            1
        );

        let angle: Payload = serde_json::from_value(json!({"angle": 45.0})).unwrap();
        assert_eq!(
            mapper.resolve_for_event(ANGLE_CHANNEL, &angle).await.len(),
            1
        );

        let alert: Payload = serde_json::from_value(json!({"alert_type": "x"})).unwrap();
        assert!(mapper
            .resolve_for_event(AI_ALERT_CHANNEL, &alert)
            .await
            .is_empty());
        assert!(mapper
            .resolve_for_event("custom", &Payload::new())
            .await
            .is_empty());
    }
}
