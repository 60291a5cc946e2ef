use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Stored data cannot be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Online,
    Offline,
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CameraStatus::Online => "online",
            CameraStatus::Offline => "offline",
        })
    }
}

/// Camera row as stored in the relational catalog. `directions` is the
/// JSON-array column associating the camera with motion directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub status: CameraStatus,
    #[serde(default)]
    pub directions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleRangeRecord {
    pub id: String,
    pub name: String,
    pub min_angle: f64,
    pub max_angle: f64,
    pub enabled: bool,
    #[serde(default)]
    pub camera_ids: Vec<String>,
}

impl AngleRangeRecord {
    pub fn contains(&self, angle: f64) -> bool {
        self.min_angle <= angle && angle <= self.max_angle
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiSettingsRecord {
    pub id: String,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub camera_name: Option<String>,
    #[serde(default)]
    pub camera_url: Option<String>,
    pub confidence_threshold: f64,
    #[serde(default)]
    pub danger_zone: Option<serde_json::Value>,
    #[serde(default)]
    pub warning_zone: Option<serde_json::Value>,
    pub sound_alarm: bool,
    pub visual_alarm: bool,
    pub auto_screenshot: bool,
    pub alarm_cooldown: f64,
    pub enabled: bool,
}

/// Full catalog content, shared between store implementations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub cameras: Vec<CameraRecord>,
    #[serde(default)]
    pub angle_ranges: Vec<AngleRangeRecord>,
    #[serde(default)]
    pub ai_settings: Option<AiSettingsRecord>,
}

/// Unit of work against the relational store. Implementations are expected
/// to be short-lived: one session per query, never held across retries.
#[async_trait]
pub trait StoreSession: Send {
    async fn cameras(&mut self) -> Result<Vec<CameraRecord>, StorageError>;
    async fn angle_ranges(&mut self) -> Result<Vec<AngleRangeRecord>, StorageError>;
    async fn ai_settings(&mut self) -> Result<Option<AiSettingsRecord>, StorageError>;
    async fn update_camera_status(
        &mut self,
        camera_id: &str,
        status: CameraStatus,
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn StoreSession>, StorageError>;
}

/// Cloneable handle to the configured store backend, resolvable through the
/// service provider.
#[derive(Clone)]
pub struct StoreAccess(Arc<dyn SessionFactory>);

impl StoreAccess {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self(factory)
    }

    pub async fn open(&self) -> Result<Box<dyn StoreSession>, StorageError> {
        self.0.open().await
    }
}
