use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use rigi::mapper::{
    AiSettingsRecord, AngleRangeRecord, CameraRecord, CameraStatus, Catalog, SessionFactory,
    StorageError, StoreSession,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Relational-store adapter backed by a single JSON catalog file
/// (`catalog.json` in the runtime root). The catalog is read once at
/// startup; status updates go through the in-memory state and are written
/// back to disk.
pub struct JsonCatalogStore {
    path: PathBuf,
    state: Arc<RwLock<Catalog>>,
}

impl JsonCatalogStore {
    /// Loads the catalog, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let catalog = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No catalog at {path:?}, starting with an empty one");
                Catalog::default()
            }
            Err(e) => return Err(e),
        };

        info!(
            "Catalog loaded from {path:?}: {} cameras, {} angle ranges",
            catalog.cameras.len(),
            catalog.angle_ranges.len()
        );
        Ok(Self {
            path,
            state: Arc::new(RwLock::new(catalog)),
        })
    }

    pub async fn snapshot(&self) -> Catalog {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl SessionFactory for JsonCatalogStore {
    async fn open(&self) -> Result<Box<dyn StoreSession>, StorageError> {
        Ok(Box::new(JsonSession {
            path: self.path.clone(),
            state: self.state.clone(),
        }))
    }
}

struct JsonSession {
    path: PathBuf,
    state: Arc<RwLock<Catalog>>,
}

#[async_trait]
impl StoreSession for JsonSession {
    async fn cameras(&mut self) -> Result<Vec<CameraRecord>, StorageError> {
        Ok(self.state.read().await.cameras.clone())
    }

    async fn angle_ranges(&mut self) -> Result<Vec<AngleRangeRecord>, StorageError> {
        Ok(self.state.read().await.angle_ranges.clone())
    }

    async fn ai_settings(&mut self) -> Result<Option<AiSettingsRecord>, StorageError> {
        Ok(self.state.read().await.ai_settings.clone())
    }

    async fn update_camera_status(
        &mut self,
        camera_id: &str,
        status: CameraStatus,
    ) -> Result<(), StorageError> {
        let snapshot = {
            let mut catalog = self.state.write().await;
            let camera = catalog
                .cameras
                .iter_mut()
                .find(|c| c.id == camera_id)
                .ok_or_else(|| {
                    StorageError::Unavailable(format!("No camera with id '{camera_id}'"))
                })?;
            camera.status = status;
            catalog.clone()
        };

        let serialized = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        if let Err(e) = tokio::fs::write(&self.path, serialized).await {
            // The in-memory state is already updated; the next write
            // retries the file
            warn!("Could not persist catalog to {:?}: {e}", self.path);
        }
        Ok(())
    }
}
