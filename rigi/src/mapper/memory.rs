use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;

use super::store::*;

/// In-memory catalog for tests and embedded setups. `fail_times` makes the
/// next n sessions fail on open, which is how the retry/fallback paths are
/// exercised.
#[derive(Default, Clone)]
pub struct MemoryStore {
    catalog: Arc<RwLock<Catalog>>,
    failing_opens: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Arc::new(RwLock::new(catalog)),
            failing_opens: Default::default(),
        }
    }

    pub fn fail_times(&self, n: u32) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn replace(&self, catalog: Catalog) {
        *self.catalog.write().expect("Not poisoned") = catalog;
    }

    pub fn snapshot(&self) -> Catalog {
        self.catalog.read().expect("Not poisoned").clone()
    }
}

#[async_trait]
impl SessionFactory for MemoryStore {
    async fn open(&self) -> Result<Box<dyn StoreSession>, StorageError> {
        let remaining = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |x| x.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(StorageError::Unavailable(
                "Injected connection failure".into(),
            ));
        }
        Ok(Box::new(MemorySession {
            catalog: self.catalog.clone(),
        }))
    }
}

struct MemorySession {
    catalog: Arc<RwLock<Catalog>>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn cameras(&mut self) -> Result<Vec<CameraRecord>, StorageError> {
        Ok(self.catalog.read().expect("Not poisoned").cameras.clone())
    }

    async fn angle_ranges(&mut self) -> Result<Vec<AngleRangeRecord>, StorageError> {
        Ok(self
            .catalog
            .read()
            .expect("Not poisoned")
            .angle_ranges
            .clone())
    }

    async fn ai_settings(&mut self) -> Result<Option<AiSettingsRecord>, StorageError> {
        Ok(self
            .catalog
            .read()
            .expect("Not poisoned")
            .ai_settings
            .clone())
    }

    async fn update_camera_status(
        &mut self,
        camera_id: &str,
        status: CameraStatus,
    ) -> Result<(), StorageError> {
        let mut catalog = self.catalog.write().expect("Not poisoned");
        match catalog.cameras.iter_mut().find(|c| c.id == camera_id) {
            Some(camera) => {
                camera.status = status;
                Ok(())
            }
            None => Err(StorageError::Unavailable(format!(
                "No camera with id '{camera_id}'"
            ))),
        }
    }
}
