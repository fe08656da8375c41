//! `JobStore` implementations: in memory, or one JSON file per job.

use async_trait::async_trait;
use forge_shared::event_interface::{JobStore, StoreError};
use forge_shared::JobSnapshot;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<Uuid, JobSnapshot>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobSnapshot>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn insert(&self, snapshot: &JobSnapshot) -> Result<(), StoreError> {
        self.records.write().await.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn update(&self, snapshot: &JobSnapshot) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&snapshot.id)
            .ok_or(StoreError::NotFound(snapshot.id))?;
        *record = snapshot.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn load_all(&self) -> Result<Vec<JobSnapshot>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// Stores each job as `<dir>/<uuid>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirJobStore {
    dir: PathBuf,
}

impl JsonDirJobStore {
    /// Creates `dir` if it does not exist.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_of(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, snapshot: &JobSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        fs::write(self.path_of(snapshot.id), json).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonDirJobStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobSnapshot>, StoreError> {
        match fs::read(self.path_of(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&self, snapshot: &JobSnapshot) -> Result<(), StoreError> {
        self.write(snapshot).await
    }

    async fn update(&self, snapshot: &JobSnapshot) -> Result<(), StoreError> {
        if !fs::try_exists(self.path_of(snapshot.id)).await? {
            return Err(StoreError::NotFound(snapshot.id));
        }
        self.write(snapshot).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        match fs::remove_file(self.path_of(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<JobSnapshot>, StoreError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<JobSnapshot>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping unreadable job record {}: {}", path.display(), e),
            }
        }
        Ok(jobs)
    }
}
