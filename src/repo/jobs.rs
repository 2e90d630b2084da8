use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::domain::{JobId, JobRecord};

/// Durable storage for scheduler bookkeeping.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self) -> Result<Vec<JobRecord>>;
    async fn save(&self, record: &JobRecord) -> Result<()>;
}

/// All job records in one JSON file, rewritten atomically on every save.
pub struct FileJobStore {
    path: PathBuf,
    records: Mutex<Option<BTreeMap<JobId, JobRecord>>>,
}

impl FileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    async fn read_file(path: &Path) -> Result<BTreeMap<JobId, JobRecord>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let list: Vec<JobRecord> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt job store {}", path.display()))?;
                Ok(list.into_iter().map(|r| (r.id, r)).collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_file(&self, records: &BTreeMap<JobId, JobRecord>) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let list: Vec<&JobRecord> = records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn load(&self) -> Result<Vec<JobRecord>> {
        let mut guard = self.records.lock().await;
        let records = Self::read_file(&self.path).await?;
        let list = records.values().cloned().collect();
        *guard = Some(records);
        Ok(list)
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let mut guard = self.records.lock().await;
        if guard.is_none() {
            *guard = Some(Self::read_file(&self.path).await?);
        }
        let records = guard.get_or_insert_with(BTreeMap::new);
        records.insert(record.id, record.clone());
        self.write_file(records).await
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    records: parking_lot::Mutex<BTreeMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.records.lock().get(&id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self) -> Result<Vec<JobRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }
}
