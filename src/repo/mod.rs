use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub mod jobs;
pub mod status_log;

pub use jobs::{FileJobStore, JobStore, MemoryJobStore};
pub use status_log::{DiscardSink, JsonLinesSink, MemoryStatusSink, StatusSink};

pub struct Repositories {
    pub status: Arc<dyn StatusSink>,
    pub jobs: Arc<dyn JobStore>,
}

impl Repositories {
    pub fn new(cfg: &Config) -> Result<Self> {
        let status: Arc<dyn StatusSink> = match &cfg.storage.status_log_path {
            Some(path) => {
                info!(path = %path.display(), "status log enabled");
                Arc::new(JsonLinesSink::new(path))
            }
            None => Arc::new(DiscardSink),
        };
        let jobs: Arc<dyn JobStore> = match &cfg.storage.job_store_path {
            Some(path) => {
                info!(path = %path.display(), "job store enabled");
                Arc::new(FileJobStore::new(path))
            }
            None => {
                tracing::warn!("no job store configured; missed runs will not be caught up after restart");
                Arc::new(MemoryJobStore::default())
            }
        };
        Ok(Self { status, jobs })
    }

    pub fn in_memory() -> Self {
        Self {
            status: Arc::new(MemoryStatusSink::default()),
            jobs: Arc::new(MemoryJobStore::default()),
        }
    }
}
