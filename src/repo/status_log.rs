use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::DeviceStatus;

/// Append-only sink for polled device status.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn append(&self, status: &DeviceStatus) -> Result<()>;
}

/// Append without waiting. A failed write is logged and dropped.
pub fn record(sink: &Arc<dyn StatusSink>, status: DeviceStatus) {
    let sink = sink.clone();
    tokio::spawn(async move {
        if let Err(e) = sink.append(&status).await {
            warn!(device_id = %status.device_id, error = %e, "status record not persisted");
        }
    });
}

/// One JSON object per line.
pub struct JsonLinesSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl StatusSink for JsonLinesSink {
    async fn append(&self, status: &DeviceStatus) -> Result<()> {
        let mut line = serde_json::to_vec(status)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DiscardSink;

#[async_trait]
impl StatusSink for DiscardSink {
    async fn append(&self, _status: &DeviceStatus) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    records: parking_lot::Mutex<Vec<DeviceStatus>>,
}

impl MemoryStatusSink {
    pub fn records(&self) -> Vec<DeviceStatus> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn append(&self, status: &DeviceStatus) -> Result<()> {
        self.records.lock().push(status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatteryStatus, DeviceId};
    use chrono::Utc;

    fn status(id: u32, soc: u8) -> DeviceStatus {
        DeviceStatus {
            device_id: DeviceId(id),
            battery: BatteryStatus {
                soc,
                charg_flag: false,
                dischrg_flag: true,
                bat_temp: Some(22.0),
                bat_capacity: None,
                rated_capacity: Some(5120.0),
            },
            energy: None,
            mode: None,
            polled_at: Utc::now(),
            partial: true,
        }
    }

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.jsonl");
        let sink = JsonLinesSink::new(&path);
        sink.append(&status(1, 40)).await.unwrap();
        sink.append(&status(2, 80)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["device_id"], 2);
        assert_eq!(lines[1]["battery"]["soc"], 80);
    }

    #[tokio::test]
    async fn unwritable_path_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("missing").join("status.jsonl"));
        assert!(sink.append(&status(1, 40)).await.is_err());
    }
}
