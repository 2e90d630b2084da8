use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The fixed set of scheduled jobs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobId {
    ApplyAuto,
    ApplyManual,
    EvaluatePrecharge,
    PollFleet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Ok,
    Failed { error: String },
    /// Trigger fired while the previous run was still going
    Skipped,
}

/// Persisted run bookkeeping of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
    /// Last run was a catch-up for triggers missed while stopped
    #[serde(default)]
    pub misfired: bool,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub skipped_count: u64,
}

impl JobRecord {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            next_run: None,
            last_run: None,
            last_outcome: None,
            misfired: false,
            run_count: 0,
            failure_count: 0,
            skipped_count: 0,
        }
    }
}
