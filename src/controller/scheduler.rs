//! Durable job scheduler.
//!
//! Every job has one trigger loop. A run only starts if the job's guard is free,
//! so an overlapping trigger is skipped rather than queued. Bookkeeping is
//! persisted after every state change; a `next_run` found in the past at start
//! produces exactly one catch-up run.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::clock::Clock;
use crate::config::{parse_hhmm, TriggerSpec};
use crate::domain::{JobId, JobRecord, RunOutcome};
use crate::repo::JobStore;

/// Longest single sleep of a trigger loop; wall-clock jumps are picked up after at most this long.
const MAX_NAP: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid trigger for job {job}: {reason}")]
    InvalidTrigger { job: String, reason: String },
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("scheduler is not running")]
    NotRunning,
    #[error("scheduler was already started")]
    AlreadyStarted,
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Every day at a local wall-clock time
    Daily { at: NaiveTime, tz: Tz },
    Every { interval: Duration },
}

impl Trigger {
    pub fn from_spec(job: JobId, spec: &TriggerSpec, tz: Tz) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidTrigger {
            job: job.to_string(),
            reason,
        };
        match spec {
            TriggerSpec::Daily { at } => Ok(Trigger::Daily {
                at: parse_hhmm(at).map_err(invalid)?,
                tz,
            }),
            TriggerSpec::Every { minutes: 0 } => Err(invalid("interval must be at least one minute".into())),
            TriggerSpec::Every { minutes } => Ok(Trigger::Every {
                interval: Duration::from_secs(minutes.saturating_mul(60)),
            }),
        }
    }

    /// First fire time strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Trigger::Every { interval } => {
                t + ChronoDuration::from_std(*interval).unwrap_or_else(|_| ChronoDuration::days(1))
            }
            Trigger::Daily { at, tz } => {
                let mut date = t.with_timezone(tz).date_naive();
                for _ in 0..3 {
                    if let Some(candidate) = resolve_local(tz, date.and_time(*at)) {
                        if candidate > t {
                            return candidate;
                        }
                    }
                    date += ChronoDuration::days(1);
                }
                t + ChronoDuration::days(1)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Daily { at, tz } => format!("daily at {} {}", at.format("%H:%M"), tz),
            Trigger::Every { interval } => format!("every {} min", interval.as_secs() / 60),
        }
    }
}

/// Local time to UTC. Ambiguous times take the earlier instant; times inside a
/// DST gap move forward by an hour.
fn resolve_local(tz: &Tz, local: chrono::NaiveDateTime) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + ChronoDuration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Work executed when a job fires. Must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: JobId, fired_at: DateTime<Utc>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Lifecycle {
    Initialized,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireKind {
    Scheduled,
    CatchUp,
    Manual,
}

/// What happened to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FireResult {
    Started,
    /// Previous run still in progress
    Skipped,
    /// Scheduler is shutting down
    Refused,
}

/// Externally visible state of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescriptor {
    pub trigger: String,
    pub running: bool,
    #[serde(flatten)]
    pub record: JobRecord,
}

struct JobSlot {
    id: JobId,
    trigger: Trigger,
    guard: Arc<Mutex<()>>,
    record: parking_lot::Mutex<JobRecord>,
}

pub struct Scheduler {
    jobs: BTreeMap<JobId, Arc<JobSlot>>,
    handler: Arc<dyn JobHandler>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
    // Held while deciding to start a run and while cancelling, so no run can slip past shutdown.
    gate: parking_lot::Mutex<()>,
    cancel: CancellationToken,
    runs: TaskTracker,
    loops: TaskTracker,
}

impl Scheduler {
    pub fn new(
        jobs: Vec<(JobId, Trigger)>,
        handler: Arc<dyn JobHandler>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let jobs = jobs
            .into_iter()
            .map(|(id, trigger)| {
                let slot = JobSlot {
                    id,
                    trigger,
                    guard: Arc::new(Mutex::new(())),
                    record: parking_lot::Mutex::new(JobRecord::new(id)),
                };
                (id, Arc::new(slot))
            })
            .collect();
        Self {
            jobs,
            handler,
            store,
            clock,
            lifecycle: parking_lot::Mutex::new(Lifecycle::Initialized),
            gate: parking_lot::Mutex::new(()),
            cancel: CancellationToken::new(),
            runs: TaskTracker::new(),
            loops: TaskTracker::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Restore persisted bookkeeping and start one trigger loop per job.
    pub async fn start(self: &Arc<Self>) -> Result<(), ScheduleError> {
        {
            let mut state = self.lifecycle.lock();
            if *state != Lifecycle::Initialized {
                return Err(ScheduleError::AlreadyStarted);
            }
            *state = Lifecycle::Running;
        }

        let persisted: BTreeMap<JobId, JobRecord> = match self.store.load().await {
            Ok(list) => list.into_iter().map(|r| (r.id, r)).collect(),
            Err(e) => {
                warn!(error = %e, "job store unreadable; starting with fresh job state");
                BTreeMap::new()
            }
        };

        let now = self.clock.now();
        for slot in self.jobs.values() {
            let upcoming = slot.trigger.next_after(now);
            let restored = persisted.get(&slot.id).cloned();
            let catch_up = restored
                .as_ref()
                .and_then(|r| r.next_run)
                .is_some_and(|due| due <= now);

            let record = {
                let mut record = slot.record.lock();
                if let Some(restored) = restored {
                    *record = restored;
                }
                record.next_run = match record.next_run {
                    Some(due) if due > now && due < upcoming => Some(due),
                    _ => Some(upcoming),
                };
                record.clone()
            };
            self.persist(&record).await;

            if catch_up {
                info!(job = %slot.id, "trigger missed while stopped; running one catch-up");
            }
            info!(job = %slot.id, trigger = %slot.trigger.describe(), next_run = ?record.next_run, "job scheduled");

            let this = self.clone();
            let slot = slot.clone();
            self.loops.spawn(async move { this.trigger_loop(slot, catch_up).await });
        }
        info!(jobs = self.jobs.len(), "scheduler started");
        Ok(())
    }

    async fn trigger_loop(self: Arc<Self>, slot: Arc<JobSlot>, catch_up: bool) {
        if catch_up {
            self.fire(&slot, FireKind::CatchUp).await;
        }
        loop {
            let next_run = slot.record.lock().next_run;
            let Some(due) = next_run else {
                break;
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.sleep_until(due) => {}
            }
            let next = slot.trigger.next_after(self.clock.now().max(due));
            slot.record.lock().next_run = Some(next);
            self.fire(&slot, FireKind::Scheduled).await;
        }
        debug!(job = %slot.id, "trigger loop stopped");
    }

    async fn sleep_until(&self, due: DateTime<Utc>) {
        loop {
            let Ok(remaining) = (due - self.clock.now()).to_std() else {
                return;
            };
            if remaining.is_zero() {
                return;
            }
            tokio::time::sleep(remaining.min(MAX_NAP)).await;
        }
    }

    /// Run `id` now, through the same overlap guard as scheduled triggers.
    pub async fn trigger_now(&self, id: JobId) -> Result<FireResult, ScheduleError> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(ScheduleError::NotRunning);
        }
        let slot = self
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| ScheduleError::UnknownJob(id.to_string()))?;
        Ok(self.fire(&slot, FireKind::Manual).await)
    }

    async fn fire(&self, slot: &Arc<JobSlot>, kind: FireKind) -> FireResult {
        let fired_at = self.clock.now();
        let result = {
            let _gate = self.gate.lock();
            if self.cancel.is_cancelled() {
                FireResult::Refused
            } else if let Ok(guard) = slot.guard.clone().try_lock_owned() {
                let record = {
                    let mut record = slot.record.lock();
                    record.last_run = Some(fired_at);
                    record.misfired = kind == FireKind::CatchUp;
                    record.run_count += 1;
                    record.clone()
                };
                let span = info_span!("job", job = %slot.id, run_id = %Uuid::new_v4());
                let handler = self.handler.clone();
                let store = self.store.clone();
                let slot = slot.clone();
                self.runs.spawn(
                    async move {
                        info!(kind = ?kind, "job started");
                        save(&*store, &record).await;
                        let result = handler.run(slot.id, fired_at).await;
                        let record = {
                            let mut record = slot.record.lock();
                            record.last_outcome = Some(match &result {
                                Ok(()) => RunOutcome::Ok,
                                Err(e) => {
                                    record.failure_count += 1;
                                    RunOutcome::Failed {
                                        error: format!("{e:#}"),
                                    }
                                }
                            });
                            record.clone()
                        };
                        match result {
                            Ok(()) => info!("job finished"),
                            Err(e) => error!(error = %format!("{e:#}"), "job failed"),
                        }
                        save(&*store, &record).await;
                        drop(guard);
                    }
                    .instrument(span),
                );
                FireResult::Started
            } else {
                FireResult::Skipped
            }
        };

        match result {
            FireResult::Refused => debug!(job = %slot.id, "scheduler stopping; trigger refused"),
            FireResult::Started => {}
            FireResult::Skipped => {
                let record = {
                    let mut record = slot.record.lock();
                    record.skipped_count += 1;
                    record.last_outcome = Some(RunOutcome::Skipped);
                    record.clone()
                };
                warn!(job = %slot.id, kind = ?kind, "previous run still in progress; trigger skipped");
                self.persist(&record).await;
            }
        }
        result
    }

    async fn persist(&self, record: &JobRecord) {
        save(&*self.store, record).await;
    }

    pub fn schedule_state(&self) -> Vec<JobDescriptor> {
        self.jobs
            .values()
            .map(|slot| JobDescriptor {
                trigger: slot.trigger.describe(),
                running: slot.guard.try_lock().is_err(),
                record: slot.record.lock().clone(),
            })
            .collect()
    }

    /// Stop accepting runs, wait for in-flight runs, then stop the trigger loops.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lifecycle.lock();
            if matches!(*state, Lifecycle::Stopping | Lifecycle::Stopped) {
                return;
            }
            *state = Lifecycle::Stopping;
        }
        {
            let _gate = self.gate.lock();
            self.cancel.cancel();
        }
        info!(in_flight = self.runs.len(), "scheduler draining in-flight jobs");
        self.runs.close();
        self.runs.wait().await;
        self.loops.close();
        self.loops.wait().await;
        *self.lifecycle.lock() = Lifecycle::Stopped;
        info!("scheduler stopped");
    }
}

async fn save(store: &dyn JobStore, record: &JobRecord) {
    if let Err(e) = store.save(record).await {
        warn!(job = %record.id, error = %e, "job state not persisted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Paris;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daily_trigger_rolls_to_next_day() {
        let t = Trigger::Daily { at: hm(6, 0), tz: Paris };
        let before = Utc.with_ymd_and_hms(2026, 1, 14, 4, 0, 0).unwrap();
        assert_eq!(t.next_after(before), Utc.with_ymd_and_hms(2026, 1, 14, 5, 0, 0).unwrap());
        let exactly = Utc.with_ymd_and_hms(2026, 1, 14, 5, 0, 0).unwrap();
        assert_eq!(t.next_after(exactly), Utc.with_ymd_and_hms(2026, 1, 15, 5, 0, 0).unwrap());
    }

    #[test]
    fn daily_trigger_inside_dst_gap_moves_forward() {
        // 2026-03-29 02:30 does not exist in Paris
        let t = Trigger::Daily { at: hm(2, 30), tz: Paris };
        let before = Utc.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap();
        let next = t.next_after(before);
        assert_eq!(next, Paris.with_ymd_and_hms(2026, 3, 29, 3, 30, 0).unwrap().with_timezone(&Utc));
    }

    #[test]
    fn interval_trigger_adds_interval() {
        let t = Trigger::Every { interval: Duration::from_secs(600) };
        let now = Utc.with_ymd_and_hms(2026, 1, 14, 12, 0, 0).unwrap();
        assert_eq!(t.next_after(now), Utc.with_ymd_and_hms(2026, 1, 14, 12, 10, 0).unwrap());
    }

    #[test]
    fn malformed_specs_are_rejected() {
        let bad_time = TriggerSpec::Daily { at: "25:00".into() };
        assert!(matches!(
            Trigger::from_spec(JobId::ApplyAuto, &bad_time, Paris),
            Err(ScheduleError::InvalidTrigger { .. })
        ));
        let zero = TriggerSpec::Every { minutes: 0 };
        assert!(Trigger::from_spec(JobId::PollFleet, &zero, Paris).is_err());
        let ok = TriggerSpec::Every { minutes: 10 };
        assert_eq!(
            Trigger::from_spec(JobId::PollFleet, &ok, Paris).unwrap().describe(),
            "every 10 min"
        );
    }
}
