pub mod clock;
pub mod fleet;
pub mod mode_machine;
pub mod scheduler;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::Discovery;
use crate::domain::{
    DeviceDescriptor, DeviceId, DeviceRegistry, FleetError, JobId, Mode, ModeDecision, ModeParams,
};
use crate::forecast::{build_tariff_source, TariffSource};
use crate::hardware::{DeviceGateway, LinkFactory};
use crate::notify::{self, Notifier};
use crate::repo::Repositories;
use crate::transport::{Link, RetryPolicy, TransportClient};

pub use clock::{Clock, SystemClock, TokioClock};
pub use fleet::{DeviceOutcome, FleetCoordinator, FleetReport, PollOutcome};
pub use mode_machine::{decide, ModeSchedule};
pub use scheduler::{
    FireResult, JobDescriptor, JobHandler, Lifecycle, ScheduleError, Scheduler, Trigger,
};

/// Collaborators that differ between production, simulation and tests.
pub struct Components {
    pub link: Arc<dyn Link>,
    pub tariff: Arc<dyn TariffSource>,
    pub notifier: Arc<dyn Notifier>,
    pub repos: Repositories,
    pub clock: Arc<dyn Clock>,
}

impl Components {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            link: LinkFactory::new(cfg.hardware.mode).create_link(cfg)?,
            tariff: build_tariff_source(&cfg.tariff)?,
            notifier: notify::build(&cfg.notify)?,
            repos: Repositories::new(cfg)?,
            clock: Arc::new(SystemClock),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub fleet: Arc<FleetCoordinator>,
    pub scheduler: Arc<Scheduler>,
    pub schedule: Arc<ModeSchedule>,
    pub tariff: Arc<dyn TariffSource>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self> {
        let components = Components::from_config(&cfg)?;
        Self::assemble(cfg, components)
    }

    /// Wire the controller from already-built collaborators.
    pub fn assemble(cfg: Config, components: Components) -> Result<Self> {
        let Components {
            link,
            tariff,
            notifier,
            repos,
            clock,
        } = components;

        let registry =
            DeviceRegistry::new(cfg.device_identities()).context("Invalid device inventory")?;
        let client = Arc::new(TransportClient::new(link, RetryPolicy::from(&cfg.transport)));
        let gateway = Arc::new(DeviceGateway::new(
            client,
            notifier.clone(),
            cfg.fleet.escalate_after_failures,
        ));
        let fleet = Arc::new(FleetCoordinator::new(
            registry,
            gateway,
            cfg.fleet.clone(),
            cfg.schedule.mode_params(),
            repos.status.clone(),
            notifier,
        ));
        let schedule = Arc::new(ModeSchedule::from(&cfg.schedule));

        let handler = Arc::new(FleetJobs {
            fleet: fleet.clone(),
            schedule: schedule.clone(),
            tariff: tariff.clone(),
        });
        let scheduler = Arc::new(Scheduler::new(
            job_triggers(&cfg)?,
            handler,
            repos.jobs.clone(),
            clock.clone(),
        ));

        info!(
            devices = fleet.registry().len(),
            active = fleet.registry().active().len(),
            hardware = ?cfg.hardware.mode,
            "controller assembled"
        );
        Ok(Self {
            cfg: Arc::new(cfg),
            fleet,
            scheduler,
            schedule,
            tariff,
            clock,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    pub fn registry(&self) -> &DeviceRegistry {
        self.fleet.registry()
    }

    /// Broadcast a device probe on the local network and collect the replies.
    pub async fn trigger_discovery(&self) -> Result<Vec<DeviceDescriptor>> {
        let discovery = Discovery::broadcast(
            self.cfg.transport.discovery_port,
            Duration::from_millis(self.cfg.transport.discovery_timeout_ms),
        );
        let found = self.fleet.discover(&discovery).await?;
        for descriptor in &found {
            let known = self
                .registry()
                .snapshot()
                .iter()
                .any(|d| d.identity.hardware_id.eq_ignore_ascii_case(&descriptor.ble_mac));
            if !known {
                info!(ble_mac = %descriptor.ble_mac, ip = %descriptor.ip, "unregistered device answered discovery");
            }
        }
        Ok(found)
    }

    pub async fn get_fleet_status(&self) -> BTreeMap<DeviceId, PollOutcome> {
        self.fleet.get_all_status().await
    }

    /// Operator override. The next scheduled transition re-evaluates the schedule.
    ///
    /// The apply runs on its own task, so a caller that goes away never cancels
    /// it between a write and its verify read.
    pub async fn set_fleet_mode(
        &self,
        mode: Mode,
        params: Option<ModeParams>,
    ) -> Result<FleetReport, FleetError> {
        let decision = ModeDecision::override_to(mode);
        info!(mode = %mode.kind(), "fleet mode override requested");
        let fleet = self.fleet.clone();
        let apply = tokio::spawn(async move {
            match params {
                Some(params) => fleet.apply_mode_with_params(&decision, &params).await,
                None => fleet.apply_mode_to_fleet(&decision).await,
            }
        });
        apply
            .await
            .map_err(|e| FleetError::Interrupted(e.to_string()))?
    }

    /// Decision the mode state machine makes right now.
    pub async fn current_decision(&self) -> ModeDecision {
        decide(&self.schedule, &*self.tariff, self.clock.now()).await
    }

    pub fn get_schedule_state(&self) -> Vec<JobDescriptor> {
        self.scheduler.schedule_state()
    }

    pub async fn run_job(&self, job: JobId) -> Result<FireResult, ScheduleError> {
        self.scheduler.trigger_now(job).await
    }
}

pub fn job_triggers(cfg: &Config) -> Result<Vec<(JobId, Trigger)>, ScheduleError> {
    let tz = cfg.schedule.timezone;
    let jobs = &cfg.schedule.jobs;
    [
        (JobId::ApplyAuto, &jobs.apply_auto),
        (JobId::ApplyManual, &jobs.apply_manual),
        (JobId::EvaluatePrecharge, &jobs.evaluate_precharge),
        (JobId::PollFleet, &jobs.poll_fleet),
    ]
    .into_iter()
    .map(|(id, spec)| Ok((id, Trigger::from_spec(id, spec, tz)?)))
    .collect()
}

/// Runs the scheduled jobs against the fleet.
///
/// Mode jobs never assume which transition they stand for: each one asks the
/// mode state machine what the fleet should be doing at the moment it fires,
/// so a late or repeated run converges on the same state.
pub struct FleetJobs {
    pub fleet: Arc<FleetCoordinator>,
    pub schedule: Arc<ModeSchedule>,
    pub tariff: Arc<dyn TariffSource>,
}

#[async_trait]
impl JobHandler for FleetJobs {
    async fn run(&self, job: JobId, fired_at: DateTime<Utc>) -> Result<()> {
        match job {
            JobId::ApplyAuto | JobId::ApplyManual | JobId::EvaluatePrecharge => {
                let decision = decide(&self.schedule, &*self.tariff, fired_at).await;
                info!(
                    mode = %decision.mode.kind(),
                    reason = ?decision.reason,
                    degraded = decision.degraded,
                    "mode decided"
                );
                let report = self.fleet.reconcile(&decision).await?;
                let failed = report.failed();
                if !failed.is_empty() {
                    bail!(
                        "{} of {} devices did not reach {}",
                        failed.len(),
                        report.outcomes.len(),
                        decision.mode.kind()
                    );
                }
                Ok(())
            }
            JobId::PollFleet => {
                let results = self.fleet.get_all_status().await;
                let failed = results
                    .values()
                    .filter(|r| matches!(r, PollOutcome::Failed { .. }))
                    .count();
                if failed > 0 {
                    warn!(failed, polled = results.len(), "some devices did not answer the poll");
                }
                if !results.is_empty() && failed == results.len() {
                    bail!("no device answered the status poll");
                }
                Ok(())
            }
        }
    }
}
