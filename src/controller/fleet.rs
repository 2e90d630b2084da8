use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::discovery::Discovery;
use crate::domain::{
    DeviceDescriptor, DeviceEntry, DeviceError, DeviceId, DeviceRegistry, DeviceStatus,
    FleetError, ModeDecision, ModeParams,
};
use crate::hardware::DeviceGateway;
use crate::notify::{self, Notification, Notifier, Severity};
use crate::repo::status_log::{self, StatusSink};

/// Result of applying a decision to one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeviceOutcome {
    /// Already in the target mode; nothing was written
    Unchanged,
    /// Written and verified
    Converged,
    Failed { error: DeviceError },
}

impl DeviceOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, DeviceOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub decision: ModeDecision,
    pub outcomes: BTreeMap<DeviceId, DeviceOutcome>,
    /// Apply passes made, including convergence retries
    pub rounds: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FleetReport {
    pub fn as_bool_map(&self) -> BTreeMap<DeviceId, bool> {
        self.outcomes
            .iter()
            .map(|(id, o)| (*id, o.is_success()))
            .collect()
    }

    pub fn failed(&self) -> Vec<DeviceId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(DeviceOutcome::is_success)
    }

    /// True when at least one device was written to or failed.
    pub fn wrote_or_failed(&self) -> bool {
        self.outcomes
            .values()
            .any(|o| *o != DeviceOutcome::Unchanged)
    }
}

/// Result of polling one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollOutcome {
    Fresh { status: DeviceStatus },
    /// Polled too recently; served from cache
    Cached { status: DeviceStatus },
    Failed { error: DeviceError },
}

/// Orchestrates operations across the fleet.
pub struct FleetCoordinator {
    registry: DeviceRegistry,
    gateway: Arc<DeviceGateway>,
    cfg: FleetConfig,
    params: ModeParams,
    write_lock: Mutex<()>,
    status_sink: Arc<dyn StatusSink>,
    notifier: Arc<dyn Notifier>,
}

impl FleetCoordinator {
    pub fn new(
        registry: DeviceRegistry,
        gateway: Arc<DeviceGateway>,
        cfg: FleetConfig,
        params: ModeParams,
        status_sink: Arc<dyn StatusSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            gateway,
            cfg,
            params,
            write_lock: Mutex::new(()),
            status_sink,
            notifier,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn mode_params(&self) -> &ModeParams {
        &self.params
    }

    /// Apply `decision` to every active device, one device at a time.
    ///
    /// Per-device failures end up in the report; only an empty fleet is an error.
    pub async fn apply_mode_to_fleet(
        &self,
        decision: &ModeDecision,
    ) -> Result<FleetReport, FleetError> {
        self.apply_mode_with_params(decision, &self.params).await
    }

    /// Same as [`Self::apply_mode_to_fleet`] with explicit device-side parameters.
    pub async fn apply_mode_with_params(
        &self,
        decision: &ModeDecision,
        params: &ModeParams,
    ) -> Result<FleetReport, FleetError> {
        let _fleet = self.write_lock.lock().await;
        let devices = self.registry.active();
        if devices.is_empty() {
            return Err(FleetError::NoDevices);
        }

        let started_at = Utc::now();
        let target = decision.mode;
        info!(
            mode = %target.kind(),
            reason = %decision.reason,
            devices = devices.len(),
            "applying mode to fleet"
        );

        let mut outcomes = BTreeMap::new();
        let mut last_exchange_end: Option<Instant> = None;
        for dev in devices {
            let outcome = self
                .apply_to_device(&dev, decision, params, &mut last_exchange_end)
                .await;
            match &outcome {
                DeviceOutcome::Failed { error } => {
                    warn!(device_id = %dev.id(), error = %error, "device did not converge")
                }
                other => debug!(device_id = %dev.id(), outcome = ?other, "device done"),
            }
            outcomes.insert(dev.id(), outcome);
        }

        let report = FleetReport {
            decision: *decision,
            outcomes,
            rounds: 1,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            mode = %target.kind(),
            failed = report.failed().len(),
            total = report.outcomes.len(),
            "fleet apply finished"
        );
        Ok(report)
    }

    async fn apply_to_device(
        &self,
        dev: &DeviceEntry,
        decision: &ModeDecision,
        params: &ModeParams,
        last_exchange_end: &mut Option<Instant>,
    ) -> DeviceOutcome {
        let target = decision.mode;
        let _io = dev.lock_io().await;

        let current = match self.gateway.get_mode(dev).await {
            Ok(info) => info.mode,
            Err(error) => return DeviceOutcome::Failed { error },
        };
        if target.matches(current) {
            return DeviceOutcome::Unchanged;
        }

        if let Some(end) = *last_exchange_end {
            sleep_until(end + self.cfg.pacing_delay()).await;
        }
        info!(device_id = %dev.id(), from = %current, to = %target.kind(), "writing mode");
        let written = self.gateway.set_mode(dev, &target, params).await;
        if let Err(error) = written {
            *last_exchange_end = Some(Instant::now());
            return DeviceOutcome::Failed { error };
        }

        sleep(self.cfg.settle_delay()).await;
        let verified = self.gateway.get_mode(dev).await;
        *last_exchange_end = Some(Instant::now());
        match verified {
            Ok(info) if target.matches(info.mode) => DeviceOutcome::Converged,
            Ok(info) => DeviceOutcome::Failed {
                error: DeviceError::VerificationFailed {
                    expected: target.device_mode(),
                    actual: info.mode,
                },
            },
            Err(error) => DeviceOutcome::Failed { error },
        }
    }

    /// Apply with convergence retries, then report the result to the operator.
    ///
    /// Devices that failed are retried in later rounds; the skip-if-matching rule
    /// keeps the devices that already converged untouched.
    pub async fn reconcile(&self, decision: &ModeDecision) -> Result<FleetReport, FleetError> {
        let mut report = self.apply_mode_to_fleet(decision).await?;
        while !report.all_succeeded() && report.rounds <= self.cfg.convergence_rounds {
            let pending = report.failed();
            info!(
                round = report.rounds + 1,
                pending = pending.len(),
                "retrying devices that did not converge"
            );
            sleep(self.cfg.retry_round_delay()).await;
            let retry = self.apply_mode_to_fleet(decision).await?;
            for id in pending {
                if let Some(outcome) = retry.outcomes.get(&id) {
                    report.outcomes.insert(id, outcome.clone());
                }
            }
            report.rounds += 1;
            report.finished_at = retry.finished_at;
        }
        if report.wrote_or_failed() {
            self.notify_summary(&report);
        } else {
            debug!(mode = %decision.mode.kind(), "fleet already in target mode");
        }
        Ok(report)
    }

    /// Run `discovery` while no fleet write or device request is in flight.
    ///
    /// The probe is broadcast, so every active device's io lock is held for the
    /// whole listen window.
    pub async fn discover(&self, discovery: &Discovery) -> anyhow::Result<Vec<DeviceDescriptor>> {
        let _fleet = self.write_lock.lock().await;
        let devices = self.registry.active();
        let mut held = Vec::with_capacity(devices.len());
        for dev in &devices {
            held.push(dev.lock_io().await);
        }
        discovery.discover().await
    }

    fn notify_summary(&self, report: &FleetReport) {
        let kind = report.decision.mode.kind();
        let failed = report.failed();
        let (severity, message) = if failed.is_empty() {
            (
                Severity::Info,
                format!("Fleet switched to {kind} ({} devices)", report.outcomes.len()),
            )
        } else {
            (
                Severity::Warning,
                format!(
                    "Fleet switch to {kind} incomplete: {} of {} devices failed",
                    failed.len(),
                    report.outcomes.len()
                ),
            )
        };
        notify::dispatch(
            &self.notifier,
            Notification::new(
                severity,
                message,
                json!({
                    "mode": report.decision.mode,
                    "reason": report.decision.reason,
                    "degraded": report.decision.degraded,
                    "rounds": report.rounds,
                    "failed": failed,
                }),
            ),
        );
    }

    /// Poll every active device with bounded concurrency.
    pub async fn get_all_status(&self) -> BTreeMap<DeviceId, PollOutcome> {
        let limit = self.cfg.max_concurrent_polls.max(1);
        stream::iter(self.registry.active())
            .map(|dev| async move {
                let outcome = self.poll_device(&dev).await;
                (dev.id(), outcome)
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    pub async fn poll_device(&self, dev: &DeviceEntry) -> PollOutcome {
        let _io = dev.lock_io().await;
        match dev.recent_poll(self.cfg.min_poll_interval()) {
            Some(Ok(status)) => {
                debug!(device_id = %dev.id(), "poll served from cache");
                return PollOutcome::Cached { status };
            }
            Some(Err(error)) => {
                debug!(device_id = %dev.id(), "last poll failed recently; not polling again yet");
                return PollOutcome::Failed { error };
            }
            None => {}
        }

        let battery = match self.gateway.get_battery(dev).await {
            Ok(b) => b,
            Err(error) => {
                warn!(device_id = %dev.id(), error = %error, "status poll failed");
                dev.store_poll_failure(error.clone());
                return PollOutcome::Failed { error };
            }
        };

        let mut partial = false;
        sleep(self.cfg.request_spacing()).await;
        let energy = match self.gateway.get_energy(dev).await {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(device_id = %dev.id(), error = %e, "energy status unavailable");
                partial = true;
                None
            }
        };
        sleep(self.cfg.request_spacing()).await;
        let mode = match self.gateway.get_mode(dev).await {
            Ok(info) => Some(info.mode),
            Err(e) => {
                warn!(device_id = %dev.id(), error = %e, "mode unavailable");
                partial = true;
                None
            }
        };

        let status = DeviceStatus {
            device_id: dev.id(),
            battery,
            energy,
            mode,
            polled_at: Utc::now(),
            partial,
        };
        self.check_alerts(dev, &status);
        dev.store_status(status.clone());
        status_log::record(&self.status_sink, status.clone());
        PollOutcome::Fresh { status }
    }

    /// Warn when a device crosses the low-SOC or high-temperature threshold.
    fn check_alerts(&self, dev: &DeviceEntry, status: &DeviceStatus) {
        let previous = dev.last_status();
        let low = |s: &DeviceStatus| s.battery.soc < self.cfg.low_soc_percent;
        let hot = |s: &DeviceStatus| {
            s.battery
                .bat_temp
                .is_some_and(|t| t > self.cfg.high_temp_c)
        };
        let name = &dev.identity().name;

        if low(status) && !previous.as_ref().is_some_and(low) {
            notify::dispatch(
                &self.notifier,
                Notification::new(
                    Severity::Warning,
                    format!("Battery {name} ({}) low: {}%", dev.id(), status.battery.soc),
                    json!({
                        "device_id": dev.id(),
                        "soc": status.battery.soc,
                        "threshold": self.cfg.low_soc_percent,
                    }),
                ),
            );
        }
        if hot(status) && !previous.as_ref().is_some_and(hot) {
            notify::dispatch(
                &self.notifier,
                Notification::new(
                    Severity::Warning,
                    format!("Battery {name} ({}) temperature high", dev.id()),
                    json!({
                        "device_id": dev.id(),
                        "temperature_c": status.battery.bat_temp,
                        "threshold": self.cfg.high_temp_c,
                    }),
                ),
            );
        }
    }
}
