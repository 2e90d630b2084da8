//! End-to-end fleet scenarios against the in-process simulated fleet.
//!
//! All tests run on a paused tokio clock, so the real protocol timings
//! (15 s attempt timeout, pacing, settle delays) cost no wall time.

#![cfg(feature = "sim")]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use battery_fleet_controller::config::Config;
use battery_fleet_controller::controller::{AppState, Components, TokioClock};
use battery_fleet_controller::domain::{DeviceId, DeviceMode, JobId, Mode, RunOutcome};
use battery_fleet_controller::forecast::{DayColor, TariffError, TariffSource};
use battery_fleet_controller::hardware::sim::{SimDevice, SimDeviceConfig, SimFleet};
use battery_fleet_controller::notify::{MemoryNotifier, Severity};
use battery_fleet_controller::repo::{MemoryJobStore, MemoryStatusSink, Repositories};

struct FixedTariff(Option<DayColor>);

#[async_trait]
impl TariffSource for FixedTariff {
    async fn day_color(&self, date: NaiveDate) -> Result<DayColor, TariffError> {
        self.0
            .ok_or_else(|| TariffError::Unavailable(format!("no data for {date}")))
    }
}

struct Harness {
    state: AppState,
    sim: Arc<SimFleet>,
    jobs: Arc<MemoryJobStore>,
    notifier: Arc<MemoryNotifier>,
}

impl Harness {
    fn new(tariff: Option<DayColor>, origin: DateTime<Utc>) -> Self {
        Self::starting_in(DeviceMode::Auto, tariff, origin)
    }

    fn starting_in(mode: DeviceMode, tariff: Option<DayColor>, origin: DateTime<Utc>) -> Self {
        let cfg = Config::from_toml_str(include_str!("../config/default.toml")).unwrap();
        let sim = SimFleet::new();
        for identity in cfg.device_identities() {
            sim.add(
                identity.addr,
                SimDeviceConfig {
                    hardware_id: identity.hardware_id.clone(),
                    mode,
                    ..SimDeviceConfig::default()
                },
            );
        }
        let jobs = Arc::new(MemoryJobStore::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let components = Components {
            link: sim.clone(),
            tariff: Arc::new(FixedTariff(tariff)),
            notifier: notifier.clone(),
            repos: Repositories {
                status: Arc::new(MemoryStatusSink::default()),
                jobs: jobs.clone(),
            },
            clock: Arc::new(TokioClock::starting_at(origin)),
        };
        let state = AppState::assemble(cfg, components).unwrap();
        Self {
            state,
            sim,
            jobs,
            notifier,
        }
    }

    fn device(&self, id: u32) -> Arc<SimDevice> {
        let addr = self.state.registry().get(DeviceId(id)).unwrap().addr();
        self.sim.device(addr).unwrap()
    }
}

/// 21:59:50 in Paris (UTC+1 in January).
fn just_before_evening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 14, 20, 59, 50).unwrap()
}

fn expected(results: &[(u32, bool)]) -> BTreeMap<DeviceId, bool> {
    results.iter().map(|&(id, ok)| (DeviceId(id), ok)).collect()
}

#[tokio::test(start_paused = true)]
async fn evening_before_peak_day_precharges_whole_fleet() {
    let h = Harness::starting_in(DeviceMode::Manual, Some(DayColor::Peak), just_before_evening());
    h.state.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3 * 60)).await;

    for id in 1..=3 {
        let dev = h.device(id);
        assert_eq!(dev.mode(), DeviceMode::Passive, "device {id}");
        let config = dev.last_config().unwrap();
        assert_eq!(config["passive_cfg"]["power"], -2500);
    }
    let record = h.jobs.get(JobId::ApplyManual).unwrap();
    assert_eq!(record.run_count, 1);
    assert_eq!(record.last_outcome, Some(RunOutcome::Ok));

    h.state.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn precharge_decision_reports_every_device() {
    let evening = Utc.with_ymd_and_hms(2026, 1, 14, 21, 0, 5).unwrap();
    let h = Harness::starting_in(DeviceMode::Manual, Some(DayColor::Peak), evening);

    let decision = h.state.current_decision().await;
    assert_eq!(decision.mode, Mode::Precharge { charge_w: 2500 });

    let report = h.state.fleet.reconcile(&decision).await.unwrap();
    assert_eq!(report.as_bool_map(), expected(&[(1, true), (2, true), (3, true)]));
    for id in 1..=3 {
        assert_eq!(h.device(id).mode(), DeviceMode::Passive, "device {id}");
        assert_eq!(h.device(id).writes(), 1, "device {id}");
    }
}

#[tokio::test(start_paused = true)]
async fn evening_without_tariff_falls_back_to_manual() {
    let h = Harness::new(None, just_before_evening());
    h.state.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3 * 60)).await;

    for id in 1..=3 {
        assert_eq!(h.device(id).mode(), DeviceMode::Manual, "device {id}");
    }
    h.state.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_does_not_block_the_others() {
    let h = Harness::new(Some(DayColor::Peak), just_before_evening());
    h.device(2).set_unreachable(true);

    let report = h
        .state
        .set_fleet_mode(Mode::Precharge { charge_w: 2500 }, None)
        .await
        .unwrap();

    assert_eq!(report.as_bool_map(), expected(&[(1, true), (2, false), (3, true)]));
    assert_eq!(h.device(1).mode(), DeviceMode::Passive);
    assert_eq!(h.device(3).mode(), DeviceMode::Passive);
    assert_eq!(h.device(2).writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduled_transition_reports_unconverged_device() {
    let h = Harness::new(Some(DayColor::Peak), just_before_evening());
    h.device(2).set_unreachable(true);
    h.state.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;

    let record = h.jobs.get(JobId::ApplyManual).unwrap();
    match record.last_outcome {
        Some(RunOutcome::Failed { error }) => assert!(error.contains("1 of 3"), "{error}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    let warnings: Vec<_> = h
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.severity == Severity::Warning)
        .collect();
    assert_eq!(warnings.len(), 1);
    h.state.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn matching_devices_receive_no_writes() {
    let h = Harness::new(None, just_before_evening());

    let report = h.state.set_fleet_mode(Mode::Auto, None).await.unwrap();

    assert!(report.all_succeeded());
    for id in 1..=3 {
        assert_eq!(h.device(id).writes(), 0, "device {id}");
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_mode_changes_never_overlap_writes() {
    let h = Harness::new(None, just_before_evening());

    let (a, b) = tokio::join!(
        h.state.set_fleet_mode(Mode::Precharge { charge_w: 1000 }, None),
        h.state.set_fleet_mode(Mode::Manual { power_w: 0 }, None),
    );

    assert!(a.unwrap().all_succeeded());
    assert!(b.unwrap().all_succeeded());
    assert_eq!(h.sim.max_concurrent_writes(), 1);
    for id in 1..=3 {
        assert_eq!(h.device(id).max_in_flight(), 1, "device {id}");
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_known_state_untouched() {
    let h = Harness::new(None, just_before_evening());
    h.state.get_fleet_status().await;
    let before = h.state.registry().get(DeviceId(2)).unwrap().state();
    assert_eq!(before.known_mode, Some(DeviceMode::Auto));
    assert!(before.last_seen.is_some());

    h.device(2).drop_next(100);
    let report = h
        .state
        .set_fleet_mode(Mode::Manual { power_w: 0 }, None)
        .await
        .unwrap();

    assert_eq!(report.as_bool_map(), expected(&[(1, true), (2, false), (3, true)]));
    let after = h.state.registry().get(DeviceId(2)).unwrap().state();
    assert_eq!(after.known_mode, before.known_mode);
    assert_eq!(after.last_seen, before.last_seen);
    assert_eq!(after.consecutive_failures, 1);
    assert_eq!(h.device(2).mode(), DeviceMode::Auto);
}
