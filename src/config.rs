use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use crate::domain::{DeviceId, DeviceIdentity, FleetError, ModeParams};
use crate::hardware::HardwareMode;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub transport: TransportConfig,
    #[validate(nested)]
    pub fleet: FleetConfig,
    #[validate(nested)]
    pub schedule: ScheduleConfig,
    #[validate(nested)]
    pub tariff: TariffConfig,
    #[validate(nested)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Device protocol timing. Tuned against real hardware; shortening the timeout
/// or the attempt count produces spurious failures.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TransportConfig {
    #[validate(range(min = 100))]
    pub timeout_ms: u64,
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub discovery_port: u16,
    #[validate(range(min = 100))]
    pub discovery_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FleetConfig {
    /// Pause between writes to consecutive devices
    pub pacing_delay_ms: u64,
    /// Pause between a write and its verification read
    pub settle_delay_ms: u64,
    /// Pause between the requests of one status poll
    pub request_spacing_ms: u64,
    pub min_poll_interval_secs: u64,
    #[validate(range(min = 1, max = 16))]
    pub max_concurrent_polls: usize,
    pub convergence_rounds: u32,
    pub retry_round_delay_secs: u64,
    #[validate(range(min = 1))]
    pub escalate_after_failures: u32,
    #[validate(range(max = 100))]
    pub low_soc_percent: u8,
    pub high_temp_c: f64,
}

impl FleetConfig {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
    pub fn request_spacing(&self) -> Duration {
        Duration::from_millis(self.request_spacing_ms)
    }
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_secs(self.min_poll_interval_secs)
    }
    pub fn retry_round_delay(&self) -> Duration {
        Duration::from_secs(self.retry_round_delay_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ScheduleConfig {
    pub timezone: Tz,
    #[serde(with = "hhmm")]
    pub morning: NaiveTime,
    #[serde(with = "hhmm")]
    pub evening: NaiveTime,
    #[serde(with = "hhmm")]
    pub precharge_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub precharge_end: NaiveTime,
    /// Discharge setpoint while pinned to MANUAL (0 = standby)
    pub manual_power_w: u32,
    #[validate(range(min = 1))]
    pub precharge_power_w: u32,
    #[validate(range(max = 9))]
    pub manual_slot: u8,
    #[validate(range(min = 1, max = 127))]
    pub week_set: u8,
    pub passive_countdown_secs: u32,
    pub jobs: JobsConfig,
}

impl ScheduleConfig {
    pub fn mode_params(&self) -> ModeParams {
        ModeParams {
            manual_slot: self.manual_slot,
            manual_start: self.evening,
            manual_end: self.morning,
            week_set: self.week_set,
            passive_countdown_secs: self.passive_countdown_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub apply_auto: TriggerSpec,
    pub apply_manual: TriggerSpec,
    pub evaluate_precharge: TriggerSpec,
    pub poll_fleet: TriggerSpec,
}

/// Raw trigger as written in configuration. Checked when the scheduler is built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerSpec {
    Daily { at: String },
    Every { minutes: u64 },
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TariffConfig {
    pub enabled: bool,
    #[validate(url)]
    pub base_url: String,
    #[validate(range(min = 1))]
    pub http_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    #[validate(range(max = 10))]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NotifyConfig {
    pub enabled: bool,
    #[validate(url)]
    pub webhook_url: Option<String>,
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Durable job metadata. Jobs are kept in memory when unset.
    pub job_store_path: Option<PathBuf>,
    /// Append-only status log. Status records are discarded when unset.
    pub status_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub mode: HardwareMode,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeviceConfig {
    pub id: u32,
    #[validate(length(min = 1))]
    pub name: String,
    pub host: IpAddr,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[validate(length(min = 1))]
    pub hardware_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl DeviceConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            id: DeviceId(self.id),
            name: self.name.clone(),
            addr: SocketAddr::new(self.host, self.port),
            hardware_id: self.hardware_id.clone(),
            enabled: self.enabled,
        }
    }
}

fn default_device_port() -> u16 {
    30000
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("FLEET__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("Failed to read configuration")?;
        cfg.validate().context("Invalid configuration")?;
        cfg.check_devices()?;
        Ok(cfg)
    }

    fn check_devices(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(FleetError::NoDevices.into());
        }
        if self.transport.backoff_base_ms > self.transport.backoff_max_ms {
            bail!("transport.backoff_base_ms exceeds transport.backoff_max_ms");
        }
        Ok(())
    }

    pub fn device_identities(&self) -> Vec<DeviceIdentity> {
        self.devices.iter().map(DeviceConfig::identity).collect()
    }
}

/// `HH:MM` wall-clock times.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hhmm(&raw).map_err(D::Error::custom)
    }
}

pub fn parse_hhmm(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
        .map_err(|_| format!("invalid time of day '{raw}', expected HH:MM"))
}
