use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::Validate;

/// Mode as reported by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum DeviceMode {
    Auto,
    #[strum(serialize = "AI")]
    #[serde(rename = "AI")]
    Ai,
    Manual,
    Passive,
}

impl DeviceMode {
    /// Decode the `mode` field of `ES.GetMode`, which firmware sends either as a
    /// string or as a numeric code.
    pub fn from_wire(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => match n.as_u64()? {
                0 => Some(Self::Auto),
                1 => Some(Self::Ai),
                2 => Some(Self::Manual),
                3 => Some(Self::Passive),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModeKind {
    Auto,
    Manual,
    Precharge,
}

/// Target operating mode for the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Mode {
    /// Device self-optimizes.
    Auto,
    /// Pinned to a fixed discharge setpoint (0 W = standby).
    Manual { power_w: u32 },
    /// Forced charge from the grid ahead of a peak-price day.
    Precharge { charge_w: u32 },
}

impl Mode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::Auto => ModeKind::Auto,
            Mode::Manual { .. } => ModeKind::Manual,
            Mode::Precharge { .. } => ModeKind::Precharge,
        }
    }

    /// Firmware mode a device reports once this mode has been applied.
    pub fn device_mode(&self) -> DeviceMode {
        match self {
            Mode::Auto => DeviceMode::Auto,
            Mode::Manual { .. } => DeviceMode::Manual,
            Mode::Precharge { .. } => DeviceMode::Passive,
        }
    }

    /// `ES.GetMode` does not echo setpoints, so convergence is judged on the mode kind.
    pub fn matches(&self, reported: DeviceMode) -> bool {
        self.device_mode() == reported
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionReason {
    Schedule,
    TariffPrecharge,
    Override,
}

/// Output of the mode machine, consumed by the fleet coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeDecision {
    pub mode: Mode,
    pub reason: DecisionReason,
    /// Tariff was unavailable and the decision fell back to the plain schedule
    pub degraded: bool,
}

impl ModeDecision {
    pub fn override_to(mode: Mode) -> Self {
        Self {
            mode,
            reason: DecisionReason::Override,
            degraded: false,
        }
    }
}

/// Device-side parameters that accompany a mode write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ModeParams {
    /// Manual time slot number (0-9)
    #[validate(range(max = 9))]
    pub manual_slot: u8,
    pub manual_start: NaiveTime,
    pub manual_end: NaiveTime,
    /// Low 7 bits: Monday = bit 0
    #[validate(range(max = 127))]
    pub week_set: u8,
    /// Countdown for passive (precharge) power, seconds
    pub passive_countdown_secs: u32,
}

impl Default for ModeParams {
    fn default() -> Self {
        Self {
            manual_slot: 0,
            manual_start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            manual_end: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
            week_set: 127,
            passive_countdown_secs: 8 * 3600,
        }
    }
}
