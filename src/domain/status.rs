use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::device::DeviceId;
use super::mode::DeviceMode;

/// `Bat.GetStatus` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    #[serde(deserialize_with = "soc_from_wire")]
    pub soc: u8,
    #[serde(default)]
    pub charg_flag: bool,
    #[serde(default)]
    pub dischrg_flag: bool,
    #[serde(default)]
    pub bat_temp: Option<f64>,
    /// Remaining capacity, Wh
    #[serde(default)]
    pub bat_capacity: Option<f64>,
    /// Rated capacity, Wh
    #[serde(default)]
    pub rated_capacity: Option<f64>,
}

/// `ES.GetStatus` payload. Powers in W, energies in Wh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyStatus {
    pub bat_soc: Option<u8>,
    pub bat_cap: Option<f64>,
    pub pv_power: Option<f64>,
    pub ongrid_power: Option<f64>,
    pub offgrid_power: Option<f64>,
    pub bat_power: Option<f64>,
    pub total_pv_energy: Option<f64>,
    pub total_grid_output_energy: Option<f64>,
    pub total_grid_input_energy: Option<f64>,
    pub total_load_energy: Option<f64>,
}

/// `ES.GetMode` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeInfo {
    pub mode: DeviceMode,
    pub ongrid_power: Option<f64>,
    pub offgrid_power: Option<f64>,
    pub bat_soc: Option<u8>,
}

/// Combined result of one status poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub battery: BatteryStatus,
    pub energy: Option<EnergyStatus>,
    pub mode: Option<DeviceMode>,
    pub polled_at: DateTime<Utc>,
    /// Energy status could not be read on this poll
    pub partial: bool,
}

/// Identity reported by `Marstek.GetDevice` (used by discovery and liveness checks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device: String,
    #[serde(default)]
    pub ver: u32,
    pub ble_mac: String,
    #[serde(default)]
    pub wifi_mac: String,
    #[serde(default)]
    pub wifi_name: Option<String>,
    #[serde(default)]
    pub ip: String,
}

fn soc_from_wire<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = serde_json::Value::deserialize(deserializer)?;
    let soc = match &raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| D::Error::custom(format!("invalid soc {raw}")))?;
    if !(0.0..=100.0).contains(&soc) {
        return Err(D::Error::custom(format!("soc out of range: {soc}")));
    }
    Ok(soc.round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn battery_status_accepts_string_soc() {
        let st: BatteryStatus =
            serde_json::from_value(json!({"id": 0, "soc": "87", "bat_temp": 21.5})).unwrap();
        assert_eq!(st.soc, 87);
        assert_eq!(st.bat_temp, Some(21.5));
        assert!(!st.charg_flag);
    }

    #[test]
    fn battery_status_rejects_garbage_soc() {
        assert!(serde_json::from_value::<BatteryStatus>(json!({"soc": "lots"})).is_err());
        assert!(serde_json::from_value::<BatteryStatus>(json!({"soc": 140})).is_err());
        assert!(serde_json::from_value::<BatteryStatus>(json!({})).is_err());
    }

    #[test]
    fn energy_status_tolerates_missing_fields() {
        let st: EnergyStatus =
            serde_json::from_value(json!({"id": 0, "bat_power": -350.0})).unwrap();
        assert_eq!(st.bat_power, Some(-350.0));
        assert_eq!(st.pv_power, None);
    }
}
