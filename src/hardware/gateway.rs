use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{
    BatteryStatus, DeviceEntry, DeviceError, DeviceMode, EnergyStatus, Liveness, Mode, ModeInfo,
    ModeParams,
};
use crate::notify::{self, Notification, Notifier, Severity};
use crate::transport::TransportClient;

pub const GET_ENERGY_STATUS: &str = "ES.GetStatus";
pub const GET_BATTERY_STATUS: &str = "Bat.GetStatus";
pub const GET_MODE: &str = "ES.GetMode";
pub const SET_MODE: &str = "ES.SetMode";
pub const GET_DEVICE: &str = "Marstek.GetDevice";

/// Component instance addressed on every device.
const INSTANCE_ID: u32 = 0;

/// Typed device operations over the transport client.
///
/// Callers must hold the device's io lock for the duration of each call.
pub struct DeviceGateway {
    transport: Arc<TransportClient>,
    notifier: Arc<dyn Notifier>,
    escalate_after: u32,
}

impl DeviceGateway {
    pub fn new(
        transport: Arc<TransportClient>,
        notifier: Arc<dyn Notifier>,
        escalate_after: u32,
    ) -> Self {
        Self {
            transport,
            notifier,
            escalate_after,
        }
    }

    pub async fn get_battery(&self, dev: &DeviceEntry) -> Result<BatteryStatus, DeviceError> {
        let status: BatteryStatus = self
            .exchange(dev, GET_BATTERY_STATUS, json!({ "id": INSTANCE_ID }), decode_as)
            .await?;
        self.succeeded(dev, None);
        Ok(status)
    }

    pub async fn get_energy(&self, dev: &DeviceEntry) -> Result<EnergyStatus, DeviceError> {
        let status: EnergyStatus = self
            .exchange(dev, GET_ENERGY_STATUS, json!({ "id": INSTANCE_ID }), decode_as)
            .await?;
        self.succeeded(dev, None);
        Ok(status)
    }

    pub async fn get_mode(&self, dev: &DeviceEntry) -> Result<ModeInfo, DeviceError> {
        let info = self
            .exchange(dev, GET_MODE, json!({ "id": INSTANCE_ID }), decode_mode_info)
            .await?;
        self.succeeded(dev, Some(info.mode));
        Ok(info)
    }

    /// Write `mode`. Returns once the device acknowledged the write; convergence is
    /// confirmed separately by reading the mode back.
    pub async fn set_mode(
        &self,
        dev: &DeviceEntry,
        mode: &Mode,
        params: &ModeParams,
    ) -> Result<(), DeviceError> {
        let accepted = self
            .exchange(dev, SET_MODE, set_mode_params(mode, params), decode_set_result)
            .await?;
        if !accepted {
            let err = DeviceError::Rejected {
                method: SET_MODE.to_string(),
                attempts: 1,
                code: 0,
                message: "device reported set_result=false".to_string(),
            };
            self.failed(dev, &err);
            return Err(err);
        }
        self.succeeded(dev, None);
        Ok(())
    }

    async fn exchange<T>(
        &self,
        dev: &DeviceEntry,
        method: &'static str,
        params: Value,
        decode: fn(&'static str, Value) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let outcome = self
            .transport
            .call(dev.addr(), method, params)
            .await
            .and_then(|result| decode(method, result));
        if let Err(e) = &outcome {
            self.failed(dev, e);
        }
        outcome
    }

    fn succeeded(&self, dev: &DeviceEntry, mode: Option<DeviceMode>) {
        if dev.record_success(mode, self.escalate_after) == Liveness::CameOnline {
            notify::dispatch(
                &self.notifier,
                Notification::new(
                    Severity::Info,
                    format!("Battery {} ({}) is back online", dev.identity().name, dev.id()),
                    json!({ "device_id": dev.id(), "addr": dev.addr().to_string() }),
                ),
            );
        }
    }

    fn failed(&self, dev: &DeviceEntry, err: &DeviceError) {
        debug!(device_id = %dev.id(), error = %err, "device call failed");
        if dev.record_failure(&err.to_string(), self.escalate_after) == Liveness::WentOffline {
            let state = dev.state();
            notify::dispatch(
                &self.notifier,
                Notification::new(
                    Severity::Error,
                    format!(
                        "Battery {} ({}) unresponsive after {} consecutive failures",
                        dev.identity().name,
                        dev.id(),
                        state.consecutive_failures
                    ),
                    json!({
                        "device_id": dev.id(),
                        "addr": dev.addr().to_string(),
                        "last_seen": state.last_seen,
                        "error": err,
                    }),
                ),
            );
        }
    }
}

fn decode_as<T: DeserializeOwned>(method: &'static str, result: Value) -> Result<T, DeviceError> {
    serde_json::from_value(result).map_err(|e| DeviceError::decode(method, e.to_string()))
}

fn decode_mode_info(method: &'static str, result: Value) -> Result<ModeInfo, DeviceError> {
    let mode = result
        .get("mode")
        .and_then(DeviceMode::from_wire)
        .ok_or_else(|| DeviceError::decode(method, format!("unknown mode in {result}")))?;
    let number = |key: &str| result.get(key).and_then(Value::as_f64);
    Ok(ModeInfo {
        mode,
        ongrid_power: number("ongrid_power"),
        offgrid_power: number("offgrid_power"),
        bat_soc: result
            .get("bat_soc")
            .and_then(Value::as_u64)
            .and_then(|v| u8::try_from(v).ok()),
    })
}

fn decode_set_result(method: &'static str, result: Value) -> Result<bool, DeviceError> {
    result
        .get("set_result")
        .and_then(Value::as_bool)
        .ok_or_else(|| DeviceError::decode(method, format!("missing set_result in {result}")))
}

/// `ES.SetMode` parameters for a target mode.
pub fn set_mode_params(mode: &Mode, params: &ModeParams) -> Value {
    let config = match mode {
        Mode::Auto => json!({
            "mode": "Auto",
            "auto_cfg": { "enable": 1 },
        }),
        Mode::Manual { power_w } => json!({
            "mode": "Manual",
            "manual_cfg": {
                "time_num": params.manual_slot,
                "start_time": params.manual_start.format("%H:%M").to_string(),
                "end_time": params.manual_end.format("%H:%M").to_string(),
                "week_set": params.week_set,
                "power": power_w,
                "enable": 1,
            },
        }),
        // Negative passive power charges from the grid
        Mode::Precharge { charge_w } => json!({
            "mode": "Passive",
            "passive_cfg": {
                "power": -i64::from(*charge_w),
                "cd_time": params.passive_countdown_secs,
            },
        }),
    };
    json!({ "id": INSTANCE_ID, "config": config })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_write_enables_auto_cfg() {
        let v = set_mode_params(&Mode::Auto, &ModeParams::default());
        assert_eq!(v, json!({"id": 0, "config": {"mode": "Auto", "auto_cfg": {"enable": 1}}}));
    }

    #[test]
    fn manual_write_carries_time_slot() {
        let v = set_mode_params(&Mode::Manual { power_w: 0 }, &ModeParams::default());
        assert_eq!(
            v["config"]["manual_cfg"],
            json!({
                "time_num": 0,
                "start_time": "22:00",
                "end_time": "06:00",
                "week_set": 127,
                "power": 0,
                "enable": 1
            })
        );
    }

    #[test]
    fn precharge_write_is_negative_passive_power() {
        let v = set_mode_params(&Mode::Precharge { charge_w: 2500 }, &ModeParams::default());
        assert_eq!(v["config"]["mode"], "Passive");
        assert_eq!(v["config"]["passive_cfg"], json!({"power": -2500, "cd_time": 28800}));
    }

    #[test]
    fn mode_info_accepts_numeric_modes() {
        let info = decode_mode_info(GET_MODE, json!({"id": 0, "mode": 3, "bat_soc": 55})).unwrap();
        assert_eq!(info.mode, DeviceMode::Passive);
        assert_eq!(info.bat_soc, Some(55));
        assert!(decode_mode_info(GET_MODE, json!({"id": 0})).is_err());
    }

    #[test]
    fn set_result_must_be_present() {
        assert!(decode_set_result(SET_MODE, json!({"id": 0, "set_result": true})).unwrap());
        assert!(!decode_set_result(SET_MODE, json!({"set_result": false})).unwrap());
        assert!(matches!(
            decode_set_result(SET_MODE, json!({"id": 0})),
            Err(DeviceError::Decode { .. })
        ));
    }
}
