//! In-process simulated fleet speaking the device protocol.
//!
//! Used when `hardware.mode = "simulated"` and as the transport double in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::gateway::{GET_BATTERY_STATUS, GET_DEVICE, GET_ENERGY_STATUS, GET_MODE, SET_MODE};
use crate::domain::DeviceMode;
use crate::transport::{Channel, Link};

/// Initial state and timing of one simulated device.
#[derive(Debug, Clone)]
pub struct SimDeviceConfig {
    pub hardware_id: String,
    pub mode: DeviceMode,
    pub soc: u8,
    pub temperature_c: f64,
    /// Time the device takes to answer any request
    pub latency: Duration,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            hardware_id: "00:00:00:00:00:00".to_string(),
            mode: DeviceMode::Auto,
            soc: 60,
            temperature_c: 24.0,
            latency: Duration::from_millis(200),
        }
    }
}

struct SimState {
    mode: DeviceMode,
    soc: u8,
    temperature_c: f64,
    last_config: Option<Value>,
}

/// One simulated battery. Fault knobs can be flipped while the fleet is in use.
pub struct SimDevice {
    addr: SocketAddr,
    hardware_id: String,
    latency: Duration,
    state: Mutex<SimState>,
    unreachable: AtomicBool,
    ignore_writes: AtomicBool,
    reject_next: AtomicU32,
    drop_next: AtomicU32,
    fail_energy: AtomicBool,
    requests: AtomicU32,
    writes: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimDevice {
    fn new(addr: SocketAddr, cfg: SimDeviceConfig) -> Self {
        Self {
            addr,
            hardware_id: cfg.hardware_id,
            latency: cfg.latency,
            state: Mutex::new(SimState {
                mode: cfg.mode,
                soc: cfg.soc,
                temperature_c: cfg.temperature_c,
                last_config: None,
            }),
            unreachable: AtomicBool::new(false),
            ignore_writes: AtomicBool::new(false),
            reject_next: AtomicU32::new(0),
            drop_next: AtomicU32::new(0),
            fail_energy: AtomicBool::new(false),
            requests: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn mode(&self) -> DeviceMode {
        self.state.lock().mode
    }

    pub fn set_mode(&self, mode: DeviceMode) {
        self.state.lock().mode = mode;
    }

    pub fn set_soc(&self, soc: u8) {
        self.state.lock().soc = soc;
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.state.lock().temperature_c = celsius;
    }

    /// Last `config` object accepted by `ES.SetMode`.
    pub fn last_config(&self) -> Option<Value> {
        self.state.lock().last_config.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Acknowledge writes without changing mode.
    pub fn set_ignore_writes(&self, ignore: bool) {
        self.ignore_writes.store(ignore, Ordering::SeqCst);
    }

    /// Answer the next `n` requests with an error object.
    pub fn reject_next(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Swallow the next `n` requests without answering.
    pub fn drop_next(&self, n: u32) {
        self.drop_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_energy(&self, fail: bool) {
        self.fail_energy.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Accepted `ES.SetMode` requests.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Highest number of requests this device ever processed at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn respond(&self, id: u64, method: &str, params: &Value) -> Option<Value> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.drop_next) {
            debug!(addr = %self.addr, method, "simulated device drops request");
            return None;
        }
        if Self::take_one(&self.reject_next) {
            return Some(json!({"id": id, "error": {"code": -32000, "message": "device busy"}}));
        }

        let mut st = self.state.lock();
        let result = match method {
            GET_BATTERY_STATUS => json!({
                "id": 0,
                "soc": st.soc,
                "charg_flag": st.mode == DeviceMode::Passive,
                "dischrg_flag": st.mode != DeviceMode::Passive,
                "bat_temp": st.temperature_c,
                "bat_capacity": f64::from(st.soc) * 51.2,
                "rated_capacity": 5120.0,
            }),
            GET_ENERGY_STATUS => {
                if self.fail_energy.load(Ordering::SeqCst) {
                    return None;
                }
                json!({
                    "id": 0,
                    "bat_soc": st.soc,
                    "bat_cap": 5120,
                    "pv_power": 0,
                    "ongrid_power": 120,
                    "offgrid_power": 0,
                    "bat_power": -120,
                    "total_pv_energy": 0,
                    "total_grid_output_energy": 1500,
                    "total_grid_input_energy": 900,
                    "total_load_energy": 0,
                })
            }
            GET_MODE => json!({
                "id": 0,
                "mode": st.mode.to_string(),
                "ongrid_power": 0,
                "offgrid_power": 0,
                "bat_soc": st.soc,
            }),
            SET_MODE => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                let config = params.get("config").cloned().unwrap_or(Value::Null);
                let target = config.get("mode").and_then(DeviceMode::from_wire);
                match target {
                    Some(mode) => {
                        if !self.ignore_writes.load(Ordering::SeqCst) {
                            st.mode = mode;
                        }
                        st.last_config = Some(config);
                        json!({"id": 0, "set_result": true})
                    }
                    None => json!({"id": 0, "set_result": false}),
                }
            }
            GET_DEVICE => json!({
                "device": "VenusE",
                "ver": 111,
                "ble_mac": self.hardware_id,
                "wifi_mac": self.hardware_id,
                "wifi_name": "sim",
                "ip": self.addr.ip().to_string(),
            }),
            other => {
                return Some(json!({"id": id, "error": {"code": -32601, "message": format!("unknown method {other}")}}))
            }
        };
        Some(json!({"id": id, "src": "VenusE-sim", "result": result}))
    }
}

/// Fleet-wide counters.
#[derive(Debug, Default)]
struct FleetStats {
    writes_in_flight: AtomicUsize,
    max_concurrent_writes: AtomicUsize,
}

/// Simulated network segment holding any number of devices.
#[derive(Default)]
pub struct SimFleet {
    devices: Mutex<HashMap<SocketAddr, Arc<SimDevice>>>,
    stats: Arc<FleetStats>,
}

impl SimFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, addr: SocketAddr, cfg: SimDeviceConfig) -> Arc<SimDevice> {
        let dev = Arc::new(SimDevice::new(addr, cfg));
        self.devices.lock().insert(addr, dev.clone());
        dev
    }

    pub fn device(&self, addr: SocketAddr) -> Option<Arc<SimDevice>> {
        self.devices.lock().get(&addr).cloned()
    }

    /// Highest number of `ES.SetMode` requests in flight across the fleet at once.
    pub fn max_concurrent_writes(&self) -> usize {
        self.stats.max_concurrent_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for SimFleet {
    async fn open(&self, target: SocketAddr) -> io::Result<Box<dyn Channel>> {
        let device = self
            .device(target)
            .filter(|d| !d.unreachable.load(Ordering::SeqCst))
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(Box::new(SimChannel {
            device,
            stats: self.stats.clone(),
            pending: None,
        }))
    }
}

struct SimChannel {
    device: Arc<SimDevice>,
    stats: Arc<FleetStats>,
    pending: Option<(u64, String, Value)>,
}

/// Tracks one request being processed; undone on drop so abandoned attempts are counted correctly.
struct InFlight {
    device: Arc<SimDevice>,
    stats: Option<Arc<FleetStats>>,
}

impl InFlight {
    fn enter(device: &Arc<SimDevice>, write: Option<&Arc<FleetStats>>) -> Self {
        let now = device.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        device.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(stats) = write {
            let now = stats.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            stats.max_concurrent_writes.fetch_max(now, Ordering::SeqCst);
        }
        Self {
            device: device.clone(),
            stats: write.cloned(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.device.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(stats) = &self.stats {
            stats.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Channel for SimChannel {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        let req: Value = serde_json::from_slice(datagram)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let id = req.get("id").and_then(Value::as_u64).unwrap_or_default();
        let method = req
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = req.get("params").cloned().unwrap_or(Value::Null);
        self.pending = Some((id, method, params));
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        let Some((id, method, params)) = self.pending.take() else {
            return std::future::pending().await;
        };
        let is_write = method == SET_MODE;
        let _guard = InFlight::enter(&self.device, is_write.then_some(&self.stats));
        tokio::time::sleep(self.device.latency).await;
        match self.device.respond(id, &method, &params) {
            Some(reply) => serde_json::to_vec(&reply)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => std::future::pending().await,
        }
    }
}
