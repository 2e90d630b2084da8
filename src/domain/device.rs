use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::error::DeviceError;
use super::mode::DeviceMode;
use super::status::DeviceStatus;

/// Fleet-level errors. Per-device failures are reported as outcomes instead.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("no devices configured")]
    NoDevices,
    #[error("duplicate device id {0}")]
    DuplicateDevice(DeviceId),
    #[error("fleet operation interrupted: {0}")]
    Interrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static identity of a configured device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub name: String,
    pub addr: SocketAddr,
    /// Stable hardware id (BLE MAC on the devices we drive)
    pub hardware_id: String,
    /// Disabled devices stay in the registry but are skipped by fleet operations
    pub enabled: bool,
}

/// Mutable state, updated on every interaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceState {
    pub known_mode: Option<DeviceMode>,
    pub last_seen: Option<DateTime<Utc>>,
    pub online: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Serializable snapshot of one registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    #[serde(flatten)]
    pub state: DeviceState,
}

/// Liveness transition produced by recording an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unchanged,
    WentOffline,
    CameOnline,
}

/// One device in the registry.
///
/// `io` is the per-device serialization lock: whoever issues requests to the
/// device holds it for the whole exchange, so at most one request is in flight.
pub struct DeviceEntry {
    identity: DeviceIdentity,
    state: RwLock<DeviceState>,
    status: Mutex<Option<DeviceStatus>>,
    /// Time and failure (if any) of the last poll attempt
    last_poll: Mutex<Option<(Instant, Option<DeviceError>)>>,
    io: tokio::sync::Mutex<()>,
}

impl DeviceEntry {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            state: RwLock::new(DeviceState::default()),
            status: Mutex::new(None),
            last_poll: Mutex::new(None),
            io: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.identity.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn addr(&self) -> SocketAddr {
        self.identity.addr
    }

    pub fn state(&self) -> DeviceState {
        self.state.read().clone()
    }

    pub fn snapshot(&self) -> Device {
        Device {
            identity: self.identity.clone(),
            state: self.state(),
        }
    }

    /// Acquire exclusive request access to this device.
    pub async fn lock_io(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.io.lock().await
    }

    /// Record a successful exchange. `mode` is only set when the exchange told us the mode.
    pub fn record_success(&self, mode: Option<DeviceMode>, escalate_after: u32) -> Liveness {
        let mut st = self.state.write();
        let was_offline = st.consecutive_failures >= escalate_after.max(1);
        st.last_seen = Some(Utc::now());
        st.online = true;
        st.consecutive_failures = 0;
        st.last_error = None;
        if let Some(mode) = mode {
            st.known_mode = Some(mode);
        }
        if was_offline {
            Liveness::CameOnline
        } else {
            Liveness::Unchanged
        }
    }

    /// Record a failed exchange. Identity, known mode and last-seen are left untouched.
    pub fn record_failure(&self, error: &str, escalate_after: u32) -> Liveness {
        let mut st = self.state.write();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.last_error = Some(error.to_string());
        if st.consecutive_failures == escalate_after.max(1) {
            st.online = false;
            Liveness::WentOffline
        } else {
            Liveness::Unchanged
        }
    }

    /// Last successfully polled status, whatever its age.
    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.status.lock().clone()
    }

    /// Result of the last poll attempt if it ended less than `min_interval` ago.
    pub fn recent_poll(&self, min_interval: Duration) -> Option<Result<DeviceStatus, DeviceError>> {
        let last_poll = self.last_poll.lock();
        let (at, failure) = last_poll.as_ref()?;
        if at.elapsed() >= min_interval {
            return None;
        }
        match failure {
            Some(error) => Some(Err(error.clone())),
            None => self.last_status().map(Ok),
        }
    }

    pub fn store_status(&self, status: DeviceStatus) {
        *self.status.lock() = Some(status);
        *self.last_poll.lock() = Some((Instant::now(), None));
    }

    pub fn store_poll_failure(&self, error: DeviceError) {
        *self.last_poll.lock() = Some((Instant::now(), Some(error)));
    }
}

/// Registry of configured devices, ordered by id.
#[derive(Clone)]
pub struct DeviceRegistry {
    entries: Arc<BTreeMap<DeviceId, Arc<DeviceEntry>>>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<DeviceIdentity>) -> Result<Self, FleetError> {
        if devices.is_empty() {
            return Err(FleetError::NoDevices);
        }
        let mut entries = BTreeMap::new();
        for identity in devices {
            let id = identity.id;
            if entries.insert(id, Arc::new(DeviceEntry::new(identity))).is_some() {
                return Err(FleetError::DuplicateDevice(id));
            }
        }
        Ok(Self {
            entries: Arc::new(entries),
        })
    }

    pub fn get(&self, id: DeviceId) -> Option<Arc<DeviceEntry>> {
        self.entries.get(&id).cloned()
    }

    /// Enabled devices in ascending id order.
    pub fn active(&self) -> Vec<Arc<DeviceEntry>> {
        self.entries
            .values()
            .filter(|e| e.identity.enabled)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.entries.values().map(|e| e.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: u32, enabled: bool) -> DeviceIdentity {
        DeviceIdentity {
            id: DeviceId(id),
            name: format!("batt{id}"),
            addr: format!("127.0.0.1:{}", 30000 + id).parse().unwrap(),
            hardware_id: format!("aa:bb:cc:00:00:0{id}"),
            enabled,
        }
    }

    #[test]
    fn empty_registry_is_rejected() {
        assert!(matches!(DeviceRegistry::new(vec![]), Err(FleetError::NoDevices)));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = DeviceRegistry::new(vec![identity(1, true), identity(1, true)]).err();
        assert!(matches!(err, Some(FleetError::DuplicateDevice(DeviceId(1)))));
    }

    #[test]
    fn active_devices_are_sorted_and_skip_disabled() {
        let reg =
            DeviceRegistry::new(vec![identity(3, true), identity(1, true), identity(2, false)])
                .unwrap();
        let ids: Vec<u32> = reg.active().iter().map(|e| e.id().0).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(reg.snapshot().len(), 3);
    }

    #[test]
    fn failures_escalate_once_and_recover() {
        let entry = DeviceEntry::new(identity(1, true));
        entry.record_success(Some(DeviceMode::Auto), 3);
        let seen = entry.state().last_seen;

        assert_eq!(entry.record_failure("timeout", 3), Liveness::Unchanged);
        assert_eq!(entry.record_failure("timeout", 3), Liveness::Unchanged);
        assert_eq!(entry.record_failure("timeout", 3), Liveness::WentOffline);
        assert_eq!(entry.record_failure("timeout", 3), Liveness::Unchanged);

        let st = entry.state();
        assert!(!st.online);
        assert_eq!(st.known_mode, Some(DeviceMode::Auto));
        assert_eq!(st.last_seen, seen);

        assert_eq!(entry.record_success(None, 3), Liveness::CameOnline);
        assert!(entry.state().online);
        assert_eq!(entry.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_is_remembered_for_the_interval() {
        let entry = DeviceEntry::new(identity(1, true));
        assert!(entry.recent_poll(Duration::from_secs(60)).is_none());

        let error = DeviceError::Timeout { method: "Bat.GetStatus".into(), attempts: 5 };
        entry.store_poll_failure(error.clone());
        assert_eq!(entry.recent_poll(Duration::from_secs(60)), Some(Err(error)));
        assert!(entry.last_status().is_none());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(entry.recent_poll(Duration::from_secs(60)).is_none());
    }
}
