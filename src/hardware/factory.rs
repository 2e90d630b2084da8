use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::Config;
use crate::transport::{Link, UdpLink};

/// How devices are reached.
///
/// Simulated mode is only available when the `sim` feature is enabled, so a
/// production build cannot silently drive a fake fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Real devices over UDP
    #[default]
    Udp,
    /// In-process simulated fleet built from the configured devices
    Simulated,
}

/// Builds the datagram link for the configured hardware mode.
pub struct LinkFactory {
    mode: HardwareMode,
}

impl LinkFactory {
    pub fn new(mode: HardwareMode) -> Self {
        Self { mode }
    }

    pub fn create_link(&self, config: &Config) -> Result<Arc<dyn Link>> {
        match self.mode {
            HardwareMode::Udp => Ok(Arc::new(UdpLink)),
            #[cfg(feature = "sim")]
            HardwareMode::Simulated => {
                use super::sim::{SimDeviceConfig, SimFleet};

                tracing::warn!(
                    devices = config.devices.len(),
                    "using simulated fleet; no real device will be driven"
                );
                let fleet = SimFleet::new();
                for dev in &config.devices {
                    let identity = dev.identity();
                    fleet.add(
                        identity.addr,
                        SimDeviceConfig {
                            hardware_id: identity.hardware_id,
                            ..SimDeviceConfig::default()
                        },
                    );
                }
                Ok(fleet as Arc<dyn Link>)
            }
            #[cfg(not(feature = "sim"))]
            HardwareMode::Simulated => {
                let _ = config;
                anyhow::bail!("hardware.mode = \"simulated\" requires the `sim` feature")
            }
        }
    }
}

impl Default for LinkFactory {
    fn default() -> Self {
        Self::new(HardwareMode::Udp)
    }
}
