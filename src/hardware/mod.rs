pub mod factory;
pub mod gateway;
#[cfg(feature = "sim")]
pub mod sim;

pub use factory::{HardwareMode, LinkFactory};
pub use gateway::DeviceGateway;
