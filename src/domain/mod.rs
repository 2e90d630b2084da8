pub mod device;
pub mod error;
pub mod job;
pub mod mode;
pub mod status;

pub use device::*;
pub use error::*;
pub use job::*;
pub use mode::*;
pub use status::*;
