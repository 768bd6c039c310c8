//! pairguard-cns: actuation and liveness for the monitoring runtime
//!
//! Provides:
//! - Relay device abstraction with simulated and serial backends
//! - The actuator bank, sole owner of the relay device
//! - Per-pipeline health supervision with timeout events

pub mod error;
pub mod device;
pub mod actuator;
pub mod health;

pub use error::CnsError;
pub use device::{build_device, lcus_frame, RelayDevice, SimulatedRelayBoard};
#[cfg(feature = "serial")]
pub use device::SerialRelayBoard;
pub use actuator::{ActuatorBank, ChannelEvent};
pub use health::{HealthState, HealthSupervisor, TimeoutEvent};
