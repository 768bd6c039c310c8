//! Error types for pairguard-cns

use pairguard_core::{MachineId, RelayChannel};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CnsError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Channel {channel} out of range (board has {count} channels)")]
    Channel { channel: RelayChannel, count: u16 },

    #[error("M{0}: not configured on the actuator bank")]
    UnknownMachine(MachineId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Core error: {0}")]
    Core(#[from] pairguard_core::Error),
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for CnsError {
    fn from(err: serialport::Error) -> Self {
        CnsError::Device(err.to_string())
    }
}

impl From<std::io::Error> for CnsError {
    fn from(err: std::io::Error) -> Self {
        CnsError::Device(err.to_string())
    }
}
