//! Error types for pairguard-server

use pairguard_cns::CnsError;
use pairguard_core::MachineId;
use pairguard_eye::VisionError;
use thiserror::Error;

/// Conditions that prevent the process from starting
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] pairguard_core::Error),

    #[error("No enabled machine passed validation")]
    NoMachines,

    #[error("Detection model unavailable: {0}")]
    MissingModel(String),

    #[error("Relay device error: {0}")]
    Device(#[from] CnsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StartupError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) | StartupError::NoMachines => 2,
            StartupError::MissingModel(_) => 3,
            StartupError::Device(_) | StartupError::Io(_) => 1,
        }
    }
}

/// Failures of the runtime control surface
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("M{0}: unknown machine")]
    UnknownMachine(MachineId),

    #[error("M{machine}: rejected at startup: {reason}")]
    Rejected { machine: MachineId, reason: String },

    #[error("Zone update rejected: {0}")]
    Zones(#[from] VisionError),

    #[error("Relay error: {0}")]
    Relay(#[from] CnsError),

    #[error("{0}")]
    Config(#[from] pairguard_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(StartupError::NoMachines.exit_code(), 2);
        assert_eq!(
            StartupError::Config(pairguard_core::Error::Configuration("x".into())).exit_code(),
            2
        );
        assert_eq!(StartupError::MissingModel("best.onnx".into()).exit_code(), 3);
        assert_eq!(StartupError::Device(CnsError::Cancelled).exit_code(), 1);
    }
}
