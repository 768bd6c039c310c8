use crate::types::MachineId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("M{machine}: invalid machine configuration: {reason}")]
    InvalidMachine { machine: MachineId, reason: String },

    #[error("Zone error: {0}")]
    Zone(String),

    #[error("Channel overlap: M{first} and M{second} both claim relay channel {channel}")]
    ChannelOverlap {
        first: MachineId,
        second: MachineId,
        channel: u16,
    },
}

impl Error {
    /// Machine this error is scoped to, if any
    pub fn machine(&self) -> Option<MachineId> {
        match self {
            Error::InvalidMachine { machine, .. } => Some(*machine),
            Error::ChannelOverlap { second, .. } => Some(*second),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Deserialization(err.to_string())
        } else {
            Error::Serialization(err.to_string())
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_display_names_both_machines() {
        let err = Error::ChannelOverlap {
            first: MachineId(1),
            second: MachineId(2),
            channel: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains("M1"));
        assert!(msg.contains("M2"));
        assert!(msg.contains("8"));
        assert_eq!(err.machine(), Some(MachineId(2)));
    }

    #[test]
    fn test_json_error_maps_to_deserialization() {
        let err: Error = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
