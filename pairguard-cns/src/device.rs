//! Relay device abstraction

use crate::error::CnsError;
use async_trait::async_trait;
use pairguard_core::{RelayChannel, RelayConfig, RelayDeviceConfig};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Multi-channel output board. Channels are numbered from 1.
///
/// Implementations are not required to support concurrent commands; the actuator bank
/// serializes every call.
#[async_trait]
pub trait RelayDevice: Send + Sync {
    /// Human readable device name for logs
    fn name(&self) -> String;

    /// Open the underlying handle
    async fn open(&mut self) -> Result<(), CnsError>;

    /// Release the underlying handle
    async fn close(&mut self) -> Result<(), CnsError>;

    /// Drive one output. `energized == true` asserts the channel.
    async fn write(&mut self, channel: RelayChannel, energized: bool) -> Result<(), CnsError>;

    fn is_connected(&self) -> bool;
}

/// Build the backend selected in the relay configuration
pub fn build_device(config: &RelayConfig) -> Result<Box<dyn RelayDevice>, CnsError> {
    match &config.device {
        RelayDeviceConfig::Simulated => Ok(Box::new(SimulatedRelayBoard::new(config.channel_count))),
        #[cfg(feature = "serial")]
        RelayDeviceConfig::Serial { port, baud_rate } => Ok(Box::new(SerialRelayBoard::new(
            port.clone(),
            *baud_rate,
            config.channel_count,
        ))),
        #[cfg(not(feature = "serial"))]
        RelayDeviceConfig::Serial { port, .. } => Err(CnsError::Config(format!(
            "serial relay board on {} requested but the `serial` feature is not enabled",
            port
        ))),
    }
}

/// In-memory board. Writes are only logged, the resulting output levels can be inspected.
pub struct SimulatedRelayBoard {
    channel_count: u16,
    outputs: Arc<RwLock<Vec<bool>>>,
    connected: bool,
}

impl SimulatedRelayBoard {
    pub fn new(channel_count: u16) -> Self {
        Self {
            channel_count,
            outputs: Arc::new(RwLock::new(vec![false; channel_count as usize])),
            connected: false,
        }
    }

    /// Shared view of the output levels, index 0 is channel 1
    pub fn outputs(&self) -> Arc<RwLock<Vec<bool>>> {
        self.outputs.clone()
    }
}

#[async_trait]
impl RelayDevice for SimulatedRelayBoard {
    fn name(&self) -> String {
        format!("simulated board ({} channels)", self.channel_count)
    }

    async fn open(&mut self) -> Result<(), CnsError> {
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CnsError> {
        self.connected = false;
        Ok(())
    }

    async fn write(&mut self, channel: RelayChannel, energized: bool) -> Result<(), CnsError> {
        if !self.connected {
            return Err(CnsError::Device("Not connected".to_string()));
        }
        if channel == 0 || channel > self.channel_count {
            return Err(CnsError::Channel {
                channel,
                count: self.channel_count,
            });
        }
        self.outputs.write()[channel as usize - 1] = energized;
        debug!("Simulated relay {} -> {}", channel, if energized { "ON" } else { "OFF" });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// LCUS command frame: header, channel, state, additive checksum
pub fn lcus_frame(channel: RelayChannel, energized: bool) -> [u8; 4] {
    let channel = channel as u8;
    let state = energized as u8;
    let checksum = 0xA0u8.wrapping_add(channel).wrapping_add(state);
    [0xA0, channel, state, checksum]
}

#[cfg(feature = "serial")]
pub use serial::SerialRelayBoard;

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use parking_lot::Mutex;
    use serialport::SerialPort;
    use std::io::Write;
    use std::time::Duration;

    /// USB serial relay board speaking the LCUS protocol
    pub struct SerialRelayBoard {
        port_name: String,
        baud_rate: u32,
        channel_count: u16,
        port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    }

    impl SerialRelayBoard {
        pub fn new(port_name: String, baud_rate: u32, channel_count: u16) -> Self {
            Self {
                port_name,
                baud_rate,
                channel_count,
                port: None,
            }
        }
    }

    #[async_trait]
    impl RelayDevice for SerialRelayBoard {
        fn name(&self) -> String {
            format!("serial board {} @ {}", self.port_name, self.baud_rate)
        }

        async fn open(&mut self) -> Result<(), CnsError> {
            let name = self.port_name.clone();
            let baud = self.baud_rate;
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(name, baud)
                    .timeout(Duration::from_millis(500))
                    .open()
            })
            .await
            .map_err(|e| CnsError::Device(e.to_string()))??;
            info!("Opened relay board on {}", self.port_name);
            self.port = Some(Arc::new(Mutex::new(port)));
            Ok(())
        }

        async fn close(&mut self) -> Result<(), CnsError> {
            self.port = None;
            Ok(())
        }

        async fn write(&mut self, channel: RelayChannel, energized: bool) -> Result<(), CnsError> {
            if channel == 0 || channel > self.channel_count {
                return Err(CnsError::Channel {
                    channel,
                    count: self.channel_count,
                });
            }
            let port = self
                .port
                .clone()
                .ok_or_else(|| CnsError::Device("Not connected".to_string()))?;
            let frame = lcus_frame(channel, energized);
            tokio::task::spawn_blocking(move || {
                let mut port = port.lock();
                port.write_all(&frame)?;
                port.flush()
            })
            .await
            .map_err(|e| CnsError::Device(e.to_string()))??;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.port.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcus_frame_checksum() {
        assert_eq!(lcus_frame(1, true), [0xA0, 0x01, 0x01, 0xA2]);
        assert_eq!(lcus_frame(6, false), [0xA0, 0x06, 0x00, 0xA6]);
    }

    #[tokio::test]
    async fn test_simulated_board_requires_open() {
        let mut board = SimulatedRelayBoard::new(4);
        assert!(board.write(1, true).await.is_err());
        board.open().await.unwrap();
        board.write(2, true).await.unwrap();
        assert_eq!(*board.outputs().read(), vec![false, true, false, false]);
        assert!(matches!(
            board.write(5, true).await,
            Err(CnsError::Channel { channel: 5, count: 4 })
        ));
    }

    #[test]
    fn test_build_device_defaults_to_simulated() {
        let device = build_device(&RelayConfig::default()).unwrap();
        assert!(device.name().contains("simulated"));
    }
}
