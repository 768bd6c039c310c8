//! Actuator bank: the only owner of the relay device
//!
//! Every write goes through one bank-wide lock. Outputs follow the fault-only convention:
//! an energized channel means FAULT, a de-energized channel means nothing is asserted.

use crate::device::RelayDevice;
use crate::error::CnsError;
use chrono::{DateTime, Utc};
use pairguard_core::{ChannelStatus, MachineId, RelayChannel, RelayConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of a write to one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub machine: Option<MachineId>,
    pub channel: RelayChannel,
    pub status: ChannelStatus,
    pub at: DateTime<Utc>,
}

pub struct ActuatorBank {
    device: Mutex<Box<dyn RelayDevice>>,
    config: RelayConfig,
    pairs: usize,
    machines: RwLock<BTreeMap<MachineId, RelayChannel>>,
    statuses: RwLock<BTreeMap<RelayChannel, ChannelStatus>>,
    events: broadcast::Sender<ChannelEvent>,
    interrupt: CancellationToken,
}

impl ActuatorBank {
    pub fn new(device: Box<dyn RelayDevice>, config: RelayConfig, pairs: usize) -> Self {
        let (events, _) = broadcast::channel(1000);
        Self {
            device: Mutex::new(device),
            config,
            pairs,
            machines: RwLock::new(BTreeMap::new()),
            statuses: RwLock::new(BTreeMap::new()),
            events,
            interrupt: CancellationToken::new(),
        }
    }

    /// Open the device and de-energize the whole board. A board that cannot be opened
    /// leaves every channel Unknown; later writes reinitialize the device. Returns
    /// `false` unless every channel was reset.
    pub async fn initialize(&self) -> bool {
        let mut device = self.device.lock().await;
        if !device.is_connected() {
            if let Err(e) = device.open().await {
                error!("Relay device {} unavailable: {}", device.name(), e);
                drop(device);
                for channel in 1..=self.config.channel_count {
                    self.record(None, channel, false, false);
                }
                return false;
            }
        }
        info!("Relay device ready: {}", device.name());
        let mut failed = 0;
        for channel in 1..=self.config.channel_count {
            let status = match device.write(channel, false).await {
                Ok(()) => ChannelStatus::DeEnergized,
                Err(e) => {
                    warn!("Failed to reset relay channel {}: {}", channel, e);
                    failed += 1;
                    ChannelStatus::Unknown
                }
            };
            self.statuses.write().insert(channel, status);
        }
        if failed > 0 {
            warn!("{} relay channels could not be reset during initialization", failed);
        }
        failed == 0
    }

    /// Assign `pairs` consecutive channels starting at `start` to a machine and drive them OK
    pub async fn configure(&self, machine: MachineId, start: RelayChannel) -> Result<(), CnsError> {
        let width = u32::try_from(self.pairs).unwrap_or(u32::MAX);
        let end = (start as u32).saturating_add(width);
        if start == 0 || end - 1 > self.config.channel_count as u32 {
            return Err(CnsError::Config(format!(
                "M{}: channels {}..{} do not fit a {}-channel board",
                machine, start, end, self.config.channel_count
            )));
        }
        {
            let mut machines = self.machines.write();
            for (other, other_start) in machines.iter() {
                if *other == machine {
                    continue;
                }
                let other_end = (*other_start as u32).saturating_add(width);
                if (start as u32) < other_end && (*other_start as u32) < end {
                    return Err(CnsError::Config(format!(
                        "M{}: channels {}..{} overlap M{}",
                        machine, start, end, other
                    )));
                }
            }
            machines.insert(machine, start);
        }
        info!("M{}: relay channels {}..={}", machine, start, end - 1);
        self.reset_machine(machine).await;
        Ok(())
    }

    pub fn channels(&self, machine: MachineId) -> Option<Vec<RelayChannel>> {
        let start = *self.machines.read().get(&machine)?;
        Some((0..self.pairs as RelayChannel).map(|i| start + i).collect())
    }

    /// Write one bit per pair: `true` energizes (FAULT), `false` de-energizes (OK).
    /// Returns `false` if any channel could not be written.
    pub async fn apply(&self, machine: MachineId, faults: &[bool]) -> bool {
        let Some(channels) = self.channels(machine) else {
            warn!("M{}: apply on a machine without relay channels", machine);
            return false;
        };
        if faults.len() != channels.len() {
            warn!(
                "M{}: expected {} fault flags, got {}",
                machine,
                channels.len(),
                faults.len()
            );
            return false;
        }
        let mut ok = true;
        for (channel, fault) in channels.into_iter().zip(faults.iter().copied()) {
            ok &= self.write_with_retry(Some(machine), channel, fault).await;
        }
        ok
    }

    /// Energize each of a machine's channels in turn for the configured hold time
    pub async fn test_machine(&self, machine: MachineId) -> Result<(), CnsError> {
        let channels = self
            .channels(machine)
            .ok_or(CnsError::UnknownMachine(machine))?;
        info!("M{}: testing relays {:?}", machine, channels);
        for (index, channel) in channels.iter().copied().enumerate() {
            self.write_with_retry(Some(machine), channel, true).await;
            let held = self.pause(self.config.test_hold()).await;
            self.write_with_retry(Some(machine), channel, false).await;
            held?;
            if index + 1 < channels.len() {
                self.pause(self.config.test_gap()).await?;
            }
        }
        info!("M{}: relay test complete", machine);
        Ok(())
    }

    pub async fn test_all(&self) -> Result<(), CnsError> {
        let machines: Vec<MachineId> = self.machines.read().keys().copied().collect();
        for machine in machines {
            self.test_machine(machine).await?;
        }
        Ok(())
    }

    /// Drive every channel of one machine OK
    pub async fn reset_machine(&self, machine: MachineId) -> bool {
        let pairs = self.pairs;
        self.apply(machine, &vec![false; pairs]).await
    }

    /// De-energize every configured channel. Best effort: a single attempt plus one
    /// reinitialization per channel, with no retry sleeps, so it also works after
    /// [`ActuatorBank::interrupt`].
    pub async fn reset_all(&self) -> bool {
        let configured: Vec<(MachineId, RelayChannel)> = self
            .machines
            .read()
            .iter()
            .flat_map(|(machine, start)| {
                (0..self.pairs as RelayChannel).map(move |i| (*machine, start + i))
            })
            .collect();

        let mut ok = true;
        for (machine, channel) in configured {
            let mut written = self.write_once(channel, false).await.is_ok();
            if !written && self.reinitialize().await.is_ok() {
                written = self.write_once(channel, false).await.is_ok();
            }
            self.record(Some(machine), channel, written, false);
            ok &= written;
        }
        if ok {
            info!("All relay channels reset");
        } else {
            error!("Relay reset incomplete, some outputs are in an unknown state");
        }
        ok
    }

    /// Cancel pending retry and test sleeps. Used on shutdown.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Release the device handle
    pub async fn close(&self) -> Result<(), CnsError> {
        self.device.lock().await.close().await
    }

    pub fn channel_status(&self, channel: RelayChannel) -> Option<ChannelStatus> {
        self.statuses.read().get(&channel).copied()
    }

    /// Status of each of a machine's channels, in pair order
    pub fn machine_statuses(&self, machine: MachineId) -> Vec<ChannelStatus> {
        let statuses = self.statuses.read();
        self.channels(machine)
            .unwrap_or_default()
            .into_iter()
            .map(|ch| statuses.get(&ch).copied().unwrap_or(ChannelStatus::Unknown))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn write_with_retry(&self, machine: Option<MachineId>, channel: RelayChannel, energized: bool) -> bool {
        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            match self.write_once(channel, energized).await {
                Ok(()) => {
                    self.record(machine, channel, true, energized);
                    return true;
                }
                Err(e) => warn!(
                    "Relay {} write failed (attempt {}/{}): {}",
                    channel, attempt, attempts, e
                ),
            }
            if self.pause(self.config.retry_delay()).await.is_err() {
                self.record(machine, channel, false, energized);
                return false;
            }
        }

        warn!("Relay {}: retries exhausted, reinitializing device", channel);
        let written = match self.reinitialize().await {
            Ok(()) => self.write_once(channel, energized).await.is_ok(),
            Err(e) => {
                error!("Relay device reinitialization failed: {}", e);
                false
            }
        };
        if !written {
            error!("Relay {}: state unknown after failed write", channel);
        }
        self.record(machine, channel, written, energized);
        written
    }

    async fn write_once(&self, channel: RelayChannel, energized: bool) -> Result<(), CnsError> {
        let mut device = self.device.lock().await;
        device.write(channel, energized).await
    }

    async fn reinitialize(&self) -> Result<(), CnsError> {
        let mut device = self.device.lock().await;
        if let Err(e) = device.close().await {
            warn!("Relay device close failed: {}", e);
        }
        device.open().await
    }

    async fn pause(&self, delay: Duration) -> Result<(), CnsError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.interrupt.cancelled() => Err(CnsError::Cancelled),
        }
    }

    fn record(&self, machine: Option<MachineId>, channel: RelayChannel, written: bool, energized: bool) {
        let status = match (written, energized) {
            (false, _) => ChannelStatus::Unknown,
            (true, true) => ChannelStatus::Energized,
            (true, false) => ChannelStatus::DeEnergized,
        };
        self.statuses.write().insert(channel, status);
        let _ = self.events.send(ChannelEvent {
            machine,
            channel,
            status,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedRelayBoard;

    async fn bank() -> (ActuatorBank, std::sync::Arc<parking_lot::RwLock<Vec<bool>>>) {
        let board = SimulatedRelayBoard::new(16);
        let outputs = board.outputs();
        let bank = ActuatorBank::new(Box::new(board), RelayConfig::default(), 3);
        assert!(bank.initialize().await);
        (bank, outputs)
    }

    #[tokio::test]
    async fn test_fault_energizes_channel() {
        let (bank, outputs) = bank().await;
        bank.configure(MachineId(1), 6).await.unwrap();
        assert!(bank.apply(MachineId(1), &[false, true, false]).await);
        let outputs = outputs.read();
        assert_eq!(&outputs[5..8], &[false, true, false]);
        assert_eq!(bank.channel_status(7), Some(ChannelStatus::Energized));
        assert_eq!(bank.channel_status(6), Some(ChannelStatus::DeEnergized));
    }

    #[tokio::test]
    async fn test_configure_rejects_bad_ranges() {
        let (bank, _) = bank().await;
        assert!(bank.configure(MachineId(1), 15).await.is_err());
        assert!(bank.configure(MachineId(1), 0).await.is_err());
        bank.configure(MachineId(1), 6).await.unwrap();
        assert!(bank.configure(MachineId(2), 8).await.is_err());
        bank.configure(MachineId(2), 9).await.unwrap();
        bank.configure(MachineId(1), 7).await.unwrap_err();
        // moving a machine over its own old range is fine
        bank.configure(MachineId(1), 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_unknown_machine_fails() {
        let (bank, _) = bank().await;
        assert!(!bank.apply(MachineId(9), &[true, true, true]).await);
    }

    #[tokio::test]
    async fn test_reset_all_clears_configured_channels() {
        let (bank, outputs) = bank().await;
        bank.configure(MachineId(1), 1).await.unwrap();
        bank.configure(MachineId(2), 4).await.unwrap();
        bank.apply(MachineId(1), &[true, true, true]).await;
        bank.apply(MachineId(2), &[true, false, true]).await;
        assert!(bank.reset_all().await);
        assert!(outputs.read().iter().all(|on| !on));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_test_pulses_each_channel() {
        let (bank, outputs) = bank().await;
        bank.configure(MachineId(1), 1).await.unwrap();
        let mut events = bank.subscribe();
        bank.test_machine(MachineId(1)).await.unwrap();
        assert!(outputs.read().iter().all(|on| !on));
        let mut energized = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.status == ChannelStatus::Energized {
                energized.push(event.channel);
            }
        }
        assert_eq!(energized, vec![1, 2, 3]);
    }
}
