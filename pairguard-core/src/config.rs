//! Configuration schema for the monitoring runtime

use crate::error::{Error, Result};
use crate::types::{MachineId, ObjectClass, RelayChannel};
use crate::zones::BoundaryKeys;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Confidence floor for classes without an explicit threshold
pub const DEFAULT_CONFIDENCE: f32 = 0.35;

/// Longest delay or timeout accepted from a configuration file
pub const MAX_DURATION_SECS: f64 = 86_400.0;

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::from_secs_f64(MAX_DURATION_SECS))
}

/// Finite, not negative (or strictly positive) and at most a day
fn check_secs(name: &str, value: f64, positive: bool) -> Result<()> {
    let low_ok = if positive { value > 0.0 } else { value >= 0.0 };
    if !value.is_finite() || !low_ok || value > MAX_DURATION_SECS {
        return Err(Error::Configuration(format!(
            "{} must be {} and at most {} seconds, got {}",
            name,
            if positive { "> 0" } else { ">= 0" },
            MAX_DURATION_SECS,
            value
        )));
    }
    Ok(())
}

/// Binding of a detector class to one side of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassBinding {
    /// Class index emitted by the detector
    pub class_id: u32,
    /// Human readable name, also the key into `confidence_thresholds`
    pub name: String,
    /// Suffix used in boundary file keys (`pair1_<key>`)
    pub boundary_key: String,
}

/// Both classes a pair is made of
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub primary: ClassBinding,
    pub secondary: ClassBinding,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            primary: ClassBinding {
                class_id: 0,
                name: "oil_can".to_string(),
                boundary_key: "oc".to_string(),
            },
            secondary: ClassBinding {
                class_id: 1,
                name: "bunk_hole".to_string(),
                boundary_key: "bh".to_string(),
            },
        }
    }
}

impl ClassConfig {
    pub fn binding(&self, class: ObjectClass) -> &ClassBinding {
        match class {
            ObjectClass::Primary => &self.primary,
            ObjectClass::Secondary => &self.secondary,
        }
    }

    /// Map a detector class index to a pair side
    pub fn classify(&self, class_id: u32) -> Option<ObjectClass> {
        if class_id == self.primary.class_id {
            Some(ObjectClass::Primary)
        } else if class_id == self.secondary.class_id {
            Some(ObjectClass::Secondary)
        } else {
            None
        }
    }

    pub fn boundary_keys(&self) -> BoundaryKeys<'_> {
        BoundaryKeys {
            primary: &self.primary.boundary_key,
            secondary: &self.secondary.boundary_key,
        }
    }
}

/// Video capture and reconnect settings shared by every machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub rtsp_timeout_ms: u64,
    pub buffer_size: u32,
    pub default_fps: u32,
    /// Consecutive failures before a source gives up and reports Failed
    pub max_reconnect_attempts: u32,
    /// Seconds; backoff grows linearly with the attempt number
    pub reconnect_backoff_base: f64,
    /// Seconds; backoff ceiling
    pub reconnect_backoff_max: f64,
    /// Upper bound on a single blocking read
    pub capture_timeout_ms: u64,
    /// Smallest accepted decoded frame (width, height)
    pub min_frame_size: (u32, u32),
    /// Largest accepted decoded frame (width, height)
    pub max_frame_size: (u32, u32),
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            rtsp_timeout_ms: 5000,
            buffer_size: 1,
            default_fps: 30,
            max_reconnect_attempts: 10,
            reconnect_backoff_base: 2.0,
            reconnect_backoff_max: 60.0,
            capture_timeout_ms: 5000,
            min_frame_size: (32, 32),
            max_frame_size: (7680, 4320),
        }
    }
}

impl CameraConfig {
    pub fn backoff_base(&self) -> Duration {
        secs(self.reconnect_backoff_base)
    }

    pub fn backoff_max(&self) -> Duration {
        secs(self.reconnect_backoff_max)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

/// Which relay hardware backend to drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayDeviceConfig {
    /// In-memory board; writes are only logged
    Simulated,
    /// Serial (CH340 style) relay board
    Serial { port: String, baud_rate: u32 },
}

impl Default for RelayDeviceConfig {
    fn default() -> Self {
        RelayDeviceConfig::Simulated
    }
}

/// Relay board settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub max_retries: u32,
    /// Seconds between write attempts
    pub retry_delay: f64,
    /// Number of outputs on the board, numbered from 1
    pub channel_count: u16,
    pub device: RelayDeviceConfig,
    /// Seconds a channel stays energized during a relay test
    pub test_hold: f64,
    /// Seconds between channels during a relay test
    pub test_gap: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: 0.5,
            channel_count: 16,
            device: RelayDeviceConfig::Simulated,
            test_hold: 1.0,
            test_gap: 0.5,
        }
    }
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        secs(self.retry_delay)
    }

    pub fn test_hold(&self) -> Duration {
        secs(self.test_hold)
    }

    pub fn test_gap(&self) -> Duration {
        secs(self.test_gap)
    }
}

/// What to do with a new frame when the shared queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the longest-waiting frame to admit the new one
    DropOldest,
    /// Refuse the new frame
    DropNewest,
}

/// Shared inference queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Seconds covered by the throughput window
    pub throughput_window: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 30,
            overflow_policy: OverflowPolicy::DropOldest,
            throughput_window: 1.0,
        }
    }
}

impl SchedulerConfig {
    pub fn throughput_window(&self) -> Duration {
        secs(self.throughput_window)
    }
}

/// One monitored machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub machine_id: MachineId,
    pub name: String,
    /// Stream URI, device index or `replay:<dir>`
    pub camera_source: String,
    /// First relay channel (1-based); pair `i` drives `start + i`
    pub relay_start_channel: RelayChannel,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl MachineConfig {
    /// Channels `[start, start + pairs)` driven by this machine. The end saturates at
    /// `u32::MAX`, which no board can hold.
    pub fn channel_range(&self, pairs: usize) -> std::ops::Range<u32> {
        let start = self.relay_start_channel as u32;
        let end = u32::try_from(pairs)
            .ok()
            .and_then(|pairs| start.checked_add(pairs))
            .unwrap_or(u32::MAX);
        start..end
    }
}

fn default_true() -> bool {
    true
}

fn default_pairs() -> usize {
    3
}

fn default_watchdog_timeout() -> f64 {
    15.0
}

fn default_watchdog_interval() -> f64 {
    1.0
}

fn default_model_path() -> PathBuf {
    PathBuf::from("best.onnx")
}

/// Complete system configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// Minimum confidence per class name
    #[serde(default)]
    pub confidence_thresholds: BTreeMap<String, f32>,
    #[serde(default)]
    pub classes: ClassConfig,
    #[serde(default = "default_pairs")]
    pub pairs_per_machine: usize,
    #[serde(default)]
    pub camera_config: CameraConfig,
    #[serde(default)]
    pub relay_config: RelayConfig,
    /// Seconds without a heartbeat before a pipeline is reported stalled
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: f64,
    /// Seconds between watchdog checks
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval: f64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Restart a Failed camera source when its watchdog fires
    #[serde(default = "default_true")]
    pub restart_failed_sources: bool,
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let mut confidence_thresholds = BTreeMap::new();
        confidence_thresholds.insert("oil_can".to_string(), 0.40);
        confidence_thresholds.insert("bunk_hole".to_string(), 0.35);

        let machines = [(1, 6, "192.168.1.64"), (2, 9, "192.168.1.65"), (3, 12, "192.168.1.66")]
            .into_iter()
            .map(|(id, start, host)| MachineConfig {
                machine_id: MachineId(id),
                name: format!("Machine {}", id),
                camera_source: format!("rtsp://{}:554/Streaming/Channels/101", host),
                relay_start_channel: start,
                enabled: true,
            })
            .collect();

        Self {
            model_path: default_model_path(),
            confidence_thresholds,
            classes: ClassConfig::default(),
            pairs_per_machine: default_pairs(),
            camera_config: CameraConfig::default(),
            relay_config: RelayConfig::default(),
            watchdog_timeout: default_watchdog_timeout(),
            watchdog_interval: default_watchdog_interval(),
            scheduler: SchedulerConfig::default(),
            restart_failed_sources: true,
            machines,
        }
    }
}

/// Outcome of per-machine validation
#[derive(Debug, Default)]
pub struct MachineValidation {
    /// Enabled machines that passed every check, in configuration order
    pub accepted: Vec<MachineConfig>,
    /// Enabled machines that must not run, with the reason
    pub rejected: Vec<(MachineId, Error)>,
}

impl MachineValidation {
    pub fn is_rejected(&self, machine: MachineId) -> bool {
        self.rejected.iter().any(|(id, _)| *id == machine)
    }
}

impl SystemConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        secs(self.watchdog_timeout)
    }

    pub fn watchdog_interval(&self) -> Duration {
        secs(self.watchdog_interval)
    }

    /// Confidence floor for one side of a pair
    pub fn threshold_for(&self, class: ObjectClass) -> f32 {
        let name = &self.classes.binding(class).name;
        self.confidence_thresholds
            .get(name)
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE)
    }

    /// Validate settings that apply to the whole process
    pub fn validate(&self) -> Result<()> {
        if self.pairs_per_machine == 0 {
            return Err(Error::Configuration("pairs_per_machine must be > 0".to_string()));
        }
        if self.classes.primary.class_id == self.classes.secondary.class_id {
            return Err(Error::Configuration(
                "primary and secondary classes must use different class ids".to_string(),
            ));
        }
        if self.classes.primary.boundary_key == self.classes.secondary.boundary_key {
            return Err(Error::Configuration(
                "primary and secondary classes must use different boundary keys".to_string(),
            ));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(Error::Configuration("scheduler.queue_capacity must be > 0".to_string()));
        }
        check_secs("scheduler.throughput_window", self.scheduler.throughput_window, true)?;
        check_secs("watchdog_timeout", self.watchdog_timeout, true)?;
        check_secs("watchdog_interval", self.watchdog_interval, true)?;
        check_secs(
            "camera_config.reconnect_backoff_base",
            self.camera_config.reconnect_backoff_base,
            false,
        )?;
        check_secs(
            "camera_config.reconnect_backoff_max",
            self.camera_config.reconnect_backoff_max,
            false,
        )?;
        check_secs("relay_config.retry_delay", self.relay_config.retry_delay, false)?;
        check_secs("relay_config.test_hold", self.relay_config.test_hold, false)?;
        check_secs("relay_config.test_gap", self.relay_config.test_gap, false)?;
        if self.camera_config.max_reconnect_attempts == 0 {
            return Err(Error::Configuration(
                "camera_config.max_reconnect_attempts must be > 0".to_string(),
            ));
        }
        let (min_w, min_h) = self.camera_config.min_frame_size;
        let (max_w, max_h) = self.camera_config.max_frame_size;
        if min_w == 0 || min_h == 0 || min_w > max_w || min_h > max_h {
            return Err(Error::Configuration("camera_config frame size bounds are invalid".to_string()));
        }
        if self.relay_config.channel_count == 0 {
            return Err(Error::Configuration("relay_config.channel_count must be > 0".to_string()));
        }
        if self.pairs_per_machine > self.relay_config.channel_count as usize {
            return Err(Error::Configuration(format!(
                "pairs_per_machine ({}) exceeds relay_config.channel_count ({})",
                self.pairs_per_machine, self.relay_config.channel_count
            )));
        }
        if self.relay_config.max_retries == 0 {
            return Err(Error::Configuration("relay_config.max_retries must be > 0".to_string()));
        }
        for (name, value) in &self.confidence_thresholds {
            if !(0.0..=1.0).contains(value) {
                return Err(Error::Configuration(format!(
                    "confidence threshold for {} must be within [0, 1]",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Check every enabled machine on its own. A machine that fails is rejected without
    /// affecting the others; both machines of an overlapping channel range are rejected.
    pub fn validate_machines(&self) -> MachineValidation {
        let pairs = self.pairs_per_machine;
        let board = 1..=self.relay_config.channel_count as u32;
        let mut rejected: Vec<(MachineId, Error)> = Vec::new();
        let mut seen = HashSet::new();
        let mut candidates: Vec<&MachineConfig> = Vec::new();

        for machine in self.machines.iter().filter(|m| m.enabled) {
            let id = machine.machine_id;
            if id.0 == 0 {
                rejected.push((id, invalid(id, "machine_id must be a positive integer")));
                continue;
            }
            if !seen.insert(id) {
                rejected.push((id, invalid(id, "duplicate machine_id")));
                continue;
            }
            if machine.camera_source.trim().is_empty() {
                rejected.push((id, invalid(id, "camera_source is empty")));
                continue;
            }
            let range = machine.channel_range(pairs);
            let last = range.end.saturating_sub(1);
            if range.is_empty() || !board.contains(&range.start) || !board.contains(&last) {
                rejected.push((
                    id,
                    invalid(
                        id,
                        &format!(
                            "relay channels {}..={} fall outside the board (1..={})",
                            range.start,
                            last,
                            self.relay_config.channel_count
                        ),
                    ),
                ));
                continue;
            }
            candidates.push(machine);
        }

        let mut overlapping = HashSet::new();
        for (i, a) in candidates.iter().enumerate() {
            for b in candidates.iter().skip(i + 1) {
                let ra = a.channel_range(pairs);
                let rb = b.channel_range(pairs);
                if ra.start < rb.end && rb.start < ra.end {
                    let channel = ra.start.max(rb.start) as RelayChannel;
                    if overlapping.insert(a.machine_id) {
                        rejected.push((
                            a.machine_id,
                            Error::ChannelOverlap {
                                first: b.machine_id,
                                second: a.machine_id,
                                channel,
                            },
                        ));
                    }
                    if overlapping.insert(b.machine_id) {
                        rejected.push((
                            b.machine_id,
                            Error::ChannelOverlap {
                                first: a.machine_id,
                                second: b.machine_id,
                                channel,
                            },
                        ));
                    }
                }
            }
        }

        let accepted = candidates
            .into_iter()
            .filter(|m| !overlapping.contains(&m.machine_id))
            .cloned()
            .collect();

        MachineValidation { accepted, rejected }
    }
}

fn invalid(machine: MachineId, reason: &str) -> Error {
    Error::InvalidMachine {
        machine,
        reason: reason.to_string(),
    }
}
