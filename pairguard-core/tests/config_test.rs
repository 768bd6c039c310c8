//! Configuration files as written by the boundary and setup tools

use pairguard_core::{
    ConfigStore, MachineId, ObjectClass, OverflowPolicy, PairVerdict, RelayDeviceConfig,
};
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

const LEGACY_CONFIG: &str = r#"{
    "model_path": "best.pt",
    "confidence_thresholds": {"oil_can": 0.40, "bunk_hole": 0.35},
    "camera_config": {
        "rtsp_timeout_ms": 5000,
        "buffer_size": 1,
        "default_fps": 30,
        "max_reconnect_attempts": 10,
        "reconnect_backoff_max": 60
    },
    "relay_config": {"max_retries": 3, "retry_delay": 0.5},
    "watchdog_timeout": 15,
    "machines": [
        {"machine_id": 1, "name": "Machine 1", "camera_source": "rtsp://192.168.1.64:554/Streaming/Channels/101", "relay_start_channel": 6, "enabled": true},
        {"machine_id": 2, "name": "Machine 2", "camera_source": "rtsp://192.168.1.65:554/Streaming/Channels/101", "relay_start_channel": 9, "enabled": true},
        {"machine_id": 3, "name": "Machine 3", "camera_source": "rtsp://192.168.1.66:554/Streaming/Channels/101", "relay_start_channel": 12, "enabled": false}
    ]
}"#;

#[test]
fn test_legacy_config_loads_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("machines_config.json");
    fs::write(&path, LEGACY_CONFIG).unwrap();

    let config = ConfigStore::new(&path).load().unwrap();
    assert_eq!(config.model_path.to_str(), Some("best.pt"));
    assert_eq!(config.pairs_per_machine, 3);
    assert_eq!(config.watchdog_timeout().as_secs(), 15);
    assert_eq!(config.camera_config.reconnect_backoff_base, 2.0);
    assert_eq!(config.camera_config.reconnect_backoff_max, 60.0);
    assert_eq!(config.relay_config.channel_count, 16);
    assert_eq!(config.relay_config.device, RelayDeviceConfig::Simulated);
    assert_eq!(config.scheduler.queue_capacity, 30);
    assert_eq!(config.scheduler.overflow_policy, OverflowPolicy::DropOldest);
    assert!((config.threshold_for(ObjectClass::Primary) - 0.40).abs() < f32::EPSILON);
    assert!((config.threshold_for(ObjectClass::Secondary) - 0.35).abs() < f32::EPSILON);

    let validation = config.validate_machines();
    let accepted: Vec<MachineId> = validation.accepted.iter().map(|m| m.machine_id).collect();
    assert_eq!(accepted, vec![MachineId(1), MachineId(2)]);
    assert!(validation.rejected.is_empty());
}

#[test]
fn test_serial_device_in_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pairguard.toml");
    fs::write(
        &path,
        r#"
pairs_per_machine = 2

[relay_config]
channel_count = 8

[relay_config.device]
kind = "serial"
port = "/dev/ttyUSB0"
baud_rate = 9600

[scheduler]
overflow_policy = "drop_newest"

[[machines]]
machine_id = 7
name = "Press 7"
camera_source = "replay:frames"
relay_start_channel = 7
"#,
    )
    .unwrap();

    let config = ConfigStore::new(&path).load().unwrap();
    assert_eq!(
        config.relay_config.device,
        RelayDeviceConfig::Serial {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600
        }
    );
    assert_eq!(config.scheduler.overflow_policy, OverflowPolicy::DropNewest);
    let validation = config.validate_machines();
    assert_eq!(validation.accepted.len(), 1);
    assert_eq!(validation.accepted[0].channel_range(2), 7..9);
    assert!(validation.accepted[0].enabled);
}

#[test]
fn test_unparsable_config_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("machines_config.json");
    fs::write(&path, "{ machines: [").unwrap();
    assert!(ConfigStore::new(&path).load().is_err());
}

proptest! {
    #[test]
    fn test_only_one_of_each_is_ok(primary in 0usize..5, secondary in 0usize..5) {
        let verdict = PairVerdict::from_counts(primary, secondary);
        prop_assert_eq!(verdict == PairVerdict::Ok, primary == 1 && secondary == 1);
        prop_assert_eq!(verdict.is_fault(), !(primary == 1 && secondary == 1));
    }
}
