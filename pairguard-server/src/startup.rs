//! Startup: configuration checks, capability loading and orchestrator assembly

use crate::error::StartupError;
use crate::orchestrator::{EventStreams, MachineRuntime, Orchestrator};
use pairguard_cns::{build_device, ActuatorBank, RelayDevice};
use pairguard_core::{ConfigStore, MachineConfig, MachineId, SystemConfig, ZoneSet};
use pairguard_eye::{open_input, Detector, FrameSink, InferenceScheduler};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Square input resolution of the bundled detection model
pub const MODEL_INPUT_SIZE: (u32, u32) = (640, 640);

/// Machines that may run, with their zones, and those that may not
#[derive(Debug, Default)]
pub struct MachinePlan {
    pub ready: Vec<(MachineConfig, ZoneSet)>,
    pub rejected: Vec<(MachineId, String)>,
}

impl MachinePlan {
    pub fn ready_ids(&self) -> Vec<MachineId> {
        self.ready.iter().map(|(m, _)| m.machine_id).collect()
    }
}

/// Validate every enabled machine and load its zones. Problems reject only the
/// machine they belong to.
pub fn plan_machines(config: &SystemConfig, store: &ConfigStore) -> MachinePlan {
    let validation = config.validate_machines();
    let mut plan = MachinePlan {
        rejected: validation
            .rejected
            .into_iter()
            .map(|(id, e)| (id, e.to_string()))
            .collect(),
        ..Default::default()
    };
    for machine in validation.accepted {
        match store.load_zone_set(machine.machine_id, config) {
            Ok(zones) => plan.ready.push((machine, zones)),
            Err(e) => plan.rejected.push((machine.machine_id, e.to_string())),
        }
    }
    plan
}

#[cfg(feature = "onnx")]
pub fn load_detector(config: &SystemConfig) -> Result<Arc<dyn Detector>, StartupError> {
    use pairguard_core::ObjectClass;

    if !config.model_path.is_file() {
        return Err(StartupError::MissingModel(format!(
            "{} not found",
            config.model_path.display()
        )));
    }
    let floor = config
        .threshold_for(ObjectClass::Primary)
        .min(config.threshold_for(ObjectClass::Secondary));
    let detector = pairguard_eye::YoloDetector::load(&config.model_path, MODEL_INPUT_SIZE, floor)
        .map_err(|e| StartupError::MissingModel(e.to_string()))?;
    info!("Detection model loaded: {}", config.model_path.display());
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "onnx"))]
pub fn load_detector(config: &SystemConfig) -> Result<Arc<dyn Detector>, StartupError> {
    Err(StartupError::MissingModel(format!(
        "{}: this build has no ONNX backend (enable the `onnx` feature)",
        config.model_path.display()
    )))
}

/// Open the relay device and assign channels to `machines`. Machines whose
/// channels cannot be assigned are returned with the reason. An unavailable
/// board is not fatal: its channels report Unknown until a write succeeds.
pub async fn build_bank(
    config: &SystemConfig,
    device: Box<dyn RelayDevice>,
    machines: &[MachineConfig],
) -> Result<(Arc<ActuatorBank>, Vec<(MachineId, String)>), StartupError> {
    let bank = Arc::new(ActuatorBank::new(
        device,
        config.relay_config.clone(),
        config.pairs_per_machine,
    ));
    if !bank.initialize().await {
        warn!("Relay board not fully initialized, outputs will be retried on the next write");
    }
    let mut rejected = Vec::new();
    for machine in machines {
        if let Err(e) = bank
            .configure(machine.machine_id, machine.relay_start_channel)
            .await
        {
            rejected.push((machine.machine_id, e.to_string()));
        }
    }
    Ok((bank, rejected))
}

pub struct OrchestratorBuilder {
    config: SystemConfig,
    store: ConfigStore,
    detector: Option<Arc<dyn Detector>>,
    device: Option<Box<dyn RelayDevice>>,
    streams: Option<EventStreams>,
}

impl OrchestratorBuilder {
    pub fn new(config: SystemConfig, store: ConfigStore) -> Self {
        Self {
            config,
            store,
            detector: None,
            device: None,
            streams: None,
        }
    }

    /// Publish on channels the caller already subscribed to, so startup events are not missed
    pub fn event_streams(mut self, streams: EventStreams) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Use this detector instead of loading `model_path`
    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Use this relay device instead of the configured one
    pub fn relay_device(mut self, device: Box<dyn RelayDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Assemble and launch. Machines start idle; call `start_all` to begin monitoring.
    pub async fn build(self) -> Result<Orchestrator, StartupError> {
        let OrchestratorBuilder {
            config,
            store,
            detector,
            device,
            streams,
        } = self;

        config.validate()?;
        let detector = match detector {
            Some(detector) => detector,
            None => load_detector(&config)?,
        };
        let device = match device {
            Some(device) => device,
            None => build_device(&config.relay_config)?,
        };

        let plan = plan_machines(&config, &store);
        let mut rejected = plan.rejected;
        let machines: Vec<MachineConfig> = plan.ready.iter().map(|(m, _)| m.clone()).collect();
        let (bank, unassigned) = build_bank(&config, device, &machines).await?;
        rejected.extend(unassigned);

        let scheduler = Arc::new(InferenceScheduler::new(detector, &config.scheduler));
        let sink: Arc<dyn FrameSink> = scheduler.clone();
        let streams = streams.unwrap_or_default();

        let mut runtimes = Vec::new();
        for (machine, zones) in plan.ready {
            let id = machine.machine_id;
            if rejected.iter().any(|(other, _)| *other == id) {
                continue;
            }
            let input = match open_input(&machine.camera_source, &config.camera_config) {
                Ok(input) => input,
                Err(e) => {
                    rejected.push((id, e.to_string()));
                    continue;
                }
            };
            match MachineRuntime::new(machine, &config, zones, input, sink.clone(), &streams) {
                Ok(runtime) => runtimes.push(runtime),
                Err(e) => rejected.push((id, e.to_string())),
            }
        }

        for (machine, reason) in &rejected {
            error!("M{}: rejected: {}", machine, reason);
        }
        if runtimes.is_empty() {
            if let Err(e) = bank.close().await {
                error!("Relay device close failed: {}", e);
            }
            return Err(StartupError::NoMachines);
        }
        info!(
            "✅ {} machine(s) ready, {} rejected",
            runtimes.len(),
            rejected.len()
        );

        let orchestrator =
            Orchestrator::new(config, store, runtimes, rejected, scheduler, bank, streams);
        orchestrator.launch();
        Ok(orchestrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairguard_core::boundary_key;
    use tempfile::TempDir;

    fn square(x: f32) -> Vec<[f32; 2]> {
        vec![[x, 0.0], [x + 10.0, 0.0], [x + 10.0, 10.0], [x, 10.0]]
    }

    fn write_zones(store: &ConfigStore, config: &SystemConfig, machine: MachineId) {
        let keys = config.classes.boundary_keys();
        let mut map = pairguard_core::BoundaryMap::new();
        for pair in 0..config.pairs_per_machine {
            for key in [keys.primary, keys.secondary] {
                map.insert(boundary_key(pair, key), square(pair as f32 * 20.0));
            }
        }
        store.save_boundaries(machine, &map).unwrap();
    }

    #[test]
    fn test_plan_rejects_missing_zones_individually() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("machines_config.json"));
        let config = SystemConfig::default();
        write_zones(&store, &config, MachineId(1));
        write_zones(&store, &config, MachineId(3));

        let plan = plan_machines(&config, &store);
        assert_eq!(plan.ready_ids(), vec![MachineId(1), MachineId(3)]);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].0, MachineId(2));
        // an empty template is left for the boundary tool
        assert!(store.boundary_path(MachineId(2)).exists());
    }

    #[test]
    fn test_plan_rejects_both_overlapping_machines() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("machines_config.json"));
        let mut config = SystemConfig::default();
        config.machines[1].relay_start_channel = 7;
        for id in 1..=3 {
            write_zones(&store, &config, MachineId(id));
        }

        let plan = plan_machines(&config, &store);
        assert_eq!(plan.ready_ids(), vec![MachineId(3)]);
        let mut rejected: Vec<MachineId> = plan.rejected.iter().map(|(id, _)| *id).collect();
        rejected.sort();
        assert_eq!(rejected, vec![MachineId(1), MachineId(2)]);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_detector_unavailable_without_backend() {
        let err = load_detector(&SystemConfig::default()).err().unwrap();
        assert_eq!(err.exit_code(), 3);
    }
}
