//! Orchestrator
//!
//! Owns one runtime per accepted machine plus the shared scheduler and relay bank.
//! Detections are routed synchronously on the scheduler's drain loop: evaluate the
//! machine's zones, drive its relays, then pulse its detection supervisor.

use crate::error::ControlError;
use crate::events::DiagnosticEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pairguard_cns::{ActuatorBank, ChannelEvent, HealthState, HealthSupervisor, TimeoutEvent};
use pairguard_core::{
    BoundaryMap, ChannelStatus, ComponentKind, ConfigStore, Frame, MachineConfig, MachineId,
    ObjectClass, RelayChannel, SystemConfig, ZoneSet,
};
use pairguard_eye::{
    DetectionBatch, DetectionRouter, Evaluation, EvaluatorStats, FrameSink, FrameSource,
    InferenceScheduler, SchedulerStats, SourceEvent, SourceStats, SourceStatus, Thresholds,
    VideoInput, VisionError, ZoneEvaluator,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared event channels every machine publishes on
#[derive(Clone)]
pub struct EventStreams {
    pub sources: broadcast::Sender<SourceEvent>,
    pub evaluations: broadcast::Sender<Evaluation>,
    pub timeouts: broadcast::Sender<TimeoutEvent>,
    pub diagnostics: broadcast::Sender<DiagnosticEvent>,
}

impl EventStreams {
    pub fn new() -> Self {
        Self {
            sources: broadcast::channel(256).0,
            evaluations: broadcast::channel(1024).0,
            timeouts: broadcast::channel(64).0,
            diagnostics: broadcast::channel(1024).0,
        }
    }
}

impl Default for EventStreams {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything that belongs to one monitored machine
pub struct MachineRuntime {
    config: MachineConfig,
    evaluator: ZoneEvaluator,
    source: FrameSource,
    camera_health: Arc<HealthSupervisor>,
    detection_health: HealthSupervisor,
    running: AtomicBool,
    /// Held across evaluate+apply, across a stop and across an escalation restart, so
    /// none of them interleave
    actuation: tokio::sync::Mutex<()>,
}

impl MachineRuntime {
    pub(crate) fn new(
        config: MachineConfig,
        system: &SystemConfig,
        zones: ZoneSet,
        input: Box<dyn VideoInput>,
        sink: Arc<dyn FrameSink>,
        streams: &EventStreams,
    ) -> Result<Self, VisionError> {
        let machine = config.machine_id;
        let thresholds = Thresholds {
            primary: system.threshold_for(ObjectClass::Primary),
            secondary: system.threshold_for(ObjectClass::Secondary),
        };
        let evaluator = ZoneEvaluator::with_events(
            machine,
            system.pairs_per_machine,
            system.classes.clone(),
            thresholds,
            streams.evaluations.clone(),
        );
        evaluator.configure(zones)?;

        let camera_health = Arc::new(HealthSupervisor::with_events(
            machine,
            ComponentKind::Camera,
            system.watchdog_timeout(),
            system.watchdog_interval(),
            streams.timeouts.clone(),
        ));
        let detection_health = HealthSupervisor::with_events(
            machine,
            ComponentKind::Detection,
            system.watchdog_timeout(),
            system.watchdog_interval(),
            streams.timeouts.clone(),
        );

        let pulse_target = camera_health.clone();
        let source = FrameSource::with_events(
            machine,
            input,
            system.camera_config.clone(),
            sink,
            Arc::new(move || pulse_target.heartbeat()),
            streams.sources.clone(),
        );

        Ok(Self {
            config,
            evaluator,
            source,
            camera_health,
            detection_health,
            running: AtomicBool::new(false),
            actuation: tokio::sync::Mutex::new(()),
        })
    }

    pub fn machine(&self) -> MachineId {
        self.config.machine_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of one machine
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub machine: MachineId,
    pub name: String,
    pub running: bool,
    pub zones_configured: bool,
    pub source: SourceStatus,
    pub source_stats: SourceStats,
    pub camera_health: HealthState,
    pub camera_last_pulse: DateTime<Utc>,
    pub detection_health: HealthState,
    pub detection_last_pulse: DateTime<Utc>,
    pub evaluator: EvaluatorStats,
    pub channels: Vec<(RelayChannel, ChannelStatus)>,
}

type Arena = Arc<BTreeMap<MachineId, Arc<MachineRuntime>>>;

struct MachineRouter {
    machines: Arena,
    bank: Arc<ActuatorBank>,
}

#[async_trait]
impl DetectionRouter for MachineRouter {
    async fn route(&self, batch: &DetectionBatch) {
        let Some(runtime) = self.machines.get(&batch.machine) else {
            warn!("M{}: detections for an unknown machine", batch.machine);
            return;
        };
        let _guard = runtime.actuation.lock().await;
        // frames queued before a stop are discarded
        if !runtime.is_running() {
            return;
        }
        let evaluation = match runtime
            .evaluator
            .evaluate_frame(&batch.detections, batch.frame_sequence)
        {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!("M{}: evaluation skipped: {}", batch.machine, e);
                return;
            }
        };
        if !self.bank.apply(batch.machine, &evaluation.fault_flags()).await {
            warn!("M{}: relay outputs not fully written", batch.machine);
        }
        runtime.detection_health.heartbeat();
    }
}

pub struct Orchestrator {
    config: SystemConfig,
    store: ConfigStore,
    machines: Arena,
    rejected: Vec<(MachineId, String)>,
    scheduler: Arc<InferenceScheduler>,
    bank: Arc<ActuatorBank>,
    streams: EventStreams,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub(crate) fn new(
        config: SystemConfig,
        store: ConfigStore,
        runtimes: Vec<MachineRuntime>,
        rejected: Vec<(MachineId, String)>,
        scheduler: Arc<InferenceScheduler>,
        bank: Arc<ActuatorBank>,
        streams: EventStreams,
    ) -> Self {
        let machines = runtimes
            .into_iter()
            .map(|runtime| (runtime.machine(), Arc::new(runtime)))
            .collect();
        Self {
            config,
            store,
            machines: Arc::new(machines),
            rejected,
            scheduler,
            bank,
            streams,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the drain loop, the escalation policy and the diagnostics forwarder
    pub(crate) fn launch(&self) {
        let router = Arc::new(MachineRouter {
            machines: self.machines.clone(),
            bank: self.bank.clone(),
        });
        let mut tasks = self.tasks.lock();
        tasks.push(self.scheduler.spawn(router, self.shutdown.child_token()));
        tasks.push(self.spawn_escalation());
        tasks.push(self.spawn_diagnostics_forwarder());

        for (machine, reason) in &self.rejected {
            let _ = self.streams.diagnostics.send(DiagnosticEvent::MachineRejected {
                machine: *machine,
                reason: reason.clone(),
            });
        }
        let _ = self.streams.diagnostics.send(DiagnosticEvent::Started {
            machines: self.machine_ids(),
        });
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Accepted machines, in id order
    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.machines.keys().copied().collect()
    }

    /// Machines excluded at startup, with the reason
    pub fn rejected(&self) -> &[(MachineId, String)] {
        &self.rejected
    }

    fn runtime(&self, machine: MachineId) -> Result<&Arc<MachineRuntime>, ControlError> {
        if let Some(runtime) = self.machines.get(&machine) {
            return Ok(runtime);
        }
        match self.rejected.iter().find(|(id, _)| *id == machine) {
            Some((_, reason)) => Err(ControlError::Rejected {
                machine,
                reason: reason.clone(),
            }),
            None => Err(ControlError::UnknownMachine(machine)),
        }
    }

    pub fn start_machine(&self, machine: MachineId) -> Result<(), ControlError> {
        let runtime = self.runtime(machine)?;
        if runtime.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        runtime.camera_health.start(&self.shutdown);
        runtime.detection_health.start(&self.shutdown);
        runtime.source.start(&self.shutdown);
        info!("M{}: monitoring started ({})", machine, runtime.config.name);
        let _ = self
            .streams
            .diagnostics
            .send(DiagnosticEvent::MachineStarted { machine });
        Ok(())
    }

    /// Stop capture and supervision for one machine and drive its relays OK
    pub async fn stop_machine(&self, machine: MachineId) -> Result<(), ControlError> {
        let runtime = self.runtime(machine)?;
        if !runtime.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let _guard = runtime.actuation.lock().await;
            runtime.source.stop().await;
            runtime.camera_health.stop().await;
            runtime.detection_health.stop().await;
            if !self.bank.reset_machine(machine).await {
                warn!("M{}: relays not fully reset on stop", machine);
            }
        }
        info!("M{}: monitoring stopped", machine);
        let _ = self
            .streams
            .diagnostics
            .send(DiagnosticEvent::MachineStopped { machine });
        Ok(())
    }

    pub fn start_all(&self) {
        for machine in self.machine_ids() {
            if let Err(e) = self.start_machine(machine) {
                error!("{}", e);
            }
        }
    }

    pub async fn stop_all(&self) {
        for machine in self.machine_ids() {
            if let Err(e) = self.stop_machine(machine).await {
                error!("{}", e);
            }
        }
    }

    /// Cycle the relays of one machine, or of every machine
    pub async fn test_relays(&self, machine: Option<MachineId>) -> Result<(), ControlError> {
        match machine {
            Some(machine) => {
                self.runtime(machine)?;
                self.bank.test_machine(machine).await?;
            }
            None => self.bank.test_all().await?,
        }
        Ok(())
    }

    pub async fn reset_relays(&self) -> bool {
        self.bank.reset_all().await
    }

    /// Replace a machine's zones. Live from the next evaluation, then persisted.
    pub fn update_zones(&self, machine: MachineId, zones: ZoneSet) -> Result<(), ControlError> {
        let runtime = self.runtime(machine)?;
        runtime.evaluator.configure(zones.clone())?;
        runtime.evaluator.reset_stats();
        self.store.save_zone_set(machine, &zones, &self.config)?;
        info!("M{}: zones updated and saved", machine);
        Ok(())
    }

    /// [`Orchestrator::update_zones`] from a boundary tool map
    pub fn update_boundaries(&self, machine: MachineId, map: &BoundaryMap) -> Result<(), ControlError> {
        let zones = ZoneSet::from_boundaries(
            map,
            self.config.pairs_per_machine,
            self.config.classes.boundary_keys(),
        )?;
        self.update_zones(machine, zones)
    }

    pub fn machine_status(&self, machine: MachineId) -> Result<MachineStatus, ControlError> {
        let runtime = self.runtime(machine)?;
        let channels = self
            .bank
            .channels(machine)
            .unwrap_or_default()
            .into_iter()
            .zip(self.bank.machine_statuses(machine))
            .collect();
        Ok(MachineStatus {
            machine,
            name: runtime.config.name.clone(),
            running: runtime.is_running(),
            zones_configured: runtime.evaluator.is_configured(),
            source: runtime.source.status(),
            source_stats: runtime.source.stats(),
            camera_health: runtime.camera_health.state(),
            camera_last_pulse: runtime.camera_health.last_pulse(),
            detection_health: runtime.detection_health.state(),
            detection_last_pulse: runtime.detection_health.last_pulse(),
            evaluator: runtime.evaluator.stats(),
            channels,
        })
    }

    /// Most recent validated frame of a machine's camera
    pub fn latest_frame(&self, machine: MachineId) -> Result<Option<Frame>, ControlError> {
        Ok(self.runtime(machine)?.source.latest_frame())
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn subscribe_detections(&self) -> broadcast::Receiver<DetectionBatch> {
        self.scheduler.subscribe()
    }

    pub fn subscribe_verdicts(&self) -> broadcast::Receiver<Evaluation> {
        self.streams.evaluations.subscribe()
    }

    pub fn subscribe_sources(&self) -> broadcast::Receiver<SourceEvent> {
        self.streams.sources.subscribe()
    }

    pub fn subscribe_timeouts(&self) -> broadcast::Receiver<TimeoutEvent> {
        self.streams.timeouts.subscribe()
    }

    pub fn subscribe_channels(&self) -> broadcast::Receiver<ChannelEvent> {
        self.bank.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.streams.diagnostics.subscribe()
    }

    /// Stop everything, de-energize every configured channel, release the device
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down monitoring");
        let _ = self.streams.diagnostics.send(DiagnosticEvent::Shutdown);
        self.bank.interrupt();
        self.shutdown.cancel();

        for runtime in self.machines.values() {
            runtime.running.store(false, Ordering::SeqCst);
            runtime.source.stop().await;
            runtime.camera_health.stop().await;
            runtime.detection_health.stop().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in tasks {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }

        if !self.bank.reset_all().await {
            error!("Some relay outputs may still be energized");
        }
        if let Err(e) = self.bank.close().await {
            warn!("Relay device close failed: {}", e);
        }
        info!("Shutdown complete");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Restart a Failed camera once its watchdog has also timed out
    fn spawn_escalation(&self) -> JoinHandle<()> {
        let mut timeouts = self.streams.timeouts.subscribe();
        let mut sources = self.streams.sources.subscribe();
        let machines = self.machines.clone();
        let diagnostics = self.streams.diagnostics.clone();
        let enabled = self.config.restart_failed_sources;
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let machine = tokio::select! {
                    _ = token.cancelled() => break,
                    Ok(event) = timeouts.recv() => {
                        warn!(
                            "M{}: {} silent for {:.1}s",
                            event.machine,
                            event.component,
                            event.silent_for.as_secs_f64()
                        );
                        if event.component != ComponentKind::Camera {
                            continue;
                        }
                        event.machine
                    }
                    Ok(event) = sources.recv() => {
                        if event.status != SourceStatus::Failed {
                            continue;
                        }
                        event.machine
                    }
                };
                if !enabled {
                    continue;
                }
                let Some(runtime) = machines.get(&machine) else {
                    continue;
                };
                // a stop that already cleared `running` waits here or is seen below
                let _guard = runtime.actuation.lock().await;
                if runtime.is_running()
                    && runtime.source.status() == SourceStatus::Failed
                    && runtime.camera_health.state() == HealthState::TimedOut
                {
                    warn!("M{}: camera failed and silent, restarting source", machine);
                    let _ = diagnostics.send(DiagnosticEvent::SourceRestart { machine });
                    runtime.source.restart(&token).await;
                }
            }
            debug!("Escalation policy stopped");
        })
    }

    /// Republish the operator-relevant subset of every stream as diagnostics
    fn spawn_diagnostics_forwarder(&self) -> JoinHandle<()> {
        let mut sources = self.streams.sources.subscribe();
        let mut timeouts = self.streams.timeouts.subscribe();
        let mut evaluations = self.streams.evaluations.subscribe();
        let mut channels = self.bank.subscribe();
        let diagnostics = self.streams.diagnostics.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    Ok(event) = sources.recv() => DiagnosticEvent::Source(event),
                    Ok(event) = timeouts.recv() => DiagnosticEvent::Timeout(event),
                    Ok(event) = evaluations.recv() => {
                        if !event.changed {
                            continue;
                        }
                        DiagnosticEvent::VerdictChanged {
                            machine: event.machine,
                            verdicts: event.verdicts,
                        }
                    }
                    Ok(event) = channels.recv() => {
                        if event.status != ChannelStatus::Unknown {
                            continue;
                        }
                        DiagnosticEvent::Channel(event)
                    }
                };
                let _ = diagnostics.send(event);
            }
        })
    }
}
