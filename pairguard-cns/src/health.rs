//! Liveness supervision
//!
//! One supervisor watches one pipeline stage of one machine. It only detects and reports;
//! what to do about a stall is decided by whoever consumes the timeout events.

use chrono::{DateTime, Utc};
use pairguard_core::{ComponentKind, MachineId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    TimedOut,
}

/// Emitted once per silence longer than the timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutEvent {
    pub machine: MachineId,
    pub component: ComponentKind,
    pub silent_for: Duration,
    pub at: DateTime<Utc>,
}

struct LivenessRecord {
    last_pulse: Instant,
    last_pulse_at: DateTime<Utc>,
    state: HealthState,
}

pub struct HealthSupervisor {
    machine: MachineId,
    component: ComponentKind,
    timeout: Duration,
    check_interval: Duration,
    record: Arc<Mutex<LivenessRecord>>,
    events: broadcast::Sender<TimeoutEvent>,
    task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl HealthSupervisor {
    pub fn new(machine: MachineId, component: ComponentKind, timeout: Duration, check_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(100);
        Self::with_events(machine, component, timeout, check_interval, events)
    }

    /// Publish timeouts on a shared channel
    pub fn with_events(
        machine: MachineId,
        component: ComponentKind,
        timeout: Duration,
        check_interval: Duration,
        events: broadcast::Sender<TimeoutEvent>,
    ) -> Self {
        Self {
            machine,
            component,
            timeout,
            check_interval,
            record: Arc::new(Mutex::new(LivenessRecord {
                last_pulse: Instant::now(),
                last_pulse_at: Utc::now(),
                state: HealthState::Healthy,
            })),
            events,
            task: Mutex::new(None),
        }
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    pub fn component(&self) -> ComponentKind {
        self.component
    }

    /// Record a liveness pulse. A timed-out supervisor silently returns to Healthy.
    pub fn heartbeat(&self) {
        let mut record = self.record.lock();
        record.last_pulse = Instant::now();
        record.last_pulse_at = Utc::now();
        if record.state == HealthState::TimedOut {
            record.state = HealthState::Healthy;
            info!("M{}: {} pipeline recovered", self.machine, self.component);
        }
    }

    pub fn state(&self) -> HealthState {
        self.record.lock().state
    }

    pub fn last_pulse(&self) -> DateTime<Utc> {
        self.record.lock().last_pulse_at
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimeoutEvent> {
        self.events.subscribe()
    }

    /// Compare the silence against the timeout once. Returns the event if this call
    /// moved the supervisor into TimedOut.
    pub fn check(&self) -> Option<TimeoutEvent> {
        check_record(
            &self.record,
            self.machine,
            self.component,
            self.timeout,
            &self.events,
        )
    }

    /// Start the periodic check. The silence is measured from this call.
    pub fn start(&self, shutdown: &CancellationToken) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        {
            let mut record = self.record.lock();
            record.last_pulse = Instant::now();
            record.last_pulse_at = Utc::now();
            record.state = HealthState::Healthy;
        }

        let token = shutdown.child_token();
        let record = self.record.clone();
        let events = self.events.clone();
        let (machine, component, timeout, period) =
            (self.machine, self.component, self.timeout, self.check_interval);
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        check_record(&record, machine, component, timeout, &events);
                    }
                }
            }
            debug!("M{}: {} watchdog stopped", machine, component);
        });

        *task = Some((handle, token));
        debug!("M{}: {} watchdog started ({:?} timeout)", self.machine, self.component, self.timeout);
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((handle, token)) = task {
            token.cancel();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

fn check_record(
    record: &Mutex<LivenessRecord>,
    machine: MachineId,
    component: ComponentKind,
    timeout: Duration,
    events: &broadcast::Sender<TimeoutEvent>,
) -> Option<TimeoutEvent> {
    let mut record = record.lock();
    if record.state == HealthState::TimedOut {
        return None;
    }
    let silent_for = record.last_pulse.elapsed();
    if silent_for < timeout {
        return None;
    }
    record.state = HealthState::TimedOut;
    drop(record);

    warn!(
        "M{}: {} pipeline silent for {:.1}s (timeout {:.1}s)",
        machine,
        component,
        silent_for.as_secs_f64(),
        timeout.as_secs_f64()
    );
    let event = TimeoutEvent {
        machine,
        component,
        silent_for,
        at: Utc::now(),
    };
    let _ = events.send(event.clone());
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> HealthSupervisor {
        HealthSupervisor::new(
            MachineId(1),
            ComponentKind::Camera,
            Duration::from_secs(15),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_fires_once_at_timeout() {
        let sup = supervisor();
        sup.heartbeat();
        tokio::time::advance(Duration::from_millis(14_900)).await;
        assert!(sup.check().is_none());
        tokio::time::advance(Duration::from_millis(100)).await;
        let event = sup.check().unwrap();
        assert_eq!(event.component, ComponentKind::Camera);
        assert_eq!(sup.state(), HealthState::TimedOut);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(sup.check().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_auto_resets() {
        let sup = supervisor();
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(sup.check().is_some());
        sup.heartbeat();
        assert_eq!(sup.state(), HealthState::Healthy);
        assert!(sup.check().is_none());
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(sup.check().is_some());
    }
}
