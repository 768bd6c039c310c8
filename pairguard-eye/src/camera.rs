//! Per-machine frame source with reconnect state machine

use crate::error::VisionError;
use crate::input::VideoInput;
use chrono::{DateTime, Utc};
use pairguard_core::{CameraConfig, Frame, MachineId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FPS_LOG_PERIOD: Duration = Duration::from_secs(5);

/// Receives validated frames. Must never block.
pub trait FrameSink: Send + Sync {
    /// Returns whether the frame was accepted
    fn submit(&self, machine: MachineId, frame: Frame) -> bool;
}

/// Liveness pulse callback
pub type Pulse = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SourceStatus {
    Stopped,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

/// Status transition of one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEvent {
    pub machine: MachineId,
    pub status: SourceStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub frames_captured: u64,
    /// Frames that failed validation
    pub frames_rejected: u64,
    /// Frames the sink refused
    pub frames_refused: u64,
    pub reconnects: u64,
    pub fps: f64,
}

/// `min(base × attempt, max)`
pub fn reconnect_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt).min(max)
}

/// Check a decoded frame against the configured geometry
pub fn validate_frame(frame: &Frame, camera: &CameraConfig) -> Result<(), VisionError> {
    if frame.channels != 3 {
        return Err(VisionError::InvalidFrame(format!(
            "expected 3 channels, got {}",
            frame.channels
        )));
    }
    if frame.expected_len() != Some(frame.data.len()) {
        return Err(VisionError::InvalidFrame(format!(
            "buffer holds {} bytes for a {}x{} frame",
            frame.data.len(),
            frame.width,
            frame.height
        )));
    }
    let (min_w, min_h) = camera.min_frame_size;
    let (max_w, max_h) = camera.max_frame_size;
    if frame.width < min_w || frame.height < min_h || frame.width > max_w || frame.height > max_h {
        return Err(VisionError::InvalidFrame(format!(
            "{}x{} outside {}x{}..={}x{}",
            frame.width, frame.height, min_w, min_h, max_w, max_h
        )));
    }
    Ok(())
}

struct Shared {
    machine: MachineId,
    camera: CameraConfig,
    input: tokio::sync::Mutex<Box<dyn VideoInput>>,
    sink: Arc<dyn FrameSink>,
    pulse: Pulse,
    status: watch::Sender<SourceStatus>,
    events: broadcast::Sender<SourceEvent>,
    stats: RwLock<SourceStats>,
    latest: RwLock<Option<Frame>>,
}

impl Shared {
    fn set_status(&self, status: SourceStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            let _ = self.events.send(SourceEvent {
                machine: self.machine,
                status,
                at: Utc::now(),
            });
        }
    }
}

/// Owns one video input and feeds its frames to a sink
pub struct FrameSource {
    shared: Arc<Shared>,
    task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl FrameSource {
    pub fn new(
        machine: MachineId,
        input: Box<dyn VideoInput>,
        camera: CameraConfig,
        sink: Arc<dyn FrameSink>,
        pulse: Pulse,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        Self::with_events(machine, input, camera, sink, pulse, events)
    }

    /// Publish status transitions on a shared channel
    pub fn with_events(
        machine: MachineId,
        input: Box<dyn VideoInput>,
        camera: CameraConfig,
        sink: Arc<dyn FrameSink>,
        pulse: Pulse,
        events: broadcast::Sender<SourceEvent>,
    ) -> Self {
        let (status, _) = watch::channel(SourceStatus::Stopped);
        Self {
            shared: Arc::new(Shared {
                machine,
                camera,
                input: tokio::sync::Mutex::new(input),
                sink,
                pulse,
                status,
                events,
                stats: RwLock::new(SourceStats::default()),
                latest: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn machine(&self) -> MachineId {
        self.shared.machine
    }

    /// Start capturing. No-op while a capture task is alive.
    pub fn start(&self, shutdown: &CancellationToken) {
        let mut task = self.task.lock();
        if let Some((handle, _)) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let token = shutdown.child_token();
        let shared = self.shared.clone();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            let mut input = shared.input.lock().await;
            capture_loop(&shared, input.as_mut(), &stop).await;
            input.release().await;
            if stop.is_cancelled() {
                shared.set_status(SourceStatus::Stopped);
                info!("M{}: camera stopped", shared.machine);
            }
        });
        *task = Some((handle, token));
    }

    /// Stop capturing and wait for the input to be released
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((handle, token)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                error!("M{}: capture task ended abnormally: {}", self.shared.machine, e);
            }
        }
        self.shared.set_status(SourceStatus::Stopped);
    }

    /// Explicit restart, the only way out of Failed
    pub async fn restart(&self, shutdown: &CancellationToken) {
        info!("M{}: restarting camera", self.shared.machine);
        self.stop().await;
        self.start(shutdown);
    }

    pub fn status(&self) -> SourceStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SourceStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> SourceStats {
        self.shared.stats.read().clone()
    }

    /// Most recent validated frame
    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.latest.read().clone()
    }
}

enum Step {
    Frame(Frame),
    Failure(VisionError),
    Cancelled,
}

async fn capture_loop(shared: &Shared, input: &mut dyn VideoInput, stop: &CancellationToken) {
    let machine = shared.machine;
    let camera = &shared.camera;
    let max_attempts = camera.max_reconnect_attempts.max(1);
    let mut failures: u32 = 0;
    let mut open = false;
    let mut connected = false;
    let mut sequence: u64 = 0;
    let mut window_start = Instant::now();
    let mut window_frames: u32 = 0;

    shared.set_status(SourceStatus::Connecting);
    info!("M{}: connecting to {}", machine, input.describe());

    loop {
        let step = if open {
            read_frame(input, camera.capture_timeout(), stop).await
        } else {
            let opened = tokio::select! {
                _ = stop.cancelled() => None,
                result = input.open() => Some(result),
            };
            match opened {
                None => Step::Cancelled,
                Some(Ok(())) => {
                    open = true;
                    // the first read doubles as the connection test
                    read_frame(input, camera.capture_timeout(), stop).await
                }
                Some(Err(e)) => Step::Failure(e),
            }
        };

        let failure = match step {
            Step::Cancelled => return,
            Step::Frame(mut frame) => match validate_frame(&frame, camera) {
                Ok(()) => {
                    failures = 0;
                    if !connected {
                        connected = true;
                        shared.set_status(SourceStatus::Connected);
                        info!("M{}: camera connected ({}x{})", machine, frame.width, frame.height);
                    }
                    sequence += 1;
                    frame.sequence = sequence;
                    *shared.latest.write() = Some(frame.clone());
                    (shared.pulse)();
                    let accepted = shared.sink.submit(machine, frame);

                    window_frames += 1;
                    let mut stats = shared.stats.write();
                    stats.frames_captured += 1;
                    if !accepted {
                        stats.frames_refused += 1;
                    }
                    let elapsed = window_start.elapsed();
                    if elapsed >= FPS_LOG_PERIOD {
                        stats.fps = window_frames as f64 / elapsed.as_secs_f64();
                        debug!("M{}: capture {:.1} fps", machine, stats.fps);
                        window_start = Instant::now();
                        window_frames = 0;
                    }
                    continue;
                }
                Err(e) => {
                    shared.stats.write().frames_rejected += 1;
                    e
                }
            },
            Step::Failure(e) => e,
        };

        failures += 1;
        connected = false;
        if open {
            input.release().await;
            open = false;
        }
        if failures >= max_attempts {
            error!(
                "M{}: camera failed after {} consecutive attempts: {}",
                machine, failures, failure
            );
            shared.set_status(SourceStatus::Failed);
            return;
        }

        let delay = reconnect_backoff(camera.backoff_base(), camera.backoff_max(), failures);
        warn!(
            "M{}: {} (attempt {}/{}), reconnecting in {:.1}s",
            machine,
            failure,
            failures,
            max_attempts,
            delay.as_secs_f64()
        );
        shared.stats.write().reconnects += 1;
        shared.set_status(SourceStatus::Reconnecting { attempt: failures });
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn read_frame(input: &mut dyn VideoInput, timeout: Duration, stop: &CancellationToken) -> Step {
    tokio::select! {
        _ = stop.cancelled() => Step::Cancelled,
        result = tokio::time::timeout(timeout, input.read()) => match result {
            Ok(Ok(frame)) => Step::Frame(frame),
            Ok(Err(e)) => Step::Failure(e),
            Err(_) => Step::Failure(VisionError::Camera(format!(
                "no frame within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_linear_then_capped() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=35)
            .map(|a| reconnect_backoff(base, max, a).as_secs())
            .collect();
        assert_eq!(&delays[..3], &[2, 4, 6]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[29], 60);
        assert_eq!(delays[34], 60);
    }

    #[test]
    fn test_validate_frame() {
        let camera = CameraConfig::default();
        assert!(validate_frame(&Frame::new(vec![0; 64 * 48 * 3], 64, 48, 3), &camera).is_ok());
        assert!(validate_frame(&Frame::new(vec![0; 64 * 48], 64, 48, 1), &camera).is_err());
        assert!(validate_frame(&Frame::new(vec![0; 10], 64, 48, 3), &camera).is_err());
        assert!(validate_frame(&Frame::new(vec![0; 8 * 8 * 3], 8, 8, 3), &camera).is_err());
    }
}
