//! Shared inference scheduler
//!
//! Frames from every machine go through one bounded FIFO queue. A single drain loop runs
//! the detector on each item in arrival order and hands the tagged result to a router
//! before publishing it.

use crate::camera::FrameSink;
use crate::models::Detector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pairguard_core::{Detection, Frame, MachineId, OverflowPolicy, SchedulerConfig};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Detections for one frame of one machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionBatch {
    pub machine: MachineId,
    pub detections: Vec<Detection>,
    /// Scheduler throughput when the batch was produced
    pub fps: f64,
    pub frame_sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// Receives every batch synchronously on the drain loop, before it is published
#[async_trait]
pub trait DetectionRouter: Send + Sync {
    async fn route(&self, batch: &DetectionBatch);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub processed: u64,
    /// Frames evicted or refused because the queue was full
    pub dropped: u64,
    pub inference_failures: u64,
    pub fps: f64,
}

/// Bounded multi-producer FIFO. `push` never waits.
pub struct FrameQueue {
    items: Mutex<VecDeque<(MachineId, Frame)>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame. Returns false if the frame itself was dropped.
    pub fn push(&self, machine: MachineId, frame: Frame) -> bool {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    OverflowPolicy::DropNewest => return false,
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                    }
                }
            }
            items.push_back((machine, frame));
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the oldest item. `None` once `stop` is cancelled.
    pub async fn pop(&self, stop: &CancellationToken) -> Option<(MachineId, Frame)> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            tokio::select! {
                _ = notified => {}
                _ = stop.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Frames processed per second over a sliding window
pub struct ThroughputMeter {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl ThroughputMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            stamps: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
        self.trim(now);
    }

    pub fn fps(&mut self, now: Instant) -> f64 {
        self.trim(now);
        self.stamps.len() as f64 / self.window.as_secs_f64()
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct InferenceScheduler {
    detector: Arc<dyn Detector>,
    queue: FrameQueue,
    meter: Mutex<ThroughputMeter>,
    stats: RwLock<SchedulerStats>,
    results: broadcast::Sender<DetectionBatch>,
}

impl InferenceScheduler {
    /// Takes ownership of the detector for the lifetime of the process
    pub fn new(detector: Arc<dyn Detector>, config: &SchedulerConfig) -> Self {
        let (results, _) = broadcast::channel(256);
        Self {
            detector,
            queue: FrameQueue::new(config.queue_capacity, config.overflow_policy),
            meter: Mutex::new(ThroughputMeter::new(config.throughput_window())),
            stats: RwLock::new(SchedulerStats::default()),
            results,
        }
    }

    /// Non-blocking submit
    pub fn submit(&self, machine: MachineId, frame: Frame) -> bool {
        let accepted = self.queue.push(machine, frame);
        if !accepted {
            debug!("M{}: inference queue full, frame dropped", machine);
        }
        accepted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionBatch> {
        self.results.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats.read().clone();
        stats.queued = self.queue.len();
        stats.dropped = self.queue.dropped();
        stats.fps = self.meter.lock().fps(Instant::now());
        stats
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn spawn(self: &Arc<Self>, router: Arc<dyn DetectionRouter>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(router, shutdown).await })
    }

    /// Drain loop. Returns when `shutdown` is cancelled.
    pub async fn run(&self, router: Arc<dyn DetectionRouter>, shutdown: CancellationToken) {
        info!("Inference scheduler started (detector: {})", self.detector.name());
        while let Some((machine, frame)) = self.queue.pop(&shutdown).await {
            let batch = self.process(machine, frame).await;
            router.route(&batch).await;
            let _ = self.results.send(batch);
        }
        info!("Inference scheduler stopped");
    }

    async fn process(&self, machine: MachineId, frame: Frame) -> DetectionBatch {
        let frame_sequence = frame.sequence;
        let captured_at = frame.captured_at;
        let detector = self.detector.clone();
        let result = tokio::task::spawn_blocking(move || detector.infer(&frame)).await;

        let detections = match result {
            Ok(Ok(detections)) => detections,
            Ok(Err(e)) => {
                warn!("M{}: inference failed: {}", machine, e);
                self.stats.write().inference_failures += 1;
                Vec::new()
            }
            Err(e) => {
                warn!("M{}: inference task panicked: {}", machine, e);
                self.stats.write().inference_failures += 1;
                Vec::new()
            }
        };

        let fps = {
            let now = Instant::now();
            let mut meter = self.meter.lock();
            meter.record(now);
            meter.fps(now)
        };
        self.stats.write().processed += 1;

        DetectionBatch {
            machine,
            detections,
            fps,
            frame_sequence,
            captured_at,
            processed_at: Utc::now(),
        }
    }
}

impl FrameSink for InferenceScheduler {
    fn submit(&self, machine: MachineId, frame: Frame) -> bool {
        InferenceScheduler::submit(self, machine, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        let mut frame = Frame::new(vec![0; 3], 1, 1, 3);
        frame.sequence = seq;
        frame
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let queue = FrameQueue::new(2, OverflowPolicy::DropOldest);
        assert!(queue.push(MachineId(1), frame(1)));
        assert!(queue.push(MachineId(1), frame(2)));
        assert!(queue.push(MachineId(2), frame(3)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        let items = queue.items.lock();
        assert_eq!(items[0].1.sequence, 2);
        assert_eq!(items[1].1.sequence, 3);
    }

    #[test]
    fn test_drop_newest_refuses() {
        let queue = FrameQueue::new(1, OverflowPolicy::DropNewest);
        assert!(queue.push(MachineId(1), frame(1)));
        assert!(!queue.push(MachineId(1), frame(2)));
        assert_eq!(queue.items.lock()[0].1.sequence, 1);
    }

    #[tokio::test]
    async fn test_pop_returns_none_on_shutdown() {
        let queue = FrameQueue::new(4, OverflowPolicy::DropOldest);
        let stop = CancellationToken::new();
        queue.push(MachineId(1), frame(7));
        assert_eq!(queue.pop(&stop).await.map(|(_, f)| f.sequence), Some(7));
        stop.cancel();
        assert!(queue.pop(&stop).await.is_none());
    }

    #[test]
    fn test_throughput_window() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(Duration::from_secs(1));
        for i in 0..10 {
            meter.record(start + Duration::from_millis(i * 100));
        }
        assert_eq!(meter.fps(start + Duration::from_millis(900)), 10.0);
        assert_eq!(meter.fps(start + Duration::from_millis(1550)), 4.0);
        assert_eq!(meter.fps(start + Duration::from_secs(5)), 0.0);
    }
}
