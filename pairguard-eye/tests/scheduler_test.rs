//! Tests for the shared inference scheduler

use async_trait::async_trait;
use pairguard_core::{
    BoundingBox, Detection, Frame, MachineId, OverflowPolicy, SchedulerConfig,
};
use pairguard_eye::{
    DetectionBatch, DetectionRouter, Detector, InferenceScheduler, VisionError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

/// Reports the frame sequence as the detection confidence; fails on sequence 0
struct EchoDetector;

impl Detector for EchoDetector {
    fn name(&self) -> &str {
        "echo"
    }

    fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, VisionError> {
        if frame.sequence == 0 {
            return Err(VisionError::Model("corrupt frame".to_string()));
        }
        Ok(vec![Detection::new(
            0,
            frame.sequence as f32,
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
        )])
    }
}

#[derive(Default)]
struct RecordingRouter {
    routed: Mutex<Vec<(MachineId, u64, usize)>>,
}

#[async_trait]
impl DetectionRouter for RecordingRouter {
    async fn route(&self, batch: &DetectionBatch) {
        self.routed
            .lock()
            .push((batch.machine, batch.frame_sequence, batch.detections.len()));
    }
}

fn frame(sequence: u64) -> Frame {
    let mut frame = Frame::new(vec![0; 3], 1, 1, 3);
    frame.sequence = sequence;
    frame
}

fn scheduler(capacity: usize, policy: OverflowPolicy) -> Arc<InferenceScheduler> {
    let config = SchedulerConfig {
        queue_capacity: capacity,
        overflow_policy: policy,
        throughput_window: 1.0,
    };
    Arc::new(InferenceScheduler::new(Arc::new(EchoDetector), &config))
}

async fn wait_for(router: &RecordingRouter, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while router.routed.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_fifo_across_machines() {
    let scheduler = scheduler(30, OverflowPolicy::DropOldest);
    for seq in 1..=5 {
        assert!(scheduler.submit(MachineId(1), frame(seq)));
        assert!(scheduler.submit(MachineId(2), frame(seq + 100)));
    }
    let router = Arc::new(RecordingRouter::default());
    let shutdown = CancellationToken::new();
    let handle = scheduler.spawn(router.clone(), shutdown.clone());
    wait_for(&router, 10).await;

    let routed = router.routed.lock().clone();
    let order: Vec<u64> = routed.iter().map(|(_, seq, _)| *seq).collect();
    assert_eq!(order, vec![1, 101, 2, 102, 3, 103, 4, 104, 5, 105]);
    shutdown.cancel();
    assert_ok!(handle.await);
    assert_eq!(scheduler.stats().processed, 10);
}

#[tokio::test]
async fn test_submit_never_blocks_and_respects_capacity() {
    let scheduler = scheduler(30, OverflowPolicy::DropOldest);
    for seq in 1..=1000 {
        assert!(scheduler.submit(MachineId(1), frame(seq)));
    }
    let stats = scheduler.stats();
    assert_eq!(stats.queued, 30);
    assert_eq!(stats.dropped, 970);

    // the survivors are the newest frames, still in capture order
    let router = Arc::new(RecordingRouter::default());
    let shutdown = CancellationToken::new();
    let handle = scheduler.spawn(router.clone(), shutdown.clone());
    wait_for(&router, 30).await;
    let order: Vec<u64> = router.routed.lock().iter().map(|(_, s, _)| *s).collect();
    assert_eq!(order, (971..=1000).collect::<Vec<_>>());
    shutdown.cancel();
    assert_ok!(handle.await);
}

#[tokio::test]
async fn test_drop_newest_policy() {
    let scheduler = scheduler(2, OverflowPolicy::DropNewest);
    assert!(scheduler.submit(MachineId(1), frame(1)));
    assert!(scheduler.submit(MachineId(1), frame(2)));
    assert!(!scheduler.submit(MachineId(1), frame(3)));
    assert_eq!(scheduler.stats().dropped, 1);
}

#[tokio::test]
async fn test_detector_error_yields_empty_batch() {
    let scheduler = scheduler(30, OverflowPolicy::DropOldest);
    let mut results = scheduler.subscribe();
    let router = Arc::new(RecordingRouter::default());
    let shutdown = CancellationToken::new();
    let handle = scheduler.spawn(router.clone(), shutdown.clone());

    scheduler.submit(MachineId(4), frame(0));
    scheduler.submit(MachineId(4), frame(1));

    let first = results.recv().await.unwrap();
    assert_eq!(first.machine, MachineId(4));
    assert!(first.detections.is_empty());
    let second = results.recv().await.unwrap();
    assert_eq!(second.detections.len(), 1);
    assert!(second.fps > 0.0);

    // router saw each batch before it was published
    assert_eq!(router.routed.lock().len(), 2);
    assert_eq!(scheduler.stats().inference_failures, 1);

    shutdown.cancel();
    assert_ok!(handle.await);
}
