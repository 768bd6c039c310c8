//! Tests for the frame source reconnect state machine

use async_trait::async_trait;
use pairguard_core::{CameraConfig, Frame, MachineId};
use pairguard_eye::{FrameSink, FrameSource, SourceStatus, VideoInput, VisionError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Script {
    /// Outcome of each open; missing entries succeed
    opens: VecDeque<bool>,
    /// Outcome of each read; missing entries succeed
    reads: VecDeque<bool>,
    open_times: Vec<Instant>,
    releases: usize,
}

struct ScriptedInput {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl VideoInput for ScriptedInput {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn open(&mut self) -> Result<(), VisionError> {
        let mut script = self.script.lock();
        script.open_times.push(Instant::now());
        if script.opens.pop_front().unwrap_or(true) {
            Ok(())
        } else {
            Err(VisionError::Camera("connection refused".to_string()))
        }
    }

    async fn read(&mut self) -> Result<Frame, VisionError> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        if self.script.lock().reads.pop_front().unwrap_or(true) {
            Ok(Frame::new(vec![0; 64 * 48 * 3], 64, 48, 3))
        } else {
            Err(VisionError::Camera("read failed".to_string()))
        }
    }

    async fn release(&mut self) {
        self.script.lock().releases += 1;
    }
}

#[derive(Default)]
struct CollectingSink {
    frames: Mutex<Vec<(MachineId, u64)>>,
}

impl FrameSink for CollectingSink {
    fn submit(&self, machine: MachineId, frame: Frame) -> bool {
        self.frames.lock().push((machine, frame.sequence));
        true
    }
}

struct Harness {
    source: FrameSource,
    script: Arc<Mutex<Script>>,
    sink: Arc<CollectingSink>,
    pulses: Arc<AtomicUsize>,
}

fn harness(script: Script) -> Harness {
    let script = Arc::new(Mutex::new(script));
    let sink = Arc::new(CollectingSink::default());
    let pulses = Arc::new(AtomicUsize::new(0));
    let counter = pulses.clone();
    let source = FrameSource::new(
        MachineId(3),
        Box::new(ScriptedInput {
            script: script.clone(),
        }),
        CameraConfig::default(),
        sink.clone(),
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    Harness {
        source,
        script,
        sink,
        pulses,
    }
}

#[tokio::test(start_paused = true)]
async fn test_streams_frames_with_pulses() {
    let h = harness(Script::default());
    let shutdown = CancellationToken::new();
    h.source.start(&shutdown);
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(h.source.status(), SourceStatus::Connected);
    let frames = h.sink.frames.lock().clone();
    assert!(frames.len() >= 20);
    assert!(frames.iter().all(|(m, _)| *m == MachineId(3)));
    assert!(frames.windows(2).all(|w| w[0].1 < w[1].1));
    assert_eq!(h.pulses.load(Ordering::SeqCst), frames.len());
    assert!(h.source.latest_frame().is_some());

    h.source.stop().await;
    assert_eq!(h.source.status(), SourceStatus::Stopped);
    assert_eq!(h.script.lock().releases, 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_then_failed() {
    let h = harness(Script {
        opens: std::iter::repeat(false).take(100).collect(),
        ..Default::default()
    });
    let mut status = h.source.watch_status();
    let shutdown = CancellationToken::new();
    h.source.start(&shutdown);

    tokio::time::timeout(Duration::from_secs(600), async {
        while *status.borrow_and_update() != SourceStatus::Failed {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let times = h.script.lock().open_times.clone();
    assert_eq!(times.len(), 10);
    let gaps: Vec<u64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![2, 4, 6, 8, 10, 12, 14, 16, 18]);
    assert_eq!(h.pulses.load(Ordering::SeqCst), 0);

    // stays failed without an explicit restart
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.script.lock().open_times.len(), 10);

    h.script.lock().opens.clear();
    h.source.restart(&shutdown).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.source.status(), SourceStatus::Connected);
    assert!(h.pulses.load(Ordering::SeqCst) > 0);
    h.source.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_attempt_count() {
    let h = harness(Script {
        reads: [true, false, true, true, false, true].into_iter().collect(),
        ..Default::default()
    });
    let mut events = h.source.subscribe();
    let shutdown = CancellationToken::new();
    h.source.start(&shutdown);
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.source.stop().await;

    let mut reconnects = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SourceStatus::Reconnecting { attempt } = event.status {
            reconnects.push(attempt);
        }
    }
    assert_eq!(reconnects, vec![1, 1]);
    assert_eq!(h.source.stats().reconnects, 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_frames_trigger_reconnect() {
    struct BadInput;

    #[async_trait]
    impl VideoInput for BadInput {
        fn describe(&self) -> String {
            "grayscale".to_string()
        }
        async fn open(&mut self) -> Result<(), VisionError> {
            Ok(())
        }
        async fn read(&mut self) -> Result<Frame, VisionError> {
            Ok(Frame::new(vec![0; 64 * 48], 64, 48, 1))
        }
        async fn release(&mut self) {}
    }

    let sink = Arc::new(CollectingSink::default());
    let source = FrameSource::new(
        MachineId(1),
        Box::new(BadInput),
        CameraConfig::default(),
        sink.clone(),
        Arc::new(|| {}),
    );
    let shutdown = CancellationToken::new();
    source.start(&shutdown);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(matches!(source.status(), SourceStatus::Reconnecting { .. }));
    assert!(sink.frames.lock().is_empty());
    assert!(source.stats().frames_rejected >= 2);

    shutdown.cancel();
    source.stop().await;
}
