//! pairguard-eye: vision side of the monitoring runtime
//!
//! Per-machine frame sources with reconnect handling, the shared detector behind one
//! inference queue, and per-machine zone evaluation.

pub mod camera;
pub mod input;
pub mod models;
pub mod preprocess;
pub mod scheduler;
pub mod evaluator;
pub mod error;

pub use camera::{
    reconnect_backoff, validate_frame, FrameSink, FrameSource, Pulse, SourceEvent, SourceStats,
    SourceStatus,
};
pub use input::{open_input, ReplayInput, VideoInput};
pub use models::Detector;
#[cfg(feature = "onnx")]
pub use models::YoloDetector;
pub use scheduler::{
    DetectionBatch, DetectionRouter, FrameQueue, InferenceScheduler, SchedulerStats,
    ThroughputMeter,
};
pub use evaluator::{Evaluation, EvaluatorStats, Thresholds, ZoneEvaluator};
pub use error::VisionError;
