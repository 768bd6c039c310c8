//! Detection capability and its backends

pub mod detector;
#[cfg(feature = "onnx")]
pub mod yolo;

pub use detector::{decode_yolo_output, non_max_suppression, Detector, NMS_IOU_THRESHOLD};
#[cfg(feature = "onnx")]
pub use yolo::YoloDetector;
