//! YOLO detector on ONNX Runtime

use crate::error::VisionError;
use crate::models::detector::{decode_yolo_output, Detector};
use crate::preprocess::frame_to_chw_tensor;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use pairguard_core::{Detection, Frame};
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

/// YOLO model for object detection
pub struct YoloDetector {
    session: Mutex<Session>,
    input_size: (u32, u32),
    confidence_floor: f32,
}

impl YoloDetector {
    /// Load the model once. `confidence_floor` drops candidates before NMS; per-class
    /// thresholds are applied later by the zone evaluator.
    pub fn load(model_path: &Path, input_size: (u32, u32), confidence_floor: f32) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::Model(format!(
                "model file {} not found",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| VisionError::Ort(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| VisionError::Ort(format!("Failed to set optimization level: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| VisionError::Ort(format!("Failed to load YOLO model: {}", e)))?;

        info!(
            "YOLO model loaded from {:?} ({}x{} input)",
            model_path, input_size.0, input_size.1
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            confidence_floor,
        })
    }
}

impl Detector for YoloDetector {
    fn name(&self) -> &str {
        "yolo-onnx"
    }

    fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, VisionError> {
        let (width, height) = self.input_size;
        let tensor = frame_to_chw_tensor(frame, width, height)?;
        let input = Tensor::from_array(([1usize, 3, height as usize, width as usize], tensor))
            .map_err(|e| VisionError::Ort(format!("Failed to create input tensor: {}", e)))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| VisionError::Ort(format!("YOLO inference failed: {}", e)))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Ort(format!("Failed to extract output tensor: {}", e)))?;
        let dims: Vec<usize> = shape.iter().map(|d| (*d).max(0) as usize).collect();

        let scale = (
            frame.width as f32 / width as f32,
            frame.height as f32 / height as f32,
        );
        let detections = decode_yolo_output(&dims, data, self.confidence_floor, scale)?;
        debug!("YOLO detected {} objects", detections.len());
        Ok(detections)
    }
}
