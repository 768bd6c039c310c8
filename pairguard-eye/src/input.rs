//! Video inputs
//!
//! A source identifier selects the backend:
//! - `replay:<dir>` cycles still images from a directory
//! - `rtsp://`, `http(s)://`, a device index or `/dev/videoN` open through OpenCV
//!   (requires the `opencv` feature)

use crate::error::VisionError;
use async_trait::async_trait;
use image::RgbImage;
use pairguard_core::{CameraConfig, Frame};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// One decoded video stream. Reads may block for up to the capture timeout.
#[async_trait]
pub trait VideoInput: Send {
    /// Source identifier for logs
    fn describe(&self) -> String;

    async fn open(&mut self) -> Result<(), VisionError>;

    /// Next decoded frame, 8-bit BGR interleaved
    async fn read(&mut self) -> Result<Frame, VisionError>;

    async fn release(&mut self);
}

/// Pick a backend for a configured source identifier
pub fn open_input(source: &str, camera: &CameraConfig) -> Result<Box<dyn VideoInput>, VisionError> {
    if let Some(dir) = source.strip_prefix("replay:") {
        return Ok(Box::new(ReplayInput::new(dir, camera.default_fps)));
    }
    open_stream(source, camera)
}

#[cfg(feature = "opencv")]
fn open_stream(source: &str, camera: &CameraConfig) -> Result<Box<dyn VideoInput>, VisionError> {
    Ok(Box::new(opencv_input::OpenCvInput::new(source, camera.clone())))
}

#[cfg(not(feature = "opencv"))]
fn open_stream(source: &str, _camera: &CameraConfig) -> Result<Box<dyn VideoInput>, VisionError> {
    Err(VisionError::Config(format!(
        "source {} needs the `opencv` feature; only replay: sources are available",
        source
    )))
}

/// Parse a numeric or `/dev/videoN` device identifier
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let digits = uri.strip_prefix("/dev/video")?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.parse().ok();
    }
    None
}

/// Convert an RGB image to a BGR frame
pub fn frame_from_rgb(image: &RgbImage) -> Frame {
    let mut data = image.as_raw().clone();
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    Frame::new(data, image.width(), image.height(), 3)
}

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Cycles through the images of a directory at a fixed rate
pub struct ReplayInput {
    dir: PathBuf,
    period: Duration,
    frames: Vec<Frame>,
    cursor: usize,
    next_due: Option<Instant>,
}

impl ReplayInput {
    pub fn new(dir: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            dir: dir.into(),
            period: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            frames: Vec::new(),
            cursor: 0,
            next_due: None,
        }
    }
}

fn load_directory(dir: &Path) -> Result<Vec<Frame>, VisionError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| Ok(frame_from_rgb(&image::open(path)?.to_rgb8())))
        .collect()
}

#[async_trait]
impl VideoInput for ReplayInput {
    fn describe(&self) -> String {
        format!("replay:{}", self.dir.display())
    }

    async fn open(&mut self) -> Result<(), VisionError> {
        let dir = self.dir.clone();
        let frames = tokio::task::spawn_blocking(move || load_directory(&dir))
            .await
            .map_err(|e| VisionError::Camera(e.to_string()))??;
        if frames.is_empty() {
            return Err(VisionError::Camera(format!(
                "no images found in {}",
                self.dir.display()
            )));
        }
        info!("Replaying {} images from {}", frames.len(), self.dir.display());
        self.frames = frames;
        self.cursor = 0;
        self.next_due = None;
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, VisionError> {
        if self.frames.is_empty() {
            return Err(VisionError::Camera("replay input not open".to_string()));
        }
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            tokio::time::sleep_until(due).await;
        }
        self.next_due = Some(due.max(now) + self.period);

        let mut frame = self.frames[self.cursor % self.frames.len()].clone();
        frame.captured_at = chrono::Utc::now();
        self.cursor = self.cursor.wrapping_add(1);
        Ok(frame)
    }

    async fn release(&mut self) {
        self.frames.clear();
    }
}

#[cfg(feature = "opencv")]
pub use opencv_input::OpenCvInput;

#[cfg(feature = "opencv")]
mod opencv_input {
    use super::*;
    use opencv::{
        prelude::*,
        videoio::{self, VideoCapture},
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tracing::warn;

    /// Stream or device opened through OpenCV
    pub struct OpenCvInput {
        uri: String,
        camera: CameraConfig,
        capture: Option<Arc<Mutex<VideoCapture>>>,
    }

    impl OpenCvInput {
        pub fn new(uri: &str, camera: CameraConfig) -> Self {
            Self {
                uri: uri.to_string(),
                camera,
                capture: None,
            }
        }
    }

    fn open_capture(uri: &str, camera: &CameraConfig) -> Result<VideoCapture, VisionError> {
        let mut capture = match parse_device_index(uri) {
            Some(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
            None => VideoCapture::from_file(uri, videoio::CAP_FFMPEG)?,
        };
        if !capture.is_opened()? {
            return Err(VisionError::Camera(format!("failed to open {}", uri)));
        }
        let timeout = camera.rtsp_timeout_ms as f64;
        for (prop, value) in [
            (videoio::CAP_PROP_BUFFERSIZE, camera.buffer_size as f64),
            (videoio::CAP_PROP_OPEN_TIMEOUT_MSEC, timeout),
            (videoio::CAP_PROP_READ_TIMEOUT_MSEC, timeout),
        ] {
            if !capture.set(prop, value).unwrap_or(false) {
                warn!("{}: capture property {} not supported", uri, prop);
            }
        }
        Ok(capture)
    }

    fn read_capture(capture: &mut VideoCapture) -> Result<Frame, VisionError> {
        let mut mat = Mat::default();
        if !capture.read(&mut mat)? || mat.empty() {
            return Err(VisionError::Camera("empty frame".to_string()));
        }
        let size = mat.size()?;
        let channels = mat.channels() as u8;
        let data = mat.data_bytes()?.to_vec();
        Ok(Frame::new(data, size.width.max(0) as u32, size.height.max(0) as u32, channels))
    }

    #[async_trait]
    impl VideoInput for OpenCvInput {
        fn describe(&self) -> String {
            self.uri.clone()
        }

        async fn open(&mut self) -> Result<(), VisionError> {
            let uri = self.uri.clone();
            let camera = self.camera.clone();
            let capture = tokio::task::spawn_blocking(move || open_capture(&uri, &camera))
                .await
                .map_err(|e| VisionError::Camera(e.to_string()))??;
            self.capture = Some(Arc::new(Mutex::new(capture)));
            Ok(())
        }

        async fn read(&mut self) -> Result<Frame, VisionError> {
            let capture = self
                .capture
                .clone()
                .ok_or_else(|| VisionError::Camera("capture not open".to_string()))?;
            tokio::task::spawn_blocking(move || read_capture(&mut capture.lock()))
                .await
                .map_err(|e| VisionError::Camera(e.to_string()))?
        }

        async fn release(&mut self) {
            if let Some(capture) = self.capture.take() {
                // a read abandoned after a timeout may still hold the handle
                let _ = tokio::task::spawn_blocking(move || {
                    if let Err(e) = capture.lock().release() {
                        warn!("Failed to release capture: {}", e);
                    }
                })
                .await;
            }
        }
    }
}
