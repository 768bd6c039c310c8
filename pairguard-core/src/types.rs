//! Shared data model for the monitoring runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine identifier, stable for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MachineId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// The two object classes a pair is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Primary,
    Secondary,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 2] = [ObjectClass::Primary, ObjectClass::Secondary];
}

/// 2-D point in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box in corner form
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union, 0.0 for degenerate boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let inter = (ix2 - ix1) * (iy2 - iy1);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 || !union.is_finite() {
            return 0.0;
        }
        inter / union
    }
}

/// One object found by the detector in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detector class index
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Optional centroid reported by the detector (e.g. mask centroid)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<Point>,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
            centroid: None,
        }
    }

    pub fn with_centroid(mut self, centroid: Point) -> Self {
        self.centroid = Some(centroid);
        self
    }

    /// Point used for zone membership: centroid if present, box center otherwise
    pub fn representative_point(&self) -> Point {
        self.centroid.unwrap_or_else(|| self.bbox.center())
    }
}

/// Decoded video frame, packed 8-bit interleaved pixels
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub captured_at: DateTime<Utc>,
    /// Per-source capture sequence number, strictly increasing
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        Self {
            data,
            width,
            height,
            channels,
            captured_at: Utc::now(),
            sequence: 0,
        }
    }

    /// Expected buffer length for the declared geometry
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.channels as usize)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .field("captured_at", &self.captured_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Verdict for one pair on one evaluated frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairVerdict {
    Ok,
    Fault,
}

impl PairVerdict {
    /// OK iff exactly one object of each class sits in the pair's zones
    pub fn from_counts(primary: usize, secondary: usize) -> Self {
        if primary == 1 && secondary == 1 {
            PairVerdict::Ok
        } else {
            PairVerdict::Fault
        }
    }

    pub fn is_fault(self) -> bool {
        matches!(self, PairVerdict::Fault)
    }
}

impl fmt::Display for PairVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairVerdict::Ok => write!(f, "OK"),
            PairVerdict::Fault => write!(f, "FAULT"),
        }
    }
}

/// Per-pair raw counts behind a verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairCounts {
    pub primary: usize,
    pub secondary: usize,
}

impl PairCounts {
    pub fn verdict(&self) -> PairVerdict {
        PairVerdict::from_counts(self.primary, self.secondary)
    }
}

/// Hardware output channel index (1-based, as printed on the board)
pub type RelayChannel = u16;

/// Last known state of one hardware output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Energized,
    DeEnergized,
    /// Write failed after all retries; the physical state is not known
    Unknown,
}

/// Pipeline stage tracked by a health supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Camera,
    Detection,
}

impl ComponentKind {
    pub fn label(self) -> &'static str {
        match self {
            ComponentKind::Camera => "camera",
            ComponentKind::Detection => "detection",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_table() {
        assert_eq!(PairVerdict::from_counts(0, 0), PairVerdict::Fault);
        assert_eq!(PairVerdict::from_counts(1, 0), PairVerdict::Fault);
        assert_eq!(PairVerdict::from_counts(0, 1), PairVerdict::Fault);
        assert_eq!(PairVerdict::from_counts(1, 1), PairVerdict::Ok);
        assert_eq!(PairVerdict::from_counts(2, 1), PairVerdict::Fault);
        assert_eq!(PairVerdict::from_counts(1, 2), PairVerdict::Fault);
    }

    #[test]
    fn test_representative_point_prefers_centroid() {
        let det = Detection::new(0, 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(det.representative_point(), Point::new(5.0, 5.0));

        let det = det.with_centroid(Point::new(2.0, 3.0));
        assert_eq!(det.representative_point(), Point::new(2.0, 3.0));
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        let iou = a.iou(&b);
        assert!((iou - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn test_frame_expected_len() {
        let frame = Frame::new(vec![0; 12], 2, 2, 3);
        assert_eq!(frame.expected_len(), Some(12));
    }

    #[test]
    fn test_verdict_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&PairVerdict::Fault).unwrap(), "\"FAULT\"");
    }
}
