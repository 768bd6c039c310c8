//! Zone polygons and point-in-polygon membership

use crate::error::{Error, Result};
use crate::types::Point;
use serde::{Deserialize, Serialize};

/// Operator-drawn polygon. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f32; 2]>", into = "Vec<[f32; 2]>")]
pub struct Zone {
    points: Vec<Point>,
}

impl Zone {
    /// Build a zone from its vertices. Needs at least three finite points.
    pub fn new(points: Vec<Point>) -> Result<Self> {
        if points.len() < 3 {
            return Err(Error::Zone(format!(
                "polygon needs at least 3 points, got {}",
                points.len()
            )));
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(Error::Zone("polygon has non-finite coordinates".to_string()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Whether `point` lies inside the polygon. Points on an edge or vertex count as inside.
    pub fn contains(&self, point: Point) -> bool {
        let n = self.points.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[j];
            if on_segment(point, a, b) {
                return true;
            }
            if (a.y > point.y) != (b.y > point.y) {
                let x_cross = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
                if point.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

impl TryFrom<Vec<[f32; 2]>> for Zone {
    type Error = Error;

    fn try_from(raw: Vec<[f32; 2]>) -> Result<Self> {
        Zone::new(raw.into_iter().map(|[x, y]| Point::new(x, y)).collect())
    }
}

impl From<Zone> for Vec<[f32; 2]> {
    fn from(zone: Zone) -> Self {
        zone.points.into_iter().map(|p| [p.x, p.y]).collect()
    }
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    const EPS: f32 = 1e-4;
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > EPS * ((b.x - a.x).abs() + (b.y - a.y).abs()).max(1.0) {
        return false;
    }
    p.x >= a.x.min(b.x) - EPS
        && p.x <= a.x.max(b.x) + EPS
        && p.y >= a.y.min(b.y) - EPS
        && p.y <= a.y.max(b.y) + EPS
}
