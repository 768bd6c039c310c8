//! Per-machine zone evaluation
//!
//! Verdicts are a pure function of one frame's detections and the current zone set.
//! Fault history is kept for display only and never feeds back into a verdict.

use crate::error::VisionError;
use chrono::{DateTime, Utc};
use pairguard_core::{
    ClassConfig, Detection, MachineId, ObjectClass, PairCounts, PairVerdict, ZoneSet,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Result of one evaluation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub machine: MachineId,
    pub verdicts: Vec<PairVerdict>,
    pub counts: Vec<PairCounts>,
    /// Any verdict differs from the previous pass
    pub changed: bool,
    pub frame_sequence: u64,
    pub at: DateTime<Utc>,
}

impl Evaluation {
    /// One flag per pair, `true` for FAULT
    pub fn fault_flags(&self) -> Vec<bool> {
        self.verdicts.iter().map(|v| v.is_fault()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluatorStats {
    pub total_evaluations: u64,
    /// OK to FAULT transitions, summed over pairs
    pub fault_episodes: u64,
    /// Onset of the current fault per pair, `None` while the pair is OK
    pub last_fault: Vec<Option<DateTime<Utc>>>,
    pub last_verdicts: Vec<PairVerdict>,
}

/// Confidence floor per side of a pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub primary: f32,
    pub secondary: f32,
}

impl Thresholds {
    fn get(&self, class: ObjectClass) -> f32 {
        match class {
            ObjectClass::Primary => self.primary,
            ObjectClass::Secondary => self.secondary,
        }
    }
}

/// Count, per pair, the detections of each class whose representative point is inside
/// that pair's zone for the class
pub fn count_pairs(
    zones: &ZoneSet,
    detections: &[Detection],
    classes: &ClassConfig,
    thresholds: Thresholds,
) -> Vec<PairCounts> {
    let mut counts = vec![PairCounts::default(); zones.pair_count()];
    for detection in detections {
        let Some(class) = classes.classify(detection.class_id) else {
            continue;
        };
        if detection.confidence < thresholds.get(class) {
            continue;
        }
        let point = detection.representative_point();
        for (pair, count) in zones.pairs().iter().zip(counts.iter_mut()) {
            if pair.zone(class).contains(point) {
                match class {
                    ObjectClass::Primary => count.primary += 1,
                    ObjectClass::Secondary => count.secondary += 1,
                }
            }
        }
    }
    counts
}

pub struct ZoneEvaluator {
    machine: MachineId,
    pairs: usize,
    classes: ClassConfig,
    thresholds: Thresholds,
    zones: RwLock<Option<Arc<ZoneSet>>>,
    stats: Mutex<EvaluatorStats>,
    events: broadcast::Sender<Evaluation>,
}

impl ZoneEvaluator {
    pub fn new(machine: MachineId, pairs: usize, classes: ClassConfig, thresholds: Thresholds) -> Self {
        let (events, _) = broadcast::channel(256);
        Self::with_events(machine, pairs, classes, thresholds, events)
    }

    /// Publish evaluations on a shared channel
    pub fn with_events(
        machine: MachineId,
        pairs: usize,
        classes: ClassConfig,
        thresholds: Thresholds,
        events: broadcast::Sender<Evaluation>,
    ) -> Self {
        Self {
            machine,
            pairs,
            classes,
            thresholds,
            zones: RwLock::new(None),
            stats: Mutex::new(EvaluatorStats {
                last_fault: vec![None; pairs],
                ..Default::default()
            }),
            events,
        }
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    /// Install a zone set. Takes effect atomically for the next evaluation.
    pub fn configure(&self, zones: ZoneSet) -> Result<(), VisionError> {
        if zones.pair_count() != self.pairs {
            return Err(VisionError::Config(format!(
                "M{}: zone set has {} pairs, expected {}",
                self.machine,
                zones.pair_count(),
                self.pairs
            )));
        }
        *self.zones.write() = Some(Arc::new(zones));
        info!("M{}: zones configured ({} pairs)", self.machine, self.pairs);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.zones.read().is_some()
    }

    pub fn evaluate(&self, detections: &[Detection]) -> Result<Evaluation, VisionError> {
        self.evaluate_frame(detections, 0)
    }

    /// Evaluate one frame's detections, tagging the result with the frame sequence
    pub fn evaluate_frame(&self, detections: &[Detection], frame_sequence: u64) -> Result<Evaluation, VisionError> {
        let zones = self
            .zones
            .read()
            .clone()
            .ok_or_else(|| VisionError::Config(format!("M{}: zones not configured", self.machine)))?;

        let counts = count_pairs(&zones, detections, &self.classes, self.thresholds);
        let verdicts: Vec<PairVerdict> = counts.iter().map(PairCounts::verdict).collect();
        let at = Utc::now();

        let changed = {
            let mut stats = self.stats.lock();
            stats.total_evaluations += 1;
            let changed = stats.last_verdicts != verdicts;
            for (index, verdict) in verdicts.iter().enumerate() {
                let was_fault = stats
                    .last_verdicts
                    .get(index)
                    .map(|v| v.is_fault())
                    .unwrap_or(false);
                match (was_fault, verdict.is_fault()) {
                    (false, true) => {
                        stats.fault_episodes += 1;
                        stats.last_fault[index] = Some(at);
                    }
                    (_, false) => stats.last_fault[index] = None,
                    (true, true) => {}
                }
            }
            stats.last_verdicts = verdicts.clone();
            changed
        };

        if changed {
            debug!(
                "M{}: verdicts {}",
                self.machine,
                verdicts
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }

        let evaluation = Evaluation {
            machine: self.machine,
            verdicts,
            counts,
            changed,
            frame_sequence,
            at,
        };
        let _ = self.events.send(evaluation.clone());
        Ok(evaluation)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Evaluation> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> EvaluatorStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = EvaluatorStats {
            last_fault: vec![None; self.pairs],
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairguard_core::{BoundingBox, PairZones, Point, Zone};

    fn square(x: f32) -> Zone {
        Zone::new(vec![
            Point::new(x, 0.0),
            Point::new(x + 10.0, 0.0),
            Point::new(x + 10.0, 10.0),
            Point::new(x, 10.0),
        ])
        .unwrap()
    }

    /// Pair i: primary zone at x = 100 i, secondary at x = 100 i + 50
    fn zones(pairs: usize) -> ZoneSet {
        ZoneSet::new(
            (0..pairs)
                .map(|i| PairZones {
                    primary: square(i as f32 * 100.0),
                    secondary: square(i as f32 * 100.0 + 50.0),
                })
                .collect(),
        )
        .unwrap()
    }

    fn det(class_id: u32, x: f32) -> Detection {
        Detection::new(class_id, 0.9, BoundingBox::new(x, 2.0, x + 6.0, 8.0))
    }

    fn evaluator() -> ZoneEvaluator {
        let ev = ZoneEvaluator::new(
            MachineId(1),
            3,
            ClassConfig::default(),
            Thresholds {
                primary: 0.4,
                secondary: 0.35,
            },
        );
        ev.configure(zones(3)).unwrap();
        ev
    }

    #[test]
    fn test_exactly_one_of_each_is_ok() {
        let ev = evaluator();
        let dets = vec![
            det(0, 2.0),
            det(1, 52.0),
            det(0, 102.0),
            det(0, 204.0),
            det(1, 252.0),
        ];
        let eval = ev.evaluate(&dets).unwrap();
        assert_eq!(
            eval.verdicts,
            vec![PairVerdict::Ok, PairVerdict::Fault, PairVerdict::Ok]
        );
        assert_eq!(eval.counts[1], PairCounts { primary: 1, secondary: 0 });
        assert_eq!(eval.fault_flags(), vec![false, true, false]);
    }

    #[test]
    fn test_duplicates_fault() {
        let ev = evaluator();
        let dets = vec![det(0, 1.0), det(0, 3.0), det(1, 52.0)];
        assert_eq!(ev.evaluate(&dets).unwrap().verdicts[0], PairVerdict::Fault);
    }

    #[test]
    fn test_low_confidence_and_unknown_classes_ignored() {
        let ev = evaluator();
        let mut weak = det(0, 3.0);
        weak.confidence = 0.3;
        let dets = vec![det(0, 1.0), weak, det(1, 52.0), det(5, 52.0)];
        assert_eq!(ev.evaluate(&dets).unwrap().verdicts[0], PairVerdict::Ok);
    }

    #[test]
    fn test_centroid_overrides_box_center() {
        let ev = evaluator();
        // box centered in pair 1's primary zone, centroid in pair 0's
        let primary = det(0, 102.0).with_centroid(Point::new(5.0, 5.0));
        let eval = ev.evaluate(&[primary, det(1, 52.0)]).unwrap();
        assert_eq!(eval.verdicts[0], PairVerdict::Ok);
        assert_eq!(eval.counts[1].primary, 0);
    }

    #[test]
    fn test_unconfigured_evaluator_errors() {
        let ev = ZoneEvaluator::new(
            MachineId(2),
            3,
            ClassConfig::default(),
            Thresholds {
                primary: 0.35,
                secondary: 0.35,
            },
        );
        assert!(ev.evaluate(&[]).is_err());
        assert!(ev.configure(zones(2)).is_err());
    }

    #[test]
    fn test_bookkeeping_does_not_change_verdicts() {
        let ev = evaluator();
        let ok_pair0 = vec![det(0, 2.0), det(1, 52.0)];

        let first = ev.evaluate(&ok_pair0).unwrap();
        assert!(first.changed);
        let stats = ev.stats();
        // pairs 1 and 2 became FAULT
        assert_eq!(stats.fault_episodes, 2);
        assert!(stats.last_fault[0].is_none());
        assert!(stats.last_fault[1].is_some());

        let second = ev.evaluate(&ok_pair0).unwrap();
        assert!(!second.changed);
        assert_eq!(second.verdicts, first.verdicts);
        assert_eq!(ev.stats().fault_episodes, 2);
        assert_eq!(ev.stats().total_evaluations, 2);

        let all_fault = ev.evaluate(&[]).unwrap();
        assert_eq!(ev.stats().fault_episodes, 3);
        assert!(all_fault.changed);

        ev.reset_stats();
        assert_eq!(ev.stats().total_evaluations, 0);
        assert_eq!(ev.evaluate(&ok_pair0).unwrap().verdicts, first.verdicts);
    }

    #[test]
    fn test_zone_swap_applies_to_next_call() {
        let ev = evaluator();
        let dets = vec![det(0, 2.0), det(1, 52.0)];
        assert_eq!(ev.evaluate(&dets).unwrap().verdicts[0], PairVerdict::Ok);
        // swap primary and secondary zones for every pair
        let swapped = ZoneSet::new(
            zones(3)
                .pairs()
                .iter()
                .map(|p| PairZones {
                    primary: p.secondary.clone(),
                    secondary: p.primary.clone(),
                })
                .collect(),
        )
        .unwrap();
        ev.configure(swapped).unwrap();
        assert_eq!(ev.evaluate(&dets).unwrap().verdicts[0], PairVerdict::Fault);
    }
}
