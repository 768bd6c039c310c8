//! Per-machine zone sets and the boundary file format
//!
//! Boundary files map `pair{n}_{key}` (1-based pair number, class boundary key)
//! to a point list, e.g. `{"pair1_oc": [[10, 10], [50, 10], [50, 40]], ...}`.

use crate::error::{Error, Result};
use crate::geometry::Zone;
use crate::types::ObjectClass;
use std::collections::BTreeMap;

/// Raw boundary file contents
pub type BoundaryMap = BTreeMap<String, Vec<[f32; 2]>>;

/// The two zones that make up one pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairZones {
    pub primary: Zone,
    pub secondary: Zone,
}

impl PairZones {
    pub fn zone(&self, class: ObjectClass) -> &Zone {
        match class {
            ObjectClass::Primary => &self.primary,
            ObjectClass::Secondary => &self.secondary,
        }
    }
}

/// Complete set of 2×P zones for one machine
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSet {
    pairs: Vec<PairZones>,
}

/// Boundary file keys for the two classes
#[derive(Debug, Clone, Copy)]
pub struct BoundaryKeys<'a> {
    pub primary: &'a str,
    pub secondary: &'a str,
}

impl<'a> BoundaryKeys<'a> {
    fn key(&self, class: ObjectClass) -> &'a str {
        match class {
            ObjectClass::Primary => self.primary,
            ObjectClass::Secondary => self.secondary,
        }
    }
}

pub fn boundary_key(pair_index: usize, class_key: &str) -> String {
    format!("pair{}_{}", pair_index + 1, class_key)
}

impl ZoneSet {
    pub fn new(pairs: Vec<PairZones>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(Error::Zone("zone set has no pairs".to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs(&self) -> &[PairZones] {
        &self.pairs
    }

    /// Build a zone set from a boundary file. Every one of the 2×P keys must be present
    /// and hold a valid polygon.
    pub fn from_boundaries(map: &BoundaryMap, pair_count: usize, keys: BoundaryKeys<'_>) -> Result<Self> {
        let mut missing = Vec::new();
        let mut pairs = Vec::with_capacity(pair_count);

        for pair in 0..pair_count {
            let mut zones = Vec::with_capacity(2);
            for class in ObjectClass::ALL {
                let key = boundary_key(pair, keys.key(class));
                match map.get(&key) {
                    Some(points) if !points.is_empty() => {
                        let zone = Zone::try_from(points.clone())
                            .map_err(|e| Error::Zone(format!("{}: {}", key, e)))?;
                        zones.push(zone);
                    }
                    _ => missing.push(key),
                }
            }
            if zones.len() == 2 {
                let secondary = zones.pop();
                let primary = zones.pop();
                if let (Some(primary), Some(secondary)) = (primary, secondary) {
                    pairs.push(PairZones { primary, secondary });
                }
            }
        }

        if !missing.is_empty() {
            return Err(Error::Zone(format!(
                "incomplete zone set, missing or empty: {}",
                missing.join(", ")
            )));
        }

        ZoneSet::new(pairs)
    }

    /// Inverse of [`ZoneSet::from_boundaries`]
    pub fn to_boundaries(&self, keys: BoundaryKeys<'_>) -> BoundaryMap {
        let mut map = BoundaryMap::new();
        for (index, pair) in self.pairs.iter().enumerate() {
            for class in ObjectClass::ALL {
                let points = pair
                    .zone(class)
                    .points()
                    .iter()
                    .map(|p| [p.x, p.y])
                    .collect();
                map.insert(boundary_key(index, keys.key(class)), points);
            }
        }
        map
    }
}

/// Empty boundary structure, written out for machines that have not been trained yet
pub fn empty_boundaries(pair_count: usize, keys: BoundaryKeys<'_>) -> BoundaryMap {
    let mut map = BoundaryMap::new();
    for pair in 0..pair_count {
        for class in ObjectClass::ALL {
            map.insert(boundary_key(pair, keys.key(class)), Vec::new());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: BoundaryKeys<'static> = BoundaryKeys {
        primary: "oc",
        secondary: "bh",
    };

    fn tri(offset: f32) -> Vec<[f32; 2]> {
        vec![[offset, 0.0], [offset + 10.0, 0.0], [offset, 10.0]]
    }

    fn full_map(pairs: usize) -> BoundaryMap {
        let mut map = BoundaryMap::new();
        for pair in 0..pairs {
            map.insert(boundary_key(pair, "oc"), tri(pair as f32 * 100.0));
            map.insert(boundary_key(pair, "bh"), tri(pair as f32 * 100.0 + 50.0));
        }
        map
    }

    #[test]
    fn test_boundary_key_is_one_based() {
        assert_eq!(boundary_key(0, "oc"), "pair1_oc");
        assert_eq!(boundary_key(2, "bh"), "pair3_bh");
    }

    #[test]
    fn test_complete_set_loads() {
        let set = ZoneSet::from_boundaries(&full_map(3), 3, KEYS).unwrap();
        assert_eq!(set.pair_count(), 3);
        assert_eq!(set.pairs()[1].primary.points()[0].x, 100.0);
        assert_eq!(set.pairs()[1].secondary.points()[0].x, 150.0);
    }

    #[test]
    fn test_missing_zone_is_rejected() {
        let mut map = full_map(3);
        map.remove("pair2_bh");
        let err = ZoneSet::from_boundaries(&map, 3, KEYS).unwrap_err();
        assert!(err.to_string().contains("pair2_bh"));
    }

    #[test]
    fn test_empty_template_is_incomplete() {
        let map = empty_boundaries(3, KEYS);
        assert_eq!(map.len(), 6);
        assert!(ZoneSet::from_boundaries(&map, 3, KEYS).is_err());
    }

    #[test]
    fn test_pair_count_is_configuration() {
        let map = full_map(5);
        assert_eq!(ZoneSet::from_boundaries(&map, 5, KEYS).unwrap().pair_count(), 5);
        // extra keys in the file are ignored when fewer pairs are configured
        assert_eq!(ZoneSet::from_boundaries(&map, 2, KEYS).unwrap().pair_count(), 2);
    }

    #[test]
    fn test_to_boundaries_restores_keys() {
        let map = full_map(2);
        let set = ZoneSet::from_boundaries(&map, 2, KEYS).unwrap();
        assert_eq!(set.to_boundaries(KEYS), map);
    }
}
