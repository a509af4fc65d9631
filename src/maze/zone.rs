//! Zones: labeled intervals on the 1-D virtual track.

use serde::{Deserialize, Serialize};

/// A stretch of the track tagged with a behavioral kind ("neutral",
/// "aversive", ...). Zones are created once at level-authoring time and
/// immutable afterwards; the session looks one up by position every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Index in construction order; doubles as the column index in the
    /// log's zone-membership vector.
    pub id: usize,
    /// Track coordinate where the zone begins.
    pub offset: f64,
    /// Extent along the track.
    pub length: f64,
    /// Behavioral kind rules match against.
    pub kind: String,
}

impl Zone {
    pub fn new(id: usize, offset: f64, length: f64, kind: impl Into<String>) -> Self {
        Self { id, offset, length, kind: kind.into() }
    }

    pub fn begin(&self) -> f64 {
        self.offset
    }

    pub fn end(&self) -> f64 {
        self.offset + self.length
    }

    pub fn middle(&self) -> f64 {
        self.offset + self.length / 2.0
    }

    /// Whether `position` lies inside the zone.
    ///
    /// Both ends are inclusive, so a position exactly on the boundary
    /// shared by two adjacent zones is inside both; see [`find_zone`] for
    /// how the tie is resolved.
    pub fn contains(&self, position: f64) -> bool {
        self.begin() <= position && position <= self.end()
    }
}

/// The zone containing `position`, or `None` if the track has a hole.
///
/// With contiguously-constructed zones, a position exactly on a shared
/// boundary matches two zones; the first in construction order wins. That
/// tie-break is inherited from the reference design and deliberately kept.
pub fn find_zone(position: f64, zones: &[Zone]) -> Option<&Zone> {
    zones.iter().find(|zone| zone.contains(position))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_zones() -> Vec<Zone> {
        vec![Zone::new(0, 0.0, 100.0, "neutral"), Zone::new(1, 100.0, 100.0, "aversive")]
    }

    #[test]
    fn interior_positions_match_exactly_one_zone() {
        let zones = two_zones();
        assert_eq!(find_zone(50.0, &zones).unwrap().id, 0);
        assert_eq!(find_zone(150.0, &zones).unwrap().id, 1);
    }

    #[test]
    fn shared_boundary_resolves_to_first_in_construction_order() {
        let zones = two_zones();
        // 100.0 is inside both; the first zone wins
        assert!(zones[0].contains(100.0));
        assert!(zones[1].contains(100.0));
        assert_eq!(find_zone(100.0, &zones).unwrap().id, 0);
    }

    #[test]
    fn ends_are_inclusive() {
        let zones = two_zones();
        assert_eq!(find_zone(0.0, &zones).unwrap().id, 0);
        assert_eq!(find_zone(200.0, &zones).unwrap().id, 1);
        assert!(find_zone(200.1, &zones).is_none());
        assert!(find_zone(-0.1, &zones).is_none());
    }
}
