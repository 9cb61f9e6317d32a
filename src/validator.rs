use std::cmp::Ordering;

use crate::overlay::{Coordinate, Direction, Element, Zone};

/// Decides which zones a message concerns and, while none has been reached,
/// which way it must travel. Routing only ever sees the key space through
/// this trait, so applications can express lookups, range scans, or any other
/// geometric constraint without touching the routers.
pub trait ConstraintsValidator: Send + Sync {
    /// A representative point of the constraint, used for greedy forwarding
    /// and diagnostics.
    fn key(&self) -> Coordinate;

    /// Whether the peer owning `zone` must act on the message.
    fn validates(&self, zone: &Zone) -> bool;

    /// The first axis on which `zone` misses the constraint, and the side the
    /// message must travel towards. `None` when the zone validates.
    fn forwarding_direction(&self, zone: &Zone) -> Option<(usize, Direction)>;
}

/// Exact-match constraint: exactly one zone validates, the one containing the
/// point.
pub struct PointValidator {
    key: Coordinate,
}

impl PointValidator {
    pub fn new(key: Coordinate) -> Self {
        Self { key }
    }
}

impl ConstraintsValidator for PointValidator {
    fn key(&self) -> Coordinate {
        self.key.clone()
    }

    fn validates(&self, zone: &Zone) -> bool {
        zone.contains(&self.key)
    }

    fn forwarding_direction(&self, zone: &Zone) -> Option<(usize, Direction)> {
        (0..zone.dimensions()).find_map(|dim| {
            match zone.contains_on(dim, self.key.element(dim)) {
                Ordering::Less => Some((dim, Direction::Inferior)),
                Ordering::Greater => Some((dim, Direction::Superior)),
                Ordering::Equal => None,
            }
        })
    }
}

/// Axis-aligned box constraint with inclusive per-axis ranges. An axis left
/// unconstrained matches every zone, so a validator constraining no axis at
/// all covers the whole overlay.
pub struct RegionValidator {
    ranges: Vec<Option<(Element, Element)>>,
}

impl RegionValidator {
    pub fn new(ranges: Vec<Option<(Element, Element)>>) -> Self {
        debug_assert!(ranges
            .iter()
            .flatten()
            .all(|(lower, upper)| lower <= upper));
        Self { ranges }
    }

    /// Matches every zone of a d-dimensional overlay.
    pub fn universal(dimensions: usize) -> Self {
        Self {
            ranges: vec![None; dimensions],
        }
    }
}

impl ConstraintsValidator for RegionValidator {
    fn key(&self) -> Coordinate {
        Coordinate(
            self.ranges
                .iter()
                .map(|range| range.map_or(0, |(lower, _)| lower))
                .collect(),
        )
    }

    fn validates(&self, zone: &Zone) -> bool {
        self.ranges.iter().enumerate().all(|(dim, range)| {
            range.map_or(true, |(lower, upper)| {
                lower < zone.upper_bound(dim) && upper >= zone.lower_bound(dim)
            })
        })
    }

    fn forwarding_direction(&self, zone: &Zone) -> Option<(usize, Direction)> {
        self.ranges.iter().enumerate().find_map(|(dim, range)| {
            let (lower, upper) = (*range)?;
            if upper < zone.lower_bound(dim) {
                Some((dim, Direction::Inferior))
            } else if lower >= zone.upper_bound(dim) {
                Some((dim, Direction::Superior))
            } else {
                None
            }
        })
    }
}
