use rkyv::{Archive, Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single axis value of the key space.
pub type Element = u64;

/// Which side of a zone a neighbor sits on along one axis.
#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum Direction {
    Inferior,
    Superior,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Inferior, Direction::Superior];

    pub fn index(self) -> usize {
        match self {
            Direction::Inferior => 0,
            Direction::Superior => 1,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Inferior => Direction::Superior,
            Direction::Superior => Direction::Inferior,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Inferior => write!(f, "inferior"),
            Direction::Superior => write!(f, "superior"),
        }
    }
}

/// A point of the d-dimensional key space, one element per axis.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[archive(check_bytes)]
pub struct Coordinate(pub Vec<Element>);

impl Coordinate {
    pub fn from(elements: Vec<Element>) -> Self {
        Self(elements)
    }

    pub fn element(&self, dimension: usize) -> Element {
        self.0[dimension]
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, ")")
    }
}

/// The hyper-rectangle of the key space owned by one peer. Bounds are
/// half-open per axis: an element `e` is inside on axis `d` when
/// `lower[d] <= e < upper[d]`.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Zone {
    lower: Coordinate,
    upper: Coordinate,
}

impl Zone {
    pub fn new(lower: Coordinate, upper: Coordinate) -> Self {
        debug_assert_eq!(lower.dimensions(), upper.dimensions());
        Self { lower, upper }
    }

    /// The whole key space for the given number of dimensions.
    pub fn full(dimensions: usize) -> Self {
        Self {
            lower: Coordinate(vec![0; dimensions]),
            upper: Coordinate(vec![Element::MAX; dimensions]),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.lower.dimensions()
    }

    pub fn lower(&self) -> &Coordinate {
        &self.lower
    }

    pub fn upper(&self) -> &Coordinate {
        &self.upper
    }

    pub fn lower_bound(&self, dimension: usize) -> Element {
        self.lower.element(dimension)
    }

    pub fn upper_bound(&self, dimension: usize) -> Element {
        self.upper.element(dimension)
    }

    /// Where `element` falls relative to this zone on one axis:
    /// `Less` when below the lower bound, `Greater` when at or above the
    /// upper bound, `Equal` when inside.
    pub fn contains_on(&self, dimension: usize, element: Element) -> Ordering {
        if element < self.lower_bound(dimension) {
            Ordering::Less
        } else if element >= self.upper_bound(dimension) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        (0..self.dimensions()).all(|dim| {
            self.contains_on(dim, coordinate.element(dim)) == Ordering::Equal
        })
    }

    /// Whether the two zones' extents overlap along one axis.
    pub fn overlaps_on(&self, other: &Zone, dimension: usize) -> bool {
        self.lower_bound(dimension) < other.upper_bound(dimension)
            && other.lower_bound(dimension) < self.upper_bound(dimension)
    }

    /// Whether `other` touches this zone along one axis on the given side
    /// without overlapping it.
    pub fn abuts_on(&self, other: &Zone, dimension: usize, direction: Direction) -> bool {
        match direction {
            Direction::Inferior => {
                other.upper_bound(dimension) == self.lower_bound(dimension)
            }
            Direction::Superior => {
                other.lower_bound(dimension) == self.upper_bound(dimension)
            }
        }
    }

    /// In a d-dimensional space two zones are neighbors when they overlap on
    /// exactly d-1 axes and abut on exactly one. Returns the abutting axis.
    pub fn neighbor_axis(&self, other: &Zone) -> Option<usize> {
        let mut overlaps = 0;
        let mut abuts = 0;
        let mut axis = 0;

        for dim in 0..self.dimensions() {
            if self.overlaps_on(other, dim) {
                overlaps += 1;
            } else if self.abuts_on(other, dim, Direction::Inferior)
                || self.abuts_on(other, dim, Direction::Superior)
            {
                axis = dim;
                abuts += 1;
            } else {
                return None;
            }
        }

        if abuts == 1 && overlaps == self.dimensions() - 1 {
            Some(axis)
        } else {
            None
        }
    }

    /// Splits the zone at the midpoint of the given axis, returning the
    /// inferior and superior halves.
    pub fn split(&self, dimension: usize) -> (Zone, Zone) {
        let lower = self.lower_bound(dimension);
        let upper = self.upper_bound(dimension);
        let middle = lower + (upper - lower) / 2;

        let mut inferior_upper = self.upper.clone();
        inferior_upper.0[dimension] = middle;
        let mut superior_lower = self.lower.clone();
        superior_lower.0[dimension] = middle;

        (
            Zone::new(self.lower.clone(), inferior_upper),
            Zone::new(superior_lower, self.upper.clone()),
        )
    }

    /// The zone's span as a product of axis widths. Exact for power-of-two
    /// widths, which is all the midpoint split ever produces.
    pub fn area(&self) -> f64 {
        (0..self.dimensions())
            .map(|dim| (self.upper_bound(dim) - self.lower_bound(dim)) as f64)
            .product()
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}..{}", self.lower, self.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(lower: &[Element], upper: &[Element]) -> Zone {
        Zone::new(Coordinate(lower.to_vec()), Coordinate(upper.to_vec()))
    }

    #[test]
    fn containment_is_half_open() {
        let z = zone(&[10, 10], &[20, 20]);

        assert!(z.contains(&Coordinate(vec![10, 19])));
        assert!(!z.contains(&Coordinate(vec![20, 10])));
        assert_eq!(z.contains_on(0, 9), Ordering::Less);
        assert_eq!(z.contains_on(0, 20), Ordering::Greater);
        assert_eq!(z.contains_on(0, 15), Ordering::Equal);
    }

    #[test]
    fn split_preserves_bounds() {
        let z = zone(&[0, 0], &[100, 100]);
        let (inf, sup) = z.split(0);

        assert_eq!(inf.lower_bound(0), 0);
        assert_eq!(inf.upper_bound(0), 50);
        assert_eq!(sup.lower_bound(0), 50);
        assert_eq!(sup.upper_bound(0), 100);
        assert_eq!(inf.upper_bound(1), 100);
        assert!(inf.abuts_on(&sup, 0, Direction::Inferior));
    }

    #[test]
    fn neighbor_axis_requires_one_abut() {
        let a = zone(&[0, 0], &[50, 50]);
        let b = zone(&[50, 0], &[100, 50]);
        let c = zone(&[50, 50], &[100, 100]);

        // b abuts a on axis 0 and overlaps on axis 1
        assert_eq!(a.neighbor_axis(&b), Some(0));
        // c only touches a at a corner: no overlap on any axis
        assert_eq!(a.neighbor_axis(&c), None);
        assert_eq!(b.neighbor_axis(&c), Some(1));
    }

    #[test]
    fn greedy_step_reaches_containing_zone() {
        // four quadrants of a 2D space; walking by first-disagreeing-axis
        // from any quadrant must land on the quadrant containing the key
        let quadrants = [
            zone(&[0, 0], &[50, 50]),
            zone(&[50, 0], &[100, 50]),
            zone(&[0, 50], &[50, 100]),
            zone(&[50, 50], &[100, 100]),
        ];
        let key = Coordinate(vec![75, 75]);

        let mut current = 0;
        let mut hops = 0;
        loop {
            if quadrants[current].contains(&key) {
                break;
            }
            let dim = (0..2)
                .find(|&d| {
                    quadrants[current].contains_on(d, key.element(d)) != Ordering::Equal
                })
                .unwrap();
            // move to the quadrant adjacent along dim that improves the axis
            current = quadrants
                .iter()
                .position(|z| {
                    z.contains_on(dim, key.element(dim)) == Ordering::Equal
                        && (0..2).all(|d| {
                            d == dim || z.overlaps_on(&quadrants[current], d)
                        })
                })
                .unwrap();
            hops += 1;
            assert!(hops <= 2, "greedy walk must terminate");
        }
        assert_eq!(current, 3);
    }
}
