use std::cmp::Ordering;

use hashbrown::HashMap;
use rand::Rng;

use crate::overlay::{Coordinate, Direction, PeerId, Zone};
use crate::peer::PeerStub;

/// One adjacency known to a peer: the neighbor's identity, a snapshot of its
/// zone, and the handle used to message it. The same peer may appear in
/// several (dimension, direction) buckets when it neighbors along more than
/// one axis.
#[derive(Clone)]
pub struct NeighborEntry {
    pub id: PeerId,
    pub zone: Zone,
    pub stub: PeerStub,
}

/// Neighbors bucketed by (dimension, direction). Maintained from outside by
/// the overlay maintenance layer; the routers only read it.
pub struct NeighborTable {
    buckets: Vec<[HashMap<PeerId, NeighborEntry>; 2]>,
}

impl NeighborTable {
    pub fn new(dimensions: usize) -> Self {
        Self {
            buckets: (0..dimensions)
                .map(|_| [HashMap::new(), HashMap::new()])
                .collect(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.buckets.len()
    }

    pub fn add(&mut self, entry: NeighborEntry, dimension: usize, direction: Direction) {
        self.buckets[dimension][direction.index()].insert(entry.id, entry);
    }

    /// Removes the peer from every bucket it appears in. Returns whether it
    /// was known at all.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        let mut removed = false;
        for buckets in &mut self.buckets {
            for bucket in buckets {
                removed |= bucket.remove(id).is_some();
            }
        }
        removed
    }

    pub fn get(&self, dimension: usize, direction: Direction) -> &HashMap<PeerId, NeighborEntry> {
        &self.buckets[dimension][direction.index()]
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.buckets
            .iter()
            .any(|buckets| buckets.iter().any(|bucket| bucket.contains_key(id)))
    }

    /// Total number of entries, counting a peer once per bucket it sits in.
    pub fn size(&self) -> usize {
        self.buckets
            .iter()
            .map(|buckets| buckets[0].len() + buckets[1].len())
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Direction, &NeighborEntry)> {
        self.buckets.iter().enumerate().flat_map(|(dim, buckets)| {
            Direction::BOTH.into_iter().flat_map(move |direction| {
                buckets[direction.index()]
                    .values()
                    .map(move |entry| (dim, direction, entry))
            })
        })
    }
}

/// Picks, from the (dimension, direction) bucket, the neighbor deemed nearest
/// to `key`: neighbors managing the key on every other axis are preferred,
/// then the ones satisfying the most axes, with ties broken randomly.
pub fn nearest_neighbor<'a>(
    table: &'a NeighborTable,
    key: &Coordinate,
    dimension: usize,
    direction: Direction,
    rng: &mut impl Rng,
) -> Option<&'a NeighborEntry> {
    let bucket = table.get(dimension, direction);
    if bucket.is_empty() {
        return None;
    }

    let rank = |entry: &NeighborEntry| {
        (0..table.dimensions())
            .filter(|&dim| {
                dim != dimension
                    && entry.zone.contains_on(dim, key.element(dim)) == Ordering::Equal
            })
            .count()
    };

    let best = bucket.values().map(|entry| rank(entry)).max()?;
    let candidates: Vec<&NeighborEntry> = bucket
        .values()
        .filter(|entry| rank(entry) == best)
        .collect();

    Some(candidates[rng.gen_range(0..candidates.len())])
}
