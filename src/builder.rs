use std::any::Any;

use crate::config::OverlayConfig;
use crate::error::Error;
use crate::messages::Envelope;
use crate::overlay::{Direction, NeighborEntry, PeerId, Zone};
use crate::peer::{Peer, PeerStub};

/// Assembles an in-process overlay by splitting zones the way successive
/// joins would, then spawning one peer per zone with both sides of every
/// adjacency wired. Used by tests and demos; a live deployment grows through
/// the join protocol instead.
pub struct OverlayBuilder {
    config: OverlayConfig,
    zones: Vec<Zone>,
}

/// A spawned peer and the zone it owns.
pub struct SpawnedPeer {
    pub stub: PeerStub,
    pub zone: Zone,
}

impl SpawnedPeer {
    pub fn id(&self) -> PeerId {
        self.stub.id()
    }
}

impl OverlayBuilder {
    /// Starts from a single zone covering the whole key space.
    pub fn new(config: OverlayConfig) -> Self {
        let zones = vec![Zone::full(config.dimensions)];
        Self { config, zones }
    }

    /// Splits the zone at `index` at its midpoint along `dimension`. The
    /// superior half is appended at the end of the zone list.
    pub fn split(mut self, index: usize, dimension: usize) -> Self {
        let (inferior, superior) = self.zones[index].split(dimension);
        self.zones[index] = inferior;
        self.zones.push(superior);
        self
    }

    /// Splits every zone once along every axis, turning each zone into a
    /// regular block of 2^d.
    pub fn split_grid(mut self) -> Self {
        for dimension in 0..self.config.dimensions {
            let mut next = Vec::with_capacity(self.zones.len() * 2);
            for zone in &self.zones {
                let (inferior, superior) = zone.split(dimension);
                next.push(inferior);
                next.push(superior);
            }
            self.zones = next;
        }
        self
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Whether the zones tile the key space: pairwise disjoint and summing
    /// to the full area. The midpoint split keeps this true by construction,
    /// so a failure means the builder was driven into a corrupt state.
    pub fn is_partition(&self) -> bool {
        for (i, zone) in self.zones.iter().enumerate() {
            for other in &self.zones[i + 1..] {
                let disjoint =
                    (0..self.config.dimensions).any(|dim| !zone.overlaps_on(other, dim));
                if !disjoint {
                    return false;
                }
            }
        }

        let total: f64 = self.zones.iter().map(Zone::area).sum();
        let full = Zone::full(self.config.dimensions).area();
        (total - full).abs() <= full * 1e-9
    }

    /// Spawns one peer per zone and exchanges neighbor entries between every
    /// adjacent pair. `store` builds each peer's application store from its
    /// index and zone.
    pub fn spawn<F>(self, mut store: F) -> Result<Vec<SpawnedPeer>, Error>
    where
        F: FnMut(usize, &Zone) -> Box<dyn Any + Send>,
    {
        let peers: Vec<SpawnedPeer> = self
            .zones
            .iter()
            .enumerate()
            .map(|(index, zone)| SpawnedPeer {
                stub: Peer::spawn(self.config.clone(), zone.clone(), store(index, zone)),
                zone: zone.clone(),
            })
            .collect();

        for (i, peer) in peers.iter().enumerate() {
            for (j, other) in peers.iter().enumerate() {
                if i == j {
                    continue;
                }
                let Some(axis) = peer.zone.neighbor_axis(&other.zone) else {
                    continue;
                };
                let direction = if other.zone.lower_bound(axis) == peer.zone.upper_bound(axis) {
                    Direction::Superior
                } else {
                    Direction::Inferior
                };
                peer.stub.send(Envelope::AddNeighbor {
                    entry: NeighborEntry {
                        id: other.id(),
                        zone: other.zone.clone(),
                        stub: other.stub.clone(),
                    },
                    dimension: axis,
                    direction,
                })?;
            }
        }

        Ok(peers)
    }
}
