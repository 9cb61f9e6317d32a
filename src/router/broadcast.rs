use tracing::warn;

use crate::error::Error;
use crate::messages::{Directions, Plane, Request, RequestKind};
use crate::overlay::{Direction, NeighborTable, PeerId, Zone};
use crate::peer::{PeerState, PeerStub};

use super::{anycast, forward_or_complete, run_local, ForwardTarget};

/// Spanning-tree broadcast. The pruning state carried by each copy makes
/// every peer receive the message exactly once, so unlike anycast the dedup
/// set is only consulted to detect upstream bugs.
pub(crate) fn make_decision(state: &mut PeerState, mut request: Request) -> Result<(), Error> {
    if state.received.contains(&request.id) {
        // must never happen: the pruning invariants are broken somewhere
        warn!(id = %request.id, "broadcast reached this peer twice, pruning failed upstream");
        return anycast::reply_duplicate(request);
    }
    state.received.insert(request.id);

    let validator = request.strategy.validator.clone();
    // validation gates the application side only, propagation always runs
    let (payload, error, background) = if validator.validates(&state.zone) {
        run_local(state, &request)
    } else {
        (None, false, false)
    };

    let dimensions = state.config.dimensions;
    let targets = match &mut request.kind {
        RequestKind::EfficientBroadcast { directions } => {
            let directions = directions
                .take()
                .unwrap_or_else(|| Directions::all(dimensions));
            efficient_targets(&state.zone, &state.table, directions)
                .into_iter()
                .map(|target| ForwardTarget {
                    peer_id: target.peer_id,
                    stub: target.stub,
                    kind: RequestKind::EfficientBroadcast {
                        directions: Some(target.directions),
                    },
                })
                .collect()
        }
        RequestKind::OptimalBroadcast { directions, plane } => {
            let directions = directions
                .take()
                .unwrap_or_else(|| Directions::all(dimensions));
            let plane = plane
                .take()
                .unwrap_or_else(|| Plane::from_lower_bounds(&state.zone));
            optimal_targets(&state.zone, &state.table, directions, plane)
                .into_iter()
                .map(|target| ForwardTarget {
                    peer_id: target.peer_id,
                    stub: target.stub,
                    kind: RequestKind::OptimalBroadcast {
                        directions: Some(target.directions),
                        plane: target.plane,
                    },
                })
                .collect()
        }
        // the request demux only hands broadcast kinds to this router
        RequestKind::Unicast | RequestKind::Anycast => Vec::new(),
    };

    forward_or_complete(state, request, targets, payload, error, background)
}

/// One child chosen by a pruning pass, with the state its copy must carry.
pub(crate) struct BroadcastTarget {
    pub peer_id: PeerId,
    pub stub: PeerStub,
    pub directions: Directions,
    pub plane: Option<Plane>,
}

/// Directional pruning with a corner check on the last axis. Axes are swept
/// from the highest down; a child never sends back towards its parent, and a
/// spent (dimension, direction) is withheld from every later child. On axis 0
/// a neighbor only receives the copy when its lower corner projects into the
/// sender's extent on every other axis, which prunes most corner duplicates
/// but not all of them.
pub(crate) fn efficient_targets(
    zone: &Zone,
    table: &NeighborTable,
    mut directions: Directions,
) -> Vec<BroadcastTarget> {
    let dimensions = zone.dimensions();
    let mut targets = Vec::new();

    for dimension in (0..dimensions).rev() {
        for direction in Direction::BOTH {
            if directions.active(dimension, direction) {
                for entry in table.get(dimension, direction).values() {
                    let corner_ok = dimension != 0
                        || (1..dimensions).all(|axis| {
                            zone.contains_on(axis, entry.zone.lower_bound(axis))
                                == std::cmp::Ordering::Equal
                        });
                    if corner_ok {
                        let mut child = directions.clone();
                        child.clear(dimension, direction.opposite());
                        targets.push(BroadcastTarget {
                            peer_id: entry.id,
                            stub: entry.stub.clone(),
                            directions: child,
                            plane: None,
                        });
                    }
                }
            }
            directions.clear(dimension, direction);
        }
    }

    targets
}

/// Directional pruning plus a propagation plane. The plane pins the copy to
/// the initiator's lower corner on every axis not yet swept; a neighbor only
/// receives the copy when its zone contains the plane on every pinned axis,
/// and on unpinned axes (other than the one being swept) when its lower bound
/// is not below the sender's. Every peer receives the broadcast exactly once.
pub(crate) fn optimal_targets(
    zone: &Zone,
    table: &NeighborTable,
    mut directions: Directions,
    mut plane: Plane,
) -> Vec<BroadcastTarget> {
    let dimensions = zone.dimensions();
    let mut targets = Vec::new();

    for dimension in 0..dimensions {
        // adjacency along the swept axis satisfies its constraint by itself
        plane.clear(dimension);
        for direction in Direction::BOTH {
            if directions.active(dimension, direction) {
                for entry in table.get(dimension, direction).values() {
                    let accepted = (0..dimensions).all(|axis| match plane.get(axis) {
                        None => {
                            axis == dimension
                                || zone.lower_bound(axis) <= entry.zone.lower_bound(axis)
                        }
                        Some(element) => {
                            entry.zone.contains_on(axis, element) == std::cmp::Ordering::Equal
                        }
                    });
                    if accepted {
                        let mut child = directions.clone();
                        child.clear(dimension, direction.opposite());
                        targets.push(BroadcastTarget {
                            peer_id: entry.id,
                            stub: entry.stub.clone(),
                            directions: child,
                            plane: Some(plane.clone()),
                        });
                    }
                }
            }
            directions.clear(dimension, direction);
        }
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{Coordinate, Element, NeighborEntry};
    use crate::peer::detached_stub;

    // a regular grid of zones, `side` per axis, peer ids encoding the index
    struct Grid {
        zones: Vec<Zone>,
        tables: Vec<NeighborTable>,
        dimensions: usize,
    }

    fn peer_id(index: usize) -> PeerId {
        let mut id = [0u8; 16];
        id[0] = index as u8;
        id
    }

    fn index_of(id: &PeerId) -> usize {
        id[0] as usize
    }

    fn grid(dimensions: usize, side: usize) -> Grid {
        let width: Element = 1000;
        let count = side.pow(dimensions as u32);
        let mut zones = Vec::with_capacity(count);
        for index in 0..count {
            let mut rest = index;
            let mut lower = Vec::with_capacity(dimensions);
            let mut upper = Vec::with_capacity(dimensions);
            for _ in 0..dimensions {
                let cell = (rest % side) as Element;
                rest /= side;
                lower.push(cell * width);
                upper.push((cell + 1) * width);
            }
            zones.push(Zone::new(Coordinate(lower), Coordinate(upper)));
        }

        let mut tables: Vec<NeighborTable> =
            (0..count).map(|_| NeighborTable::new(dimensions)).collect();
        for i in 0..count {
            for j in 0..count {
                if i == j {
                    continue;
                }
                if let Some(axis) = zones[i].neighbor_axis(&zones[j]) {
                    let direction = if zones[j].lower_bound(axis) == zones[i].upper_bound(axis) {
                        Direction::Superior
                    } else {
                        Direction::Inferior
                    };
                    tables[i].add(
                        NeighborEntry {
                            id: peer_id(j),
                            zone: zones[j].clone(),
                            stub: detached_stub(peer_id(j)),
                        },
                        axis,
                        direction,
                    );
                }
            }
        }

        Grid {
            zones,
            tables,
            dimensions,
        }
    }

    fn simulate(grid: &Grid, start: usize, optimal: bool) -> Vec<u32> {
        let mut receipts = vec![0u32; grid.zones.len()];
        let mut worklist = vec![(
            start,
            Directions::all(grid.dimensions),
            Plane::from_lower_bounds(&grid.zones[start]),
        )];

        while let Some((index, directions, plane)) = worklist.pop() {
            receipts[index] += 1;
            let targets = if optimal {
                optimal_targets(&grid.zones[index], &grid.tables[index], directions, plane)
            } else {
                efficient_targets(&grid.zones[index], &grid.tables[index], directions)
            };
            for target in targets {
                let next = index_of(&target.peer_id);
                let plane = target
                    .plane
                    .unwrap_or_else(|| Plane::from_lower_bounds(&grid.zones[next]));
                worklist.push((next, target.directions, plane));
            }
        }

        receipts
    }

    fn assert_exactly_once(grid: &Grid, optimal: bool) {
        for start in 0..grid.zones.len() {
            let receipts = simulate(grid, start, optimal);
            for (index, count) in receipts.iter().enumerate() {
                assert_eq!(
                    *count, 1,
                    "peer {} received {} copies when starting from {}",
                    index, count, start
                );
            }
        }
    }

    #[test]
    fn optimal_covers_2d_quadrants_exactly_once() {
        assert_exactly_once(&grid(2, 2), true);
    }

    #[test]
    fn optimal_covers_2d_grid_exactly_once_from_every_start() {
        assert_exactly_once(&grid(2, 4), true);
    }

    #[test]
    fn optimal_covers_3d_grid_exactly_once_from_every_start() {
        assert_exactly_once(&grid(3, 2), true);
        assert_exactly_once(&grid(3, 3), true);
    }

    #[test]
    fn efficient_covers_2d_grid_exactly_once_from_every_start() {
        assert_exactly_once(&grid(2, 2), false);
        assert_exactly_once(&grid(2, 4), false);
    }

    #[test]
    fn efficient_covers_every_peer_in_3d() {
        // the corner heuristic guarantees coverage; on a regular grid it
        // also avoids duplicates
        let grid = grid(3, 2);
        for start in 0..grid.zones.len() {
            let receipts = simulate(&grid, start, false);
            assert!(receipts.iter().all(|count| *count >= 1));
        }
    }

    #[test]
    fn child_never_sends_back_to_its_parent() {
        let grid = grid(2, 2);
        let targets = optimal_targets(
            &grid.zones[0],
            &grid.tables[0],
            Directions::all(2),
            Plane::from_lower_bounds(&grid.zones[0]),
        );

        for target in targets {
            let child = index_of(&target.peer_id);
            let axis = grid.zones[0].neighbor_axis(&grid.zones[child]).unwrap();
            let back = if grid.zones[child].lower_bound(axis) == grid.zones[0].upper_bound(axis) {
                Direction::Inferior
            } else {
                Direction::Superior
            };
            assert!(!target.directions.active(axis, back));
        }
    }
}
