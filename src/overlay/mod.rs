mod neighbors;
mod zone;

pub use neighbors::{nearest_neighbor, NeighborEntry, NeighborTable};
pub use zone::{Coordinate, Direction, Element, Zone};

/// Identifies one peer of the overlay for its whole lifetime.
pub type PeerId = [u8; 16];
