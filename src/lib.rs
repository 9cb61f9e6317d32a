//! Message routing and response aggregation over a CAN-style structured
//! overlay.
//!
//! The key space is a d-dimensional torus-free box partitioned into
//! hyper-rectangular zones, one per peer. Requests travel forward as greedy
//! unicasts, constrained anycast floods, or spanning-tree broadcasts, run
//! application callbacks on the peers their constraints validate, and their
//! responses merge pairwise on the way back along the reverse path until a
//! single final response reaches the dispatching caller.
//!
//! Each peer is a task owning its zone, neighbor table, and aggregation
//! state; everything reaches it through its mailbox, so no routing state is
//! ever shared between threads.

mod aggregation;
mod builder;
mod config;
mod dispatch;
mod error;
mod hex;
mod messages;
mod overlay;
mod peer;
mod router;
mod validator;

pub use aggregation::{AggregationEntry, CombinerFn, ResponseEntry, Status};
pub use builder::{OverlayBuilder, SpawnedPeer};
pub use config::OverlayConfig;
pub use dispatch::{FinalResponseSink, MessageDispatcher};
pub use error::Error;
pub use hex::{ShortHex, ShortHexExt};
pub use messages::{
    BackgroundHandler, Directions, Envelope, FaultPolicy, FinalResponse, Handler, HandlerError,
    InlineHandler, MergeFn, MessageId, Payload, Plane, Request, RequestKind, Response,
    ResponseMode, ResponseProvider, ReversePathEntry, ReversePathStack, Strategy,
};
pub use overlay::{
    nearest_neighbor, Coordinate, Direction, Element, NeighborEntry, NeighborTable, PeerId, Zone,
};
pub use peer::{Peer, PeerContext, PeerSnapshot, PeerStub};
pub use validator::{ConstraintsValidator, PointValidator, RegionValidator};
