use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::dispatch::FinalResponseSink;
use crate::hex::ShortHexExt;
use crate::overlay::{Coordinate, Direction, Element, NeighborEntry, PeerId, Zone};
use crate::peer::{PeerContext, PeerSnapshot, PeerStub};
use crate::validator::ConstraintsValidator;

/// Globally unique message identifier: the producer that minted it plus a
/// per-producer sequence number.
#[derive(Clone, Copy, Archive, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[archive(check_bytes)]
pub struct MessageId {
    pub producer: PeerId,
    pub seq: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.producer.short_hex(), self.seq)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Opaque application bytes carried by responses.
pub type Payload = Vec<u8>;

/// Folds two sub-response payloads into one. Runs on whichever peer holds the
/// aggregation entry, so it must be commutative and associative for the final
/// value to be independent of arrival order.
pub type MergeFn = Arc<dyn Fn(Payload, Payload) -> Payload + Send + Sync>;

/// Produces this peer's contribution to the aggregated response.
pub type ResponseProvider = Arc<dyn Fn(&mut PeerContext<'_>, &Request) -> Payload + Send + Sync>;

/// Application side effect executed on every validating peer, inline on the
/// peer's event loop. Must stay short; long work belongs in a background
/// handler.
pub type InlineHandler =
    Arc<dyn Fn(&mut PeerContext<'_>, &Request) -> Result<(), HandlerError> + Send + Sync>;

/// Application side effect executed off the peer's event loop on the blocking
/// pool. Its return value is merged into the peer's aggregation entry like
/// one more sub-response, so the entry completes only once the task is done.
pub type BackgroundHandler = Arc<dyn Fn(PeerId, &Zone, &Request) -> Payload + Send + Sync>;

/// Failure reported by an application handler.
#[derive(Debug)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// What a peer does when its handler fails: keep the traversal alive and
/// respond with whatever it has, or mark the whole aggregation as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    Degrade,
    Escalate,
}

pub enum Handler {
    Inline(InlineHandler),
    Background(BackgroundHandler),
}

/// Everything the routers need to know about one kind of application message:
/// where it applies, what to run there, and how to combine the answers.
pub struct Strategy {
    pub validator: Arc<dyn ConstraintsValidator>,
    pub handler: Option<Handler>,
    pub provider: Option<ResponseProvider>,
    pub merge: Option<MergeFn>,
    pub fault_policy: FaultPolicy,
}

impl Strategy {
    pub fn new(validator: impl ConstraintsValidator + 'static) -> Self {
        Self {
            validator: Arc::new(validator),
            handler: None,
            provider: None,
            merge: None,
            fault_policy: FaultPolicy::Degrade,
        }
    }

    pub fn on_peer<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut PeerContext<'_>, &Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handler = Some(Handler::Inline(Arc::new(handler)));
        self
    }

    pub fn on_peer_background<F>(mut self, handler: F) -> Self
    where
        F: Fn(PeerId, &Zone, &Request) -> Payload + Send + Sync + 'static,
    {
        self.handler = Some(Handler::Background(Arc::new(handler)));
        self
    }

    pub fn with_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&mut PeerContext<'_>, &Request) -> Payload + Send + Sync + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn with_merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(Payload, Payload) -> Payload + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }

    pub fn escalate_faults(mut self) -> Self {
        self.fault_policy = FaultPolicy::Escalate;
        self
    }
}

/// Per-axis propagation permissions of a broadcast copy. A cleared side is a
/// promise that some other copy already covers it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directions(Vec<[bool; 2]>);

impl Directions {
    pub fn all(dimensions: usize) -> Self {
        Self(vec![[true; 2]; dimensions])
    }

    pub fn active(&self, dimension: usize, direction: Direction) -> bool {
        self.0[dimension][direction.index()]
    }

    pub fn clear(&mut self, dimension: usize, direction: Direction) {
        self.0[dimension][direction.index()] = false;
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }
}

/// Per-axis containment constraint of the optimal broadcast: a child only
/// accepts a copy when its zone contains the plane on every constrained axis.
/// Axes already swept are unconstrained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plane(Vec<Option<Element>>);

impl Plane {
    /// The initiator pins the plane to its own lower corner.
    pub fn from_lower_bounds(zone: &Zone) -> Self {
        Self((0..zone.dimensions()).map(|dim| Some(zone.lower_bound(dim))).collect())
    }

    pub fn get(&self, dimension: usize) -> Option<Element> {
        self.0[dimension]
    }

    pub fn clear(&mut self, dimension: usize) {
        self.0[dimension] = None;
    }
}

#[derive(Clone)]
pub enum RequestKind {
    /// Greedy walk to the single zone validating the constraints.
    Unicast,
    /// Flooding constrained to validating zones, duplicates pruned by the
    /// receiver's dedup set.
    Anycast,
    /// Spanning-tree broadcast with directional pruning. `None` until the
    /// first validating peer seeds the directions.
    EfficientBroadcast { directions: Option<Directions> },
    /// Spanning-tree broadcast with directional and plane pruning, reaching
    /// every peer exactly once by construction.
    OptimalBroadcast {
        directions: Option<Directions>,
        plane: Option<Plane>,
    },
}

/// One hop of the return path: who to hand the merged response to next.
#[derive(Clone)]
pub struct ReversePathEntry {
    pub peer_id: PeerId,
    pub stub: PeerStub,
}

/// Stack of peers awaiting sub-responses along the path this copy travelled.
/// Each peer that fans out pushes itself; each response send pops exactly one
/// entry.
#[derive(Clone, Default)]
pub struct ReversePathStack(Vec<ReversePathEntry>);

impl ReversePathStack {
    pub fn push(&mut self, entry: ReversePathEntry) {
        self.0.push(entry);
    }

    pub fn pop(&mut self) -> Option<ReversePathEntry> {
        self.0.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.0.iter().any(|entry| entry.peer_id == *id)
    }
}

/// An application message travelling forward through the overlay.
#[derive(Clone)]
pub struct Request {
    pub id: MessageId,
    /// Set when this request belongs to a dispatcher-side group.
    pub aggregation_id: Option<MessageId>,
    pub kind: RequestKind,
    pub strategy: Arc<Strategy>,
    pub hop_count: u32,
    pub dispatched_at: DateTime<Utc>,
    /// Lower corner of the dispatching peer's zone, recorded on first
    /// receipt. Unicast responses travel back towards it geometrically.
    pub origin: Option<Coordinate>,
    pub reverse_path: ReversePathStack,
    /// Where the final response goes. `None` for fire-and-forget requests,
    /// which then produce no responses at all.
    pub response_destination: Option<FinalResponseSink>,
}

impl Request {
    fn with_kind(kind: RequestKind, strategy: Strategy) -> Self {
        Self {
            id: MessageId {
                producer: [0; 16],
                seq: 0,
            },
            aggregation_id: None,
            kind,
            strategy: Arc::new(strategy),
            hop_count: 0,
            dispatched_at: Utc::now(),
            origin: None,
            reverse_path: ReversePathStack::default(),
            response_destination: None,
        }
    }

    pub fn unicast(strategy: Strategy) -> Self {
        Self::with_kind(RequestKind::Unicast, strategy)
    }

    pub fn anycast(strategy: Strategy) -> Self {
        Self::with_kind(RequestKind::Anycast, strategy)
    }

    pub fn efficient_broadcast(strategy: Strategy) -> Self {
        Self::with_kind(RequestKind::EfficientBroadcast { directions: None }, strategy)
    }

    pub fn optimal_broadcast(strategy: Strategy) -> Self {
        Self::with_kind(
            RequestKind::OptimalBroadcast {
                directions: None,
                plane: None,
            },
            strategy,
        )
    }

    /// Requests dispatched without a destination leave no aggregation state
    /// behind anywhere.
    pub fn expects_response(&self) -> bool {
        self.response_destination.is_some()
    }

    pub fn key(&self) -> Coordinate {
        self.strategy.validator.key()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseMode {
    /// Routed geometrically back to the request's origin coordinate.
    Unicast,
    /// Routed along the reverse path, merging at every fan-out point.
    Multicast,
}

/// A (possibly partial) answer travelling back towards the requester.
#[derive(Clone)]
pub struct Response {
    pub id: MessageId,
    pub aggregation_id: Option<MessageId>,
    pub mode: ResponseMode,
    /// For unicast responses, the coordinate to route back to.
    pub key: Coordinate,
    pub payload: Option<Payload>,
    pub error: bool,
    pub merge: Option<MergeFn>,
    pub hop_count: u32,
    pub inbound_hop_count: u32,
    pub reverse_path: ReversePathStack,
    pub destination: Option<FinalResponseSink>,
    pub dispatched_at: DateTime<Utc>,
}

impl Response {
    fn base(request: &Request) -> Self {
        Self {
            id: request.id,
            aggregation_id: request.aggregation_id,
            mode: ResponseMode::Multicast,
            key: request.key(),
            payload: None,
            error: false,
            merge: request.strategy.merge.clone(),
            hop_count: 0,
            inbound_hop_count: request.hop_count,
            reverse_path: ReversePathStack::default(),
            destination: request.response_destination.clone(),
            dispatched_at: request.dispatched_at,
        }
    }

    /// A reverse-path response. `reverse_path` is the path as it stood before
    /// the responding peer pushed itself, so the popping discipline stays one
    /// pop per send.
    pub fn multicast(
        request: &Request,
        reverse_path: ReversePathStack,
        payload: Option<Payload>,
        error: bool,
    ) -> Self {
        Self {
            reverse_path,
            payload,
            error,
            ..Self::base(request)
        }
    }

    /// A geometrically routed response headed back to `origin`.
    pub fn unicast(
        request: &Request,
        origin: Coordinate,
        payload: Option<Payload>,
        error: bool,
    ) -> Self {
        Self {
            mode: ResponseMode::Unicast,
            key: origin,
            payload,
            error,
            ..Self::base(request)
        }
    }
}

/// The fully aggregated answer handed back to the dispatching caller.
#[derive(Clone, Debug)]
pub struct FinalResponse {
    pub id: MessageId,
    pub aggregation_id: Option<MessageId>,
    pub payload: Option<Payload>,
    pub error: bool,
    pub inbound_hop_count: u32,
    pub outbound_hop_count: u32,
    pub dispatched_at: DateTime<Utc>,
    pub delivered_at: DateTime<Utc>,
}

impl FinalResponse {
    pub fn latency(&self) -> chrono::Duration {
        self.delivered_at - self.dispatched_at
    }
}

/// Everything a peer's mailbox can receive.
pub enum Envelope {
    Request(Request),
    Response(Response),
    /// Completion notice of a background handler, sent by the blocking task
    /// back to its own peer.
    TaskDone {
        id: MessageId,
        payload: Payload,
        elapsed: Duration,
    },
    AddNeighbor {
        entry: NeighborEntry,
        dimension: usize,
        direction: Direction,
    },
    RemoveNeighbor(PeerId),
    Snapshot(oneshot::Sender<PeerSnapshot>),
}
