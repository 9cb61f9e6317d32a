use std::any::Any;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, error, Instrument};

use crate::aggregation::{merge_payloads, ResponseEntry};
use crate::config::OverlayConfig;
use crate::dispatch::FinalResponseSink;
use crate::error::Error;
use crate::hex::ShortHexExt;
use crate::messages::{
    BackgroundHandler, Envelope, MergeFn, MessageId, Payload, Request, Response, ResponseMode,
    ReversePathStack,
};
use crate::overlay::{Coordinate, NeighborTable, PeerId, Zone};
use crate::router;

/// Cloneable handle to a running peer. Everything the rest of the system does
/// to a peer goes through its mailbox.
#[derive(Clone)]
pub struct PeerStub {
    id: PeerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PeerStub {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub(crate) fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.tx
            .send(envelope)
            .map_err(|_| Error::PeerUnreachable(self.id))
    }

    /// Hands a request to this peer for routing.
    pub fn route(&self, request: Request) -> Result<(), Error> {
        self.send(Envelope::Request(request))
    }

    pub async fn snapshot(&self) -> Result<PeerSnapshot, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Envelope::Snapshot(tx))?;
        rx.await.map_err(|_| Error::PeerUnreachable(self.id))
    }
}

/// Observability view of one peer's routing state.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub zone: Zone,
    pub neighbors: usize,
    pub pending_entries: usize,
    pub pending_tasks: usize,
    pub seen_requests: usize,
}

/// View of the hosting peer handed to application handlers and providers.
pub struct PeerContext<'a> {
    pub id: PeerId,
    pub zone: &'a Zone,
    store: &'a mut Box<dyn Any + Send>,
}

impl PeerContext<'_> {
    /// The peer's application store, when it holds a `T`.
    pub fn store<T: 'static>(&mut self) -> Option<&mut T> {
        self.store.downcast_mut::<T>()
    }
}

/// Message-id set that forgets entries after a fixed TTL. Ids only matter
/// while their traversal is in flight, so expiry keeps the set bounded.
pub(crate) struct ExpiringSet {
    ttl: Duration,
    set: HashSet<MessageId>,
    expiries: BinaryHeap<(Reverse<Instant>, MessageId)>,
}

impl ExpiringSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            set: HashSet::new(),
            expiries: BinaryHeap::new(),
        }
    }

    pub fn insert(&mut self, id: MessageId) {
        if self.set.insert(id) {
            self.expiries.push((Reverse(Instant::now() + self.ttl), id));
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.set.contains(id)
    }

    pub fn remove_expired(&mut self) {
        let now = Instant::now();
        while let Some((Reverse(expiry), id)) = self.expiries.peek().copied() {
            if expiry > now {
                break;
            }
            self.expiries.pop();
            self.set.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }
}

/// State carried by a background handler so its result can be turned back
/// into a response when the blocking task reports in.
pub(crate) struct PendingTask {
    pub mode: ResponseMode,
    /// For multicast: the reverse path as it stood before the peer pushed
    /// itself.
    pub reverse_path: ReversePathStack,
    /// For unicast: the origin coordinate to route the response back to.
    pub key: Coordinate,
    pub aggregation_id: Option<MessageId>,
    pub merge: Option<MergeFn>,
    pub destination: Option<FinalResponseSink>,
    pub inbound_hop_count: u32,
    /// For unicast: the provider's payload, merged with the task's result.
    pub seed: Option<Payload>,
    /// Whether the inline part of the handling already failed.
    pub error: bool,
    pub dispatched_at: DateTime<Utc>,
}

pub(crate) struct PeerState {
    pub config: OverlayConfig,
    pub id: PeerId,
    pub zone: Zone,
    pub table: NeighborTable,
    pub entries: HashMap<MessageId, ResponseEntry>,
    pub pending_tasks: HashMap<MessageId, PendingTask>,
    pub received: ExpiringSet,
    pub stub: PeerStub,
    pub store: Box<dyn Any + Send>,
    pub rng: SmallRng,
}

impl PeerState {
    pub fn context(&mut self) -> PeerContext<'_> {
        PeerContext {
            id: self.id,
            zone: &self.zone,
            store: &mut self.store,
        }
    }
}

/// Stub whose mailbox is never drained, for routing-table tests that only
/// inspect target selection.
#[cfg(test)]
pub(crate) fn detached_stub(id: PeerId) -> PeerStub {
    let (tx, rx) = mpsc::unbounded_channel();
    // keep the channel open so sends would not error
    std::mem::forget(rx);
    PeerStub { id, tx }
}

pub struct Peer;

impl Peer {
    /// Spawns a peer task owning `zone` and returns the handle to message it.
    /// The peer runs until every handle is dropped.
    pub fn spawn(config: OverlayConfig, zone: Zone, store: Box<dyn Any + Send>) -> PeerStub {
        let id: PeerId = rand::random();
        let (tx, rx) = mpsc::unbounded_channel();
        let stub = PeerStub { id, tx };
        let dimensions = config.dimensions;
        let dedup_ttl = config.dedup_ttl;
        let state = PeerState {
            config,
            id,
            zone,
            table: NeighborTable::new(dimensions),
            entries: HashMap::new(),
            pending_tasks: HashMap::new(),
            received: ExpiringSet::new(dedup_ttl),
            stub: stub.clone(),
            store,
            rng: SmallRng::from_entropy(),
        };

        tokio::spawn(run(state, rx).instrument(debug_span!("peer", id = %id.short_hex())));
        stub
    }
}

async fn run(mut state: PeerState, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    debug!(zone = %state.zone, "peer started");
    while let Some(envelope) = rx.recv().await {
        state.received.remove_expired();
        if let Err(e) = handle(&mut state, envelope) {
            // routing errors are per-message, the peer keeps serving
            error!("{}", e);
        }
    }
    debug!("peer stopped");
}

fn handle(state: &mut PeerState, envelope: Envelope) -> Result<(), Error> {
    match envelope {
        Envelope::Request(request) => router::route_request(state, request),
        Envelope::Response(response) => router::route_response(state, response),
        Envelope::TaskDone {
            id,
            payload,
            elapsed,
        } => on_task_done(state, id, payload, elapsed),
        Envelope::AddNeighbor {
            entry,
            dimension,
            direction,
        } => {
            debug!(
                neighbor = %entry.id.short_hex(),
                zone = %entry.zone,
                %dimension,
                %direction,
                "neighbor added"
            );
            state.table.add(entry, dimension, direction);
            Ok(())
        }
        Envelope::RemoveNeighbor(id) => {
            if state.table.remove(&id) {
                debug!(neighbor = %id.short_hex(), "neighbor removed");
            }
            Ok(())
        }
        Envelope::Snapshot(tx) => {
            let _ = tx.send(PeerSnapshot {
                id: state.id,
                zone: state.zone.clone(),
                neighbors: state.table.size(),
                pending_entries: state.entries.len(),
                pending_tasks: state.pending_tasks.len(),
                seen_requests: state.received.len(),
            });
            Ok(())
        }
    }
}

fn on_task_done(
    state: &mut PeerState,
    id: MessageId,
    payload: Payload,
    elapsed: Duration,
) -> Result<(), Error> {
    let Some(task) = state.pending_tasks.remove(&id) else {
        // fire-and-forget request: the task ran for its side effects only
        debug!(%id, ?elapsed, "background task finished, result discarded");
        return Ok(());
    };
    debug!(%id, ?elapsed, "background task finished");

    let payload = merge_payloads(task.seed, Some(payload), task.merge.as_ref());
    let response = Response {
        id,
        aggregation_id: task.aggregation_id,
        mode: task.mode,
        key: task.key,
        payload,
        error: task.error,
        merge: task.merge,
        hop_count: 0,
        inbound_hop_count: task.inbound_hop_count,
        reverse_path: task.reverse_path,
        destination: task.destination,
        dispatched_at: task.dispatched_at,
    };
    router::route_response(state, response)
}

/// Runs a background handler on the blocking pool. The result comes back to
/// this peer's own mailbox as a `TaskDone` envelope.
pub(crate) fn spawn_background(state: &PeerState, request: &Request, handler: BackgroundHandler) {
    let stub = state.stub.clone();
    let peer_id = state.id;
    let zone = state.zone.clone();
    let request = request.clone();

    tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let payload = handler(peer_id, &zone, &request);
        // the peer may be gone by the time the task finishes
        let _ = stub.send(Envelope::TaskDone {
            id: request.id,
            payload,
            elapsed: started.elapsed(),
        });
    });
}
