use tracing::debug;

use crate::aggregation::ResponseEntry;
use crate::error::Error;
use crate::hex::ShortHexExt;
use crate::messages::{Envelope, Request, RequestKind, Response, ReversePathEntry};
use crate::overlay::nearest_neighbor;
use crate::peer::PeerState;

use super::{forward_or_complete, run_local, ForwardTarget};

/// Constrained flooding: walk to the target region, then flood it through
/// every validating neighbor, relying on the dedup set to prune the cycles
/// the zone graph may contain.
pub(crate) fn make_decision(state: &mut PeerState, mut request: Request) -> Result<(), Error> {
    if state.received.contains(&request.id) {
        debug!(id = %request.id, "request already received, replying empty");
        return reply_duplicate(request);
    }

    let validator = request.strategy.validator.clone();
    match validator.forwarding_direction(&state.zone) {
        Some((dimension, direction)) => {
            // outside the target region: one greedy step towards it, which
            // makes this peer a plain relay on the return path
            if request.expects_response() {
                state
                    .entries
                    .insert(request.id, ResponseEntry::new(1, None));
                request.reverse_path.push(ReversePathEntry {
                    peer_id: state.id,
                    stub: state.stub.clone(),
                });
            }
            let key = validator.key();
            let neighbor =
                nearest_neighbor(&state.table, &key, dimension, direction, &mut state.rng)
                    .ok_or(Error::NoNeighbor {
                        dimension,
                        direction,
                    })?;
            debug!(
                id = %request.id,
                to = %neighbor.id.short_hex(),
                "forwarding towards the target region"
            );
            request.hop_count += 1;
            neighbor.stub.send(Envelope::Request(request))
        }
        None => {
            state.received.insert(request.id);
            debug!(id = %request.id, "zone validates the anycast constraints");
            let (payload, error, background) = run_local(state, &request);
            let targets = validating_neighbors(state, &request);
            forward_or_complete(state, request, targets, payload, error, background)
        }
    }
}

/// Answers a duplicate arrival with an empty response so the sender's entry
/// still completes. Pops exactly the sender off the reverse path.
pub(super) fn reply_duplicate(mut request: Request) -> Result<(), Error> {
    if !request.expects_response() {
        return Ok(());
    }
    let Some(parent) = request.reverse_path.pop() else {
        return Ok(());
    };
    debug!(
        id = %request.id,
        to = %parent.peer_id.short_hex(),
        "sending empty response for duplicate"
    );
    let mut response = Response::multicast(&request, request.reverse_path.clone(), None, false);
    response.hop_count = 1;
    parent.stub.send(Envelope::Response(response))
}

fn validating_neighbors(state: &PeerState, request: &Request) -> Vec<ForwardTarget> {
    let mut targets: Vec<ForwardTarget> = Vec::new();
    for (_, _, entry) in state.table.iter() {
        // the sender and its ancestors have seen this request already
        if request.reverse_path.contains(&entry.id) {
            continue;
        }
        if !request.strategy.validator.validates(&entry.zone) {
            continue;
        }
        // a neighbor adjacent on several axes sits in several buckets
        if targets.iter().any(|target| target.peer_id == entry.id) {
            continue;
        }
        targets.push(ForwardTarget {
            peer_id: entry.id,
            stub: entry.stub.clone(),
            kind: RequestKind::Anycast,
        });
    }
    targets
}
