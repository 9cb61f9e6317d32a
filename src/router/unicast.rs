use std::cmp::Ordering;

use chrono::Utc;
use tracing::debug;

use crate::error::Error;
use crate::hex::ShortHexExt;
use crate::messages::{Envelope, FinalResponse, Request, Response, ResponseMode, ReversePathStack};
use crate::overlay::{nearest_neighbor, Direction};
use crate::peer::{PeerState, PendingTask};

/// Greedy forwarding: walk one axis at a time towards the single zone the
/// constraints validate, then answer from there.
pub(crate) fn make_decision(state: &mut PeerState, mut request: Request) -> Result<(), Error> {
    if request.origin.is_none() {
        // first receipt: the response will travel back to this corner
        request.origin = Some(state.zone.lower().clone());
    }

    let validator = request.strategy.validator.clone();
    match validator.forwarding_direction(&state.zone) {
        None => handle_destination(state, request),
        Some((dimension, direction)) => {
            let key = validator.key();
            let neighbor =
                nearest_neighbor(&state.table, &key, dimension, direction, &mut state.rng)
                    .ok_or(Error::NoNeighbor {
                        dimension,
                        direction,
                    })?;
            debug!(
                id = %request.id,
                key = %key,
                to = %neighbor.id.short_hex(),
                %dimension,
                %direction,
                "forwarding towards the key owner"
            );
            request.hop_count += 1;
            neighbor.stub.send(Envelope::Request(request))
        }
    }
}

fn handle_destination(state: &mut PeerState, request: Request) -> Result<(), Error> {
    debug!(id = %request.id, hops = request.hop_count, "zone validates the unicast constraints");
    let (payload, local_error, background) = super::run_local(state, &request);

    if !request.expects_response() {
        return Ok(());
    }
    let origin = request
        .origin
        .clone()
        .unwrap_or_else(|| state.zone.lower().clone());

    if background {
        // respond once the blocking task reports in
        state.pending_tasks.insert(
            request.id,
            PendingTask {
                mode: ResponseMode::Unicast,
                reverse_path: ReversePathStack::default(),
                key: origin,
                aggregation_id: request.aggregation_id,
                merge: request.strategy.merge.clone(),
                destination: request.response_destination.clone(),
                inbound_hop_count: request.hop_count,
                seed: payload,
                error: local_error,
                dispatched_at: request.dispatched_at,
            },
        );
        return Ok(());
    }

    let response = Response::unicast(&request, origin, payload, local_error);
    route_response(state, response)
}

/// Routes a response geometrically back to the origin coordinate, delivering
/// it once the owning zone is reached.
pub(crate) fn route_response(state: &mut PeerState, mut response: Response) -> Result<(), Error> {
    let disagreeing = (0..state.zone.dimensions()).find_map(|dim| {
        match state.zone.contains_on(dim, response.key.element(dim)) {
            Ordering::Less => Some((dim, Direction::Inferior)),
            Ordering::Greater => Some((dim, Direction::Superior)),
            Ordering::Equal => None,
        }
    });

    match disagreeing {
        None => {
            let Some(destination) = response.destination.take() else {
                debug!(id = %response.id, "response reached its origin with nobody waiting");
                return Ok(());
            };
            debug!(id = %response.id, hops = response.hop_count, "delivering final response");
            destination.push(FinalResponse {
                id: response.id,
                aggregation_id: response.aggregation_id,
                payload: response.payload,
                error: response.error,
                inbound_hop_count: response.inbound_hop_count,
                outbound_hop_count: response.hop_count,
                dispatched_at: response.dispatched_at,
                delivered_at: Utc::now(),
            })
        }
        Some((dimension, direction)) => {
            let neighbor = nearest_neighbor(
                &state.table,
                &response.key,
                dimension,
                direction,
                &mut state.rng,
            )
            .ok_or(Error::NoNeighbor {
                dimension,
                direction,
            })?;
            debug!(
                id = %response.id,
                to = %neighbor.id.short_hex(),
                "routing response towards its origin"
            );
            response.hop_count += 1;
            neighbor.stub.send(Envelope::Response(response))
        }
    }
}
