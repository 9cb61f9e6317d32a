mod anycast;
mod broadcast;
mod response;
mod unicast;

use tracing::{debug, warn};

use crate::aggregation::ResponseEntry;
use crate::error::Error;
use crate::hex::ShortHexExt;
use crate::messages::{
    Envelope, FaultPolicy, Handler, Payload, Request, RequestKind, Response, ResponseMode,
    ReversePathEntry,
};
use crate::overlay::PeerId;
use crate::peer::{self, PeerState, PeerStub, PendingTask};

pub(crate) fn route_request(state: &mut PeerState, request: Request) -> Result<(), Error> {
    match request.kind {
        RequestKind::Unicast => unicast::make_decision(state, request),
        RequestKind::Anycast => anycast::make_decision(state, request),
        RequestKind::EfficientBroadcast { .. } | RequestKind::OptimalBroadcast { .. } => {
            broadcast::make_decision(state, request)
        }
    }
}

pub(crate) fn route_response(state: &mut PeerState, response: Response) -> Result<(), Error> {
    match response.mode {
        ResponseMode::Unicast => unicast::route_response(state, response),
        ResponseMode::Multicast => response::make_decision(state, response),
    }
}

/// One child of a fan-out, with the kind (and pruning state) its copy must
/// carry.
pub(crate) struct ForwardTarget {
    pub peer_id: PeerId,
    pub stub: PeerStub,
    pub kind: RequestKind,
}

/// Runs the request's application side on this peer: handler first, then the
/// response provider. Returns (local payload, local error, background task
/// spawned).
pub(crate) fn run_local(state: &mut PeerState, request: &Request) -> (Option<Payload>, bool, bool) {
    let mut error = false;
    let mut background = false;

    match &request.strategy.handler {
        Some(Handler::Inline(handler)) => {
            let handler = handler.clone();
            let policy = request.strategy.fault_policy;
            let mut context = state.context();
            if let Err(e) = handler(&mut context, request) {
                warn!(id = %request.id, policy = ?policy, "handler failed: {}", e);
                error = policy == FaultPolicy::Escalate;
            }
        }
        Some(Handler::Background(handler)) => {
            peer::spawn_background(state, request, handler.clone());
            background = true;
        }
        None => {}
    }

    let payload = if request.expects_response() {
        request.strategy.provider.clone().map(|provider| {
            let mut context = state.context();
            provider(&mut context, request)
        })
    } else {
        None
    };

    (payload, error, background)
}

/// Aggregation bookkeeping shared by the anycast and broadcast forward
/// passes once the children are known: seed the entry, push this peer onto
/// the reverse path, send the copies. A leaf with nothing pending responds
/// on the spot.
pub(crate) fn forward_or_complete(
    state: &mut PeerState,
    mut request: Request,
    targets: Vec<ForwardTarget>,
    local_payload: Option<Payload>,
    local_error: bool,
    background: bool,
) -> Result<(), Error> {
    let expects_response = request.expects_response();

    if targets.is_empty() && !background {
        if expects_response {
            debug!(id = %request.id, "leaf of the traversal, responding immediately");
            state
                .entries
                .insert(request.id, ResponseEntry::new(1, None));
            let path = request.reverse_path.clone();
            let response = Response::multicast(&request, path, local_payload, local_error);
            return response::make_decision(state, response);
        }
        return Ok(());
    }

    // snapshot before the self-push: a branch that fails to send is absorbed
    // as if it had answered empty
    let failure_template = expects_response
        .then(|| Response::multicast(&request, request.reverse_path.clone(), None, false));

    if expects_response {
        let expected = targets.len() as u32 + u32::from(background);
        let mut entry = ResponseEntry::new(expected, local_payload);
        if local_error {
            entry.mark_error();
        }
        state.entries.insert(request.id, entry);

        if background {
            state.pending_tasks.insert(
                request.id,
                PendingTask {
                    mode: ResponseMode::Multicast,
                    reverse_path: request.reverse_path.clone(),
                    key: request.key(),
                    aggregation_id: request.aggregation_id,
                    merge: request.strategy.merge.clone(),
                    destination: request.response_destination.clone(),
                    inbound_hop_count: request.hop_count,
                    seed: None,
                    error: false,
                    dispatched_at: request.dispatched_at,
                },
            );
        }

        request.reverse_path.push(ReversePathEntry {
            peer_id: state.id,
            stub: state.stub.clone(),
        });
    }
    request.hop_count += 1;

    for target in targets {
        debug!(
            id = %request.id,
            to = %target.peer_id.short_hex(),
            "forwarding to child"
        );
        let mut copy = request.clone();
        copy.kind = target.kind;
        if let Err(e) = target.stub.send(Envelope::Request(copy)) {
            warn!(id = %request.id, "{}, counting the branch as an empty response", e);
            if let Some(template) = &failure_template {
                response::make_decision(state, template.clone())?;
            }
        }
    }

    Ok(())
}
