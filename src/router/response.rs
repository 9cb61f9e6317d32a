use chrono::Utc;
use tracing::debug;

use crate::aggregation::Status;
use crate::error::Error;
use crate::hex::ShortHexExt;
use crate::messages::{Envelope, FinalResponse, Response};
use crate::peer::PeerState;

/// Reverse-path aggregation: fold the arriving sub-response into this peer's
/// entry and, once the entry completes, pop the next hop and send the merge
/// on. An empty path at completion means this peer dispatched the request.
pub(crate) fn make_decision(state: &mut PeerState, mut response: Response) -> Result<(), Error> {
    let entry = state
        .entries
        .get_mut(&response.id)
        .ok_or(Error::UnknownResponseEntry(response.id))?;

    let status = entry.absorb(
        response.id,
        response.payload.take(),
        response.error,
        response.inbound_hop_count,
        response.hop_count,
        response.merge.as_ref(),
    )?;
    if status != Status::ReceiptCompleted {
        debug!(
            id = %response.id,
            received = entry.received(),
            expected = entry.expected(),
            "sub-response absorbed"
        );
        return Ok(());
    }

    let Some(entry) = state.entries.remove(&response.id) else {
        return Ok(());
    };
    let (payload, error, inbound_hop_count, outbound_hop_count) = entry.into_parts();

    match response.reverse_path.pop() {
        None => {
            let Some(destination) = response.destination.take() else {
                debug!(id = %response.id, "aggregation completed with nobody waiting");
                return Ok(());
            };
            debug!(id = %response.id, "all sub-responses received, delivering final response");
            destination.push(FinalResponse {
                id: response.id,
                aggregation_id: response.aggregation_id,
                payload,
                error,
                inbound_hop_count,
                outbound_hop_count,
                dispatched_at: response.dispatched_at,
                delivered_at: Utc::now(),
            })
        }
        Some(parent) => {
            debug!(
                id = %response.id,
                to = %parent.peer_id.short_hex(),
                "all sub-responses received, routing the merge to the parent"
            );
            let merged = Response {
                id: response.id,
                aggregation_id: response.aggregation_id,
                mode: response.mode,
                key: response.key,
                payload,
                error,
                merge: response.merge,
                hop_count: outbound_hop_count + 1,
                inbound_hop_count,
                reverse_path: response.reverse_path,
                destination: response.destination,
                dispatched_at: response.dispatched_at,
            };
            parent.stub.send(Envelope::Response(merged))
        }
    }
}
