use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::info;

use canopy::{
    Coordinate, Element, MessageDispatcher, OverlayBuilder, OverlayConfig, PointValidator,
    RegionValidator, Request, ShortHexExt, Strategy,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = OverlayConfig::builder().dimensions(2).build();
    let peers = OverlayBuilder::new(config)
        .split_grid()
        .split(0, 0)
        .split(3, 1)
        .spawn(|index, _| Box::new(index))
        .expect("overlay must spawn");
    for peer in &peers {
        info!(id = %peer.id().short_hex(), zone = %peer.zone, "peer ready");
    }

    let dispatcher = MessageDispatcher::new();

    // survey the whole overlay: every peer appends its id to the response
    let visited = Arc::new(Mutex::new(0u32));
    let counter = visited.clone();
    let survey = Request::optimal_broadcast(
        Strategy::new(RegionValidator::universal(2))
            .on_peer(move |_, _| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .with_provider(|context, _| context.id.to_vec())
            .with_merge(|mut acc, next| {
                acc.extend(next);
                acc
            }),
    );
    let response = dispatcher
        .dispatch(survey, &peers[0].stub)
        .await
        .expect("broadcast must complete");
    let answered = response
        .payload
        .as_ref()
        .map_or(0, |payload| payload.len() / 16);
    info!(
        peers = answered,
        visited = *visited.lock().unwrap(),
        hops_out = response.inbound_hop_count,
        hops_back = response.outbound_hop_count,
        latency_us = response.latency().num_microseconds().unwrap_or(0),
        "broadcast survey done"
    );

    // look up the owner of a random key
    let mut rng = rand::thread_rng();
    let key = Coordinate(vec![rng.gen::<Element>(), rng.gen::<Element>()]);
    let lookup = Request::unicast(
        Strategy::new(PointValidator::new(key.clone()))
            .with_provider(|context, _| context.id.to_vec()),
    );
    let response = dispatcher
        .dispatch(lookup, &peers[0].stub)
        .await
        .expect("lookup must complete");
    info!(
        key = %key,
        owner = %response.payload.unwrap_or_default().short_hex(),
        hops = response.inbound_hop_count,
        "key lookup done"
    );

    let snapshots = futures::future::join_all(
        peers.iter().map(|peer| peer.stub.snapshot()),
    )
    .await;
    for snapshot in snapshots.into_iter().flatten() {
        info!(
            id = %snapshot.id.short_hex(),
            zone = %snapshot.zone,
            neighbors = snapshot.neighbors,
            seen = snapshot.seen_requests,
            "peer state"
        );
    }
}
