use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};

use canopy::{
    CombinerFn, Coordinate, Element, HandlerError, MessageDispatcher, OverlayBuilder,
    OverlayConfig, Payload, PeerId, PointValidator, RegionValidator, Request, SpawnedPeer,
    Strategy,
};

type Counts = Arc<Mutex<HashMap<PeerId, u32>>>;

fn init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn overlay(dimensions: usize) -> Vec<SpawnedPeer> {
    let config = OverlayConfig::builder().dimensions(dimensions).build();
    OverlayBuilder::new(config)
        .split_grid()
        .spawn(|_, _| Box::new(()))
        .expect("overlay must spawn")
}

fn counting_handler(counts: &Counts) -> impl Fn(&mut canopy::PeerContext<'_>, &Request) -> Result<(), HandlerError> + Send + Sync + 'static
{
    let counts = counts.clone();
    move |context, _| {
        *counts.lock().unwrap().entry(context.id).or_insert(0) += 1;
        Ok(())
    }
}

fn id_provider() -> impl Fn(&mut canopy::PeerContext<'_>, &Request) -> Payload + Send + Sync + 'static
{
    |context, _| context.id.to_vec()
}

fn concat_merge(mut acc: Payload, next: Payload) -> Payload {
    acc.extend(next);
    acc
}

fn id_chunks(payload: &[u8]) -> HashSet<PeerId> {
    assert_eq!(payload.len() % 16, 0);
    payload
        .chunks(16)
        .map(|chunk| {
            let mut id = [0u8; 16];
            id.copy_from_slice(chunk);
            id
        })
        .collect()
}

#[tokio::test]
async fn unicast_reaches_the_key_owner_and_returns() {
    init();
    // three zones in a row: the key sits in the far one, two hops out
    let config = OverlayConfig::builder().dimensions(1).build();
    let peers = OverlayBuilder::new(config)
        .split(0, 0)
        .split(1, 0)
        .spawn(|_, _| Box::new(()))
        .unwrap();
    let key = Coordinate(vec![Element::MAX - 1]);
    let owner = peers
        .iter()
        .find(|peer| peer.zone.contains(&key))
        .unwrap()
        .id();

    let dispatcher = MessageDispatcher::new();
    let request = Request::unicast(
        Strategy::new(PointValidator::new(key)).with_provider(id_provider()),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert_eq!(response.payload, Some(owner.to_vec()));
    assert!(!response.error);
    assert_eq!(response.inbound_hop_count, 2);
    assert_eq!(response.outbound_hop_count, 2);
}

#[tokio::test]
async fn unicast_handler_runs_only_on_the_owner() {
    init();
    let peers = overlay(2);
    let key = Coordinate(vec![Element::MAX / 4 * 3, Element::MAX / 4 * 3]);
    let owner = peers
        .iter()
        .find(|peer| peer.zone.contains(&key))
        .unwrap()
        .id();
    let counts: Counts = Arc::new(Mutex::new(HashMap::new()));

    let dispatcher = MessageDispatcher::new();
    let request = Request::unicast(
        Strategy::new(PointValidator::new(key))
            .on_peer(counting_handler(&counts))
            .with_provider(id_provider()),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert_eq!(response.payload, Some(owner.to_vec()));
    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts.get(&owner), Some(&1));
}

#[tokio::test]
async fn unicast_without_provider_still_responds() {
    init();
    let peers = overlay(2);
    let counts: Counts = Arc::new(Mutex::new(HashMap::new()));

    let dispatcher = MessageDispatcher::new();
    let request = Request::unicast(
        Strategy::new(PointValidator::new(Coordinate(vec![1, 1])))
            .on_peer(counting_handler(&counts)),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert_eq!(response.payload, None);
    assert!(!response.error);
    assert_eq!(counts.lock().unwrap().values().sum::<u32>(), 1);
}

#[tokio::test]
async fn anycast_visits_each_matching_peer_at_most_once() {
    init();
    // the quadrant graph has a cycle, so anycast relies on dedup pruning
    let peers = overlay(2);
    let counts: Counts = Arc::new(Mutex::new(HashMap::new()));

    let dispatcher = MessageDispatcher::new();
    let request = Request::anycast(
        Strategy::new(RegionValidator::universal(2))
            .on_peer(counting_handler(&counts))
            .with_provider(id_provider())
            .with_merge(concat_merge),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), peers.len());
    assert!(counts.values().all(|count| *count == 1));
    let expected: HashSet<PeerId> = peers.iter().map(|peer| peer.id()).collect();
    assert_eq!(id_chunks(&response.payload.unwrap()), expected);
}

#[tokio::test]
async fn anycast_respects_the_region_constraint() {
    init();
    let peers = overlay(2);
    // only the two superior-x quadrants intersect this box
    let region = RegionValidator::new(vec![
        Some((Element::MAX / 2, Element::MAX - 1)),
        None,
    ]);
    let matching: HashSet<PeerId> = peers
        .iter()
        .filter(|peer| peer.zone.lower_bound(0) >= Element::MAX / 2)
        .map(|peer| peer.id())
        .collect();
    assert_eq!(matching.len(), 2);

    let dispatcher = MessageDispatcher::new();
    let request = Request::anycast(
        Strategy::new(region)
            .with_provider(id_provider())
            .with_merge(concat_merge),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert_eq!(id_chunks(&response.payload.unwrap()), matching);
}

#[tokio::test]
async fn efficient_broadcast_reaches_every_peer_exactly_once() {
    init();
    let peers = overlay(2);
    let counts: Counts = Arc::new(Mutex::new(HashMap::new()));

    let dispatcher = MessageDispatcher::new();
    let request = Request::efficient_broadcast(
        Strategy::new(RegionValidator::universal(2))
            .on_peer(counting_handler(&counts))
            .with_provider(id_provider())
            .with_merge(concat_merge),
    );
    let response = dispatcher.dispatch(request, &peers[1].stub).await.unwrap();

    let counts = counts.lock().unwrap();
    assert!(counts.values().all(|count| *count == 1));
    let expected: HashSet<PeerId> = peers.iter().map(|peer| peer.id()).collect();
    assert_eq!(id_chunks(&response.payload.unwrap()), expected);
}

#[tokio::test]
async fn optimal_broadcast_reaches_every_peer_exactly_once_in_3d() {
    init();
    let peers = overlay(3);
    let counts: Counts = Arc::new(Mutex::new(HashMap::new()));

    let dispatcher = MessageDispatcher::new();
    let request = Request::optimal_broadcast(
        Strategy::new(RegionValidator::universal(3))
            .on_peer(counting_handler(&counts))
            .with_provider(id_provider())
            .with_merge(concat_merge),
    );
    let response = dispatcher.dispatch(request, &peers[5].stub).await.unwrap();

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), 8);
    assert!(counts.values().all(|count| *count == 1));
    let expected: HashSet<PeerId> = peers.iter().map(|peer| peer.id()).collect();
    assert_eq!(id_chunks(&response.payload.unwrap()), expected);
}

#[tokio::test]
async fn aggregation_state_is_cleaned_up_after_completion() {
    init();
    let peers = overlay(2);

    let dispatcher = MessageDispatcher::new();
    let request = Request::optimal_broadcast(
        Strategy::new(RegionValidator::universal(2))
            .with_provider(id_provider())
            .with_merge(concat_merge),
    );
    dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    for peer in &peers {
        let snapshot = peer.stub.snapshot().await.unwrap();
        assert_eq!(snapshot.pending_entries, 0);
        assert_eq!(snapshot.pending_tasks, 0);
    }
}

#[tokio::test]
async fn single_peer_overlay_completes_on_the_spot() {
    init();
    let config = OverlayConfig::builder().dimensions(2).build();
    let peers = OverlayBuilder::new(config)
        .spawn(|_, _| Box::new(()))
        .unwrap();

    let dispatcher = MessageDispatcher::new();
    let request = Request::anycast(
        Strategy::new(RegionValidator::universal(2)).with_provider(id_provider()),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert_eq!(response.payload, Some(peers[0].id().to_vec()));
    assert_eq!(response.inbound_hop_count, 0);
    assert_eq!(response.outbound_hop_count, 0);
}

#[tokio::test]
async fn escalated_handler_failure_marks_the_final_response() {
    init();
    let peers = overlay(2);

    let dispatcher = MessageDispatcher::new();
    let request = Request::efficient_broadcast(
        Strategy::new(RegionValidator::universal(2))
            .on_peer(|context, _| {
                if context.zone.lower_bound(0) == 0 && context.zone.lower_bound(1) == 0 {
                    Err(HandlerError("disk on fire".into()))
                } else {
                    Ok(())
                }
            })
            .with_provider(id_provider())
            .with_merge(concat_merge)
            .escalate_faults(),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert!(response.error);
    // the failing peer still contributed its payload
    assert_eq!(id_chunks(&response.payload.unwrap()).len(), peers.len());
}

#[tokio::test]
async fn degraded_handler_failure_keeps_the_response_clean() {
    init();
    let peers = overlay(2);

    let dispatcher = MessageDispatcher::new();
    let request = Request::efficient_broadcast(
        Strategy::new(RegionValidator::universal(2))
            .on_peer(|_, _| Err(HandlerError("always failing".into())))
            .with_provider(id_provider())
            .with_merge(concat_merge),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert!(!response.error);
    assert_eq!(id_chunks(&response.payload.unwrap()).len(), peers.len());
}

#[tokio::test]
async fn background_handler_contributes_to_the_merge() {
    init();
    let config = OverlayConfig::builder().dimensions(2).build();
    let peers = OverlayBuilder::new(config)
        .spawn(|_, _| Box::new(()))
        .unwrap();

    let dispatcher = MessageDispatcher::new();
    let request = Request::anycast(
        Strategy::new(RegionValidator::universal(2))
            .on_peer_background(|_, _, _| b"bg".to_vec())
            .with_provider(|_: &mut canopy::PeerContext<'_>, _: &Request| b"pv".to_vec())
            .with_merge(concat_merge),
    );
    let response = dispatcher.dispatch(request, &peers[0].stub).await.unwrap();

    assert_eq!(response.payload, Some(b"pvbg".to_vec()));
}

#[tokio::test]
async fn fire_and_forget_rejects_a_provider() {
    init();
    let peers = overlay(2);

    let dispatcher = MessageDispatcher::new();
    let request = Request::efficient_broadcast(
        Strategy::new(RegionValidator::universal(2)).with_provider(id_provider()),
    );

    let err = dispatcher
        .dispatch_forget(request, &peers[0].stub)
        .unwrap_err();
    assert!(matches!(err, canopy::Error::ProviderForbidden));
}

#[tokio::test]
async fn fire_and_forget_still_runs_the_handlers() {
    init();
    let peers = overlay(2);
    let counts: Counts = Arc::new(Mutex::new(HashMap::new()));

    let dispatcher = MessageDispatcher::new();
    let request = Request::efficient_broadcast(
        Strategy::new(RegionValidator::universal(2)).on_peer(counting_handler(&counts)),
    );
    dispatcher.dispatch_forget(request, &peers[0].stub).unwrap();

    for _ in 0..100 {
        if counts.lock().unwrap().len() == peers.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), peers.len());
    assert!(counts.values().all(|count| *count == 1));

    // with no destination, no aggregation state was ever created
    drop(counts);
    for peer in &peers {
        let snapshot = peer.stub.snapshot().await.unwrap();
        assert_eq!(snapshot.pending_entries, 0);
    }
}

#[tokio::test]
async fn grouped_dispatch_combines_final_responses() {
    init();
    let peers = overlay(2);
    let low = Coordinate(vec![1, 1]);
    let high = Coordinate(vec![Element::MAX - 1, Element::MAX - 1]);
    let owners: HashSet<PeerId> = peers
        .iter()
        .filter(|peer| peer.zone.contains(&low) || peer.zone.contains(&high))
        .map(|peer| peer.id())
        .collect();
    assert_eq!(owners.len(), 2);

    let dispatcher = MessageDispatcher::new();
    let requests = vec![
        Request::unicast(Strategy::new(PointValidator::new(low)).with_provider(id_provider())),
        Request::unicast(Strategy::new(PointValidator::new(high)).with_provider(id_provider())),
    ];
    let combiner: CombinerFn = Arc::new(|_, acc, next| concat_merge(acc, next));
    let response = dispatcher
        .dispatch_group(requests, Payload::new(), combiner, &peers[0].stub)
        .await
        .unwrap();

    assert_eq!(response.aggregation_id, Some(response.id));
    assert_eq!(id_chunks(&response.payload.unwrap()), owners);
}

#[tokio::test]
async fn concurrent_dispatches_get_distinct_ids() {
    init();
    let peers = overlay(2);
    let dispatcher = MessageDispatcher::new();

    let dispatches = (0..16).map(|_| {
        let dispatcher = dispatcher.clone();
        let stub = peers[0].stub.clone();
        async move {
            let request = Request::optimal_broadcast(
                Strategy::new(RegionValidator::universal(2))
                    .with_provider(id_provider())
                    .with_merge(concat_merge),
            );
            dispatcher.dispatch(request, &stub).await.unwrap()
        }
    });
    let responses = futures::future::join_all(dispatches).await;

    let ids: HashSet<_> = responses.iter().map(|response| response.id).collect();
    assert_eq!(ids.len(), 16);
    for response in &responses {
        assert_eq!(id_chunks(response.payload.as_ref().unwrap()).len(), 4);
    }
}
