//! End-to-end replication scenarios over the in-process network.

use std::collections::BTreeSet;
use tilesync_core::{
    NetworkEntitySnapshot, NetworkId, TileKey, TileLayer, TileMap, TileState, Vec2,
    WorldMetadata,
};
use tilesync_net::protocol::{EntityPositionUpdate, EntitySpawned, Handshake};
use tilesync_net::{
    compute_schema_hash, encode, NetConfig, NetEvent, Payload, Role, SendOutcome, SessionState,
    TransferError, Transport, PROTOCOL_VERSION,
};
use tilesync_testkit::{peer_id, LoopbackCluster, HOST_PEER};

fn arena() -> (WorldMetadata, TileMap) {
    let mut tiles = TileMap::new();
    for x in 0..32 {
        for y in 24..32 {
            tiles.set(TileKey::new(x, y, TileLayer::Ground), TileState::new(2));
        }
    }
    tiles.set(TileKey::new(4, 23, TileLayer::Liquid), TileState::with_data(10, vec![200]));
    tiles.set(TileKey::new(9, 23, TileLayer::Furniture), TileState::with_data(20, vec![1, 2, 3]));
    (WorldMetadata::new("arena", 32, 32), tiles)
}

fn joined(peers: usize) -> LoopbackCluster {
    let mut cluster = LoopbackCluster::new(peers, NetConfig::for_tests()).expect("cluster");
    let (metadata, tiles) = arena();
    cluster.load_world(metadata, tiles).expect("load");
    cluster.join_all().expect("join");
    cluster.clear_events();
    cluster.take_traffic();
    cluster
}

/// Send a raw payload from the host straight to peer `index`.
fn inject(cluster: &mut LoopbackCluster, index: usize, payload: &Payload) {
    let peer = peer_id(index);
    let handle = cluster
        .host()
        .session()
        .link(peer)
        .map(|link| link.handle)
        .expect("host holds a link to the peer");
    let message = encode(payload).expect("encode");
    let outcome = cluster.host_mut().transport_mut().send(handle, message.as_frame());
    assert_eq!(outcome, SendOutcome::Ok);
}

#[test]
fn join_transfers_the_whole_world() {
    let cluster = joined(2);
    let (_, tiles) = arena();
    for index in 0..2 {
        let peer = cluster.peer(index);
        assert_eq!(peer.session().state(), SessionState::Connected(Role::Peer));
        assert_eq!(peer.tiles().tiles(), &tiles);
        let metadata = peer.tiles().metadata().expect("metadata");
        assert_eq!(metadata.name, "arena");
        assert_eq!(metadata.checksum, tiles.checksum());
    }
    assert_eq!(cluster.host().session().validated_count(), 2);
}

#[test]
fn peer_edit_is_relayed_to_everyone_but_the_origin() {
    let mut cluster = joined(3);
    let key = TileKey::new(5, 5, TileLayer::Ground);
    cluster
        .peer_mut(0)
        .set_tile(key, TileState::new(7))
        .expect("edit");

    cluster
        .run_until(60, |c| (1..3).all(|i| c.peer(i).tiles().get(key).is_some()))
        .expect("edit reaches the other peers");
    cluster.run(5);

    let relayed: BTreeSet<u64> = cluster
        .traffic()
        .iter()
        .filter(|r| r.kind == "tile_changed" && r.from == HOST_PEER.0)
        .map(|r| r.to)
        .collect();
    assert_eq!(relayed, BTreeSet::from([peer_id(1).0, peer_id(2).0]));
    assert_eq!(cluster.host().tiles().get(key), Some(&TileState::new(7)));

    let origin_events = cluster.peer_events(0);
    assert!(!origin_events
        .iter()
        .any(|e| matches!(e, NetEvent::TileChanged { .. })));
    let other_events = cluster.peer_events(1);
    assert!(other_events.iter().any(|e| matches!(
        e,
        NetEvent::TileChanged { key: k, actor, .. } if *k == key && *actor == peer_id(0)
    )));
}

#[test]
fn out_of_bounds_edit_is_refused_locally() {
    let mut cluster = joined(2);
    let key = TileKey::new(40, 3, TileLayer::Ground);
    // The peer's bounds check refuses this up front.
    assert!(cluster.peer_mut(0).set_tile(key, TileState::new(1)).is_err());
    assert!(cluster.peer(0).tiles().get(key).is_none());
}

#[test]
fn air_is_never_stored_anywhere() {
    let mut cluster = joined(2);
    let key = TileKey::new(3, 24, TileLayer::Ground);
    assert!(cluster.peer(1).tiles().get(key).is_some());

    cluster.peer_mut(0).set_tile(key, TileState::air()).expect("dig");
    cluster
        .run_until(60, |c| c.peer(1).tiles().get(key).is_none())
        .expect("removal reaches the other peer");

    assert!(cluster.host().tiles().get(key).is_none());
    assert!(cluster.peer(0).tiles().get(key).is_none());
    for node in std::iter::once(cluster.host()).chain((0..2).map(|i| cluster.peer(i))) {
        assert!(node.tiles().tiles().iter().all(|(_, state)| !state.is_air()));
    }
}

#[test]
fn dirty_tiles_are_batched_and_relayed() {
    let mut cluster = joined(2);
    let keys: Vec<TileKey> = (0..30).map(|x| TileKey::new(x, 10, TileLayer::Liquid)).collect();
    for key in &keys {
        cluster.host_mut().update_tile(*key, TileState::with_data(10, vec![128]));
    }

    cluster
        .run_until(60, |c| {
            (0..2).all(|i| keys.iter().all(|k| c.peer(i).tiles().get(*k).is_some()))
        })
        .expect("batches arrive");
    let batches = cluster
        .traffic()
        .iter()
        .filter(|r| r.kind == "tile_updated" && r.to == peer_id(0).0)
        .count();
    // 30 tiles at 25 per message.
    assert_eq!(batches, 2);
}

#[test]
fn duplicate_spawn_is_suppressed() {
    let mut cluster = joined(1);
    let snapshot = NetworkEntitySnapshot::new(3, NetworkId::generate(), Vec2::new(1.0, 2.0));
    let spawn = Payload::EntitySpawned(EntitySpawned {
        snapshot: snapshot.clone(),
        owner: HOST_PEER,
    });
    inject(&mut cluster, 0, &spawn);
    inject(&mut cluster, 0, &spawn);
    cluster.run(5);

    assert_eq!(cluster.peer(0).entities().len(), 1);
    let spawned = cluster
        .peer_events(0)
        .into_iter()
        .filter(|e| matches!(e, NetEvent::EntitySpawned { network_id, .. } if *network_id == snapshot.network_id))
        .count();
    assert_eq!(spawned, 1);
}

#[test]
fn update_before_spawn_creates_the_entity() {
    let mut cluster = joined(1);
    let snapshot = NetworkEntitySnapshot::new(3, NetworkId::generate(), Vec2::new(6.0, 0.5));
    inject(
        &mut cluster,
        0,
        &Payload::EntityPositionUpdate(EntityPositionUpdate {
            snapshot: snapshot.clone(),
        }),
    );
    cluster.run(3);

    let record = cluster
        .peer(0)
        .entities()
        .get(snapshot.network_id)
        .expect("synthesized from the update");
    assert!(record.synthesized);
    assert_eq!(record.snapshot.position, Vec2::new(6.0, 0.5));
    assert!(cluster.peer_events(0).iter().any(|e| matches!(
        e,
        NetEvent::EntityUpdated { synthesized: true, .. }
    )));

    // The late spawn is now a duplicate.
    inject(
        &mut cluster,
        0,
        &Payload::EntitySpawned(EntitySpawned {
            snapshot,
            owner: HOST_PEER,
        }),
    );
    cluster.run(3);
    assert_eq!(cluster.peer(0).entities().len(), 1);
    assert!(!cluster
        .peer_events(0)
        .iter()
        .any(|e| matches!(e, NetEvent::EntitySpawned { .. })));
}

#[test]
fn entity_lifecycle_reaches_every_peer() {
    let mut cluster = joined(2);
    let network_id = cluster
        .peer_mut(0)
        .spawn_entity(NetworkEntitySnapshot::new(5, NetworkId::generate(), Vec2::new(2.0, 2.0)))
        .expect("spawn");
    cluster
        .run_until(60, |c| c.peer(1).entities().get(network_id).is_some())
        .expect("spawn relayed");
    assert_eq!(
        cluster.host().entities().get(network_id).map(|r| r.owner),
        Some(peer_id(0))
    );

    let mut moved = cluster.peer(0).entities().get(network_id).expect("own").snapshot.clone();
    moved.position = Vec2::new(3.5, 2.0);
    cluster.peer_mut(0).update_entity(moved).expect("update");
    cluster
        .run_until(60, |c| {
            c.peer(1)
                .entities()
                .get(network_id)
                .is_some_and(|r| r.snapshot.position == Vec2::new(3.5, 2.0))
        })
        .expect("update relayed");

    cluster.peer_mut(0).kill_entity(network_id).expect("kill");
    cluster
        .run_until(60, |c| c.peer(1).entities().is_empty() && c.host().entities().is_empty())
        .expect("kill relayed");
}

#[test]
fn disconnect_cleans_up_the_departed_peer() {
    let mut cluster = joined(3);
    let network_id = cluster
        .peer_mut(0)
        .spawn_entity(NetworkEntitySnapshot::new(1, NetworkId::generate(), Vec2::ZERO))
        .expect("spawn");
    cluster
        .run_until(60, |c| (1..3).all(|i| c.peer(i).entities().get(network_id).is_some()))
        .expect("spawn relayed");
    cluster.clear_events();

    cluster.network().disconnect(peer_id(0));
    cluster
        .run_until(60, |c| {
            c.host().session().validated_count() == 2
                && (1..3).all(|i| c.peer(i).entities().is_empty())
        })
        .expect("host evicts the departed peer");

    let host_events = cluster.host_events();
    assert!(host_events
        .iter()
        .any(|e| matches!(e, NetEvent::PeerLeft { peer } if *peer == peer_id(0))));
    let bystander = cluster.peer_events(1);
    assert!(bystander
        .iter()
        .any(|e| matches!(e, NetEvent::PeerLeft { peer } if *peer == peer_id(0))));
    assert!(bystander
        .iter()
        .any(|e| matches!(e, NetEvent::EntityRemoved { network_id: id } if *id == network_id)));

    assert_eq!(cluster.peer(0).session().state(), SessionState::Disconnected);
    assert!(cluster
        .peer_events(0)
        .iter()
        .any(|e| matches!(e, NetEvent::SessionEnded)));
}

#[test]
fn rate_limited_host_drains_once_the_limit_lifts() {
    let mut cluster = joined(2);
    cluster.network().set_send_budget(HOST_PEER, Some(0));
    let keys: Vec<TileKey> = (0..10).map(|x| TileKey::new(x, 2, TileLayer::Furniture)).collect();
    for key in &keys {
        cluster.host_mut().set_tile(*key, TileState::new(20)).expect("edit");
    }
    cluster.run(10);

    assert!(cluster.host().queue_len() > 0);
    assert!(cluster.host().queue_metrics().rate_limited > 0);
    assert!(cluster.peer(0).tiles().get(keys[0]).is_none());

    cluster.network().set_send_budget(HOST_PEER, None);
    cluster
        .run_until(200, |c| {
            c.host().queue_len() == 0
                && (0..2).all(|i| keys.iter().all(|k| c.peer(i).tiles().get(*k).is_some()))
        })
        .expect("queue drains");
    assert_eq!(cluster.host().queue_metrics().failed, 0);
}

#[test]
fn join_survives_reordered_delivery() {
    let mut cluster = LoopbackCluster::with_seed(2, NetConfig::for_tests(), 99).expect("cluster");
    let (metadata, tiles) = arena();
    cluster.load_world(metadata, tiles.clone()).expect("load");
    for index in 0..2 {
        cluster.network().set_reorder(peer_id(index), true);
    }

    cluster.join_all().expect("join");
    for index in 0..2 {
        assert_eq!(cluster.peer(index).tiles().tiles(), &tiles);
    }
}

#[test]
fn late_joiner_receives_existing_entities_and_edits() {
    let mut cluster = joined(1);
    let network_id = cluster
        .host_mut()
        .spawn_entity(NetworkEntitySnapshot::new(2, NetworkId::generate(), Vec2::new(8.0, 8.0)))
        .expect("spawn");
    let key = TileKey::new(1, 1, TileLayer::Ground);
    cluster.peer_mut(0).set_tile(key, TileState::new(4)).expect("edit");
    cluster
        .run_until(60, |c| c.host().tiles().get(key).is_some())
        .expect("edit reaches host");

    let late = cluster.add_peer().expect("add");
    cluster.join_all().expect("late join");
    cluster
        .run_until(60, |c| c.peer(late).entities().get(network_id).is_some())
        .expect("catch-up spawn");
    assert_eq!(cluster.peer(late).tiles().get(key), Some(&TileState::new(4)));
    assert_eq!(
        cluster.peer(late).tiles().tiles(),
        cluster.host().tiles().tiles()
    );
}

#[test]
fn chat_is_attributed_by_the_host() {
    let mut cluster = joined(2);
    cluster.peer_mut(1).send_chat("hello there").expect("chat");
    cluster
        .run_until(60, |c| c.traffic().iter().any(|r| r.kind == "chat_message" && r.to == peer_id(0).0))
        .expect("chat relayed");

    let lines: Vec<NetEvent> = cluster
        .peer_events(0)
        .into_iter()
        .filter(|e| matches!(e, NetEvent::Chat { .. }))
        .collect();
    assert_eq!(
        lines,
        vec![NetEvent::Chat {
            author: peer_id(1),
            name: "peer1".into(),
            text: "hello there".into(),
        }]
    );
}

fn slow_receiver_config() -> NetConfig {
    NetConfig {
        max_receive_batch: 1,
        ..NetConfig::for_tests()
    }
}

#[test]
fn edit_during_join_survives_the_world_swap() {
    let key = TileKey::new(7, 2, TileLayer::Ground);
    for seed in 0..8 {
        let mut cluster =
            LoopbackCluster::with_seed(1, slow_receiver_config(), seed).expect("cluster");
        let (metadata, tiles) = arena();
        cluster.load_world(metadata, tiles).expect("load");
        cluster.network().set_reorder(peer_id(0), true);
        cluster.join(0).expect("join");
        cluster
            .run_until(20, |c| c.host().session().validated_count() == 1)
            .expect("handshake accepted");

        cluster.host_mut().set_tile(key, TileState::new(9)).expect("edit");
        cluster
            .run_until(500, |c| {
                let peer = c.peer(0);
                peer.tiles().metadata().is_some() && peer.transfer_progress().is_none()
            })
            .expect("world arrives");
        cluster.run(20);

        let peer = cluster.peer(0);
        assert_eq!(peer.tiles().get(key), Some(&TileState::new(9)), "seed {seed}");
        assert_eq!(peer.tiles().tiles(), cluster.host().tiles().tiles(), "seed {seed}");
    }
}

#[test]
fn concurrent_edits_of_one_tile_converge() {
    let mut cluster = joined(3);
    let key = TileKey::new(3, 3, TileLayer::Ground);
    cluster.peer_mut(0).set_tile(key, TileState::new(1)).expect("a");
    cluster.peer_mut(1).set_tile(key, TileState::new(2)).expect("b");
    cluster.run(30);

    let truth = cluster.host().tiles().get(key).cloned();
    assert!(truth.is_some());
    for index in 0..3 {
        assert_eq!(cluster.peer(index).tiles().get(key).cloned(), truth, "peer {index}");
    }

    // The losing writer keeps editing and is still answered.
    cluster.peer_mut(0).set_tile(key, TileState::new(5)).expect("a again");
    cluster.peer_mut(1).set_tile(key, TileState::new(6)).expect("b again");
    cluster.peer_mut(1).set_tile(key, TileState::new(7)).expect("b once more");
    cluster.run(30);

    let truth = cluster.host().tiles().get(key).cloned();
    for index in 0..3 {
        assert_eq!(cluster.peer(index).tiles().get(key).cloned(), truth, "peer {index}");
    }
    assert_eq!(
        cluster.peer(2).tiles().tiles(),
        cluster.host().tiles().tiles()
    );
}

#[test]
fn repeated_handshake_keeps_the_peer_registered() {
    let mut cluster = joined(2);
    let network_id = cluster
        .peer_mut(0)
        .spawn_entity(NetworkEntitySnapshot::new(1, NetworkId::generate(), Vec2::ZERO))
        .expect("spawn");
    cluster
        .run_until(60, |c| c.peer(1).entities().get(network_id).is_some())
        .expect("spawn relayed");

    let handle = cluster
        .peer(0)
        .session()
        .link(HOST_PEER)
        .map(|link| link.handle)
        .expect("peer holds its host link");
    let again = encode(&Payload::Handshake(Handshake {
        version: PROTOCOL_VERSION,
        schema_hash: compute_schema_hash(),
        peer_id: peer_id(0),
        display_name: "peer0".into(),
    }))
    .expect("encode");
    let outcome = cluster.peer_mut(0).transport_mut().send(handle, again.as_frame());
    assert_eq!(outcome, SendOutcome::Ok);
    cluster.run(120);

    assert_eq!(cluster.peer(0).session().state(), SessionState::Connected(Role::Peer));
    assert_eq!(cluster.host().session().validated_count(), 2);
    assert!(!cluster
        .peer_events(0)
        .iter()
        .any(|e| matches!(e, NetEvent::JoinRejected { .. })));

    // A real departure afterwards is still cleaned up everywhere.
    cluster.network().disconnect(peer_id(0));
    cluster
        .run_until(60, |c| {
            c.host().entities().is_empty()
                && c.peer(1).entities().is_empty()
                && c.peer(1)
                    .session()
                    .participants()
                    .iter()
                    .all(|p| p.peer != peer_id(0))
        })
        .expect("departure cleaned up");
}

/// One peer whose world transfer stalls after the first chunk: the host may
/// send the Welcome, the start and one chunk, then every send is refused.
fn stalled_transfer(config: NetConfig) -> LoopbackCluster {
    let mut cluster = LoopbackCluster::new(1, config).expect("cluster");
    let (metadata, tiles) = arena();
    cluster.load_world(metadata, tiles).expect("load");
    cluster.join(0).expect("join");
    cluster.tick();
    cluster.network().set_send_budget(HOST_PEER, Some(3));
    cluster
        .run_until(10, |c| c.peer(0).transfer_progress().is_some())
        .expect("transfer starts");
    cluster.run(3);
    let (received, expected) = cluster.peer(0).transfer_progress().expect("still open");
    assert!(received < expected as usize);
    cluster.clear_events();
    cluster
}

fn stall_config() -> NetConfig {
    NetConfig {
        max_immediate_retries: 1,
        ..NetConfig::for_tests()
    }
}

#[test]
fn host_loss_mid_transfer_discards_the_transfer() {
    let mut cluster = stalled_transfer(stall_config());
    cluster.network().disconnect(HOST_PEER);
    cluster
        .run_until(10, |c| c.peer(0).session().state() == SessionState::Disconnected)
        .expect("peer notices");

    assert_eq!(cluster.peer(0).transfer_progress(), None);
    let events = cluster.peer_events(0);
    assert!(events.contains(&NetEvent::TransferFailed {
        error: TransferError::Disconnected
    }));
    assert!(events.contains(&NetEvent::SessionEnded));
}

#[test]
fn idle_transfer_times_out_and_can_be_requested_again() {
    let config = stall_config();
    let timeout = config.transfer_timeout();
    let mut cluster = stalled_transfer(config);

    cluster.advance(timeout);
    cluster.tick();
    assert_eq!(cluster.peer(0).transfer_progress(), None);
    assert!(cluster
        .peer_events(0)
        .iter()
        .any(|e| matches!(e, NetEvent::TransferFailed { error: TransferError::TimedOut { received: 1, .. } })));
    assert_eq!(cluster.peer(0).session().state(), SessionState::Connected(Role::Peer));

    cluster.network().set_send_budget(HOST_PEER, None);
    cluster.peer_mut(0).request_world().expect("request");
    cluster
        .run_until(60, |c| {
            c.peer(0).tiles().metadata().is_some() && c.peer(0).transfer_progress().is_none()
        })
        .expect("world re-sent");
    assert_eq!(cluster.peer(0).tiles().tiles(), cluster.host().tiles().tiles());
}

#[test]
fn leaving_forgets_the_old_world() {
    let mut cluster = joined(1);
    assert!(cluster.peer(0).tiles().metadata().is_some());
    cluster.peer_mut(0).leave();
    assert!(cluster.peer(0).tiles().metadata().is_none());
    assert!(cluster.peer(0).tiles().tiles().is_empty());
    assert!(cluster.host().tiles().metadata().is_some());
}
