mod common;

use muninn_switch_lib::actions::ActionBuilder;
use muninn_switch_lib::flow::extract;
use muninn_switch_lib::flow::wire::{decode_key, encode_key};
use muninn_switch_lib::{DpError, PutFlags, UpcallKind};

#[test]
fn miss_becomes_an_upcall() {
    let (registry, mut dpif) = common::dummy_dp("d");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    let frame = common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64);
    registry.dummy_netdev("p1").unwrap().inject(&frame);
    dpif.run();

    let stats = dpif.stats();
    assert_eq!(stats.n_missed, 1);
    assert_eq!(stats.n_hit, 0);
    assert_eq!(stats.n_lost, 0);

    let upcall = dpif.recv().unwrap();
    assert_eq!(upcall.kind, UpcallKind::Miss);
    assert_eq!(upcall.packet, frame);
    let key = decode_key(&upcall.key).unwrap();
    assert_eq!(key.in_port, 1);

    assert!(matches!(dpif.recv(), Err(DpError::Again)));
}

#[test]
fn hit_updates_flow_and_datapath_stats() {
    let (registry, dpif) = common::dummy_dp("d");
    dpif.port_add("p2", "system", None).unwrap();
    dpif.port_add("p3", "system", None).unwrap();

    let frame = common::icmp_echo_frame(0x0a00_0001, 0x0a00_0002);
    assert_eq!(frame.len(), 98);
    let key = encode_key(&extract(&frame, 2).unwrap());
    let actions = ActionBuilder::new().output(3).finish();
    dpif.flow_put(PutFlags::CREATE, &key, &actions).unwrap();

    registry.dummy_netdev("p2").unwrap().inject(&frame);
    dpif.run();

    assert_eq!(dpif.stats().n_hit, 1);
    assert_eq!(dpif.stats().n_missed, 0);

    let (_, stats) = dpif.flow_get(&key).unwrap();
    assert_eq!(stats.n_packets, 1);
    assert_eq!(stats.n_bytes, 98);
    assert_eq!(stats.tcp_flags, 0);

    assert_eq!(
        registry.dummy_netdev("p3").unwrap().sent(),
        vec![frame.clone()]
    );

    // A second hit accumulates.
    registry.dummy_netdev("p2").unwrap().inject(&frame);
    dpif.run();
    let (_, stats) = dpif.flow_get(&key).unwrap();
    assert_eq!(stats.n_packets, 2);
    assert_eq!(stats.n_bytes, 196);
    assert!(stats.used_ms <= muninn_switch_lib::time::monotonic_ms());
}

#[test]
fn tcp_flags_accumulate_across_hits() {
    let (registry, dpif) = common::dummy_dp("d");
    dpif.port_add("p1", "system", None).unwrap();

    let syn = common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(10, 20, 0x02));
    let fin_ack = common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(10, 20, 0x11));
    let key = encode_key(&extract(&syn, 1).unwrap());
    assert_eq!(key, encode_key(&extract(&fin_ack, 1).unwrap()));

    dpif.flow_put(PutFlags::CREATE, &key, &ActionBuilder::new().finish())
        .unwrap();

    let p1 = registry.dummy_netdev("p1").unwrap();
    p1.inject(&syn);
    dpif.run();
    p1.inject(&fin_ack);
    dpif.run();

    let (_, stats) = dpif.flow_get(&key).unwrap();
    assert_eq!(stats.tcp_flags, 0x13);
}

#[test]
fn queue_overflow_counts_losses() {
    let (registry, mut dpif) = common::dummy_dp("d");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    let frame = common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64);
    let p1 = registry.dummy_netdev("p1").unwrap();
    for _ in 0..200 {
        p1.inject(&frame);
    }
    for _ in 0..200 {
        dpif.run();
    }

    let stats = dpif.stats();
    assert_eq!(stats.n_missed, 200);
    assert_eq!(stats.n_lost, 72);

    let mut received = 0;
    while dpif.recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 128);

    // hit + miss covers every processed packet; losses never exceed misses.
    assert_eq!(stats.n_hit + stats.n_missed, 200);
    assert!(stats.n_lost <= stats.n_missed);
}

#[test]
fn miss_ring_drains_before_action_ring() {
    let (registry, mut dpif) = common::dummy_dp("d");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    // Queue an explicit upcall first...
    let frame = common::ipv4_frame(17, 1, 2, 64, &common::udp_l4(1, 2, 0));
    let explicit = ActionBuilder::new().userspace(None).finish();
    dpif.execute(&frame, &explicit).unwrap();

    // ...then a miss.
    registry.dummy_netdev("p1").unwrap().inject(&frame);
    dpif.run();

    assert_eq!(dpif.recv().unwrap().kind, UpcallKind::Miss);
    assert_eq!(dpif.recv().unwrap().kind, UpcallKind::Action);
}

#[test]
fn recv_requires_listening() {
    let (registry, mut dpif) = common::dummy_dp("d");
    dpif.port_add("p1", "system", None).unwrap();

    registry
        .dummy_netdev("p1")
        .unwrap()
        .inject(&common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64));
    dpif.run();

    assert!(matches!(dpif.recv(), Err(DpError::Again)));
    dpif.recv_set(true);
    assert!(dpif.recv().is_ok());
}

#[test]
fn purge_discards_pending_upcalls() {
    let (registry, mut dpif) = common::dummy_dp("d");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    let p1 = registry.dummy_netdev("p1").unwrap();
    for _ in 0..5 {
        p1.inject(&common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64));
        dpif.run();
    }
    dpif.recv_purge();
    assert!(matches!(dpif.recv(), Err(DpError::Again)));
}

#[test]
fn short_frames_never_reach_the_table() {
    let (registry, dpif) = common::dummy_dp("d");
    dpif.port_add("p1", "system", None).unwrap();

    registry.dummy_netdev("p1").unwrap().inject(&[0u8; 10]);
    dpif.run();

    let stats = dpif.stats();
    assert_eq!(stats.n_hit + stats.n_missed + stats.n_lost, 0);
}
