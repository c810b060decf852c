mod common;

use std::time::{Duration, Instant};

use muninn_switch_lib::actions::ActionBuilder;
use muninn_switch_lib::flow::extract;
use muninn_switch_lib::flow::wire::encode_key;
use muninn_switch_lib::{Poller, PutFlags, UpcallKind};

const DEADLINE: Duration = Duration::from_secs(5);

fn wait_until(mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < DEADLINE, "worker made no progress");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn worker_delivers_misses_as_upcalls() {
    let (registry, mut dpif) = common::dummy_dp_threaded("t");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    let frame = common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64);
    registry.dummy_netdev("p1").unwrap().inject(&frame);

    // run() is a no-op in threaded mode; the worker does the ingress.
    dpif.run();
    wait_until(|| dpif.stats().n_missed == 1);

    let upcall = dpif.recv().unwrap();
    assert_eq!(upcall.kind, UpcallKind::Miss);
    assert_eq!(upcall.packet, frame);
}

#[test]
fn worker_forwards_hits() {
    let (registry, dpif) = common::dummy_dp_threaded("t");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.port_add("p2", "system", None).unwrap();

    let frame = common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(5, 6, 0));
    let key = encode_key(&extract(&frame, 1).unwrap());
    dpif.flow_put(
        PutFlags::CREATE,
        &key,
        &ActionBuilder::new().output(2).finish(),
    )
    .unwrap();

    registry.dummy_netdev("p1").unwrap().inject(&frame);
    wait_until(|| dpif.stats().n_hit == 1);

    let sent = registry.dummy_netdev("p2").unwrap().sent();
    assert_eq!(sent, vec![frame]);
}

#[test]
fn upcall_pipe_wakes_a_poller() {
    let (registry, mut dpif) = common::dummy_dp_threaded("t");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    let frame = common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64);
    registry.dummy_netdev("p1").unwrap().inject(&frame);

    // Either the upcall is already queued (immediate wake) or the wake
    // pipe becomes readable; both return well before the timeout.
    let deadline = Instant::now() + DEADLINE;
    loop {
        let mut poller = Poller::new().unwrap();
        dpif.recv_wait(&mut poller);
        poller.poll(Some(Duration::from_millis(100))).unwrap();
        match dpif.recv() {
            Ok(upcall) => {
                assert_eq!(upcall.kind, UpcallKind::Miss);
                break;
            }
            Err(_) => assert!(Instant::now() < deadline, "no upcall arrived"),
        }
    }
}

#[test]
fn worker_handles_many_frames_in_batches() {
    let (registry, mut dpif) = common::dummy_dp_threaded("t");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    let frame = common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64);
    let p1 = registry.dummy_netdev("p1").unwrap();
    for _ in 0..150 {
        p1.inject(&frame);
    }

    wait_until(|| dpif.stats().n_missed == 150);

    let stats = dpif.stats();
    // The rings hold 128; the rest were counted as lost.
    assert_eq!(stats.n_lost, 22);
    let mut received = 0;
    while dpif.recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 128);
}

#[test]
fn registry_teardown_stops_the_worker() {
    let (registry, dpif) = common::dummy_dp_threaded("t");
    dpif.port_add("p1", "system", None).unwrap();
    drop(dpif);

    let start = Instant::now();
    drop(registry);
    // Shutdown must not wait out the full poll timeout.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn ports_added_after_start_are_polled() {
    let (registry, mut dpif) = common::dummy_dp_threaded("t");
    dpif.port_add("p1", "system", None).unwrap();
    dpif.recv_set(true);

    // Let the worker build at least one poll set without p9.
    std::thread::sleep(Duration::from_millis(50));
    dpif.port_add("p9", "system", None).unwrap();

    let frame = common::eth_frame(common::MAC_A, common::MAC_B, 0x0800, 64);
    registry.dummy_netdev("p9").unwrap().inject(&frame);

    wait_until(|| dpif.stats().n_missed == 1);
    let upcall = dpif.recv().unwrap();
    assert_eq!(decode_in_port(&upcall.key), 9);
}

fn decode_in_port(key: &[u8]) -> u32 {
    muninn_switch_lib::flow::wire::decode_key(key).unwrap().in_port
}
