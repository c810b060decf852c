//! Micro benchmarks for the packet hot path: key extraction, flow table
//! lookup, and action interpretation. Pure CPU - no devices, no IO.
//!
//! ```bash
//! cargo bench --bench bench_datapath
//! ```

use bytes::Bytes;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use muninn_switch_lib::actions::{ActionBuilder, ActionSink, execute};
use muninn_switch_lib::flow::{FlowTable, extract};
use muninn_switch_lib::packet::Packet;

/// 64-byte TCP SYN, the classic minimum-size worst case.
fn tcp_syn_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 64];
    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x0a]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x0b]);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    frame[14] = 0x45; // IPv4, no options
    frame[14 + 2..14 + 4].copy_from_slice(&50u16.to_be_bytes());
    frame[14 + 8] = 64;
    frame[14 + 9] = 6; // TCP
    frame[14 + 12..14 + 16].copy_from_slice(&0x0a00_0001u32.to_be_bytes());
    frame[14 + 16..14 + 20].copy_from_slice(&0x0a00_0002u32.to_be_bytes());
    frame[34..36].copy_from_slice(&40000u16.to_be_bytes());
    frame[36..38].copy_from_slice(&443u16.to_be_bytes());
    frame[34 + 12] = 5 << 4;
    frame[34 + 13] = 0x02; // SYN
    frame
}

struct NullSink;

impl ActionSink for NullSink {
    fn output(&mut self, port: u32, packet: &Packet) {
        black_box((port, packet.len()));
    }

    fn userspace(&mut self, packet: &Packet, _userdata: Option<&[u8]>) {
        black_box(packet.len());
    }
}

fn bench_extract(c: &mut Criterion) {
    let frame = tcp_syn_frame();
    c.bench_function("flow_extract_tcp_syn", |b| {
        b.iter(|| extract(black_box(&frame), 1))
    });
}

fn bench_lookup(c: &mut Criterion) {
    let frame = tcp_syn_frame();
    let mut table = FlowTable::new();
    // A realistically loaded table: 10k flows differing in source port.
    for i in 0..10_000u16 {
        let mut key = extract(&frame, 1).unwrap();
        key.tp_src = i;
        table.insert(key, Bytes::from_static(&[0u8; 16])).unwrap();
    }
    let key = {
        let mut key = extract(&frame, 1).unwrap();
        key.tp_src = 5_000;
        key
    };

    c.bench_function("flow_table_lookup_10k", |b| {
        b.iter(|| table.lookup(black_box(&key)).is_some())
    });
}

fn bench_actions(c: &mut Criterion) {
    let frame = tcp_syn_frame();
    let actions = ActionBuilder::new()
        .push_vlan(0x1064)
        .set_eth([0x02, 0, 0, 0, 0, 1], [0x02, 0, 0, 0, 0, 2])
        .output(2)
        .finish();

    c.bench_function("actions_vlan_set_output", |b| {
        b.iter(|| {
            let mut packet = Packet::from_frame(black_box(&frame));
            execute(&mut packet, &actions, &mut NullSink);
            packet.len()
        })
    });
}

criterion_group!(benches, bench_extract, bench_lookup, bench_actions);
criterion_main!(benches);
