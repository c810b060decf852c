//! The action interpreter.
//!
//! Walks a validated program exactly once, in order, mutating the working
//! packet as it goes; an OUTPUT hands the packet to the sink before the
//! next action runs, so later transformations are not visible to earlier
//! outputs. Programs reach this module only through [`super::validate`];
//! a malformed or unknown attribute here is internal corruption and panics.

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

use super::{
    ACTION_ATTR_OUTPUT, ACTION_ATTR_POP_MPLS, ACTION_ATTR_POP_VLAN, ACTION_ATTR_PUSH_MPLS,
    ACTION_ATTR_PUSH_VLAN, ACTION_ATTR_SAMPLE, ACTION_ATTR_SET, ACTION_ATTR_USERSPACE,
    SAMPLE_ATTR_ACTIONS, SAMPLE_ATTR_PROBABILITY, USERSPACE_ATTR_USERDATA,
};
use crate::flow::wire::{
    KEY_ATTR_ETHERNET, KEY_ATTR_IPV4, KEY_ATTR_IPV6, KEY_ATTR_MPLS, KEY_ATTR_PRIORITY,
    KEY_ATTR_SKB_MARK, KEY_ATTR_TCP, KEY_ATTR_TUNNEL, KEY_ATTR_UDP,
};
use crate::packet::Packet;
use crate::wire::{Attr, AttrReader};

/// Where OUTPUT and USERSPACE actions deliver packets.
pub trait ActionSink {
    /// Deliver to a datapath port. Implementations drop silently when the
    /// port does not exist.
    fn output(&mut self, port: u32, packet: &Packet);

    /// Queue an upcall tagged as explicitly requested by an action.
    fn userspace(&mut self, packet: &Packet, userdata: Option<&[u8]>);
}

/// Run `actions` over `packet`.
pub fn execute(packet: &mut Packet, actions: &[u8], sink: &mut dyn ActionSink) {
    let mut rng = rand::thread_rng();
    walk(packet, actions, sink, &mut rng);
}

fn walk<R: Rng>(packet: &mut Packet, actions: &[u8], sink: &mut dyn ActionSink, rng: &mut R) {
    for attr in AttrReader::new(actions) {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => panic!("corrupt action stream: {err}"),
        };
        match attr.ty {
            ACTION_ATTR_OUTPUT => {
                let port = expect(attr.u32_be());
                sink.output(port, packet);
            }
            ACTION_ATTR_USERSPACE => {
                let mut userdata = None;
                for nested in attr.nested() {
                    let nested = expect(nested);
                    if nested.ty == USERSPACE_ATTR_USERDATA {
                        userdata = Some(nested.payload);
                    }
                }
                sink.userspace(packet, userdata);
            }
            ACTION_ATTR_PUSH_VLAN => {
                let p: [u8; 4] = expect(attr.array());
                packet.push_vlan(
                    BigEndian::read_u16(&p[0..2]),
                    BigEndian::read_u16(&p[2..4]),
                );
            }
            ACTION_ATTR_POP_VLAN => {
                packet.pop_vlan();
            }
            ACTION_ATTR_SAMPLE => sample(packet, &attr, sink, rng),
            ACTION_ATTR_SET => {
                let field = expect(
                    attr.nested()
                        .next()
                        .unwrap_or_else(|| panic!("empty SET action")),
                );
                apply_set(packet, &field);
            }
            ACTION_ATTR_PUSH_MPLS => {
                let p: [u8; 6] = expect(attr.array());
                packet.push_mpls(
                    BigEndian::read_u16(&p[0..2]),
                    BigEndian::read_u32(&p[2..6]),
                );
            }
            ACTION_ATTR_POP_MPLS => {
                packet.pop_mpls(expect(attr.u16_be()));
            }
            other => panic!("unknown action type {other} in validated stream"),
        }
    }
}

fn sample<R: Rng>(packet: &mut Packet, attr: &Attr, sink: &mut dyn ActionSink, rng: &mut R) {
    let mut probability = 0u32;
    let mut actions: &[u8] = &[];
    for nested in attr.nested() {
        let nested = expect(nested);
        match nested.ty {
            SAMPLE_ATTR_PROBABILITY => probability = expect(nested.u32_be()),
            SAMPLE_ATTR_ACTIONS => actions = nested.payload,
            other => panic!("unknown SAMPLE attribute type {other}"),
        }
    }
    // Executes with probability `probability / 2^32`.
    if rng.gen::<u32>() < probability {
        walk(packet, actions, sink, rng);
    }
}

fn apply_set(packet: &mut Packet, field: &Attr) {
    match field.ty {
        KEY_ATTR_ETHERNET => {
            let p: [u8; 12] = expect(field.array());
            let mut src = [0u8; 6];
            let mut dst = [0u8; 6];
            src.copy_from_slice(&p[0..6]);
            dst.copy_from_slice(&p[6..12]);
            packet.set_eth_src(src);
            packet.set_eth_dst(dst);
        }
        KEY_ATTR_IPV4 => {
            // src, dst, proto, tos, ttl; the protocol of an existing packet
            // is not rewritable.
            let p: [u8; 11] = expect(field.array());
            packet.set_ipv4_src(BigEndian::read_u32(&p[0..4]));
            packet.set_ipv4_dst(BigEndian::read_u32(&p[4..8]));
            packet.set_ipv4_tos(p[9]);
            packet.set_ipv4_ttl(p[10]);
        }
        KEY_ATTR_IPV6 => {
            let p: [u8; 39] = expect(field.array());
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&p[0..16]);
            dst.copy_from_slice(&p[16..32]);
            packet.set_ipv6_src(src);
            packet.set_ipv6_dst(dst);
            packet.set_ipv6_label(BigEndian::read_u32(&p[32..36]));
            packet.set_ipv6_proto(p[36]);
            packet.set_ipv6_tclass(p[37]);
            packet.set_ipv6_hoplimit(p[38]);
        }
        KEY_ATTR_TCP => {
            let p: [u8; 4] = expect(field.array());
            packet.set_tcp_src(BigEndian::read_u16(&p[0..2]));
            packet.set_tcp_dst(BigEndian::read_u16(&p[2..4]));
        }
        KEY_ATTR_UDP => {
            let p: [u8; 4] = expect(field.array());
            packet.set_udp_src(BigEndian::read_u16(&p[0..2]));
            packet.set_udp_dst(BigEndian::read_u16(&p[2..4]));
        }
        KEY_ATTR_MPLS => {
            packet.set_mpls_lse(expect(field.u32_be()));
        }
        KEY_ATTR_PRIORITY | KEY_ATTR_TUNNEL | KEY_ATTR_SKB_MARK => {}
        other => panic!("SET of unsupported field type {other}"),
    }
}

fn expect<T>(res: crate::error::Result<T>) -> T {
    match res {
        Ok(v) => v,
        Err(err) => panic!("corrupt action stream: {err}"),
    }
}
