//! Serialized form of [`FlowKey`]: the attribute stream shared with clients.
//!
//! [`encode_key`] is canonical (fixed attribute order, nothing optional
//! emitted twice) so that `encode_key(&decode_key(b)?) == b` for every
//! stream this crate produces. Debug builds verify the round trip on every
//! decode; a mismatch means the emit and parse sides have drifted apart and
//! is reported as an error, rate-limited.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::error;

use super::{FlowKey, VLAN_TAG_PRESENT};
use crate::error::{DpError, Result};
use crate::packet::{
    ETH_TYPE_ARP, ETH_TYPE_IP, ETH_TYPE_IPV6, IP_PROTO_ICMP, IP_PROTO_ICMPV6, IP_PROTO_TCP,
    IP_PROTO_UDP, is_mpls,
};
use crate::telemetry::LogLimiter;
use crate::wire::{AttrReader, AttrWriter};

pub const KEY_ATTR_PRIORITY: u16 = 1;
pub const KEY_ATTR_IN_PORT: u16 = 2;
pub const KEY_ATTR_ETHERNET: u16 = 3;
pub const KEY_ATTR_VLAN: u16 = 4;
pub const KEY_ATTR_ETHERTYPE: u16 = 5;
pub const KEY_ATTR_IPV4: u16 = 6;
pub const KEY_ATTR_IPV6: u16 = 7;
pub const KEY_ATTR_TCP: u16 = 8;
pub const KEY_ATTR_UDP: u16 = 9;
pub const KEY_ATTR_ICMP: u16 = 10;
pub const KEY_ATTR_ICMPV6: u16 = 11;
pub const KEY_ATTR_ARP: u16 = 12;
pub const KEY_ATTR_MPLS: u16 = 13;
pub const KEY_ATTR_TUNNEL: u16 = 14;
pub const KEY_ATTR_SKB_MARK: u16 = 15;

const IPV4_PAYLOAD_LEN: usize = 11;
const IPV6_PAYLOAD_LEN: usize = 39;
const ARP_PAYLOAD_LEN: usize = 22;

static ROUNDTRIP_LOG: LogLimiter = LogLimiter::new(Duration::from_secs(5));

/// Serialize `key` in canonical attribute order.
pub fn encode_key(key: &FlowKey) -> Vec<u8> {
    let mut w = AttrWriter::new();
    w.put_u32_be(KEY_ATTR_IN_PORT, key.in_port);

    let mut eth = [0u8; 12];
    eth[0..6].copy_from_slice(&key.eth_src);
    eth[6..12].copy_from_slice(&key.eth_dst);
    w.put(KEY_ATTR_ETHERNET, &eth);

    if key.vlan_tci != 0 {
        w.put_u16_be(KEY_ATTR_VLAN, key.vlan_tci);
    }
    w.put_u16_be(KEY_ATTR_ETHERTYPE, key.eth_type);

    match key.eth_type {
        ETH_TYPE_IP => {
            let mut p = [0u8; IPV4_PAYLOAD_LEN];
            BigEndian::write_u32(&mut p[0..4], key.nw_src);
            BigEndian::write_u32(&mut p[4..8], key.nw_dst);
            p[8] = key.nw_proto;
            p[9] = key.nw_tos;
            p[10] = key.nw_ttl;
            w.put(KEY_ATTR_IPV4, &p);
            encode_l4(&mut w, key, IP_PROTO_ICMP);
        }
        ETH_TYPE_IPV6 => {
            let mut p = [0u8; IPV6_PAYLOAD_LEN];
            p[0..16].copy_from_slice(&key.ipv6_src);
            p[16..32].copy_from_slice(&key.ipv6_dst);
            BigEndian::write_u32(&mut p[32..36], key.ipv6_label);
            p[36] = key.nw_proto;
            p[37] = key.nw_tos;
            p[38] = key.nw_ttl;
            w.put(KEY_ATTR_IPV6, &p);
            encode_l4(&mut w, key, IP_PROTO_ICMPV6);
        }
        ETH_TYPE_ARP => {
            let mut p = [0u8; ARP_PAYLOAD_LEN];
            BigEndian::write_u32(&mut p[0..4], key.nw_src);
            BigEndian::write_u32(&mut p[4..8], key.nw_dst);
            BigEndian::write_u16(&mut p[8..10], key.nw_proto as u16);
            p[10..16].copy_from_slice(&key.arp_sha);
            p[16..22].copy_from_slice(&key.arp_tha);
            w.put(KEY_ATTR_ARP, &p);
        }
        t if is_mpls(t) => {
            w.put_u32_be(KEY_ATTR_MPLS, key.mpls_lse);
        }
        _ => {}
    }
    w.finish()
}

fn encode_l4(w: &mut AttrWriter, key: &FlowKey, icmp_proto: u8) {
    match key.nw_proto {
        IP_PROTO_TCP => {
            let mut p = [0u8; 4];
            BigEndian::write_u16(&mut p[0..2], key.tp_src);
            BigEndian::write_u16(&mut p[2..4], key.tp_dst);
            w.put(KEY_ATTR_TCP, &p);
        }
        IP_PROTO_UDP => {
            let mut p = [0u8; 4];
            BigEndian::write_u16(&mut p[0..2], key.tp_src);
            BigEndian::write_u16(&mut p[2..4], key.tp_dst);
            w.put(KEY_ATTR_UDP, &p);
        }
        p if p == icmp_proto => {
            let attr = if icmp_proto == IP_PROTO_ICMPV6 {
                KEY_ATTR_ICMPV6
            } else {
                KEY_ATTR_ICMP
            };
            w.put(attr, &[key.tp_src as u8, key.tp_dst as u8]);
        }
        _ => {}
    }
}

/// Parse a serialized key back into canonical form.
pub fn decode_key(buf: &[u8]) -> Result<FlowKey> {
    let mut key = FlowKey::default();
    for attr in AttrReader::new(buf) {
        let attr = attr?;
        match attr.ty {
            KEY_ATTR_IN_PORT => key.in_port = attr.u32_be()?,
            KEY_ATTR_ETHERNET => {
                let eth: [u8; 12] = attr.array()?;
                key.eth_src.copy_from_slice(&eth[0..6]);
                key.eth_dst.copy_from_slice(&eth[6..12]);
            }
            KEY_ATTR_VLAN => {
                let tci = attr.u16_be()?;
                if tci & VLAN_TAG_PRESENT == 0 {
                    return Err(DpError::Invalid(
                        "VLAN key attribute without tag-present bit".into(),
                    ));
                }
                key.vlan_tci = tci;
            }
            KEY_ATTR_ETHERTYPE => key.eth_type = attr.u16_be()?,
            KEY_ATTR_IPV4 => {
                let p: [u8; IPV4_PAYLOAD_LEN] = attr.array()?;
                key.nw_src = BigEndian::read_u32(&p[0..4]);
                key.nw_dst = BigEndian::read_u32(&p[4..8]);
                key.nw_proto = p[8];
                key.nw_tos = p[9];
                key.nw_ttl = p[10];
            }
            KEY_ATTR_IPV6 => {
                let p: [u8; IPV6_PAYLOAD_LEN] = attr.array()?;
                key.ipv6_src.copy_from_slice(&p[0..16]);
                key.ipv6_dst.copy_from_slice(&p[16..32]);
                key.ipv6_label = BigEndian::read_u32(&p[32..36]);
                key.nw_proto = p[36];
                key.nw_tos = p[37];
                key.nw_ttl = p[38];
            }
            KEY_ATTR_TCP | KEY_ATTR_UDP => {
                let p: [u8; 4] = attr.array()?;
                key.tp_src = BigEndian::read_u16(&p[0..2]);
                key.tp_dst = BigEndian::read_u16(&p[2..4]);
            }
            KEY_ATTR_ICMP | KEY_ATTR_ICMPV6 => {
                let p: [u8; 2] = attr.array()?;
                key.tp_src = p[0] as u16;
                key.tp_dst = p[1] as u16;
            }
            KEY_ATTR_ARP => {
                let p: [u8; ARP_PAYLOAD_LEN] = attr.array()?;
                key.nw_src = BigEndian::read_u32(&p[0..4]);
                key.nw_dst = BigEndian::read_u32(&p[4..8]);
                key.nw_proto = BigEndian::read_u16(&p[8..10]) as u8;
                key.arp_sha.copy_from_slice(&p[10..16]);
                key.arp_tha.copy_from_slice(&p[16..22]);
            }
            KEY_ATTR_MPLS => key.mpls_lse = attr.u32_be()?,
            // Tolerated but not part of the exact-match key.
            KEY_ATTR_PRIORITY | KEY_ATTR_TUNNEL | KEY_ATTR_SKB_MARK => {}
            other => {
                return Err(DpError::Invalid(format!(
                    "unknown flow key attribute type {other}"
                )));
            }
        }
    }

    if cfg!(debug_assertions) && encode_key(&key) != buf {
        if let Some(suppressed) = ROUNDTRIP_LOG.allow() {
            error!(
                suppressed,
                "flow key does not round-trip through its serialized form"
            );
        }
    }
    Ok(key)
}
