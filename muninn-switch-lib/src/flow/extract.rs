//! Frame parsing: raw bytes in, canonical [`FlowKey`] out.
//!
//! The parse depth matches the key schema: Ethernet, one VLAN tag,
//! IPv4/IPv6/ARP/MPLS, and TCP/UDP/ICMP/ICMPv6 directly behind the network
//! header. Anything deeper (IPv6 extension headers, nested MPLS labels,
//! QinQ) leaves the corresponding key fields at their zero values; a frame
//! that parses shallowly still yields a usable exact-match key.

use byteorder::{BigEndian, ByteOrder};

use super::{FlowKey, VLAN_TAG_PRESENT};
use crate::packet::{
    ETH_HEADER_LEN, ETH_TYPE_ARP, ETH_TYPE_IP, ETH_TYPE_IPV6, ETH_TYPE_MIN, ETH_TYPE_NONE,
    ETH_TYPE_VLAN, IP_PROTO_ICMP, IP_PROTO_ICMPV6, IP_PROTO_TCP, IP_PROTO_UDP, VLAN_HEADER_LEN,
    is_mpls,
};

/// Parse `frame` into a flow key. Returns `None` for frames shorter than an
/// Ethernet header; such frames are discarded before lookup.
pub fn extract(frame: &[u8], in_port: u32) -> Option<FlowKey> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }

    let mut key = FlowKey {
        in_port,
        ..FlowKey::default()
    };
    key.eth_dst.copy_from_slice(&frame[0..6]);
    key.eth_src.copy_from_slice(&frame[6..12]);

    let mut eth_type = BigEndian::read_u16(&frame[12..14]);
    let mut l3 = ETH_HEADER_LEN;
    if eth_type == ETH_TYPE_VLAN {
        if frame.len() < ETH_HEADER_LEN + VLAN_HEADER_LEN {
            key.eth_type = ETH_TYPE_NONE;
            return Some(key);
        }
        key.vlan_tci = BigEndian::read_u16(&frame[14..16]) | VLAN_TAG_PRESENT;
        eth_type = BigEndian::read_u16(&frame[16..18]);
        l3 = ETH_HEADER_LEN + VLAN_HEADER_LEN;
    }

    if eth_type < ETH_TYPE_MIN {
        // 802.3 length field, not a type.
        key.eth_type = ETH_TYPE_NONE;
        return Some(key);
    }
    key.eth_type = eth_type;

    match eth_type {
        ETH_TYPE_IP => parse_ipv4(frame, l3, &mut key),
        ETH_TYPE_IPV6 => parse_ipv6(frame, l3, &mut key),
        ETH_TYPE_ARP => parse_arp(frame, l3, &mut key),
        t if is_mpls(t) => {
            if frame.len() >= l3 + 4 {
                key.mpls_lse = BigEndian::read_u32(&frame[l3..l3 + 4]);
            }
        }
        _ => {}
    }
    Some(key)
}

fn parse_ipv4(frame: &[u8], l3: usize, key: &mut FlowKey) {
    if frame.len() < l3 + 20 {
        return;
    }
    let ihl = ((frame[l3] & 0x0f) as usize) * 4;
    if frame[l3] >> 4 != 4 || ihl < 20 || frame.len() < l3 + ihl {
        return;
    }
    key.nw_tos = frame[l3 + 1];
    key.nw_ttl = frame[l3 + 8];
    key.nw_proto = frame[l3 + 9];
    key.nw_src = BigEndian::read_u32(&frame[l3 + 12..l3 + 16]);
    key.nw_dst = BigEndian::read_u32(&frame[l3 + 16..l3 + 20]);

    // No L4 fields from fragments other than the first.
    let frag_off = BigEndian::read_u16(&frame[l3 + 6..l3 + 8]) & 0x1fff;
    if frag_off != 0 {
        return;
    }
    parse_l4(frame, l3 + ihl, key.nw_proto, IP_PROTO_ICMP, key);
}

fn parse_ipv6(frame: &[u8], l3: usize, key: &mut FlowKey) {
    if frame.len() < l3 + 40 || frame[l3] >> 4 != 6 {
        return;
    }
    let word = BigEndian::read_u32(&frame[l3..l3 + 4]);
    key.nw_tos = ((word >> 20) & 0xff) as u8;
    key.ipv6_label = word & 0x000f_ffff;
    key.nw_proto = frame[l3 + 6];
    key.nw_ttl = frame[l3 + 7];
    key.ipv6_src.copy_from_slice(&frame[l3 + 8..l3 + 24]);
    key.ipv6_dst.copy_from_slice(&frame[l3 + 24..l3 + 40]);
    parse_l4(frame, l3 + 40, key.nw_proto, IP_PROTO_ICMPV6, key);
}

fn parse_arp(frame: &[u8], l3: usize, key: &mut FlowKey) {
    if frame.len() < l3 + 28 {
        return;
    }
    // Only Ethernet/IPv4 ARP is interesting to the key schema.
    if BigEndian::read_u16(&frame[l3..l3 + 2]) != 1
        || BigEndian::read_u16(&frame[l3 + 2..l3 + 4]) != ETH_TYPE_IP
        || frame[l3 + 4] != 6
        || frame[l3 + 5] != 4
    {
        return;
    }
    let op = BigEndian::read_u16(&frame[l3 + 6..l3 + 8]);
    if op <= 0xff {
        key.nw_proto = op as u8;
    }
    key.arp_sha.copy_from_slice(&frame[l3 + 8..l3 + 14]);
    key.nw_src = BigEndian::read_u32(&frame[l3 + 14..l3 + 18]);
    key.arp_tha.copy_from_slice(&frame[l3 + 18..l3 + 24]);
    key.nw_dst = BigEndian::read_u32(&frame[l3 + 24..l3 + 28]);
}

/// `icmp_proto` is the ICMP variant belonging to this IP version; the other
/// variant's protocol number yields no L4 fields, matching the serialized
/// key schema.
fn parse_l4(frame: &[u8], l4: usize, proto: u8, icmp_proto: u8, key: &mut FlowKey) {
    match proto {
        IP_PROTO_TCP | IP_PROTO_UDP => {
            if frame.len() >= l4 + 4 {
                key.tp_src = BigEndian::read_u16(&frame[l4..l4 + 2]);
                key.tp_dst = BigEndian::read_u16(&frame[l4 + 2..l4 + 4]);
            }
        }
        p if p == icmp_proto => {
            if frame.len() >= l4 + 2 {
                key.tp_src = frame[l4] as u16;
                key.tp_dst = frame[l4 + 1] as u16;
            }
        }
        _ => {}
    }
}

/// The TCP flag byte of `frame`, or zero when the frame is not TCP. Used to
/// accumulate the per-flow flag bitmap on hits.
pub fn tcp_flags(frame: &[u8], key: &FlowKey) -> u8 {
    if key.nw_proto != IP_PROTO_TCP
        || (key.eth_type != ETH_TYPE_IP && key.eth_type != ETH_TYPE_IPV6)
    {
        return 0;
    }
    let l3 = if key.vlan_tci != 0 {
        ETH_HEADER_LEN + VLAN_HEADER_LEN
    } else {
        ETH_HEADER_LEN
    };
    let l4 = match key.eth_type {
        ETH_TYPE_IP => {
            if frame.len() < l3 + 20 {
                return 0;
            }
            // A later fragment carries payload where the TCP header would be.
            if BigEndian::read_u16(&frame[l3 + 6..l3 + 8]) & 0x1fff != 0 {
                return 0;
            }
            l3 + ((frame[l3] & 0x0f) as usize) * 4
        }
        _ => l3 + 40,
    };
    if frame.len() < l4 + 14 {
        return 0;
    }
    frame[l4 + 13]
}
