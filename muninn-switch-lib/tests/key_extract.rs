mod common;

use common::{MAC_A, MAC_B};
use muninn_switch_lib::flow::wire::{decode_key, encode_key};
use muninn_switch_lib::flow::{VLAN_TAG_PRESENT, extract, tcp_flags};
use muninn_switch_lib::FlowKey;

#[test]
fn short_frames_are_discarded() {
    assert!(extract(&[0u8; 13], 1).is_none());
    assert!(extract(&[], 1).is_none());
    // An exact Ethernet header is enough.
    assert!(extract(&[0u8; 14], 1).is_some());
}

#[test]
fn icmp_key_fields() {
    let frame = common::icmp_echo_frame(0x0a00_0001, 0x0a00_0002);
    let key = extract(&frame, 2).unwrap();

    assert_eq!(key.in_port, 2);
    assert_eq!(key.eth_dst, MAC_A);
    assert_eq!(key.eth_src, MAC_B);
    assert_eq!(key.eth_type, 0x0800);
    assert_eq!(key.nw_proto, 1);
    assert_eq!(key.nw_src, 0x0a00_0001);
    assert_eq!(key.nw_dst, 0x0a00_0002);
    assert_eq!(key.nw_ttl, 64);
    assert_eq!(key.tp_src, 8); // echo request type
    assert_eq!(key.tp_dst, 0);
    assert_eq!(key.vlan_tci, 0);
}

#[test]
fn tcp_key_fields_and_flags() {
    let frame = common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(40000, 443, 0x12));
    let key = extract(&frame, 1).unwrap();

    assert_eq!(key.nw_proto, 6);
    assert_eq!(key.tp_src, 40000);
    assert_eq!(key.tp_dst, 443);
    assert_eq!(tcp_flags(&frame, &key), 0x12); // SYN|ACK

    let udp = common::ipv4_frame(17, 1, 2, 64, &common::udp_l4(53, 53, 0));
    let udp_key = extract(&udp, 1).unwrap();
    assert_eq!(tcp_flags(&udp, &udp_key), 0);
}

#[test]
fn vlan_tag_is_parsed_and_marked() {
    let inner = common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(1, 2, 0));
    let tagged = common::with_vlan(&inner, 0x0064);
    let key = extract(&tagged, 1).unwrap();

    assert_eq!(key.vlan_tci, 0x0064 | VLAN_TAG_PRESENT);
    assert_eq!(key.eth_type, 0x0800);
    assert_eq!(key.tp_src, 1);
    assert_eq!(tcp_flags(&tagged, &key), 0);
}

#[test]
fn arp_key_fields() {
    let frame = common::arp_frame(1, MAC_A, 0xc0a8_0001, [0; 6], 0xc0a8_0002);
    let key = extract(&frame, 1).unwrap();

    assert_eq!(key.eth_type, 0x0806);
    assert_eq!(key.nw_proto, 1); // request opcode
    assert_eq!(key.nw_src, 0xc0a8_0001);
    assert_eq!(key.nw_dst, 0xc0a8_0002);
    assert_eq!(key.arp_sha, MAC_A);
    assert_eq!(key.arp_tha, [0; 6]);
}

#[test]
fn ipv6_key_fields() {
    let src = [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    let dst = [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
    let frame = common::ipv6_frame(17, src, dst, 0x12345, &common::udp_l4(1000, 2000, 0));
    let key = extract(&frame, 9).unwrap();

    assert_eq!(key.eth_type, 0x86dd);
    assert_eq!(key.ipv6_src, src);
    assert_eq!(key.ipv6_dst, dst);
    assert_eq!(key.ipv6_label, 0x12345);
    assert_eq!(key.nw_proto, 17);
    assert_eq!(key.nw_ttl, 64);
    assert_eq!(key.tp_src, 1000);
    assert_eq!(key.tp_dst, 2000);
}

#[test]
fn mpls_key_fields() {
    let mut frame = common::eth_header(MAC_A, MAC_B, 0x8847);
    frame.extend_from_slice(&0x0001_4140u32.to_be_bytes());
    let key = extract(&frame, 1).unwrap();
    assert_eq!(key.eth_type, 0x8847);
    assert_eq!(key.mpls_lse, 0x0001_4140);
}

#[test]
fn dot3_frames_get_the_none_ethertype() {
    let frame = common::eth_frame(MAC_A, MAC_B, 0x0100, 60);
    let key = extract(&frame, 1).unwrap();
    assert_eq!(key.eth_type, 0x5ff);
}

#[test]
fn fragments_have_no_l4_fields() {
    let mut frame = common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(7, 8, 0));
    // Fragment offset 1 (in 8-byte units).
    frame[14 + 6] = 0x00;
    frame[14 + 7] = 0x01;
    let key = extract(&frame, 1).unwrap();
    assert_eq!(key.nw_proto, 6);
    assert_eq!(key.tp_src, 0);
    assert_eq!(key.tp_dst, 0);
}

#[test]
fn every_extracted_key_round_trips() {
    let frames = vec![
        common::icmp_echo_frame(1, 2),
        common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(80, 8080, 0x02)),
        common::ipv4_frame(17, 3, 4, 1, &common::udp_l4(67, 68, 8)),
        common::with_vlan(&common::ipv4_frame(6, 1, 2, 64, &common::tcp_l4(1, 2, 0)), 0x064),
        common::arp_frame(2, MAC_B, 9, MAC_A, 10),
        common::ipv6_frame(58, [1; 16], [2; 16], 7, &[128, 0, 0, 0]),
        common::eth_frame(MAC_A, MAC_B, 0x88cc, 60), // LLDP: L2-only key
        common::eth_frame(MAC_A, MAC_B, 0x0042, 60), // 802.3
    ];

    for frame in frames {
        let key = extract(&frame, 5).unwrap();
        let bytes = encode_key(&key);
        let decoded = decode_key(&bytes).unwrap();
        assert_eq!(decoded, key, "decode(encode(k)) != k");
        assert_eq!(encode_key(&decoded), bytes, "encode(decode(b)) != b");
    }
}

#[test]
fn decode_rejects_unknown_attributes() {
    let mut w = muninn_switch_lib::wire::AttrWriter::new();
    w.put_u32_be(200, 1);
    assert!(decode_key(&w.finish()).is_err());
}

#[test]
fn default_key_encodes_to_l2_only_attributes() {
    let key = FlowKey::default();
    let bytes = encode_key(&key);
    let decoded = decode_key(&bytes).unwrap();
    assert_eq!(decoded, key);
}
