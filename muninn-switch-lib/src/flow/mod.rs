//! Canonical flow keys and the exact-match flow table.

pub mod extract;
pub mod table;
pub mod wire;

pub use extract::{extract, tcp_flags};
pub use table::{DumpCursor, FlowEntry, FlowStats, FlowTable, MAX_FLOWS};

use crate::error::{DpError, Result};
use crate::port::MAX_PORTS;

/// Marks a parsed VLAN tag in [`FlowKey::vlan_tci`] so a tag with VID 0 is
/// distinguishable from "no tag".
pub const VLAN_TAG_PRESENT: u16 = 0x1000;

/// Wire sentinel: the datapath-local port.
pub const WIRE_PORT_LOCAL: u32 = 0xfffe;
/// Wire sentinel: no ingress port.
pub const WIRE_PORT_NONE: u32 = 0xffff;
/// Wire sentinel: the highest addressable port number.
pub const WIRE_PORT_MAX: u32 = 0xff00;

/// The canonical descriptor a packet parses into.
///
/// Fixed-size and byte-comparable: equality, hashing, and the flow table all
/// operate on the whole struct. Multi-use fields follow the usual
/// conventions: `nw_src`/`nw_dst` hold the ARP sender/target IP for ARP
/// frames, `nw_proto` the ARP opcode, and `tp_src`/`tp_dst` the ICMP
/// type/code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlowKey {
    pub in_port: u32,
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
    /// Raw TCI with [`VLAN_TAG_PRESENT`] OR'd in; zero when untagged.
    pub vlan_tci: u16,
    pub eth_type: u16,
    pub mpls_lse: u32,
    pub nw_src: u32,
    pub nw_dst: u32,
    pub ipv6_src: [u8; 16],
    pub ipv6_dst: [u8; 16],
    pub ipv6_label: u32,
    pub nw_proto: u8,
    pub nw_tos: u8,
    pub nw_ttl: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
    pub arp_sha: [u8; 6],
    pub arp_tha: [u8; 6],
}

impl FlowKey {
    /// Reject keys whose ingress port is neither a valid slot nor one of the
    /// recognized sentinels.
    pub fn validate_in_port(&self) -> Result<()> {
        if self.in_port < MAX_PORTS as u32
            || self.in_port == WIRE_PORT_LOCAL
            || self.in_port == WIRE_PORT_NONE
        {
            Ok(())
        } else {
            Err(DpError::Invalid(format!(
                "flow key in_port {} out of range",
                self.in_port
            )))
        }
    }
}
