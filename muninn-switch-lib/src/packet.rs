//! The working packet: an owned frame with headroom for tag pushes.
//!
//! Action programs mutate the packet in place; every transformation here
//! keeps checksums consistent so a frame forwarded after a SET action is
//! still well-formed on the wire.

use byteorder::{BigEndian, ByteOrder};

pub const ETH_ADDR_LEN: usize = 6;
pub const ETH_HEADER_LEN: usize = 14;
pub const VLAN_HEADER_LEN: usize = 4;
pub const MPLS_HEADER_LEN: usize = 4;

/// Reserved in front of the frame so a VLAN push never reallocates.
pub const HEADROOM: usize = 2 + VLAN_HEADER_LEN;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_MPLS: u16 = 0x8847;
pub const ETH_TYPE_MPLS_MCAST: u16 = 0x8848;
/// Ethertypes below this are 802.3 length fields, not types.
pub const ETH_TYPE_MIN: u16 = 0x600;
/// Canonical stand-in for an 802.3 frame with no ethertype.
pub const ETH_TYPE_NONE: u16 = 0x5ff;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ICMPV6: u8 = 58;

pub fn is_mpls(eth_type: u16) -> bool {
    eth_type == ETH_TYPE_MPLS || eth_type == ETH_TYPE_MPLS_MCAST
}

/// An owned frame plus spare bytes in front of it.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    start: usize,
}

impl Packet {
    pub fn from_frame(frame: &[u8]) -> Self {
        let mut buf = vec![0u8; HEADROOM + frame.len()];
        buf[HEADROOM..].copy_from_slice(frame);
        Packet { buf, start: HEADROOM }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow the frame by `n` bytes at the front, reallocating only when the
    /// headroom is exhausted.
    fn prepend(&mut self, n: usize) {
        if self.start >= n {
            self.start -= n;
        } else {
            let shortfall = n - self.start;
            let mut buf = vec![0u8; self.buf.len() + shortfall];
            buf[shortfall..].copy_from_slice(&self.buf);
            self.buf = buf;
            self.start = 0;
        }
    }

    /// Drop `n` bytes from the front of the frame.
    fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.buf.len());
        self.start += n;
    }

    /// Length of the L2 header, accounting for one VLAN tag.
    fn l2_len(&self) -> Option<usize> {
        let data = self.data();
        if data.len() < ETH_HEADER_LEN {
            return None;
        }
        if BigEndian::read_u16(&data[12..14]) == ETH_TYPE_VLAN {
            if data.len() < ETH_HEADER_LEN + VLAN_HEADER_LEN {
                return None;
            }
            Some(ETH_HEADER_LEN + VLAN_HEADER_LEN)
        } else {
            Some(ETH_HEADER_LEN)
        }
    }

    /// The effective ethertype, looking through one VLAN tag.
    pub fn eth_type(&self) -> Option<u16> {
        let l2 = self.l2_len()?;
        Some(BigEndian::read_u16(&self.data()[l2 - 2..l2]))
    }

    /// Insert a VLAN tag between the addresses and the ethertype. The TCI is
    /// written exactly as given.
    pub fn push_vlan(&mut self, tpid: u16, tci: u16) {
        if self.len() < ETH_HEADER_LEN {
            return;
        }
        self.prepend(VLAN_HEADER_LEN);
        let data = self.data_mut();
        data.copy_within(VLAN_HEADER_LEN..VLAN_HEADER_LEN + 12, 0);
        BigEndian::write_u16(&mut data[12..14], tpid);
        BigEndian::write_u16(&mut data[14..16], tci);
    }

    /// Remove the outermost VLAN tag, returning its TCI. No-op on untagged
    /// frames.
    pub fn pop_vlan(&mut self) -> Option<u16> {
        let data = self.data();
        if data.len() < ETH_HEADER_LEN + VLAN_HEADER_LEN
            || BigEndian::read_u16(&data[12..14]) != ETH_TYPE_VLAN
        {
            return None;
        }
        let tci = BigEndian::read_u16(&data[14..16]);
        let data = self.data_mut();
        data.copy_within(0..12, VLAN_HEADER_LEN);
        self.consume(VLAN_HEADER_LEN);
        Some(tci)
    }

    /// Insert an MPLS label stack entry after the L2 header and rewrite the
    /// ethertype to `eth_type`.
    pub fn push_mpls(&mut self, eth_type: u16, lse: u32) {
        let Some(l2) = self.l2_len() else { return };
        self.prepend(MPLS_HEADER_LEN);
        let data = self.data_mut();
        data.copy_within(MPLS_HEADER_LEN..MPLS_HEADER_LEN + l2, 0);
        BigEndian::write_u16(&mut data[l2 - 2..l2], eth_type);
        BigEndian::write_u32(&mut data[l2..l2 + 4], lse);
    }

    /// Remove the outermost MPLS entry and restore `eth_type`. No-op unless
    /// the frame is MPLS.
    pub fn pop_mpls(&mut self, eth_type: u16) {
        let Some(l2) = self.l2_len() else { return };
        if !is_mpls(BigEndian::read_u16(&self.data()[l2 - 2..l2]))
            || self.len() < l2 + MPLS_HEADER_LEN
        {
            return;
        }
        let data = self.data_mut();
        data.copy_within(0..l2, MPLS_HEADER_LEN);
        self.consume(MPLS_HEADER_LEN);
        let data = self.data_mut();
        BigEndian::write_u16(&mut data[l2 - 2..l2], eth_type);
    }

    /// Overwrite the outermost MPLS label stack entry.
    pub fn set_mpls_lse(&mut self, lse: u32) {
        let Some(l2) = self.l2_len() else { return };
        if !is_mpls(BigEndian::read_u16(&self.data()[l2 - 2..l2]))
            || self.len() < l2 + MPLS_HEADER_LEN
        {
            return;
        }
        let data = self.data_mut();
        BigEndian::write_u32(&mut data[l2..l2 + 4], lse);
    }

    pub fn set_eth_src(&mut self, addr: [u8; ETH_ADDR_LEN]) {
        if self.len() >= ETH_HEADER_LEN {
            self.data_mut()[6..12].copy_from_slice(&addr);
        }
    }

    pub fn set_eth_dst(&mut self, addr: [u8; ETH_ADDR_LEN]) {
        if self.len() >= ETH_HEADER_LEN {
            self.data_mut()[0..6].copy_from_slice(&addr);
        }
    }

    fn ipv4_view(&self) -> Option<Ipv4View> {
        let l2 = self.l2_len()?;
        if self.eth_type()? != ETH_TYPE_IP {
            return None;
        }
        let data = self.data();
        if data.len() < l2 + 20 {
            return None;
        }
        let ihl = ((data[l2] & 0x0f) as usize) * 4;
        if ihl < 20 || data.len() < l2 + ihl {
            return None;
        }
        Some(Ipv4View { l3: l2, proto: data[l2 + 9], l4: l2 + ihl })
    }

    fn ipv6_view(&self) -> Option<Ipv6View> {
        let l2 = self.l2_len()?;
        if self.eth_type()? != ETH_TYPE_IPV6 {
            return None;
        }
        let data = self.data();
        if data.len() < l2 + 40 {
            return None;
        }
        Some(Ipv6View { l3: l2, proto: data[l2 + 6], l4: l2 + 40 })
    }

    /// Offset of the L4 checksum field for `proto`, if the frame carries one.
    fn l4_csum_off(&self, proto: u8, l4: usize) -> Option<usize> {
        let data = self.data();
        match proto {
            IP_PROTO_TCP if data.len() >= l4 + 18 => Some(l4 + 16),
            IP_PROTO_UDP if data.len() >= l4 + 8 => {
                // A zero UDP checksum means "not computed"; leave it alone.
                if BigEndian::read_u16(&data[l4 + 6..l4 + 8]) == 0 {
                    None
                } else {
                    Some(l4 + 6)
                }
            }
            _ => None,
        }
    }

    fn replace_u32(&mut self, off: usize, new: u32, csum_offs: &[usize]) {
        let old = BigEndian::read_u32(&self.data()[off..off + 4]);
        for &coff in csum_offs {
            let data = self.data_mut();
            csum_replace32(data, coff, old, new);
        }
        let data = self.data_mut();
        BigEndian::write_u32(&mut data[off..off + 4], new);
    }

    pub fn set_ipv4_src(&mut self, addr: u32) {
        let Some(v) = self.ipv4_view() else { return };
        let mut csums = vec![v.l3 + 10];
        if let Some(off) = self.l4_csum_off(v.proto, v.l4) {
            csums.push(off);
        }
        self.replace_u32(v.l3 + 12, addr, &csums);
    }

    pub fn set_ipv4_dst(&mut self, addr: u32) {
        let Some(v) = self.ipv4_view() else { return };
        let mut csums = vec![v.l3 + 10];
        if let Some(off) = self.l4_csum_off(v.proto, v.l4) {
            csums.push(off);
        }
        self.replace_u32(v.l3 + 16, addr, &csums);
    }

    pub fn set_ipv4_tos(&mut self, tos: u8) {
        let Some(v) = self.ipv4_view() else { return };
        let data = self.data_mut();
        let old = BigEndian::read_u16(&data[v.l3..v.l3 + 2]);
        let new = (old & 0xff00) | tos as u16;
        csum_replace16(data, v.l3 + 10, old, new);
        BigEndian::write_u16(&mut data[v.l3..v.l3 + 2], new);
    }

    pub fn set_ipv4_ttl(&mut self, ttl: u8) {
        let Some(v) = self.ipv4_view() else { return };
        let data = self.data_mut();
        let old = BigEndian::read_u16(&data[v.l3 + 8..v.l3 + 10]);
        let new = ((ttl as u16) << 8) | (old & 0x00ff);
        csum_replace16(data, v.l3 + 10, old, new);
        BigEndian::write_u16(&mut data[v.l3 + 8..v.l3 + 10], new);
    }

    fn set_ipv6_addr(&mut self, off: usize, addr: [u8; 16]) {
        let Some(v) = self.ipv6_view() else { return };
        let csum = self.l4_csum_off(v.proto, v.l4);
        let data = self.data_mut();
        if let Some(coff) = csum {
            for i in 0..4 {
                let old = BigEndian::read_u32(&data[off + i * 4..off + i * 4 + 4]);
                let new = BigEndian::read_u32(&addr[i * 4..i * 4 + 4]);
                csum_replace32(data, coff, old, new);
            }
        }
        data[off..off + 16].copy_from_slice(&addr);
    }

    pub fn set_ipv6_src(&mut self, addr: [u8; 16]) {
        if let Some(v) = self.ipv6_view() {
            self.set_ipv6_addr(v.l3 + 8, addr);
        }
    }

    pub fn set_ipv6_dst(&mut self, addr: [u8; 16]) {
        if let Some(v) = self.ipv6_view() {
            self.set_ipv6_addr(v.l3 + 24, addr);
        }
    }

    pub fn set_ipv6_tclass(&mut self, tclass: u8) {
        let Some(v) = self.ipv6_view() else { return };
        let data = self.data_mut();
        let word = BigEndian::read_u32(&data[v.l3..v.l3 + 4]);
        let word = (word & 0xf00f_ffff) | ((tclass as u32) << 20);
        BigEndian::write_u32(&mut data[v.l3..v.l3 + 4], word);
    }

    pub fn set_ipv6_label(&mut self, label: u32) {
        let Some(v) = self.ipv6_view() else { return };
        let data = self.data_mut();
        let word = BigEndian::read_u32(&data[v.l3..v.l3 + 4]);
        let word = (word & 0xfff0_0000) | (label & 0x000f_ffff);
        BigEndian::write_u32(&mut data[v.l3..v.l3 + 4], word);
    }

    pub fn set_ipv6_hoplimit(&mut self, hlim: u8) {
        let Some(v) = self.ipv6_view() else { return };
        self.data_mut()[v.l3 + 7] = hlim;
    }

    pub fn set_ipv6_proto(&mut self, proto: u8) {
        let Some(v) = self.ipv6_view() else { return };
        self.data_mut()[v.l3 + 6] = proto;
    }

    fn l4_view(&self, want: u8) -> Option<(usize, u8)> {
        if let Some(v) = self.ipv4_view() {
            if v.proto == want {
                return Some((v.l4, v.proto));
            }
        }
        if let Some(v) = self.ipv6_view() {
            if v.proto == want {
                return Some((v.l4, v.proto));
            }
        }
        None
    }

    fn set_l4_port(&mut self, proto: u8, field: usize, port: u16) {
        let Some((l4, proto)) = self.l4_view(proto) else { return };
        if self.len() < l4 + 8 {
            return;
        }
        let csum = self.l4_csum_off(proto, l4);
        let data = self.data_mut();
        let off = l4 + field * 2;
        let old = BigEndian::read_u16(&data[off..off + 2]);
        if let Some(coff) = csum {
            csum_replace16(data, coff, old, port);
        }
        BigEndian::write_u16(&mut data[off..off + 2], port);
    }

    pub fn set_tcp_src(&mut self, port: u16) {
        self.set_l4_port(IP_PROTO_TCP, 0, port);
    }

    pub fn set_tcp_dst(&mut self, port: u16) {
        self.set_l4_port(IP_PROTO_TCP, 1, port);
    }

    pub fn set_udp_src(&mut self, port: u16) {
        self.set_l4_port(IP_PROTO_UDP, 0, port);
    }

    pub fn set_udp_dst(&mut self, port: u16) {
        self.set_l4_port(IP_PROTO_UDP, 1, port);
    }
}

struct Ipv4View {
    l3: usize,
    proto: u8,
    l4: usize,
}

struct Ipv6View {
    l3: usize,
    proto: u8,
    l4: usize,
}

/// RFC 1624 incremental checksum update: HC' = ~(~HC + ~m + m').
fn csum_update(csum: u16, old: u16, new: u16) -> u16 {
    let sum = (!csum as u32) + (!old as u32) + new as u32;
    let sum = (sum & 0xffff) + (sum >> 16);
    let sum = (sum & 0xffff) + (sum >> 16);
    !(sum as u16)
}

fn csum_replace16(data: &mut [u8], csum_off: usize, old: u16, new: u16) {
    let csum = BigEndian::read_u16(&data[csum_off..csum_off + 2]);
    let mut updated = csum_update(csum, old, new);
    // A computed UDP checksum of zero goes on the wire as 0xffff.
    if updated == 0 {
        updated = 0xffff;
    }
    BigEndian::write_u16(&mut data[csum_off..csum_off + 2], updated);
}

fn csum_replace32(data: &mut [u8], csum_off: usize, old: u32, new: u32) {
    csum_replace16(data, csum_off, (old >> 16) as u16, (new >> 16) as u16);
    csum_replace16(data, csum_off, old as u16, new as u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged_frame() -> Packet {
        let mut frame = vec![0u8; ETH_HEADER_LEN];
        frame[0..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&[0x11; 6]);
        BigEndian::write_u16(&mut frame[12..14], ETH_TYPE_IP);
        frame.extend_from_slice(&[0xaa; 4]);
        let mut p = Packet::from_frame(&frame);
        p.push_vlan(ETH_TYPE_VLAN, 0x1005);
        p
    }

    #[test]
    fn push_then_pop_vlan_restores_frame() {
        let mut p = tagged_frame();
        assert_eq!(p.len(), ETH_HEADER_LEN + VLAN_HEADER_LEN + 4);
        assert_eq!(BigEndian::read_u16(&p.data()[12..14]), ETH_TYPE_VLAN);
        assert_eq!(BigEndian::read_u16(&p.data()[14..16]), 0x1005);

        assert_eq!(p.pop_vlan(), Some(0x1005));
        assert_eq!(p.len(), ETH_HEADER_LEN + 4);
        assert_eq!(BigEndian::read_u16(&p.data()[12..14]), ETH_TYPE_IP);
        assert_eq!(&p.data()[0..6], &[0xff; 6]);

        // second pop is a no-op
        assert_eq!(p.pop_vlan(), None);
    }

    #[test]
    fn push_pop_mpls() {
        let mut frame = vec![0u8; ETH_HEADER_LEN + 4];
        BigEndian::write_u16(&mut frame[12..14], ETH_TYPE_IP);
        let mut p = Packet::from_frame(&frame);

        p.push_mpls(ETH_TYPE_MPLS, 0x0001_0140);
        assert_eq!(p.eth_type(), Some(ETH_TYPE_MPLS));
        assert_eq!(
            BigEndian::read_u32(&p.data()[ETH_HEADER_LEN..ETH_HEADER_LEN + 4]),
            0x0001_0140
        );

        p.pop_mpls(ETH_TYPE_IP);
        assert_eq!(p.eth_type(), Some(ETH_TYPE_IP));
        assert_eq!(p.len(), ETH_HEADER_LEN + 4);
    }

    #[test]
    fn headroom_exhaustion_reallocates() {
        let frame = vec![0u8; ETH_HEADER_LEN];
        let mut p = Packet::from_frame(&frame);
        for _ in 0..4 {
            p.push_mpls(ETH_TYPE_MPLS, 0);
        }
        assert_eq!(p.len(), ETH_HEADER_LEN + 4 * MPLS_HEADER_LEN);
    }

    #[test]
    fn incremental_checksum_matches_recompute() {
        // 20-byte IPv4 header with a valid checksum.
        let mut hdr = [
            0x45, 0x00, 0x00, 0x54, 0x00, 0x00, 0x40, 0x00, 0x40, 0x01, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x01, 0x0a, 0x00, 0x00, 0x02,
        ];
        let full = |h: &[u8]| -> u16 {
            let mut sum = 0u32;
            for c in h.chunks(2) {
                sum += BigEndian::read_u16(c) as u32;
            }
            while sum > 0xffff {
                sum = (sum & 0xffff) + (sum >> 16);
            }
            !(sum as u16)
        };
        let csum = {
            let mut h = hdr;
            h[10] = 0;
            h[11] = 0;
            full(&h)
        };
        BigEndian::write_u16(&mut hdr[10..12], csum);

        let mut frame = vec![0u8; ETH_HEADER_LEN];
        BigEndian::write_u16(&mut frame[12..14], ETH_TYPE_IP);
        frame.extend_from_slice(&hdr);
        let mut p = Packet::from_frame(&frame);

        p.set_ipv4_src(0xc0a8_0101);
        p.set_ipv4_ttl(17);

        let data = p.data();
        let mut h = [0u8; 20];
        h.copy_from_slice(&data[ETH_HEADER_LEN..ETH_HEADER_LEN + 20]);
        let got = BigEndian::read_u16(&h[10..12]);
        h[10] = 0;
        h[11] = 0;
        assert_eq!(got, full(&h));
        assert_eq!(BigEndian::read_u32(&data[ETH_HEADER_LEN + 12..ETH_HEADER_LEN + 16]), 0xc0a8_0101);
        assert_eq!(data[ETH_HEADER_LEN + 8], 17);
    }
}
