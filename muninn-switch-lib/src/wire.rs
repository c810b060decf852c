//! Length-prefixed, type-tagged attribute streams.
//!
//! Flow keys and action programs travel as a concatenation of
//! `(length, type, payload)` records with the payload padded to a 4-byte
//! boundary, the same framing the kernel uses for its flow and packet
//! families. The header is native-endian; multi-byte protocol values inside
//! payloads are big-endian and read through the typed accessors on
//! [`Attr`].
//!
//! Encoding is canonical: for any stream this crate emits,
//! `AttrWriter` output fed back through `AttrReader` and re-emitted is
//! byte-identical.

use byteorder::{BigEndian, ByteOrder, NativeEndian};

use crate::error::{DpError, Result};

/// Attribute header: `len: u16` (header included, padding excluded),
/// `type: u16`.
pub const ATTR_HDR_LEN: usize = 4;

const ATTR_ALIGN: usize = 4;

/// Round `len` up to the attribute alignment boundary.
pub fn attr_pad(len: usize) -> usize {
    (len + ATTR_ALIGN - 1) & !(ATTR_ALIGN - 1)
}

fn truncated(what: &str) -> DpError {
    DpError::Invalid(format!("truncated attribute: {what}"))
}

/// A single attribute borrowed from a stream.
#[derive(Debug, Clone, Copy)]
pub struct Attr<'a> {
    pub ty: u16,
    pub payload: &'a [u8],
}

impl<'a> Attr<'a> {
    pub fn u8(&self) -> Result<u8> {
        match self.payload {
            [b] => Ok(*b),
            _ => Err(truncated("expected u8 payload")),
        }
    }

    pub fn u16_be(&self) -> Result<u16> {
        if self.payload.len() != 2 {
            return Err(truncated("expected u16 payload"));
        }
        Ok(BigEndian::read_u16(self.payload))
    }

    pub fn u32_be(&self) -> Result<u32> {
        if self.payload.len() != 4 {
            return Err(truncated("expected u32 payload"));
        }
        Ok(BigEndian::read_u32(self.payload))
    }

    /// Fixed-size byte payload (Ethernet addresses, IPv6 addresses).
    pub fn array<const N: usize>(&self) -> Result<[u8; N]> {
        self.payload
            .try_into()
            .map_err(|_| truncated("unexpected payload length"))
    }

    /// Iterate this attribute's payload as a nested stream.
    pub fn nested(&self) -> AttrReader<'a> {
        AttrReader::new(self.payload)
    }
}

/// Iterator over the attributes of a stream.
///
/// Yields `Err` once and then stops if the stream is truncated mid-record.
pub struct AttrReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> AttrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        AttrReader { buf, pos: 0, failed: false }
    }
}

impl<'a> Iterator for AttrReader<'a> {
    type Item = Result<Attr<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        if rest.len() < ATTR_HDR_LEN {
            self.failed = true;
            return Some(Err(truncated("header")));
        }
        let len = NativeEndian::read_u16(&rest[0..2]) as usize;
        let ty = NativeEndian::read_u16(&rest[2..4]);
        if len < ATTR_HDR_LEN || rest.len() < len {
            self.failed = true;
            return Some(Err(truncated("payload")));
        }
        let payload = &rest[ATTR_HDR_LEN..len];
        self.pos += attr_pad(len).min(rest.len());
        Some(Ok(Attr { ty, payload }))
    }
}

/// Builder for attribute streams.
#[derive(Default)]
pub struct AttrWriter {
    buf: Vec<u8>,
}

impl AttrWriter {
    pub fn new() -> Self {
        AttrWriter::default()
    }

    pub fn put(&mut self, ty: u16, payload: &[u8]) -> &mut Self {
        let len = ATTR_HDR_LEN + payload.len();
        let mut hdr = [0u8; ATTR_HDR_LEN];
        NativeEndian::write_u16(&mut hdr[0..2], len as u16);
        NativeEndian::write_u16(&mut hdr[2..4], ty);
        self.buf.extend_from_slice(&hdr);
        self.buf.extend_from_slice(payload);
        self.buf.resize(self.buf.len() + attr_pad(len) - len, 0);
        self
    }

    pub fn put_empty(&mut self, ty: u16) -> &mut Self {
        self.put(ty, &[])
    }

    pub fn put_u8(&mut self, ty: u16, v: u8) -> &mut Self {
        self.put(ty, &[v])
    }

    pub fn put_u16_be(&mut self, ty: u16, v: u16) -> &mut Self {
        self.put(ty, &v.to_be_bytes())
    }

    pub fn put_u32_be(&mut self, ty: u16, v: u32) -> &mut Self {
        self.put(ty, &v.to_be_bytes())
    }

    /// Emit a nested attribute whose payload is built by `f`.
    pub fn put_nested(&mut self, ty: u16, f: impl FnOnce(&mut AttrWriter)) -> &mut Self {
        let mut inner = AttrWriter::new();
        f(&mut inner);
        self.put(ty, &inner.buf)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_bytes() {
        let mut w = AttrWriter::new();
        w.put_u32_be(1, 0xdead_beef)
            .put(2, &[1, 2, 3]) // padded to 4
            .put_empty(3)
            .put_nested(4, |n| {
                n.put_u16_be(7, 0x0800);
            });
        let bytes = w.finish();

        let mut again = AttrWriter::new();
        for attr in AttrReader::new(&bytes) {
            let attr = attr.unwrap();
            again.put(attr.ty, attr.payload);
        }
        assert_eq!(again.finish(), bytes);
    }

    #[test]
    fn truncated_stream_errors_once() {
        let mut w = AttrWriter::new();
        w.put_u32_be(1, 42);
        let mut bytes = w.finish();
        bytes.truncate(bytes.len() - 1);

        let results: Vec<_> = AttrReader::new(&bytes).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn typed_accessors_check_length() {
        let mut w = AttrWriter::new();
        w.put(9, &[1, 2, 3]);
        let bytes = w.finish();
        let attr = AttrReader::new(&bytes).next().unwrap().unwrap();
        assert!(attr.u32_be().is_err());
        assert!(attr.u16_be().is_err());
        assert_eq!(attr.payload, &[1, 2, 3]);
    }
}
