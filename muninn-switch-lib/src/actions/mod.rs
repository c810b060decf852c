//! Action programs: the byte-code a flow entry carries.
//!
//! A program is an attribute stream; each attribute is one action, executed
//! in order by [`execute`]. Blobs are checked by [`validate`] when they
//! enter the datapath (flow put, execute operation) so the interpreter only
//! ever runs vetted programs.

mod execute;

pub use execute::{ActionSink, execute};

use crate::error::{DpError, Result};
use crate::flow::wire::{
    KEY_ATTR_ETHERNET, KEY_ATTR_IPV4, KEY_ATTR_IPV6, KEY_ATTR_MPLS, KEY_ATTR_PRIORITY,
    KEY_ATTR_SKB_MARK, KEY_ATTR_TCP, KEY_ATTR_TUNNEL, KEY_ATTR_UDP,
};
use crate::wire::{Attr, AttrReader, AttrWriter};

pub const ACTION_ATTR_OUTPUT: u16 = 1;
pub const ACTION_ATTR_USERSPACE: u16 = 2;
pub const ACTION_ATTR_PUSH_VLAN: u16 = 3;
pub const ACTION_ATTR_POP_VLAN: u16 = 4;
pub const ACTION_ATTR_SAMPLE: u16 = 5;
pub const ACTION_ATTR_SET: u16 = 6;
pub const ACTION_ATTR_PUSH_MPLS: u16 = 7;
pub const ACTION_ATTR_POP_MPLS: u16 = 8;

pub const USERSPACE_ATTR_USERDATA: u16 = 1;

pub const SAMPLE_ATTR_PROBABILITY: u16 = 1;
pub const SAMPLE_ATTR_ACTIONS: u16 = 2;

fn invalid(msg: impl Into<String>) -> DpError {
    DpError::Invalid(msg.into())
}

/// Structural check of an action program, including nested SAMPLE programs.
pub fn validate(actions: &[u8]) -> Result<()> {
    for attr in AttrReader::new(actions) {
        let attr = attr?;
        match attr.ty {
            ACTION_ATTR_OUTPUT => {
                attr.u32_be()?;
            }
            ACTION_ATTR_USERSPACE => validate_userspace(&attr)?,
            ACTION_ATTR_PUSH_VLAN => {
                let _: [u8; 4] = attr.array()?;
            }
            ACTION_ATTR_POP_VLAN => {
                if !attr.payload.is_empty() {
                    return Err(invalid("POP_VLAN carries a payload"));
                }
            }
            ACTION_ATTR_SAMPLE => validate_sample(&attr)?,
            ACTION_ATTR_SET => validate_set(&attr)?,
            ACTION_ATTR_PUSH_MPLS => {
                let _: [u8; 6] = attr.array()?;
            }
            ACTION_ATTR_POP_MPLS => {
                attr.u16_be()?;
            }
            other => return Err(invalid(format!("unknown action type {other}"))),
        }
    }
    Ok(())
}

fn validate_userspace(attr: &Attr) -> Result<()> {
    for nested in attr.nested() {
        let nested = nested?;
        if nested.ty != USERSPACE_ATTR_USERDATA {
            return Err(invalid(format!(
                "unknown USERSPACE attribute type {}",
                nested.ty
            )));
        }
    }
    Ok(())
}

fn validate_sample(attr: &Attr) -> Result<()> {
    let mut have_probability = false;
    for nested in attr.nested() {
        let nested = nested?;
        match nested.ty {
            SAMPLE_ATTR_PROBABILITY => {
                nested.u32_be()?;
                have_probability = true;
            }
            SAMPLE_ATTR_ACTIONS => validate(nested.payload)?,
            other => {
                return Err(invalid(format!("unknown SAMPLE attribute type {other}")));
            }
        }
    }
    if !have_probability {
        return Err(invalid("SAMPLE without a probability"));
    }
    Ok(())
}

fn validate_set(attr: &Attr) -> Result<()> {
    let mut nested = attr.nested();
    let field = nested.next().ok_or_else(|| invalid("empty SET action"))??;
    if nested.next().is_some() {
        return Err(invalid("SET action with more than one field"));
    }
    match field.ty {
        KEY_ATTR_ETHERNET => {
            let _: [u8; 12] = field.array()?;
        }
        KEY_ATTR_IPV4 => {
            let _: [u8; 11] = field.array()?;
        }
        KEY_ATTR_IPV6 => {
            let _: [u8; 39] = field.array()?;
        }
        KEY_ATTR_TCP | KEY_ATTR_UDP => {
            let _: [u8; 4] = field.array()?;
        }
        KEY_ATTR_MPLS => {
            field.u32_be()?;
        }
        // Accepted for compatibility; the interpreter ignores them.
        KEY_ATTR_PRIORITY | KEY_ATTR_TUNNEL | KEY_ATTR_SKB_MARK => {}
        other => return Err(invalid(format!("SET of unsupported field type {other}"))),
    }
    Ok(())
}

/// Convenience encoder for building action programs.
///
/// ```
/// use muninn_switch_lib::actions::ActionBuilder;
///
/// let actions = ActionBuilder::new().push_vlan(0x1064).output(2).finish();
/// muninn_switch_lib::actions::validate(&actions).unwrap();
/// ```
#[derive(Default)]
pub struct ActionBuilder {
    w: AttrWriter,
}

impl ActionBuilder {
    pub fn new() -> Self {
        ActionBuilder::default()
    }

    pub fn output(mut self, port: u32) -> Self {
        self.w.put_u32_be(ACTION_ATTR_OUTPUT, port);
        self
    }

    pub fn userspace(mut self, userdata: Option<&[u8]>) -> Self {
        self.w.put_nested(ACTION_ATTR_USERSPACE, |n| {
            if let Some(data) = userdata {
                n.put(USERSPACE_ATTR_USERDATA, data);
            }
        });
        self
    }

    /// Push an 802.1Q tag; `tci` is written to the wire as given.
    pub fn push_vlan(mut self, tci: u16) -> Self {
        let mut p = [0u8; 4];
        p[0..2].copy_from_slice(&crate::packet::ETH_TYPE_VLAN.to_be_bytes());
        p[2..4].copy_from_slice(&tci.to_be_bytes());
        self.w.put(ACTION_ATTR_PUSH_VLAN, &p);
        self
    }

    pub fn pop_vlan(mut self) -> Self {
        self.w.put_empty(ACTION_ATTR_POP_VLAN);
        self
    }

    pub fn push_mpls(mut self, eth_type: u16, lse: u32) -> Self {
        let mut p = [0u8; 6];
        p[0..2].copy_from_slice(&eth_type.to_be_bytes());
        p[2..6].copy_from_slice(&lse.to_be_bytes());
        self.w.put(ACTION_ATTR_PUSH_MPLS, &p);
        self
    }

    pub fn pop_mpls(mut self, eth_type: u16) -> Self {
        self.w.put_u16_be(ACTION_ATTR_POP_MPLS, eth_type);
        self
    }

    pub fn set_eth(mut self, src: [u8; 6], dst: [u8; 6]) -> Self {
        self.w.put_nested(ACTION_ATTR_SET, |n| {
            let mut p = [0u8; 12];
            p[0..6].copy_from_slice(&src);
            p[6..12].copy_from_slice(&dst);
            n.put(KEY_ATTR_ETHERNET, &p);
        });
        self
    }

    pub fn set_ipv4(mut self, src: u32, dst: u32, tos: u8, ttl: u8) -> Self {
        self.w.put_nested(ACTION_ATTR_SET, |n| {
            let mut p = [0u8; 11];
            p[0..4].copy_from_slice(&src.to_be_bytes());
            p[4..8].copy_from_slice(&dst.to_be_bytes());
            p[9] = tos;
            p[10] = ttl;
            n.put(KEY_ATTR_IPV4, &p);
        });
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_ipv6(
        mut self,
        src: [u8; 16],
        dst: [u8; 16],
        label: u32,
        proto: u8,
        tclass: u8,
        hlimit: u8,
    ) -> Self {
        self.w.put_nested(ACTION_ATTR_SET, |n| {
            let mut p = [0u8; 39];
            p[0..16].copy_from_slice(&src);
            p[16..32].copy_from_slice(&dst);
            p[32..36].copy_from_slice(&label.to_be_bytes());
            p[36] = proto;
            p[37] = tclass;
            p[38] = hlimit;
            n.put(KEY_ATTR_IPV6, &p);
        });
        self
    }

    pub fn set_tcp(mut self, src: u16, dst: u16) -> Self {
        self.set_ports(KEY_ATTR_TCP, src, dst);
        self
    }

    pub fn set_udp(mut self, src: u16, dst: u16) -> Self {
        self.set_ports(KEY_ATTR_UDP, src, dst);
        self
    }

    fn set_ports(&mut self, attr: u16, src: u16, dst: u16) {
        self.w.put_nested(ACTION_ATTR_SET, |n| {
            let mut p = [0u8; 4];
            p[0..2].copy_from_slice(&src.to_be_bytes());
            p[2..4].copy_from_slice(&dst.to_be_bytes());
            n.put(attr, &p);
        });
    }

    pub fn set_mpls_lse(mut self, lse: u32) -> Self {
        self.w.put_nested(ACTION_ATTR_SET, |n| {
            n.put_u32_be(KEY_ATTR_MPLS, lse);
        });
        self
    }

    /// Wrap `nested` actions so they run with probability
    /// `probability / 2^32`.
    pub fn sample(mut self, probability: u32, nested: impl FnOnce(Self) -> Self) -> Self {
        let inner = nested(ActionBuilder::new()).finish();
        self.w.put_nested(ACTION_ATTR_SAMPLE, |n| {
            n.put_u32_be(SAMPLE_ATTR_PROBABILITY, probability);
            n.put(SAMPLE_ATTR_ACTIONS, &inner);
        });
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.w.finish()
    }
}
