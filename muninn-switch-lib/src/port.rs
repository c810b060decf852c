//! Ports: the interfaces attached to a datapath.

use crate::error::{DpError, Result};
use crate::netdev::NetDev;

/// Slots per datapath, local port included.
pub const MAX_PORTS: usize = 256;

/// Slot 0 is the datapath-local port, created with the datapath itself.
pub const LOCAL_PORT: u16 = 0;

pub struct Port {
    pub port_no: u16,
    pub name: String,
    pub ty: String,
    pub netdev: Box<dyn NetDev>,
}

/// Summary of a port as reported by the query and dump operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port_no: u16,
    pub name: String,
    pub ty: String,
}

impl From<&Port> for PortInfo {
    fn from(port: &Port) -> Self {
        PortInfo {
            port_no: port.port_no,
            name: port.name.clone(),
            ty: port.ty.clone(),
        }
    }
}

/// Fixed array of slots plus the insertion order of the occupied ones.
pub struct PortTable {
    slots: Vec<Option<Port>>,
    order: Vec<u16>,
}

impl PortTable {
    pub fn new() -> Self {
        PortTable {
            slots: (0..MAX_PORTS).map(|_| None).collect(),
            order: Vec::new(),
        }
    }

    pub fn get(&self, port_no: u16) -> Option<&Port> {
        self.slots.get(port_no as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, port_no: u16) -> Option<&mut Port> {
        self.slots.get_mut(port_no as usize).and_then(Option::as_mut)
    }

    pub fn by_name(&self, name: &str) -> Option<&Port> {
        self.iter().find(|p| p.name == name)
    }

    /// Occupied ports in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.order.iter().filter_map(|no| self.get(*no))
    }

    /// Occupied ports in slot order; the ingress loop does not care about
    /// insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn port_numbers(&self) -> Vec<u16> {
        self.order.clone()
    }

    pub fn insert(&mut self, port: Port) -> Result<()> {
        let slot = port.port_no as usize;
        if slot >= MAX_PORTS {
            return Err(DpError::Invalid(format!("port number {slot} out of range")));
        }
        if self.slots[slot].is_some() {
            return Err(DpError::Busy);
        }
        self.order.push(port.port_no);
        self.slots[slot] = Some(port);
        Ok(())
    }

    pub fn remove(&mut self, port_no: u16) -> Option<Port> {
        let port = self.slots.get_mut(port_no as usize)?.take()?;
        self.order.retain(|no| *no != port_no);
        Some(port)
    }

    /// Pick a port number for `name`.
    ///
    /// Names beginning with "br" start the scan at 100, and the first run
    /// of digits in the name (if any) is added to the start, which keeps
    /// numbering deterministic for tests. When the candidate is taken or
    /// out of range the scan continues upward from the start before the
    /// generic first-free-from-1 rule applies.
    pub fn choose_port_no(&self, name: &str) -> Result<u16> {
        let start: u16 = if name.starts_with("br") { 100 } else { 0 };
        let mut candidate = start;
        if let Some(digits_at) = name.find(|c: char| c.is_ascii_digit()) {
            let digits: String = name[digits_at..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(n) = digits.parse::<u16>() {
                candidate = start.saturating_add(n);
            }
        }
        if candidate > 0 && (candidate as usize) < MAX_PORTS && self.get(candidate).is_none() {
            return Ok(candidate);
        }
        if start > 0 {
            for port_no in start..MAX_PORTS as u16 {
                if self.get(port_no).is_none() {
                    return Ok(port_no);
                }
            }
        }
        for port_no in 1..MAX_PORTS as u16 {
            if self.get(port_no).is_none() {
                return Ok(port_no);
            }
        }
        Err(DpError::TooBig("no free port slots"))
    }
}

impl Default for PortTable {
    fn default() -> Self {
        PortTable::new()
    }
}
