//! Bounded upcall rings.
//!
//! Each datapath buffers packets for the controlling client in two rings,
//! one for flow-table misses and one for packets an action explicitly sent
//! up. The rings use free-running head and tail counters over a
//! power-of-two slot array; `head - tail` is the fill level even across
//! counter wrap.

/// Rings per datapath: miss and explicit-action.
pub const N_QUEUES: usize = 2;

/// Capacity of each ring.
pub const MAX_QUEUE_LEN: u64 = 128;

const QUEUE_MASK: u64 = MAX_QUEUE_LEN - 1;

const _: () = assert!(MAX_QUEUE_LEN.is_power_of_two());

/// Why a packet was handed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpcallKind {
    /// No flow matched.
    Miss,
    /// A USERSPACE action asked for it.
    Action,
}

impl UpcallKind {
    fn queue(self) -> usize {
        match self {
            UpcallKind::Miss => 0,
            UpcallKind::Action => 1,
        }
    }
}

/// A packet queued for the client. The receiver takes ownership of the
/// buffer.
#[derive(Debug)]
pub struct Upcall {
    pub kind: UpcallKind,
    /// Serialized flow key of the packet.
    pub key: Vec<u8>,
    /// USERSPACE action userdata, when present.
    pub userdata: Option<Vec<u8>>,
    pub packet: Vec<u8>,
}

struct Ring {
    slots: Vec<Option<Upcall>>,
    head: u64,
    tail: u64,
}

impl Ring {
    fn new() -> Self {
        Ring {
            slots: (0..MAX_QUEUE_LEN).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    fn len(&self) -> u64 {
        self.head - self.tail
    }

    fn push(&mut self, upcall: Upcall) -> Result<(), Upcall> {
        if self.len() >= MAX_QUEUE_LEN {
            return Err(upcall);
        }
        self.slots[(self.head & QUEUE_MASK) as usize] = Some(upcall);
        self.head += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Upcall> {
        if self.head == self.tail {
            return None;
        }
        let upcall = self.slots[(self.tail & QUEUE_MASK) as usize].take();
        self.tail += 1;
        debug_assert!(upcall.is_some());
        upcall
    }
}

pub struct UpcallQueues {
    rings: [Ring; N_QUEUES],
}

impl UpcallQueues {
    pub fn new() -> Self {
        UpcallQueues {
            rings: [Ring::new(), Ring::new()],
        }
    }

    /// Queue an upcall; gives it back when its ring is full so the caller
    /// can count the loss.
    pub fn enqueue(&mut self, upcall: Upcall) -> Result<(), Upcall> {
        self.rings[upcall.kind.queue()].push(upcall)
    }

    /// Oldest record from the first non-empty ring; the miss ring drains
    /// ahead of the action ring.
    pub fn dequeue(&mut self) -> Option<Upcall> {
        self.rings.iter_mut().find_map(Ring::pop)
    }

    pub fn is_empty(&self) -> bool {
        self.rings.iter().all(|r| r.len() == 0)
    }

    pub fn len(&self) -> usize {
        self.rings.iter().map(|r| r.len() as usize).sum()
    }

    /// Drop everything, returning how many records were discarded.
    pub fn purge(&mut self) -> usize {
        let mut dropped = 0;
        for ring in &mut self.rings {
            while ring.pop().is_some() {
                dropped += 1;
            }
        }
        dropped
    }
}

impl Default for UpcallQueues {
    fn default() -> Self {
        UpcallQueues::new()
    }
}
