//! The in-memory device backend.
//!
//! Every dummy device is pollable like a real one: an injected frame lands
//! in a queue and a byte goes down a pipe, so the device's fd reports
//! readable to `poll` until the queue drains. Frames the datapath sends
//! are captured for inspection instead of leaving the process.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use mio::unix::pipe;
use parking_lot::Mutex;
use tracing::debug;

use super::NetDev;
use crate::error::{DpError, Result};

pub const DUMMY_TYPE: &str = "dummy";

const DUMMY_MTU: usize = 1500;

struct Queues {
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
    promisc: bool,
}

struct Shared {
    name: String,
    queues: Mutex<Queues>,
    wake_tx: Mutex<pipe::Sender>,
    wake_rx: Mutex<pipe::Receiver>,
    wake_fd: RawFd,
}

impl Shared {
    fn new(name: &str) -> Result<Arc<Self>> {
        let (wake_tx, wake_rx) = pipe::new()?;
        let wake_fd = wake_rx.as_raw_fd();
        Ok(Arc::new(Shared {
            name: name.to_string(),
            queues: Mutex::new(Queues {
                rx: VecDeque::new(),
                tx: Vec::new(),
                promisc: false,
            }),
            wake_tx: Mutex::new(wake_tx),
            wake_rx: Mutex::new(wake_rx),
            wake_fd,
        }))
    }

    fn inject(&self, frame: &[u8]) {
        let mut queues = self.queues.lock();
        queues.rx.push_back(frame.to_vec());
        // Pipe full just means readability is already signalled.
        let _ = self.wake_tx.lock().write(&[0]);
    }

    /// Pop one pending frame, consuming its wake byte.
    fn pop_rx(&self) -> Option<Vec<u8>> {
        let mut queues = self.queues.lock();
        let frame = queues.rx.pop_front();
        if frame.is_some() {
            let mut byte = [0u8; 1];
            let _ = self.wake_rx.lock().read(&mut byte);
        }
        frame
    }
}

/// All dummy devices of one registry, by name.
pub struct DummyHub {
    devices: Mutex<HashMap<String, Arc<Shared>>>,
}

impl DummyHub {
    pub fn new() -> Self {
        DummyHub {
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn shared(&self, name: &str) -> Result<Arc<Shared>> {
        let mut devices = self.devices.lock();
        if let Some(shared) = devices.get(name) {
            return Ok(Arc::clone(shared));
        }
        let shared = Shared::new(name)?;
        devices.insert(name.to_string(), Arc::clone(&shared));
        Ok(shared)
    }

    pub(super) fn open(&self, name: &str) -> Result<Box<dyn NetDev>> {
        debug!(name, "opening dummy netdev");
        Ok(Box::new(DummyNetdev {
            shared: self.shared(name)?,
        }))
    }

    pub fn handle(&self, name: &str) -> Result<DummyHandle> {
        Ok(DummyHandle {
            shared: self.shared(name)?,
        })
    }
}

impl Default for DummyHub {
    fn default() -> Self {
        DummyHub::new()
    }
}

/// Test-side control over a dummy device.
pub struct DummyHandle {
    shared: Arc<Shared>,
}

impl DummyHandle {
    /// Queue a frame for the datapath to receive.
    pub fn inject(&self, frame: &[u8]) {
        self.shared.inject(frame);
    }

    /// Frames the datapath has transmitted on this device so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.queues.lock().tx.clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.shared.queues.lock().tx)
    }
}

struct DummyNetdev {
    shared: Arc<Shared>,
}

impl NetDev for DummyNetdev {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn listen(&mut self) -> Result<()> {
        // Frames arrive by injection; there is nothing to start. Reported
        // as unsupported, which only the dummy datapath class accepts.
        Err(DpError::Unsupported("dummy devices have no receive path"))
    }

    fn set_promisc(&mut self, on: bool) -> Result<()> {
        self.shared.queues.lock().promisc = on;
        Ok(())
    }

    fn mtu(&self) -> Result<usize> {
        Ok(DUMMY_MTU)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.shared.wake_fd)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.shared.pop_rx() {
            Some(frame) => {
                if frame.len() > buf.len() {
                    return Err(DpError::NoBufs);
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            None => Err(DpError::Again),
        }
    }

    fn dispatch(&mut self, batch: usize, cb: super::DispatchFn) -> Result<usize> {
        let mut n = 0;
        while n < batch {
            match self.shared.pop_rx() {
                Some(frame) => {
                    cb(&frame);
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.shared.queues.lock().tx.push(frame.to_vec());
        Ok(())
    }
}
