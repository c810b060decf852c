//! The network-device contract the datapath consumes.
//!
//! The datapath never talks to hardware directly; each port owns a
//! [`NetDev`] obtained from the [`NetdevRegistry`]. Registration is
//! explicit: the host wires in the backends it wants before opening
//! datapaths (the kernel-socket and tunnel backends live with the host,
//! not here). The only built-in backend is [`dummy`], the in-memory
//! device the dummy datapath class and the test suite run on.

pub mod dummy;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DpError, Result};

/// Per-frame callback for batched receive dispatch.
pub type DispatchFn<'a> = &'a mut dyn FnMut(&[u8]);

/// The device operations the datapath relies on.
pub trait NetDev: Send {
    fn name(&self) -> &str;

    /// Start receiving. Backends without a receive path return
    /// `Unsupported`, which the datapath tolerates only for its dummy
    /// class.
    fn listen(&mut self) -> Result<()>;

    fn set_promisc(&mut self, on: bool) -> Result<()>;

    fn mtu(&self) -> Result<usize>;

    /// File descriptor that polls readable when a frame is pending, if the
    /// backend has one.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Non-blocking single-frame receive; `Again` when nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Receive up to `batch` frames, handing each to `cb`. Returns the
    /// number processed; zero when nothing was pending.
    fn dispatch(&mut self, batch: usize, cb: DispatchFn) -> Result<usize>;

    fn send(&mut self, frame: &[u8]) -> Result<()>;
}

type Ctor = Box<dyn Fn(&str) -> Result<Box<dyn NetDev>> + Send + Sync>;

/// Maps port type tags to device constructors.
pub struct NetdevRegistry {
    ctors: Mutex<HashMap<String, Ctor>>,
    hub: Arc<dummy::DummyHub>,
}

impl NetdevRegistry {
    pub fn new() -> Self {
        let hub = Arc::new(dummy::DummyHub::new());
        let mut ctors: HashMap<String, Ctor> = HashMap::new();
        let for_ctor = Arc::clone(&hub);
        ctors.insert(
            dummy::DUMMY_TYPE.to_string(),
            Box::new(move |name| for_ctor.open(name)),
        );
        NetdevRegistry {
            ctors: Mutex::new(ctors),
            hub,
        }
    }

    /// Register a backend for `ty`. Replaces any previous registration.
    pub fn register(
        &self,
        ty: &str,
        ctor: impl Fn(&str) -> Result<Box<dyn NetDev>> + Send + Sync + 'static,
    ) {
        self.ctors.lock().insert(ty.to_string(), Box::new(ctor));
    }

    pub fn open(&self, name: &str, ty: &str) -> Result<Box<dyn NetDev>> {
        match self.ctors.lock().get(ty) {
            Some(ctor) => ctor(name),
            None => Err(DpError::Unsupported("no netdev backend for port type")),
        }
    }

    /// Control handle for the dummy device `name`, creating it on first
    /// use. Lets tests and the dummy class inject and observe frames.
    pub fn dummy_handle(&self, name: &str) -> Result<dummy::DummyHandle> {
        self.hub.handle(name)
    }
}

impl Default for NetdevRegistry {
    fn default() -> Self {
        NetdevRegistry::new()
    }
}
