//! Datapath classes, the name registry, and client handles.
//!
//! A [`DpRegistry`] is the explicit home of everything a process shares:
//! the class table, the name-to-datapath map, the netdev backends, and
//! the threaded-mode worker. Hosts create one at startup and drop it at
//! shutdown; tests create their own and nothing leaks between them.
//!
//! A [`Dpif`] is one client's handle onto a datapath. Handles are cheap;
//! several can share a datapath, which stays alive until the last handle
//! closes after destruction was requested.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::datapath::{Datapath, DpMode, DpifStats, PutFlags};
use crate::error::{DpError, Result};
use crate::flow::{DumpCursor, FlowStats};
use crate::netdev::NetdevRegistry;
use crate::netdev::dummy::DummyHandle;
use crate::poller::Poller;
use crate::port::PortInfo;
use crate::upcall::Upcall;
use crate::worker;

/// The class tag of the real userspace datapath.
pub const CLASS_NETDEV: &str = "netdev";
/// The class tag of the testing variant.
pub const CLASS_DUMMY: &str = "dummy";

/// A registered datapath variant: a type tag plus whether it behaves as
/// the testing class. The dummy variant is the real implementation with
/// the tag overridden.
#[derive(Debug, Clone)]
struct DpClass {
    dummy: bool,
}

struct DpEntry {
    dp: Arc<Datapath>,
    open_count: usize,
}

pub(crate) struct RegistryInner {
    classes: Mutex<HashMap<String, DpClass>>,
    datapaths: Mutex<HashMap<String, DpEntry>>,
    netdevs: Arc<NetdevRegistry>,
    mode: DpMode,
    worker: Mutex<Option<worker::WorkerHandle>>,
}

impl RegistryInner {
    /// Arcs of every threaded datapath, for the worker's poll pass.
    pub(crate) fn snapshot_datapaths(&self) -> Vec<Arc<Datapath>> {
        self.datapaths
            .lock()
            .values()
            .filter(|e| e.dp.mode() == DpMode::Threaded)
            .map(|e| Arc::clone(&e.dp))
            .collect()
    }
}

/// Owner of all datapaths in a process (or a test).
pub struct DpRegistry {
    inner: Arc<RegistryInner>,
}

impl DpRegistry {
    /// A registry whose datapaths run cooperatively.
    pub fn new() -> Self {
        DpRegistry::with_mode(DpMode::Cooperative)
    }

    /// A registry whose datapaths run in `mode`. Threaded registries spawn
    /// their ingress worker on the first datapath open.
    pub fn with_mode(mode: DpMode) -> Self {
        let mut classes = HashMap::new();
        classes.insert(CLASS_NETDEV.to_string(), DpClass { dummy: false });
        DpRegistry {
            inner: Arc::new(RegistryInner {
                classes: Mutex::new(classes),
                datapaths: Mutex::new(HashMap::new()),
                netdevs: Arc::new(NetdevRegistry::new()),
                mode,
                worker: Mutex::new(None),
            }),
        }
    }

    /// The netdev backends this registry's datapaths open ports through.
    /// Hosts register their real device implementations here.
    pub fn netdevs(&self) -> Arc<NetdevRegistry> {
        Arc::clone(&self.inner.netdevs)
    }

    /// Control handle for a dummy device, creating it on first use.
    pub fn dummy_netdev(&self, name: &str) -> Result<DummyHandle> {
        self.inner.netdevs.dummy_handle(name)
    }

    /// Register the dummy class. With `override_all`, every class already
    /// registered is replaced by the dummy behavior under its own tag, so
    /// a host built for real devices runs entirely in-memory.
    pub fn enable_dummy(&self, override_all: bool) {
        let mut classes = self.inner.classes.lock();
        if override_all {
            for class in classes.values_mut() {
                class.dummy = true;
            }
        }
        classes.insert(CLASS_DUMMY.to_string(), DpClass { dummy: true });
        debug!(override_all, "dummy datapath class enabled");
    }

    /// Names of the datapaths of class `ty`.
    pub fn enumerate(&self, ty: &str) -> Vec<String> {
        self.inner
            .datapaths
            .lock()
            .values()
            .filter(|e| e.dp.class() == ty)
            .map(|e| e.dp.name().to_string())
            .collect()
    }

    /// Open a handle onto the datapath `name` of class `ty`.
    ///
    /// With `create` the datapath must not exist yet and is created;
    /// without it the datapath must exist already. Opening an existing
    /// datapath under a different class tag is invalid.
    pub fn open(&self, name: &str, ty: &str, create: bool) -> Result<Dpif> {
        let class = self
            .inner
            .classes
            .lock()
            .get(ty)
            .cloned()
            .ok_or(DpError::Unsupported("unknown datapath class"))?;

        let dp = {
            let mut dps = self.inner.datapaths.lock();
            match dps.get_mut(name) {
                Some(entry) => {
                    if create {
                        return Err(DpError::Exists);
                    }
                    if entry.dp.class() != ty {
                        return Err(DpError::Invalid(format!(
                            "datapath {name} has class {}, not {ty}",
                            entry.dp.class()
                        )));
                    }
                    entry.open_count += 1;
                    Arc::clone(&entry.dp)
                }
                None => {
                    if !create {
                        return Err(DpError::NotFound);
                    }
                    let dp = Datapath::create(
                        name,
                        ty,
                        class.dummy,
                        self.inner.mode,
                        Arc::clone(&self.inner.netdevs),
                    )?;
                    dps.insert(
                        name.to_string(),
                        DpEntry {
                            dp: Arc::clone(&dp),
                            open_count: 1,
                        },
                    );
                    dp
                }
            }
        };

        if self.inner.mode == DpMode::Threaded {
            self.ensure_worker()?;
        }

        let last_serial = dp.port_serial();
        Ok(Dpif {
            inner: Arc::clone(&self.inner),
            class: ty.to_string(),
            listening: false,
            last_serial,
            dp,
        })
    }

    fn ensure_worker(&self) -> Result<()> {
        let mut slot = self.inner.worker.lock();
        if slot.is_none() {
            *slot = Some(worker::spawn(Arc::clone(&self.inner))?);
        }
        Ok(())
    }
}

impl Default for DpRegistry {
    fn default() -> Self {
        DpRegistry::new()
    }
}

impl Drop for DpRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.worker.lock().take() {
            handle.stop();
        }
    }
}

/// One flow yielded by a dump.
#[derive(Debug, Clone)]
pub struct FlowDumpEntry {
    pub key: Vec<u8>,
    pub actions: Bytes,
    pub stats: FlowStats,
}

/// Cursor-driven flow iteration. The table may change between calls to
/// `next`; entries touched concurrently may appear once, twice, or not at
/// all, but iteration always terminates.
pub struct FlowDump {
    dp: Arc<Datapath>,
    cursor: DumpCursor,
}

impl Iterator for FlowDump {
    type Item = FlowDumpEntry;

    fn next(&mut self) -> Option<FlowDumpEntry> {
        let (key, actions, stats, next) = self.dp.flow_dump_next(self.cursor)?;
        self.cursor = next;
        Some(FlowDumpEntry {
            key,
            actions,
            stats,
        })
    }
}

/// A client handle onto one datapath.
pub struct Dpif {
    inner: Arc<RegistryInner>,
    dp: Arc<Datapath>,
    class: String,
    listening: bool,
    last_serial: u64,
}

impl Dpif {
    pub fn name(&self) -> &str {
        self.dp.name()
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn mode(&self) -> DpMode {
        self.dp.mode()
    }

    /// One cooperative ingress pass. No-op on threaded datapaths.
    pub fn run(&self) {
        self.dp.run();
    }

    /// Register ingress fds with the host poll set. No-op on threaded
    /// datapaths.
    pub fn wait(&self, poller: &mut Poller) {
        self.dp.wait(poller);
    }

    pub fn stats(&self) -> DpifStats {
        self.dp.stats()
    }

    /// Attach an interface. `requested` pins the port number; otherwise one
    /// is chosen from the name.
    pub fn port_add(&self, name: &str, ty: &str, requested: Option<u16>) -> Result<u16> {
        self.dp.add_port(name, ty, requested)
    }

    pub fn port_del(&self, port_no: u16) -> Result<()> {
        self.dp.del_port(port_no)
    }

    pub fn port_query_by_number(&self, port_no: u16) -> Result<PortInfo> {
        self.dp.port_query_by_number(port_no)
    }

    pub fn port_query_by_name(&self, name: &str) -> Result<PortInfo> {
        self.dp.port_query_by_name(name)
    }

    pub fn port_dump(&self) -> Vec<PortInfo> {
        self.dp.port_dump()
    }

    /// True when ports changed since this handle last asked. A change may
    /// be observed one poll late; it is never lost.
    pub fn port_poll(&mut self) -> bool {
        let serial = self.dp.port_serial();
        if serial != self.last_serial {
            self.last_serial = serial;
            true
        } else {
            false
        }
    }

    pub fn port_poll_wait(&self, poller: &mut Poller) {
        if self.dp.port_serial() != self.last_serial {
            poller.immediate_wake();
        }
    }

    pub fn flow_get(&self, key: &[u8]) -> Result<(Bytes, FlowStats)> {
        self.dp.flow_get(key)
    }

    pub fn flow_put(
        &self,
        flags: PutFlags,
        key: &[u8],
        actions: &[u8],
    ) -> Result<Option<FlowStats>> {
        self.dp.flow_put(flags, key, actions)
    }

    pub fn flow_del(&self, key: &[u8]) -> Result<FlowStats> {
        self.dp.flow_del(key)
    }

    pub fn flow_flush(&self) {
        self.dp.flow_flush()
    }

    pub fn flow_dump(&self) -> FlowDump {
        FlowDump {
            dp: Arc::clone(&self.dp),
            cursor: DumpCursor::default(),
        }
    }

    /// Run an action program over a supplied frame, outside any flow.
    pub fn execute(&self, frame: &[u8], actions: &[u8]) -> Result<()> {
        self.dp.execute(frame, actions)
    }

    /// Enable or disable upcall reception on this handle.
    pub fn recv_set(&mut self, enable: bool) {
        self.listening = enable;
    }

    /// The oldest queued upcall; `Again` when the queues are empty or this
    /// handle is not listening.
    pub fn recv(&mut self) -> Result<Upcall> {
        if !self.listening {
            return Err(DpError::Again);
        }
        self.dp.recv_upcall()
    }

    pub fn recv_wait(&self, poller: &mut Poller) {
        if self.listening {
            self.dp.recv_wait(poller);
        }
    }

    pub fn recv_purge(&self) {
        self.dp.purge_upcalls();
    }

    /// Mark the datapath for deletion. It disappears from the registry when
    /// the last handle closes.
    pub fn destroy(&self) {
        self.dp.set_destroyed();
        debug!(datapath = self.dp.name(), "destroy requested");
    }

    /// Release this handle. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for Dpif {
    fn drop(&mut self) {
        let mut dps = self.inner.datapaths.lock();
        if let Some(entry) = dps.get_mut(self.dp.name()) {
            // Guard against a same-named datapath created after ours was
            // removed.
            if !Arc::ptr_eq(&entry.dp, &self.dp) {
                return;
            }
            entry.open_count -= 1;
            if entry.open_count == 0 && entry.dp.is_destroyed() {
                let name = self.dp.name().to_string();
                dps.remove(&name);
                info!(datapath = %name, "datapath freed");
            }
        }
    }
}
