//! The datapath engine: ports, flows, queues, and the per-packet slow path.
//!
//! Locking is two mutexes per datapath: one over the port table and one
//! over the flow table, upcall rings, and counters together. When both are
//! held the port lock is taken first. Neither is held across netdev I/O
//! other than non-blocking receives, and the self-pipe is the only I/O
//! done under the flow lock.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use mio::unix::pipe;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::actions::{self, ActionSink};
use crate::error::{DpError, Result};
use crate::flow::wire::{decode_key, encode_key};
use crate::flow::{DumpCursor, FlowKey, FlowStats, FlowTable, WIRE_PORT_NONE, extract, tcp_flags};
use crate::netdev::NetdevRegistry;
use crate::packet::{ETH_HEADER_LEN, Packet};
use crate::poller::Poller;
use crate::port::{LOCAL_PORT, MAX_PORTS, Port, PortInfo, PortTable};
use crate::telemetry::LogLimiter;
use crate::time::monotonic_ms;
use crate::upcall::{Upcall, UpcallKind, UpcallQueues};

/// Frames handed to one port's dispatch callback per worker wakeup.
pub const DISPATCH_BATCH: usize = 50;

const RECV_BUF_LEN: usize = 65536;

static RX_LOG: LogLimiter = LogLimiter::new(Duration::from_secs(5));
static TX_LOG: LogLimiter = LogLimiter::new(Duration::from_secs(5));
static PIPE_LOG: LogLimiter = LogLimiter::new(Duration::from_secs(5));

/// How a datapath runs its ingress side, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpMode {
    /// The host drives ingress by calling run/wait from its poll loop.
    Cooperative,
    /// A worker thread polls every port; run/wait are no-ops.
    Threaded,
}

/// Aggregate counters reported by the stats operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DpifStats {
    pub n_hit: u64,
    pub n_missed: u64,
    pub n_lost: u64,
    pub n_flows: u64,
}

/// What a flow put may do.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutFlags {
    /// Insert the flow when absent.
    pub create: bool,
    /// Replace the actions when present.
    pub modify: bool,
    /// Reset the counters of a modified flow.
    pub zero_stats: bool,
}

impl PutFlags {
    pub const CREATE: PutFlags = PutFlags {
        create: true,
        modify: false,
        zero_stats: false,
    };
    pub const MODIFY: PutFlags = PutFlags {
        create: false,
        modify: true,
        zero_stats: false,
    };
    pub const UPSERT: PutFlags = PutFlags {
        create: true,
        modify: true,
        zero_stats: false,
    };
}

#[derive(Default)]
struct Counters {
    n_hit: u64,
    n_missed: u64,
    n_lost: u64,
}

/// Everything guarded by the flow mutex. The upcall rings and the read end
/// of the wake pipe live here so a wake byte is never observable before
/// the record it announces.
struct FlowState {
    table: FlowTable,
    queues: UpcallQueues,
    counters: Counters,
    wake_rx: pipe::Receiver,
}

pub struct Datapath {
    name: String,
    class: String,
    dummy_class: bool,
    mode: DpMode,
    destroyed: AtomicBool,
    /// Bumped under the port lock on every add or delete; read without it.
    port_serial: AtomicU64,
    ports: Mutex<PortTable>,
    flow: Mutex<FlowState>,
    wake_tx: Mutex<pipe::Sender>,
    wake_fd: RawFd,
    netdevs: Arc<NetdevRegistry>,
}

impl Datapath {
    pub(crate) fn create(
        name: &str,
        class: &str,
        dummy_class: bool,
        mode: DpMode,
        netdevs: Arc<NetdevRegistry>,
    ) -> Result<Arc<Self>> {
        let (wake_tx, wake_rx) = pipe::new()?;
        let wake_fd = wake_rx.as_raw_fd();
        let dp = Arc::new(Datapath {
            name: name.to_string(),
            class: class.to_string(),
            dummy_class,
            mode,
            destroyed: AtomicBool::new(false),
            port_serial: AtomicU64::new(0),
            ports: Mutex::new(PortTable::new()),
            flow: Mutex::new(FlowState {
                table: FlowTable::new(),
                queues: UpcallQueues::new(),
                counters: Counters::default(),
                wake_rx,
            }),
            wake_tx: Mutex::new(wake_tx),
            wake_fd,
            netdevs,
        });

        {
            let mut ports = dp.ports.lock();
            dp.install_port(&mut ports, LOCAL_PORT, name, "internal")?;
        }
        info!(datapath = name, class, ?mode, "created datapath");
        Ok(dp)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn mode(&self) -> DpMode {
        self.mode
    }

    pub(crate) fn set_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn port_serial(&self) -> u64 {
        self.port_serial.load(Ordering::Acquire)
    }

    fn bump_serial(&self) {
        self.port_serial.fetch_add(1, Ordering::Release);
    }

    /// The type tag actually opened for a port. The dummy class swaps every
    /// type for the in-memory backend.
    fn resolve_type<'a>(&self, ty: &'a str) -> &'a str {
        if self.dummy_class {
            crate::netdev::dummy::DUMMY_TYPE
        } else {
            ty
        }
    }

    fn install_port(&self, ports: &mut PortTable, port_no: u16, name: &str, ty: &str) -> Result<()> {
        let mut netdev = self.netdevs.open(name, self.resolve_type(ty))?;
        match netdev.listen() {
            Ok(()) => {}
            Err(DpError::Unsupported(_)) if self.dummy_class => {}
            Err(err) => return Err(err),
        }
        netdev.set_promisc(true)?;
        ports.insert(Port {
            port_no,
            name: name.to_string(),
            ty: ty.to_string(),
            netdev,
        })?;
        self.bump_serial();
        debug!(datapath = %self.name, port = port_no, name, ty, "added port");
        Ok(())
    }

    pub(crate) fn add_port(&self, name: &str, ty: &str, requested: Option<u16>) -> Result<u16> {
        let mut ports = self.ports.lock();
        if ports.by_name(name).is_some() {
            return Err(DpError::Exists);
        }
        let port_no = match requested {
            Some(LOCAL_PORT) => {
                return Err(DpError::Invalid(
                    "port 0 is reserved for the local port".into(),
                ));
            }
            Some(n) if n as usize >= MAX_PORTS => {
                return Err(DpError::Invalid(format!("port number {n} out of range")));
            }
            Some(n) => {
                if ports.get(n).is_some() {
                    return Err(DpError::Busy);
                }
                n
            }
            None => ports.choose_port_no(name)?,
        };
        self.install_port(&mut ports, port_no, name, ty)?;
        Ok(port_no)
    }

    pub(crate) fn del_port(&self, port_no: u16) -> Result<()> {
        if port_no == LOCAL_PORT {
            return Err(DpError::Invalid(
                "the local port lives as long as the datapath".into(),
            ));
        }
        let mut ports = self.ports.lock();
        ports.remove(port_no).ok_or(DpError::NotFound)?;
        self.bump_serial();
        debug!(datapath = %self.name, port = port_no, "deleted port");
        Ok(())
    }

    pub(crate) fn port_query_by_number(&self, port_no: u16) -> Result<PortInfo> {
        let ports = self.ports.lock();
        ports.get(port_no).map(PortInfo::from).ok_or(DpError::NotFound)
    }

    pub(crate) fn port_query_by_name(&self, name: &str) -> Result<PortInfo> {
        let ports = self.ports.lock();
        ports.by_name(name).map(PortInfo::from).ok_or(DpError::NotFound)
    }

    pub(crate) fn port_dump(&self) -> Vec<PortInfo> {
        let ports = self.ports.lock();
        ports.iter().map(PortInfo::from).collect()
    }

    pub(crate) fn stats(&self) -> DpifStats {
        let fs = self.flow.lock();
        DpifStats {
            n_hit: fs.counters.n_hit,
            n_missed: fs.counters.n_missed,
            n_lost: fs.counters.n_lost,
            n_flows: fs.table.len() as u64,
        }
    }

    pub(crate) fn flow_get(&self, key_bytes: &[u8]) -> Result<(Bytes, FlowStats)> {
        let key = decode_key(key_bytes)?;
        let fs = self.flow.lock();
        let entry = fs.table.lookup(&key).ok_or(DpError::NotFound)?;
        Ok((entry.actions.clone(), entry.stats))
    }

    /// Install or replace a flow. Returns the pre-modification stats when an
    /// existing flow was replaced.
    pub(crate) fn flow_put(
        &self,
        flags: PutFlags,
        key_bytes: &[u8],
        actions_bytes: &[u8],
    ) -> Result<Option<FlowStats>> {
        let key = decode_key(key_bytes)?;
        key.validate_in_port()?;
        actions::validate(actions_bytes)?;
        let actions = Bytes::copy_from_slice(actions_bytes);

        let mut fs = self.flow.lock();
        if fs.table.lookup(&key).is_some() {
            if !flags.modify {
                return Err(DpError::Exists);
            }
            let old = fs.table.modify(&key, actions, flags.zero_stats)?;
            Ok(Some(old))
        } else {
            if !flags.create {
                return Err(DpError::NotFound);
            }
            fs.table.insert(key, actions)?;
            Ok(None)
        }
    }

    pub(crate) fn flow_del(&self, key_bytes: &[u8]) -> Result<FlowStats> {
        let key = decode_key(key_bytes)?;
        let mut fs = self.flow.lock();
        fs.table.remove(&key)
    }

    pub(crate) fn flow_flush(&self) {
        let mut fs = self.flow.lock();
        fs.table.flush();
    }

    pub(crate) fn flow_dump_next(
        &self,
        cursor: DumpCursor,
    ) -> Option<(Vec<u8>, Bytes, FlowStats, DumpCursor)> {
        let fs = self.flow.lock();
        fs.table
            .dump_next(cursor)
            .map(|(entry, next)| (encode_key(&entry.key), entry.actions.clone(), entry.stats, next))
    }

    /// Run a one-off action program over a caller-supplied frame.
    pub(crate) fn execute(&self, frame: &[u8], actions_bytes: &[u8]) -> Result<()> {
        if frame.len() < ETH_HEADER_LEN {
            return Err(DpError::Invalid(
                "frame shorter than an Ethernet header".into(),
            ));
        }
        actions::validate(actions_bytes)?;
        let Some(key) = extract(frame, WIRE_PORT_NONE) else {
            return Err(DpError::Invalid("unparseable frame".into()));
        };
        let mut packet = Packet::from_frame(frame);
        let mut sink = DpSink { dp: self, key: &key };
        actions::execute(&mut packet, actions_bytes, &mut sink);
        Ok(())
    }

    /// The per-frame slow path: extract, look up, act or queue an upcall.
    pub(crate) fn process_packet(&self, port_no: u16, frame: &[u8]) {
        if frame.len() < ETH_HEADER_LEN {
            return;
        }
        let Some(key) = extract(frame, u32::from(port_no)) else {
            return;
        };
        let flags = tcp_flags(frame, &key);

        let mut fs = self.flow.lock();
        match fs.table.lookup_mut(&key) {
            Some(entry) => {
                entry.record_hit(monotonic_ms(), frame.len(), flags);
                let actions = entry.actions.clone();
                fs.counters.n_hit += 1;
                // Execution takes the port lock for outputs; the flow lock
                // must already be gone by then.
                drop(fs);
                let mut packet = Packet::from_frame(frame);
                let mut sink = DpSink { dp: self, key: &key };
                actions::execute(&mut packet, &actions, &mut sink);
            }
            None => {
                fs.counters.n_missed += 1;
                let upcall = Upcall {
                    kind: UpcallKind::Miss,
                    key: encode_key(&key),
                    userdata: None,
                    packet: frame.to_vec(),
                };
                self.enqueue_upcall(&mut fs, upcall);
            }
        }
    }

    fn enqueue_upcall(&self, fs: &mut FlowState, upcall: Upcall) {
        match fs.queues.enqueue(upcall) {
            Ok(()) => {
                if self.mode == DpMode::Threaded {
                    // Written with the flow lock held: the reader cannot see
                    // the wake before the record.
                    if let Err(err) = self.wake_tx.lock().write(&[0]) {
                        if err.kind() != ErrorKind::WouldBlock {
                            if let Some(suppressed) = PIPE_LOG.allow() {
                                warn!(
                                    datapath = %self.name,
                                    suppressed,
                                    "upcall wake write failed: {err}"
                                );
                            }
                        }
                    }
                }
            }
            Err(_) => fs.counters.n_lost += 1,
        }
    }

    pub(crate) fn recv_upcall(&self) -> Result<Upcall> {
        let mut fs = self.flow.lock();
        match fs.queues.dequeue() {
            Some(upcall) => {
                if self.mode == DpMode::Threaded {
                    let mut byte = [0u8; 1];
                    let _ = fs.wake_rx.read(&mut byte);
                }
                Ok(upcall)
            }
            None => Err(DpError::Again),
        }
    }

    pub(crate) fn recv_wait(&self, poller: &mut Poller) {
        let fs = self.flow.lock();
        if !fs.queues.is_empty() {
            poller.immediate_wake();
        } else if self.mode == DpMode::Threaded {
            poller.watch_fd(self.wake_fd);
        }
    }

    pub(crate) fn purge_upcalls(&self) {
        let mut fs = self.flow.lock();
        let dropped = fs.queues.purge();
        if self.mode == DpMode::Threaded {
            let mut buf = [0u8; 64];
            while matches!(fs.wake_rx.read(&mut buf), Ok(n) if n > 0) {}
        }
        if dropped > 0 {
            debug!(datapath = %self.name, dropped, "purged upcall queues");
        }
    }

    /// One cooperative ingress pass: a single non-blocking receive per
    /// port. No-op for threaded datapaths.
    pub(crate) fn run(&self) {
        if self.mode == DpMode::Threaded {
            return;
        }
        let mut batch: Vec<(u16, Vec<u8>)> = Vec::new();
        {
            let mut ports = self.ports.lock();
            let mut buf = vec![0u8; RECV_BUF_LEN];
            for port in ports.iter_mut() {
                match port.netdev.recv(&mut buf) {
                    Ok(n) => batch.push((port.port_no, buf[..n].to_vec())),
                    Err(DpError::Again) => {}
                    Err(err) => {
                        if let Some(suppressed) = RX_LOG.allow() {
                            error!(
                                datapath = %self.name,
                                port = port.port_no,
                                suppressed,
                                "receive failed: {err}"
                            );
                        }
                    }
                }
            }
        }
        for (port_no, frame) in batch {
            self.process_packet(port_no, &frame);
        }
    }

    /// Register every port's fd with the host poll set. No-op for threaded
    /// datapaths.
    pub(crate) fn wait(&self, poller: &mut Poller) {
        if self.mode == DpMode::Threaded {
            return;
        }
        let ports = self.ports.lock();
        for port in ports.iter() {
            if let Some(fd) = port.netdev.raw_fd() {
                poller.watch_fd(fd);
            }
        }
    }

    /// Snapshot of (port number, fd) pairs for the worker's poll set.
    pub(crate) fn pollable_ports(&self) -> Vec<(u16, RawFd)> {
        let ports = self.ports.lock();
        ports
            .iter()
            .filter_map(|p| p.netdev.raw_fd().map(|fd| (p.port_no, fd)))
            .collect()
    }

    /// Drain up to [`DISPATCH_BATCH`] frames from one port and run each
    /// through the slow path.
    pub(crate) fn dispatch_port(&self, port_no: u16) {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        {
            let mut ports = self.ports.lock();
            let Some(port) = ports.get_mut(port_no) else {
                return;
            };
            let res = port
                .netdev
                .dispatch(DISPATCH_BATCH, &mut |frame| frames.push(frame.to_vec()));
            match res {
                Ok(_) | Err(DpError::Again) => {}
                Err(err) => {
                    if let Some(suppressed) = RX_LOG.allow() {
                        error!(
                            datapath = %self.name,
                            port = port_no,
                            suppressed,
                            "dispatch failed: {err}"
                        );
                    }
                }
            }
        }
        for frame in frames {
            self.process_packet(port_no, &frame);
        }
    }
}

/// Delivery target the interpreter drives while a program runs.
struct DpSink<'a> {
    dp: &'a Datapath,
    key: &'a FlowKey,
}

impl ActionSink for DpSink<'_> {
    fn output(&mut self, port: u32, packet: &Packet) {
        if port as usize >= MAX_PORTS {
            return;
        }
        let mut ports = self.dp.ports.lock();
        // A vanished port is a silent drop, not an error.
        if let Some(target) = ports.get_mut(port as u16) {
            if let Err(err) = target.netdev.send(packet.data()) {
                if let Some(suppressed) = TX_LOG.allow() {
                    warn!(
                        datapath = %self.dp.name,
                        port,
                        suppressed,
                        "transmit failed: {err}"
                    );
                }
            }
        }
    }

    fn userspace(&mut self, packet: &Packet, userdata: Option<&[u8]>) {
        let upcall = Upcall {
            kind: UpcallKind::Action,
            key: encode_key(self.key),
            userdata: userdata.map(<[u8]>::to_vec),
            packet: packet.data().to_vec(),
        };
        let mut fs = self.dp.flow.lock();
        self.dp.enqueue_upcall(&mut fs, upcall);
    }
}
