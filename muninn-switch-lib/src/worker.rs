//! The threaded-mode ingress worker.
//!
//! One worker serves every threaded datapath of a registry. Each pass it
//! rebuilds the poll set from the current port tables (taking each port
//! lock briefly), sleeps in poll for up to two seconds, and drains a
//! bounded batch from every readable port. Fatal signals are masked here
//! so only the host's main thread observes them; the host stops the
//! worker through a shutdown pipe and joins it.

use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, error, warn};

use crate::datapath::Datapath;
use crate::dpif::RegistryInner;
use crate::error::Result;

const WORKER_POLL_TIMEOUT: Duration = Duration::from_millis(2000);

pub(crate) struct WorkerHandle {
    thread: JoinHandle<()>,
    shutdown_tx: pipe::Sender,
}

impl WorkerHandle {
    /// Ask the worker to exit at its next poll boundary and wait for it.
    pub(crate) fn stop(mut self) {
        let _ = self.shutdown_tx.write(&[0]);
        let _ = self.thread.join();
    }
}

pub(crate) fn spawn(inner: Arc<RegistryInner>) -> Result<WorkerHandle> {
    let (shutdown_tx, shutdown_rx) = pipe::new()?;
    let thread = thread::Builder::new()
        .name("muninn-dp-worker".to_string())
        .spawn(move || worker_main(&inner, &shutdown_rx))?;
    Ok(WorkerHandle {
        thread,
        shutdown_tx,
    })
}

fn worker_main(inner: &RegistryInner, shutdown_rx: &pipe::Receiver) {
    mask_fatal_signals();
    let shutdown_fd = shutdown_rx.as_raw_fd();
    debug!("ingress worker running");

    loop {
        // The fd list must hold still for the poll below; rebuild it from
        // scratch each pass under the port locks.
        let mut sources: Vec<(Arc<Datapath>, u16, RawFd)> = Vec::new();
        for dp in inner.snapshot_datapaths() {
            for (port_no, fd) in dp.pollable_ports() {
                sources.push((Arc::clone(&dp), port_no, fd));
            }
        }

        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                error!("worker cannot create poll set: {err}");
                thread::sleep(WORKER_POLL_TIMEOUT);
                continue;
            }
        };
        if let Err(err) =
            poll.registry()
                .register(&mut SourceFd(&shutdown_fd), Token(0), Interest::READABLE)
        {
            error!("worker cannot watch its shutdown pipe: {err}");
            return;
        }
        for (i, (_, _, fd)) in sources.iter().enumerate() {
            if let Err(err) =
                poll.registry()
                    .register(&mut SourceFd(fd), Token(i + 1), Interest::READABLE)
            {
                warn!(fd, "worker failed to watch port fd: {err}");
            }
        }

        let mut events = Events::with_capacity(sources.len() + 8);
        if let Err(err) = poll.poll(&mut events, Some(WORKER_POLL_TIMEOUT)) {
            if err.kind() != std::io::ErrorKind::Interrupted {
                warn!("worker poll failed: {err}");
            }
            continue;
        }

        let mut shutdown = false;
        for event in events.iter() {
            match event.token() {
                Token(0) => shutdown = true,
                Token(i) => {
                    if let Some((dp, port_no, _)) = sources.get(i - 1) {
                        dp.dispatch_port(*port_no);
                    }
                }
            }
        }
        if shutdown {
            debug!("ingress worker exiting");
            return;
        }
    }
}

/// Fatal signals belong to the main thread; the worker never sees them.
fn mask_fatal_signals() {
    let mut mask = SigSet::empty();
    for sig in [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGALRM,
    ] {
        mask.add(sig);
    }
    if let Err(err) = mask.thread_block() {
        warn!("worker failed to mask signals: {err}");
    }
}
