//! The host-side poll set for cooperative mode.
//!
//! A `Poller` is built fresh for each pass of the host loop: the wait
//! entry points register whatever fds matter right now, and the host
//! sleeps once. Rebuilding per pass keeps the set consistent with the
//! current port table instead of maintaining registrations incrementally.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::warn;

pub struct Poller {
    poll: Poll,
    events: Events,
    fds: Vec<RawFd>,
    immediate: bool,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            fds: Vec::new(),
            immediate: false,
        })
    }

    /// Make the next [`poll`](Poller::poll) return without sleeping.
    pub fn immediate_wake(&mut self) {
        self.immediate = true;
    }

    /// Watch `fd` for readability. Duplicates are ignored; a registration
    /// failure downgrades to a warning since the worst case is a missed
    /// sleep.
    pub fn watch_fd(&mut self, fd: RawFd) {
        if self.fds.contains(&fd) {
            return;
        }
        let token = Token(self.fds.len());
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            Ok(()) => self.fds.push(fd),
            Err(err) => warn!(fd, "failed to add fd to poll set: {err}"),
        }
    }

    /// Sleep until an fd is readable, an immediate wake was requested, or
    /// the timeout passes.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = if self.immediate {
            Some(Duration::ZERO)
        } else {
            timeout
        };
        self.immediate = false;
        match self.poll.poll(&mut self.events, timeout) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            other => other,
        }
    }

    /// Fds readable in the last poll.
    pub fn ready_fds(&self) -> Vec<RawFd> {
        self.events
            .iter()
            .filter_map(|e| self.fds.get(e.token().0).copied())
            .collect()
    }
}
