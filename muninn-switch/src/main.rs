#![forbid(unsafe_code)]

use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use muninn_switch_lib::config::{self, Config};
use muninn_switch_lib::telemetry::init_tracing;
use muninn_switch_lib::{CLASS_DUMMY, DpError, DpMode, DpRegistry, Poller};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about = "Muninn userspace datapath host")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "demos/muninn.toml"
    )]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    match config::load_from_path(&cli.config) {
        Ok(cfg) => {
            init_tracing(&cfg.logging.level, cfg.logging.show_target);
            info!(
                datapath = %cfg.datapath.name,
                ports = cfg.ports.len(),
                "configuration loaded"
            );
            if let Err(err) = run(&cfg) {
                error!(%err, "datapath host exited with error");
                std::process::exit(1);
            }
        }
        Err(err) => {
            init_tracing("info", false);
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    }
}

fn run(cfg: &Config) -> muninn_switch_lib::Result<()> {
    let mode = DpMode::from(cfg.datapath.mode);
    let registry = DpRegistry::with_mode(mode);
    if cfg.datapath.class == CLASS_DUMMY {
        registry.enable_dummy(false);
    }

    let mut dpif = registry.open(&cfg.datapath.name, &cfg.datapath.class, true)?;
    for port in &cfg.ports {
        let port_no = dpif.port_add(&port.name, &port.ty, port.port_no)?;
        info!(port = port_no, name = %port.name, ty = %port.ty, "attached port");
    }
    dpif.recv_set(true);

    // Fatal signals arrive on an fd so the poll loop below is the only
    // suspension point. The ingress worker (threaded mode) masks the same
    // set and never observes them.
    let mut mask = SigSet::empty();
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        mask.add(sig);
    }
    mask.thread_block().map_err(to_io)?;
    let mut sfd =
        SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(to_io)?;
    let signal_fd = sfd.as_fd().as_raw_fd();

    info!(datapath = %cfg.datapath.name, ?mode, "datapath running");
    loop {
        dpif.run();
        while let Ok(upcall) = dpif.recv() {
            // A real controller would install a flow here; the host just
            // reports what came up.
            info!(
                kind = ?upcall.kind,
                bytes = upcall.packet.len(),
                "upcall received"
            );
        }

        let mut poller = Poller::new()?;
        dpif.wait(&mut poller);
        dpif.recv_wait(&mut poller);
        poller.watch_fd(signal_fd);
        poller.poll(Some(Duration::from_millis(500)))?;

        if let Ok(Some(siginfo)) = sfd.read_signal() {
            info!(signal = siginfo.ssi_signo, "shutting down");
            break;
        }
    }

    dpif.destroy();
    dpif.close();
    // Dropping the registry stops and joins the ingress worker.
    Ok(())
}

fn to_io(err: nix::errno::Errno) -> DpError {
    DpError::Io(err.into())
}
