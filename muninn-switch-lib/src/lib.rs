#![forbid(unsafe_code)]

pub mod actions;
pub mod config;
pub mod datapath;
pub mod dpif;
pub mod error;
pub mod flow;
pub mod netdev;
pub mod packet;
pub mod poller;
pub mod port;
pub mod telemetry;
pub mod time;
pub mod upcall;
pub mod wire;

mod worker;

pub use config::load_from_path;
pub use datapath::{DpMode, DpifStats, PutFlags};
pub use dpif::{CLASS_DUMMY, CLASS_NETDEV, DpRegistry, Dpif, FlowDump, FlowDumpEntry};
pub use error::{DpError, Result};
pub use flow::{FlowKey, FlowStats};
pub use poller::Poller;
pub use upcall::{Upcall, UpcallKind};
