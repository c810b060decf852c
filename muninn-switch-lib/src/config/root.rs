use serde::Deserialize;

use crate::datapath::DpMode;

/// Host daemon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// The datapath this host creates at startup
    pub datapath: DatapathConfig,
    /// Interfaces attached after creation
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatapathConfig {
    /// Datapath name, e.g. "dp0"
    pub name: String,
    /// Datapath class tag
    /// Default: "dummy" (the only class with a built-in device backend)
    #[serde(default = "default_class")]
    pub class: String,
    /// Ingress mode: "cooperative" (host poll loop) or "threaded"
    /// (dedicated worker thread)
    #[serde(default)]
    pub mode: Mode,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Cooperative,
    Threaded,
}

impl From<Mode> for DpMode {
    fn from(mode: Mode) -> DpMode {
        match mode {
            Mode::Cooperative => DpMode::Cooperative,
            Mode::Threaded => DpMode::Threaded,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortConfig {
    /// Interface name
    pub name: String,
    /// Port type tag
    /// Default: "system"
    #[serde(default = "default_port_type", rename = "type")]
    pub ty: String,
    /// Requested port number (1..255); chosen from the name when absent
    #[serde(default)]
    pub port_no: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level filter, overridable with RUST_LOG
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Include the module path in log lines
    /// Default: false
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            show_target: false,
        }
    }
}

fn default_class() -> String {
    "dummy".to_string()
}

fn default_port_type() -> String {
    "system".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
