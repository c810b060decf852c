use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{DpError, Result};
use crate::port::MAX_PORTS;

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| DpError::Invalid(format!("failed to read config file: {e}")))?;
    let cfg: Config =
        toml::from_str(&txt).map_err(|e| DpError::Invalid(format!("failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.datapath.name.is_empty() {
        return Err(DpError::Invalid("datapath name must not be empty".into()));
    }

    let mut names = HashSet::new();
    for port in &cfg.ports {
        if !names.insert(port.name.as_str()) {
            return Err(DpError::Invalid(format!(
                "port {} is configured twice",
                port.name
            )));
        }
        if port.name == cfg.datapath.name {
            return Err(DpError::Invalid(format!(
                "port {} collides with the local port",
                port.name
            )));
        }
        match port.port_no {
            Some(0) => {
                return Err(DpError::Invalid(format!(
                    "port {}: number 0 is reserved for the local port",
                    port.name
                )));
            }
            Some(n) if n as usize >= MAX_PORTS => {
                return Err(DpError::Invalid(format!(
                    "port {}: number {n} out of range",
                    port.name
                )));
            }
            _ => {}
        }
    }

    Ok(())
}
