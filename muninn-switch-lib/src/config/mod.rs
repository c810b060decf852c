mod loader;
mod root;

pub use loader::load_from_path;
pub use root::{Config, DatapathConfig, LoggingConfig, Mode, PortConfig};
