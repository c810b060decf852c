use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds on a monotonic clock anchored at first use.
///
/// Flow `used` timestamps are expressed on this clock; they are comparable
/// within a process but carry no wall-clock meaning.
pub fn monotonic_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}
