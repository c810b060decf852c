//! Tracing setup and log rate limiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides `log_level` when set. Safe to call more than once;
/// later calls are ignored (tests share one subscriber).
pub fn init_tracing(log_level: &str, show_target: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(show_target)
        .try_init();
}

/// Interval-based limiter for log statements on hot paths.
///
/// The ingress loop can hit the same error thousands of times per second;
/// callers gate their `error!`/`warn!` behind [`LogLimiter::allow`], which
/// passes at most one event per interval and reports how many were
/// suppressed since the last one that passed.
///
/// ```ignore
/// static RX_ERR: LogLimiter = LogLimiter::new(Duration::from_secs(5));
///
/// if let Some(suppressed) = RX_ERR.allow() {
///     error!(port = port_no, suppressed, "receive failed: {err}");
/// }
/// ```
pub struct LogLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogLimiter {
    pub const fn new(interval: Duration) -> Self {
        LogLimiter {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed_count)` when the caller may log, `None` when
    /// the event falls inside the quiet interval.
    pub fn allow(&self) -> Option<u64> {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}
