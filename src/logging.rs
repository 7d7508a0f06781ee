use chrono::Local;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

struct LocalTimestamp;

impl FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Initialize the logging system
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(LocalTimestamp)
            .with_target(true)
            .try_init();
    });
}

#[derive(Debug)]
struct ReportWindow {
    last_reported: Instant,
    suppressed: u64,
}

/// Rate limits failure logging per destination.
///
/// A destination is reported at most once per cooldown window; failures inside
/// the window are counted and folded into the next report.
#[derive(Debug)]
pub struct FailureReportLimiter {
    cooldown: Duration,
    windows: Mutex<HashMap<String, ReportWindow>>,
}

impl FailureReportLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(suppressed_count)` when the failure should be logged now.
    pub fn should_report(&self, destination: &str) -> Option<u64> {
        self.should_report_at(destination, Instant::now())
    }

    pub fn should_report_at(&self, destination: &str, now: Instant) -> Option<u64> {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match windows.get_mut(destination) {
            Some(window) if now.saturating_duration_since(window.last_reported) < self.cooldown => {
                window.suppressed += 1;
                None
            }
            Some(window) => {
                let suppressed = window.suppressed;
                window.last_reported = now;
                window.suppressed = 0;
                Some(suppressed)
            }
            None => {
                windows.insert(
                    destination.to_string(),
                    ReportWindow {
                        last_reported: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Log a send failure unless this destination already reported one recently.
    pub fn report_send_failure(&self, destination: &str, what: &str, error: &anyhow::Error) {
        match self.should_report(destination) {
            Some(0) => warn!(destination, "failed to send {}: {}", what, error),
            Some(suppressed) => warn!(
                destination,
                suppressed,
                "failed to send {}: {} ({} similar failures suppressed)",
                what,
                error,
                suppressed
            ),
            None => debug!(destination, "suppressed send failure for {}: {}", what, error),
        }
    }

    /// Forget the cooldown state for a destination, e.g. once it is gone for good.
    pub fn clear(&self, destination: &str) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(destination);
        }
    }
}
