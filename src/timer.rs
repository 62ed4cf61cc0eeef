use tokio::time::Instant;

/// Placeholder shown for a session revived from hold: the time spent on hold
/// is not billable call time, so no accumulated count is displayed.
pub const HOLD_PLACEHOLDER: &str = "--:--";

/// Monotonic elapsed-time tracking for one call. Elapsed seconds are
/// recomputed from the start instant on every read, so a missed tick never
/// skews the result. Logged durations always come from `stop()`, never from
/// a formatted display string.
#[derive(Debug, Default, Clone)]
pub struct CallTimer {
    started_at: Option<Instant>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Elapsed whole seconds since `start()`, 0 if never started.
    pub fn elapsed_secs(&self) -> u64 {
        self.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Final elapsed seconds; clears the timer.
    pub fn stop(&mut self) -> u64 {
        let elapsed = self.elapsed_secs();
        self.started_at = None;
        elapsed
    }
}

/// Render elapsed seconds as `mm:ss` for display.
pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
