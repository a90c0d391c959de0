//! Poll cadence and connection health.

use crate::Error;
use std::time::Duration;

/// Consecutive failed ticks before the connection is considered degraded.
pub const MAX_CONSECUTIVE_ERRORS: usize = 5;

/// The connection is recycled this often even when healthy.
pub const CONNECTION_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Sleep between ticks, tightening as the round closes.
pub fn poll_interval(slots_remaining: Option<i64>) -> Duration {
    let millis = match slots_remaining {
        Some(1..=30) => 100,
        Some(31..=100) => 400,
        Some(101..=200) => 600,
        _ => 1_000,
    };
    Duration::from_millis(millis)
}

/// Counts consecutive tick failures.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    consecutive: usize,
}

impl ErrorTracker {
    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failed tick. Returns [Error::ConnectionDegraded] (and starts
    /// counting again) once [MAX_CONSECUTIVE_ERRORS] failures have piled up.
    pub fn failure(&mut self) -> Result<(), Error> {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_ERRORS {
            let consecutive = self.consecutive;
            self.consecutive = 0;
            return Err(Error::ConnectionDegraded { consecutive });
        }
        Ok(())
    }
}
