//! wall clock used by the time windowed components
//!
//! Deduplication, rate limiting, quiet hours and the authorizer all ask an
//! injected [Clock] for the current time so tests can move time by hand.
//! Batch flush timers are driven by tokio's timer instead.

use std::{fmt::Debug, time::Duration};

use chrono::{DateTime, Utc};

/// source of the current time
pub trait Clock: Send + Sync + Debug {
	/// the current point in time
	fn now(&self) -> DateTime<Utc>;
}

/// the system's real time clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// time elapsed between `since` and `now`, zero if the clock went backwards
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
	(now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
pub use manual::ManualClock;
