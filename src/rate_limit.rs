//! Per category rate limiting.
//!
//! A category is a string like `restart` or `alerts:warning:HighCPU`. The part
//! before the first `:` names the policy class, so every alert category shares
//! the `alerts` policy while being counted separately. Categories without a
//! policy are never limited.

use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

use crate::clock::{elapsed, Clock};

/// rate limit policy class of privileged restarts
pub const RESTART_RATE_CLASS: &str = "restart";

/// rate limit policy class of one time code submissions, counted per user
pub const AUTH_RATE_CLASS: &str = "auth";

/// rate limit policy class of journal reads, counted per user
pub const LOGS_RATE_CLASS: &str = "logs";

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitPolicy {
	/// allowed attempts per window
	pub max: u32,
	#[serde_as(as = "DurationSeconds<f64>")]
	pub window: Duration,
}

impl RateLimitPolicy {
	pub fn new(max: u32, window: Duration) -> Self {
		Self { max, window }
	}
}

/// the policies used if none are configured. An alert category gets one
/// message per window, later alerts of the category are suppressed until the
/// window since the last sent one passed.
pub fn default_policies() -> HashMap<String, RateLimitPolicy> {
	HashMap::from([
		(
			crate::alert::ALERT_RATE_CLASS.to_owned(),
			RateLimitPolicy::new(1, Duration::from_secs(60)),
		),
		(RESTART_RATE_CLASS.to_owned(), RateLimitPolicy::new(3, Duration::from_secs(60 * 60))),
		(AUTH_RATE_CLASS.to_owned(), RateLimitPolicy::new(5, Duration::from_secs(5 * 60))),
		(LOGS_RATE_CLASS.to_owned(), RateLimitPolicy::new(10, Duration::from_secs(10 * 60))),
	])
}

#[derive(Debug)]
pub struct RateLimiter {
	policies: HashMap<String, RateLimitPolicy>,
	/// accepted attempts per category, oldest first
	attempts: HashMap<String, VecDeque<DateTime<Utc>>>,
	clock: Arc<dyn Clock>,
}

impl RateLimiter {
	pub fn new(policies: HashMap<String, RateLimitPolicy>, clock: Arc<dyn Clock>) -> Self {
		Self { policies, attempts: HashMap::new(), clock }
	}

	fn policy(&self, category: &str) -> Option<RateLimitPolicy> {
		let class = category.split(':').next().unwrap_or(category);
		self.policies.get(category).or_else(|| self.policies.get(class)).copied()
	}

	/// returns true and records the attempt if `category` is below its limit
	pub fn allow(&mut self, category: &str) -> bool {
		let policy = match self.policy(category) {
			Some(policy) => policy,
			None => return true,
		};

		let now = self.clock.now();
		let attempts = self.attempts.entry(category.to_owned()).or_default();

		while let Some(oldest) = attempts.front() {
			if elapsed(*oldest, now) > policy.window {
				attempts.pop_front();
			} else {
				break;
			}
		}

		if attempts.len() >= policy.max as usize {
			tracing::debug!("rate limited {category}");
			return false;
		}

		attempts.push_back(now);
		true
	}

	/// drops attempts that left their window and categories without attempts
	pub fn sweep(&mut self) {
		let now = self.clock.now();
		let policies = &self.policies;

		self.attempts.retain(|category, attempts| {
			let class = category.split(':').next().unwrap_or(category);
			let window = match policies.get(category.as_str()).or_else(|| policies.get(class)) {
				Some(policy) => policy.window,
				None => return false,
			};

			attempts.retain(|attempt| elapsed(*attempt, now) <= window);
			!attempts.is_empty()
		});
	}

	#[cfg(test)]
	fn tracked(&self) -> usize {
		self.attempts.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::ManualClock;

	fn limiter(clock: &ManualClock) -> RateLimiter {
		RateLimiter::new(default_policies(), Arc::new(clock.clone()))
	}

	#[test]
	fn denies_attempt_above_limit_until_window_passed() {
		let clock = ManualClock::at_hour(12, 0);
		let mut limiter = limiter(&clock);

		for _ in 0..3 {
			assert!(limiter.allow("restart"));
			clock.advance(Duration::from_secs(60));
		}
		assert!(!limiter.allow("restart"));

		// the first attempt was 3 minutes ago, the window is an hour
		clock.advance(Duration::from_secs(60 * 60 - 3 * 60));
		assert!(!limiter.allow("restart"));
		clock.advance(Duration::from_millis(1));
		assert!(limiter.allow("restart"));
		assert!(!limiter.allow("restart"));
	}

	#[test]
	fn denied_attempts_are_not_counted() {
		let clock = ManualClock::at_hour(12, 0);
		let mut limiter = RateLimiter::new(
			HashMap::from([("logs".to_owned(), RateLimitPolicy::new(1, Duration::from_secs(10)))]),
			Arc::new(clock.clone()),
		);

		assert!(limiter.allow("logs"));
		for _ in 0..9 {
			clock.advance(Duration::from_secs(1));
			assert!(!limiter.allow("logs"));
		}
		clock.advance(Duration::from_secs(1));
		assert!(!limiter.allow("logs"));
		clock.advance(Duration::from_millis(1));
		assert!(limiter.allow("logs"));
	}

	#[test]
	fn alert_category_sends_once_per_window() {
		let clock = ManualClock::at_hour(12, 0);
		let mut limiter = limiter(&clock);

		assert!(limiter.allow("alerts:warning:HighCPU"));
		clock.advance(Duration::from_secs(30));
		assert!(!limiter.allow("alerts:warning:HighCPU"));
		assert!(limiter.allow("alerts:warning:HighMemory"));

		clock.advance(Duration::from_secs(30));
		assert!(!limiter.allow("alerts:warning:HighCPU"));
		clock.advance(Duration::from_millis(1));
		assert!(limiter.allow("alerts:warning:HighCPU"));
	}

	#[test]
	fn log_reads_are_counted_per_user() {
		let clock = ManualClock::at_hour(12, 0);
		let mut limiter = limiter(&clock);

		for _ in 0..10 {
			assert!(limiter.allow("logs:U1"));
		}
		assert!(!limiter.allow("logs:U1"));
		assert!(limiter.allow("logs:U2"));
	}

	#[test]
	fn unknown_categories_are_unlimited() {
		let clock = ManualClock::at_hour(12, 0);
		let mut limiter = limiter(&clock);

		for _ in 0..100 {
			assert!(limiter.allow("status"));
		}
		assert_eq!(limiter.tracked(), 0);
	}

	#[test]
	fn sweep_forgets_idle_categories() {
		let clock = ManualClock::at_hour(12, 0);
		let mut limiter = limiter(&clock);

		limiter.allow("alerts:info:A");
		limiter.allow("restart");
		clock.advance(Duration::from_secs(120));
		limiter.sweep();

		assert_eq!(limiter.tracked(), 1);
	}
}
