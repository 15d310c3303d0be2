//! Quiet hours: a local time interval during which only critical alerts are
//! delivered right away.

use chrono::{DateTime, FixedOffset, Local, Timelike, Utc};
use serde::Deserialize;

use crate::alert::Severity;

/// what happens to non critical alerts during quiet hours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuietPolicy {
	/// hold them back until quiet hours end
	Queue,
	/// drop them, they are logged and counted
	Drop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuietHoursSettings {
	#[serde(default = "enabled")]
	pub enabled: bool,
	/// first quiet hour, 0-23
	pub start: u32,
	/// first hour after quiet hours, 0-23. May be smaller than `start` if the
	/// interval wraps midnight.
	pub end: u32,
	#[serde(default = "default_policy")]
	pub policy: QuietPolicy,
	/// offset of local time to UTC, the system's timezone if unset
	#[serde(default)]
	pub utc_offset_hours: Option<i32>,
}

fn enabled() -> bool {
	true
}

fn default_policy() -> QuietPolicy {
	QuietPolicy::Queue
}

impl Default for QuietHoursSettings {
	fn default() -> Self {
		Self { enabled: true, start: 22, end: 7, policy: QuietPolicy::Queue, utc_offset_hours: None }
	}
}

/// outcome of [QuietHours::decide]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuietDecision {
	Deliver,
	Defer,
	Drop,
}

#[derive(Debug, Clone)]
pub struct QuietHours {
	enabled: bool,
	start: u32,
	end: u32,
	policy: QuietPolicy,
	offset: Option<FixedOffset>,
}

impl QuietHours {
	pub fn new(settings: &QuietHoursSettings) -> Self {
		Self {
			enabled: settings.enabled,
			start: settings.start,
			end: settings.end,
			policy: settings.policy,
			offset: settings.utc_offset_hours.and_then(|hours| FixedOffset::east_opt(hours * 3600)),
		}
	}

	/// whether `local_hour` lies in the quiet interval. An interval with equal
	/// start and end is empty.
	pub fn is_quiet(&self, local_hour: u32) -> bool {
		if !self.enabled || self.start == self.end {
			return false;
		}

		if self.start < self.end {
			(self.start..self.end).contains(&local_hour)
		} else {
			local_hour >= self.start || local_hour < self.end
		}
	}

	pub fn local_hour(&self, now: DateTime<Utc>) -> u32 {
		match self.offset {
			Some(offset) => now.with_timezone(&offset).hour(),
			None => now.with_timezone(&Local).hour(),
		}
	}

	pub fn is_quiet_at(&self, now: DateTime<Utc>) -> bool {
		self.is_quiet(self.local_hour(now))
	}

	/// critical alerts always pass, everything else follows the policy while
	/// it's quiet
	pub fn decide(&self, severity: Severity, now: DateTime<Utc>) -> QuietDecision {
		if severity == Severity::Critical || !self.is_quiet_at(now) {
			return QuietDecision::Deliver;
		}

		match self.policy {
			QuietPolicy::Queue => QuietDecision::Defer,
			QuietPolicy::Drop => QuietDecision::Drop,
		}
	}
}
