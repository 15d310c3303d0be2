//! data structures for deserializing incoming alerts and the validated
//! [Alert] the gateway works with
use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// body of a webhook call: either an alertmanager notification or a bare list
/// of alerts
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Payload {
	/// alertmanager style notification, only `alerts` is of interest
	Notification(Notification),
	/// list of alerts without envelope
	Alerts(Vec<RawAlert>),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
	#[serde(default)]
	pub alerts: Vec<RawAlert>,
}

/// a single alert as received, before validation
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAlert {
	pub status: Option<String>,
	#[serde(default)]
	pub labels: BTreeMap<String, String>,
	#[serde(default)]
	pub annotations: BTreeMap<String, String>,
}

/// an alert payload that can't be turned into an [Alert]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedAlert {
	#[error("alert #{index} has no status")]
	MissingStatus { index: usize },
	#[error("alert #{index} has unknown status `{status}`")]
	UnknownStatus { index: usize, status: String },
	#[error("alert #{index} has no `alertname` label")]
	MissingName { index: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
	Firing,
	Resolved,
}

impl AlertStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			AlertStatus::Firing => "firing",
			AlertStatus::Resolved => "resolved",
		}
	}
}

impl FromStr for AlertStatus {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"firing" => Ok(AlertStatus::Firing),
			"resolved" => Ok(AlertStatus::Resolved),
			_ => Err(()),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Info,
	Warning,
	Critical,
}

impl Severity {
	/// maps the `severity` label, anything unrecognized is informational
	pub fn from_label(label: Option<&str>) -> Self {
		match label.map(str::to_ascii_lowercase).as_deref() {
			Some("critical" | "crit" | "error" | "page") => Severity::Critical,
			Some("warning" | "warn") => Severity::Warning,
			_ => Severity::Info,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Severity::Info => "info",
			Severity::Warning => "warning",
			Severity::Critical => "critical",
		}
	}

	pub fn emoji(&self) -> &'static str {
		match self {
			Severity::Info => "ℹ️",
			Severity::Warning => "⚠️",
			Severity::Critical => "🚨",
		}
	}
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// labels the gateway understands, everything else ends up in `extra`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Labels {
	pub instance: Option<String>,
	pub component: Option<String>,
	pub job: Option<String>,
	pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Annotations {
	pub summary: Option<String>,
	pub description: Option<String>,
	pub extra: BTreeMap<String, String>,
}

/// a validated alert. Immutable once received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Alert {
	pub name: String,
	pub status: AlertStatus,
	pub severity: Severity,
	pub labels: Labels,
	pub annotations: Annotations,
	pub received_at: DateTime<Utc>,
}

impl Alert {
	/// validates a [RawAlert], `index` is its position in the payload and only
	/// used for error messages
	pub fn from_raw(
		index: usize,
		raw: RawAlert,
		received_at: DateTime<Utc>,
	) -> Result<Self, MalformedAlert> {
		let RawAlert { status, mut labels, mut annotations } = raw;

		let status = status.ok_or(MalformedAlert::MissingStatus { index })?;
		let status: AlertStatus = status
			.parse()
			.map_err(|_| MalformedAlert::UnknownStatus { index, status: status.clone() })?;

		let name = labels
			.remove("alertname")
			.filter(|name| !name.trim().is_empty())
			.ok_or(MalformedAlert::MissingName { index })?;
		let severity = Severity::from_label(labels.remove("severity").as_deref());

		let labels = Labels {
			instance: labels.remove("instance"),
			component: labels.remove("component"),
			job: labels.remove("job"),
			extra: labels,
		};

		let annotations = Annotations {
			summary: annotations.remove("summary"),
			description: annotations.remove("description"),
			extra: annotations,
		};

		Ok(Self { name, status, severity, labels, annotations, received_at })
	}

	/// where the alert originates from: the `instance` label, then `job`
	pub fn source(&self) -> &str {
		self.labels.instance.as_deref().or(self.labels.job.as_deref()).unwrap_or("unknown")
	}

	/// key of the batch bucket this alert is grouped into
	pub fn batch_key(&self) -> String {
		format!("{}:{}", self.severity, self.source())
	}

	/// rate limiter category, see [RateLimiter](crate::rate_limit::RateLimiter)
	pub fn rate_category(&self) -> String {
		format!("{}:{}:{}", ALERT_RATE_CLASS, self.severity, self.name)
	}
}

/// rate limit policy class applied to every alert category
pub const ALERT_RATE_CLASS: &str = "alerts";

impl Payload {
	/// validates every alert of the payload. One malformed alert rejects the
	/// whole payload.
	pub fn into_alerts(self, received_at: DateTime<Utc>) -> Result<Vec<Alert>, MalformedAlert> {
		let raw = match self {
			Payload::Notification(notification) => notification.alerts,
			Payload::Alerts(alerts) => alerts,
		};

		raw.into_iter()
			.enumerate()
			.map(|(index, raw)| Alert::from_raw(index, raw, received_at))
			.collect()
	}
}
