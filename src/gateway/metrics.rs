//! prometheus meters for the gateway

use prometheus::{
	exponential_buckets, histogram_opts, opts, Histogram, IntCounter, IntCounterVec, Registry,
};

use crate::alert::Severity;

/// why an accepted or received alert never made it into a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suppression {
	Duplicate,
	RateLimited,
	QuietDropped,
	/// pushed out of a full batch queue or quiet hours queue
	Evicted,
	/// part of a message that couldn't be sent
	Undelivered,
}

impl Suppression {
	fn as_str(&self) -> &'static str {
		match self {
			Suppression::Duplicate => "duplicate",
			Suppression::RateLimited => "rate_limited",
			Suppression::QuietDropped => "quiet_dropped",
			Suppression::Evicted => "evicted",
			Suppression::Undelivered => "undelivered",
		}
	}
}

#[derive(Debug, Clone)]
/// prometheus meters for the gateway loop
pub(crate) struct GatewayMetrics {
	/// alerts received from the webhook
	received: IntCounterVec,
	suppressed: IntCounterVec,
	batches_flushed: IntCounter,
	messages_sent: IntCounter,
	delivery_failures: IntCounter,
	/// privileged requests by how the authorizer answered
	privileged_requests: IntCounterVec,
	action_outcomes: IntCounterVec,
	/// time a confirmed restart took, verification included
	action_duration: Histogram,
}

impl GatewayMetrics {
	/// construct prometheus meters and register them in `registry`
	pub(crate) fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
		let received = IntCounterVec::new(
			opts!("alerts_received_total", "alerts received from alertmanager")
				.namespace("barker")
				.subsystem("gateway"),
			&["severity"],
		)?;

		let suppressed = IntCounterVec::new(
			opts!("alerts_suppressed_total", "alerts that were not delivered")
				.namespace("barker")
				.subsystem("gateway"),
			&["reason"],
		)?;

		let batches_flushed = IntCounter::with_opts(
			opts!("batches_flushed_total", "alert batches whose window ended")
				.namespace("barker")
				.subsystem("gateway"),
		)?;

		let messages_sent = IntCounter::with_opts(
			opts!("messages_sent_total", "messages handed to the transport successfully")
				.namespace("barker")
				.subsystem("gateway"),
		)?;

		let delivery_failures = IntCounter::with_opts(
			opts!("delivery_failures_total", "messages the transport failed to deliver")
				.namespace("barker")
				.subsystem("gateway"),
		)?;

		let privileged_requests = IntCounterVec::new(
			opts!("privileged_requests_total", "privileged action requests by authorization step")
				.namespace("barker")
				.subsystem("gateway"),
			&["outcome"],
		)?;

		let action_outcomes = IntCounterVec::new(
			opts!("actions_total", "executed privileged actions by outcome")
				.namespace("barker")
				.subsystem("gateway"),
			&["outcome"],
		)?;

		let action_duration = Histogram::with_opts(
			histogram_opts!(
				"action_duration_seconds",
				"time spent executing privileged actions",
				exponential_buckets(0.1, 2., 10)?
			)
			.namespace("barker")
			.subsystem("gateway"),
		)?;

		registry.register(Box::new(received.clone()))?;
		registry.register(Box::new(suppressed.clone()))?;
		registry.register(Box::new(batches_flushed.clone()))?;
		registry.register(Box::new(messages_sent.clone()))?;
		registry.register(Box::new(delivery_failures.clone()))?;
		registry.register(Box::new(privileged_requests.clone()))?;
		registry.register(Box::new(action_outcomes.clone()))?;
		registry.register(Box::new(action_duration.clone()))?;

		Ok(Self {
			received,
			suppressed,
			batches_flushed,
			messages_sent,
			delivery_failures,
			privileged_requests,
			action_outcomes,
			action_duration,
		})
	}

	pub(crate) fn record_received(&self, severity: Severity) {
		self.received.with_label_values(&[severity.as_str()]).inc();
	}

	pub(crate) fn record_suppressed(&self, reason: Suppression, count: usize) {
		self.suppressed.with_label_values(&[reason.as_str()]).inc_by(count as u64);
	}

	pub(crate) fn record_flush(&self) {
		self.batches_flushed.inc();
	}

	pub(crate) fn record_delivery(&self, success: bool) {
		if success {
			self.messages_sent.inc();
		} else {
			self.delivery_failures.inc();
		}
	}

	/// `outcome` is one of denied, needs_auth, needs_confirmation,
	/// code_accepted, code_rejected, confirmed, confirm_denied, rate_limited
	pub(crate) fn record_privileged(&self, outcome: &str) {
		self.privileged_requests.with_label_values(&[outcome]).inc();
	}

	pub(crate) fn record_action(&self, outcome: &str, seconds: f64) {
		self.action_outcomes.with_label_values(&[outcome]).inc();
		self.action_duration.observe(seconds);
	}
}
