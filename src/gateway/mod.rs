//! The gateway loop.
//!
//! A single task owns every stateful component and processes one event at a
//! time: alerts from the webhook, commands and button presses from the chat,
//! batch windows ending, finished background work and periodic housekeeping.
//! Sending messages and running privileged actions happens in spawned tasks
//! that report back through a [Completion], so the loop never waits for the
//! network or a child process.
//!
//! Alerts pass the [Deduplicator], the [RateLimiter] and [QuietHours] before
//! they are queued into the [BatchQueue]. An alert whose dedup entry was
//! recorded but that never gets delivered has the entry rolled back.

mod commands;
mod metrics;

use std::{
	collections::{BTreeSet, VecDeque},
	future::Future,
	sync::Arc,
	time::Duration,
};

use anyhow::{Context, Result};
use futures::StreamExt;
use prometheus::Registry;
use serde::Serialize;
use tokio::{
	sync::{mpsc, oneshot},
	time::{self, Instant, MissedTickBehavior},
};

use self::metrics::{GatewayMetrics, Suppression};
use crate::{
	alert::Alert,
	alert_renderer::AlertRenderer,
	allow_list::AllowList,
	auth::Authorizer,
	batch::{BatchQueue, FlushedBatch, PendingAlert},
	clock::Clock,
	dedup::{DedupStore, Deduplicator, Fingerprint},
	executor::{ActionExecutor, ActionRunner, Outcome},
	quiet_hours::{QuietDecision, QuietHours},
	rate_limit::RateLimiter,
	settings::Settings,
	status::MetricsSource,
	transport::{DeliveryError, InboundEvent, OutboundMessage, Transport},
};

/// categories listed by the introspection endpoint
const MAX_CATEGORIES: usize = 256;

/// messages to the gateway loop
#[derive(Debug)]
pub enum GatewayEvent {
	/// validated alerts from the webhook, answered with what became of them
	Alerts { alerts: Vec<Alert>, reply: oneshot::Sender<IngestReport> },
	/// a command or button press from the chat
	Inbound(InboundEvent),
	Introspect(oneshot::Sender<Introspection>),
	/// the configuration was reloaded
	ReloadAllowLists { admins: AllowList, actions: AllowList },
	/// flush what's pending and stop
	Shutdown,
}

/// answer to an alert webhook call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
	pub status: &'static str,
	pub total: usize,
	/// alerts that passed deduplication, rate limiting and quiet hours
	pub accepted: usize,
	pub suppressed: usize,
}

impl IngestReport {
	pub fn new(total: usize, accepted: usize, suppressed: usize) -> Self {
		Self { status: "success", total, accepted, suppressed }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Introspection {
	pub templates: Vec<String>,
	/// alert categories seen since start
	pub categories: Vec<String>,
}

/// result of a task spawned by the gateway
#[derive(Debug)]
enum Completion {
	Delivered {
		/// alerts contained in the message, empty for replies
		fingerprints: Vec<Fingerprint>,
		result: Result<(), DeliveryError>,
	},
	ActionFinished {
		chat_id: String,
		user_id: String,
		target: String,
		outcome: Outcome,
		elapsed: Duration,
	},
}

/// the things outside the gateway it talks to
pub struct Collaborators {
	pub transport: Arc<dyn Transport>,
	pub runner: Arc<dyn ActionRunner>,
	pub metrics_source: Arc<dyn MetricsSource>,
	pub dedup_store: Box<dyn DedupStore>,
}

pub struct Gateway {
	dedup: Deduplicator,
	rate_limiter: RateLimiter,
	quiet_hours: QuietHours,
	batch_queue: BatchQueue,
	/// alerts held back during quiet hours, oldest first
	deferred: VecDeque<PendingAlert>,
	/// batched and held back alerts together
	max_pending: usize,
	authorizer: Authorizer,
	executor: ActionExecutor,

	renderer: Arc<AlertRenderer>,
	transport: Arc<dyn Transport>,
	metrics_source: Arc<dyn MetricsSource>,
	metrics: GatewayMetrics,
	clock: Arc<dyn Clock>,

	/// the chat alerts go to, its members may use the read only commands
	alert_chat: String,
	code_ttl: Duration,
	confirmation_ttl: Duration,
	categories: BTreeSet<String>,
	housekeeping_interval: Duration,
	shutdown_grace: Duration,

	tx_completion: mpsc::Sender<Completion>,
	rx_completion: mpsc::Receiver<Completion>,
	/// spawned tasks that didn't report back yet
	in_flight: usize,
}

impl Gateway {
	pub fn new(
		settings: &Settings,
		collaborators: Collaborators,
		clock: Arc<dyn Clock>,
		registry: &Registry,
	) -> Result<Self> {
		let Collaborators { transport, runner, metrics_source, dedup_store } = collaborators;

		let renderer = AlertRenderer::new(settings.templates_dir.as_deref(), settings.system_prefix.clone())
			.context("failed to load alert templates")?;
		let metrics = GatewayMetrics::new(registry).context("failed to register gateway metrics")?;

		let authorizer = Authorizer::new(
			Arc::new(settings.admins.clone()),
			Arc::new(settings.allowed_actions.clone()),
			&settings.auth,
			clock.clone(),
		);

		let (tx_completion, rx_completion) = mpsc::channel(64);

		Ok(Self {
			dedup: Deduplicator::new(settings.dedup.window, dedup_store, clock.clone()),
			rate_limiter: RateLimiter::new(settings.rate_limit_policies(), clock.clone()),
			quiet_hours: QuietHours::new(&settings.quiet_hours),
			batch_queue: BatchQueue::new(&settings.batch),
			deferred: VecDeque::new(),
			max_pending: settings.batch.max_items.max(1),
			authorizer,
			executor: ActionExecutor::new(runner, &settings.actions),
			renderer: Arc::new(renderer),
			transport,
			metrics_source,
			metrics,
			clock,
			alert_chat: settings.telegram.chat_id.clone(),
			code_ttl: settings.auth.code_ttl,
			confirmation_ttl: settings.auth.confirmation_ttl,
			categories: BTreeSet::new(),
			housekeeping_interval: settings.housekeeping_interval,
			shutdown_grace: settings.actions.timeout + settings.actions.verify_timeout,
			tx_completion,
			rx_completion,
			in_flight: 0,
		})
	}

	/// runs until [GatewayEvent::Shutdown] is received or every sender is
	/// gone, then flushes pending batches
	pub async fn run(mut self, mut rx: mpsc::Receiver<GatewayEvent>) {
		let mut housekeeping =
			time::interval_at(Instant::now() + self.housekeeping_interval, self.housekeeping_interval);
		housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

		self.notify(format!("🟢 {} started", clap::crate_name!()));

		loop {
			tokio::select! {
				// a batch window ended
				Some(batch) = self.batch_queue.next() => self.flush(batch),

				// a message was sent or an action finished
				Some(completion) = self.rx_completion.recv() => self.complete(completion),

				_ = housekeeping.tick() => self.housekeeping(),

				event = rx.recv() => match event {
					Some(GatewayEvent::Shutdown) | None => break,
					Some(event) => self.handle(event),
				},
			}
		}

		self.shutdown().await;
	}

	fn handle(&mut self, event: GatewayEvent) {
		match event {
			GatewayEvent::Alerts { alerts, reply } => {
				let report = self.ingest(alerts);
				if reply.send(report).is_err() {
					tracing::debug!("webhook caller went away before the alerts were processed");
				}
			}
			GatewayEvent::Inbound(event) => self.handle_inbound(event),
			GatewayEvent::Introspect(reply) => {
				let _ = reply.send(Introspection {
					templates: self.renderer.template_names(),
					categories: self.categories.iter().cloned().collect(),
				});
			}
			GatewayEvent::ReloadAllowLists { admins, actions } => {
				tracing::info!(
					"reloaded allow lists: {} admins, {} allowed actions",
					admins.len(),
					actions.len()
				);
				self.authorizer.reload(Arc::new(admins), Arc::new(actions));
			}
			// handled by the loop
			GatewayEvent::Shutdown => {}
		}
	}

	/// runs every alert through deduplication, rate limiting and quiet hours
	/// and queues the ones left
	fn ingest(&mut self, alerts: Vec<Alert>) -> IngestReport {
		self.release_deferred();

		let now = self.clock.now();
		let total = alerts.len();
		let mut accepted = 0;

		for alert in alerts {
			self.metrics.record_received(alert.severity);

			let category = alert.rate_category();
			if self.categories.len() < MAX_CATEGORIES {
				self.categories.insert(category.clone());
			}

			if !self.dedup.accept(&alert) {
				tracing::debug!("suppressed duplicate alert {} from {}", alert.name, alert.source());
				self.metrics.record_suppressed(Suppression::Duplicate, 1);
				continue;
			}

			let fingerprint = Fingerprint::of(&alert);
			if !self.rate_limiter.allow(&category) {
				tracing::info!("rate limited alert {} from {}", alert.name, alert.source());
				self.roll_back([fingerprint], Suppression::RateLimited);
				continue;
			}

			let pending = PendingAlert { alert, fingerprint };
			match self.quiet_hours.decide(pending.alert.severity, now) {
				QuietDecision::Deliver => self.enqueue(pending),
				QuietDecision::Defer => self.defer(pending),
				QuietDecision::Drop => {
					tracing::info!(
						"dropped {} alert {} from {} during quiet hours",
						pending.alert.severity,
						pending.alert.name,
						pending.alert.source()
					);
					self.roll_back([pending.fingerprint], Suppression::QuietDropped);
					continue;
				}
			}

			accepted += 1;
		}

		IngestReport::new(total, accepted, total - accepted)
	}

	fn enqueue(&mut self, pending: PendingAlert) {
		let key = pending.alert.batch_key();
		let evicted = self.batch_queue.add(key, pending, self.clock.now());
		self.roll_back(evicted.into_iter().map(|pending| pending.fingerprint), Suppression::Evicted);
		self.enforce_capacity();
	}

	fn defer(&mut self, pending: PendingAlert) {
		tracing::debug!("holding back {} until quiet hours end", pending.alert.name);
		self.deferred.push_back(pending);
		self.enforce_capacity();
	}

	/// Keeps batched and held back alerts within one capacity. Alerts held
	/// back for quiet hours are evicted first, oldest first.
	fn enforce_capacity(&mut self) {
		while self.batch_queue.len() + self.deferred.len() > self.max_pending {
			let evicted = match self.deferred.pop_front() {
				Some(oldest) => oldest,
				None => match self.batch_queue.evict_oldest() {
					Some(oldest) => oldest,
					None => break,
				},
			};

			tracing::warn!(
				"too many pending alerts, dropping {} from {}",
				evicted.alert.name,
				evicted.alert.source()
			);
			self.roll_back([evicted.fingerprint], Suppression::Evicted);
		}
	}

	/// queues the alerts held back once quiet hours ended
	fn release_deferred(&mut self) {
		if self.deferred.is_empty() || self.quiet_hours.is_quiet_at(self.clock.now()) {
			return;
		}

		tracing::info!("quiet hours ended, releasing {} alerts", self.deferred.len());
		while let Some(pending) = self.deferred.pop_front() {
			self.enqueue(pending);
		}
	}

	/// forgets the dedup entries of alerts that won't be delivered, so their
	/// next occurrence goes through
	fn roll_back(&mut self, fingerprints: impl IntoIterator<Item = Fingerprint>, reason: Suppression) {
		let mut count = 0;
		for fingerprint in fingerprints {
			self.dedup.rollback(&fingerprint);
			count += 1;
		}

		if count > 0 {
			self.metrics.record_suppressed(reason, count);
		}
	}

	/// the messages of a batch, each with the fingerprints of the alerts it
	/// carries
	fn render(&self, batch: FlushedBatch) -> Vec<(OutboundMessage, Vec<Fingerprint>)> {
		let messages = self.renderer.render_batch(&batch.key, batch.items.iter().map(|pending| &pending.alert));
		let mut fingerprints = batch.items.into_iter().map(|pending| pending.fingerprint);

		messages
			.into_iter()
			.map(|message| {
				let carried = fingerprints.by_ref().take(message.count).collect();
				(OutboundMessage::to_alert_channel(message.text), carried)
			})
			.collect()
	}

	fn flush(&mut self, batch: FlushedBatch) {
		tracing::info!(
			"flushing batch {} with {} alerts, opened at {}",
			batch.key,
			batch.items.len(),
			batch.opened_at
		);
		self.metrics.record_flush();

		let messages = self.render(batch);
		self.deliver_in_order(messages);
	}

	fn housekeeping(&mut self) {
		self.dedup.sweep();
		self.rate_limiter.sweep();
		self.authorizer.sweep();
		self.release_deferred();
		self.dedup.save();

		tracing::debug!(
			"{} alerts pending in {} batches, {} held back for quiet hours",
			self.batch_queue.len(),
			self.batch_queue.bucket_count(),
			self.deferred.len()
		);
	}

	/// runs `task` in the background, its result comes back as a completion
	fn spawn<F>(&mut self, task: F)
	where
		F: Future<Output = Completion> + Send + 'static,
	{
		let tx = self.tx_completion.clone();
		self.in_flight += 1;

		tokio::spawn(async move {
			let completion = task.await;
			// the gateway only goes away after waiting for its tasks
			let _ = tx.send(completion).await;
		});
	}

	fn deliver(&mut self, message: OutboundMessage, fingerprints: Vec<Fingerprint>) {
		let transport = self.transport.clone();

		self.spawn(async move {
			let result = transport.send(message).await;
			Completion::Delivered { fingerprints, result }
		});
	}

	/// sends the messages one after another, each reports back on its own
	fn deliver_in_order(&mut self, messages: Vec<(OutboundMessage, Vec<Fingerprint>)>) {
		let transport = self.transport.clone();
		let tx = self.tx_completion.clone();
		self.in_flight += messages.len();

		tokio::spawn(async move {
			for (message, fingerprints) in messages {
				let result = transport.send(message).await;
				let _ = tx.send(Completion::Delivered { fingerprints, result }).await;
			}
		});
	}

	/// a system message to the alert chat
	fn notify(&mut self, text: String) {
		let message = OutboundMessage::to_alert_channel(self.renderer.finish(&text));
		self.deliver(message, Vec::new());
	}

	fn complete(&mut self, completion: Completion) {
		self.in_flight = self.in_flight.saturating_sub(1);

		match completion {
			Completion::Delivered { fingerprints, result: Ok(()) } => {
				self.metrics.record_delivery(true);
				if !fingerprints.is_empty() {
					tracing::debug!("delivered message with {} alerts", fingerprints.len());
				}
			}
			Completion::Delivered { fingerprints, result: Err(err) } => {
				self.metrics.record_delivery(false);
				tracing::error!("failed to deliver message with {} alerts: {err}", fingerprints.len());
				self.roll_back(fingerprints, Suppression::Undelivered);
			}
			Completion::ActionFinished { chat_id, user_id, target, outcome, elapsed } => {
				tracing::info!(
					"restart of {target} requested by {user_id} finished: {} after {elapsed:?}",
					outcome.as_str()
				);
				self.metrics.record_action(outcome.as_str(), elapsed.as_secs_f64());
				self.reply(&chat_id, commands::outcome_message(&target, &outcome));
			}
		}
	}

	/// sends what's still pending and waits a bit for running tasks
	async fn shutdown(mut self) {
		tracing::info!("gateway is shutting down");

		let transport = self.transport.clone();

		if !self.batch_queue.is_empty() {
			tracing::info!("sending {} pending alerts", self.batch_queue.len());
		}
		for batch in self.batch_queue.drain() {
			for (message, fingerprints) in self.render(batch) {
				let result = transport.send(message).await;
				self.complete_inline(fingerprints, result);
			}
		}

		if !self.deferred.is_empty() {
			tracing::info!("discarding {} alerts held back for quiet hours", self.deferred.len());
			let deferred: Vec<Fingerprint> = self.deferred.drain(..).map(|pending| pending.fingerprint).collect();
			self.roll_back(deferred, Suppression::Undelivered);
		}

		let notice = self.renderer.finish(&format!("🔴 {} stopped", clap::crate_name!()));
		let result = transport.send(OutboundMessage::to_alert_channel(notice)).await;
		self.complete_inline(Vec::new(), result);

		let deadline = Instant::now() + self.shutdown_grace;
		while self.in_flight > 0 {
			match time::timeout_at(deadline, self.rx_completion.recv()).await {
				Ok(Some(completion)) => self.complete(completion),
				_ => {
					tracing::warn!("{} tasks didn't finish before shutdown", self.in_flight);
					break;
				}
			}
		}

		self.dedup.save();
		tracing::info!("gateway stopped");
	}

	fn complete_inline(&mut self, fingerprints: Vec<Fingerprint>, result: Result<(), DeliveryError>) {
		// not spawned, so not counted
		self.in_flight += 1;
		self.complete(Completion::Delivered { fingerprints, result });
	}
}

#[cfg(test)]
mod tests {
	use chrono::{TimeZone, Utc};
	use tokio::task::JoinHandle;

	use super::*;
	use crate::{
		alert::{tests::alert, Severity},
		alert_renderer::MAX_MESSAGE_LEN,
		clock::ManualClock,
		dedup::MemoryDedupStore,
		executor::tests::FakeRunner,
		quiet_hours::QuietPolicy,
		status::tests::{snapshot, FakeMetrics},
		transport::{tests::FakeTransport, Recipient},
	};

	pub(super) const ALERT_CHAT: &str = "-100";

	pub(super) struct Harness {
		pub(super) tx: mpsc::Sender<GatewayEvent>,
		pub(super) transport: Arc<FakeTransport>,
		pub(super) runner: Arc<FakeRunner>,
		pub(super) clock: ManualClock,
		handle: JoinHandle<()>,
	}

	/// lets spawned tasks run. Time is paused, so this returns once every task
	/// is idle.
	pub(super) async fn settle() {
		time::sleep(Duration::from_millis(1)).await;
	}

	impl Harness {
		pub(super) async fn start(settings: Settings, clock: ManualClock) -> Self {
			let transport = Arc::new(FakeTransport::default());
			let runner = Arc::new(FakeRunner::default());

			let collaborators = Collaborators {
				transport: transport.clone(),
				runner: runner.clone(),
				metrics_source: Arc::new(FakeMetrics(snapshot())),
				dedup_store: Box::new(MemoryDedupStore),
			};

			let gateway =
				Gateway::new(&settings, collaborators, Arc::new(clock.clone()), &Registry::new()).unwrap();
			let (tx, rx) = mpsc::channel(16);
			let handle = tokio::spawn(gateway.run(rx));

			settle().await;
			assert!(transport.sent()[0].text.contains("started"));
			transport.clear();

			Self { tx, transport, runner, clock, handle }
		}

		pub(super) async fn alerts(&self, alerts: Vec<Alert>) -> IngestReport {
			let (reply, rx_reply) = oneshot::channel();
			self.tx.send(GatewayEvent::Alerts { alerts, reply }).await.unwrap();
			rx_reply.await.unwrap()
		}

		pub(super) async fn command(&self, user_id: &str, chat_id: &str, text: &str) {
			let (name, args) = crate::transport::parse_command(text).unwrap();
			let event =
				InboundEvent::Command { user_id: user_id.into(), chat_id: chat_id.into(), name, args };
			self.tx.send(GatewayEvent::Inbound(event)).await.unwrap();
			settle().await;
		}

		pub(super) async fn press(&self, user_id: &str, chat_id: &str, data: &str) {
			let event =
				InboundEvent::Callback { user_id: user_id.into(), chat_id: chat_id.into(), data: data.into() };
			self.tx.send(GatewayEvent::Inbound(event)).await.unwrap();
			settle().await;
		}

		/// texts sent to the alert chat
		pub(super) fn alert_messages(&self) -> Vec<String> {
			self.transport
				.sent()
				.into_iter()
				.filter(|message| message.recipient == Recipient::AlertChannel)
				.map(|message| message.text)
				.collect()
		}

		/// last message sent to `chat_id`
		pub(super) fn last_to(&self, chat_id: &str) -> OutboundMessage {
			self.transport
				.sent()
				.into_iter()
				.rev()
				.find(|message| message.recipient == Recipient::Chat(chat_id.to_owned()))
				.unwrap_or_else(|| panic!("nothing was sent to {chat_id}"))
		}

		pub(super) async fn stop(self) -> Arc<FakeTransport> {
			self.tx.send(GatewayEvent::Shutdown).await.unwrap();
			self.handle.await.unwrap();
			self.transport
		}
	}

	fn day() -> ManualClock {
		ManualClock::at_hour(12, 0)
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_alert_is_delivered_once() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		let report = h.alerts(vec![alert("ServiceDown", "host1", Severity::Critical)]).await;
		assert_eq!(report, IngestReport::new(1, 1, 0));

		h.clock.advance(Duration::from_secs(5 * 60));
		let report = h.alerts(vec![alert("ServiceDown", "host1", Severity::Critical)]).await;
		assert_eq!(report, IngestReport::new(1, 0, 1));

		time::sleep(Duration::from_secs(11)).await;
		let messages = h.alert_messages();
		assert_eq!(messages.len(), 1);
		assert!(messages[0].contains("ServiceDown"));
	}

	#[tokio::test(start_paused = true)]
	async fn failed_delivery_lets_next_occurrence_through() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		h.transport.fail(true);
		h.alerts(vec![alert("ServiceDown", "host1", Severity::Critical)]).await;
		time::sleep(Duration::from_secs(11)).await;
		assert!(h.alert_messages().is_empty());

		h.transport.fail(false);
		h.clock.advance(Duration::from_secs(61));
		let report = h.alerts(vec![alert("ServiceDown", "host1", Severity::Critical)]).await;
		assert_eq!(report.accepted, 1);

		time::sleep(Duration::from_secs(11)).await;
		assert_eq!(h.alert_messages().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn alerts_of_one_bucket_are_sent_together_in_order() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		for name in ["A", "B", "C"] {
			h.alerts(vec![alert(name, "host1", Severity::Warning)]).await;
			time::sleep(Duration::from_secs(3)).await;
		}
		assert!(h.alert_messages().is_empty());

		time::sleep(Duration::from_secs(2)).await;
		let messages = h.alert_messages();
		assert_eq!(messages.len(), 1);
		assert!(messages[0].starts_with("📦 3 alerts (warning:host1)"));

		let positions: Vec<usize> =
			["🔔 A", "🔔 B", "🔔 C"].iter().map(|name| messages[0].find(name).unwrap()).collect();
		assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
	}

	#[tokio::test(start_paused = true)]
	async fn full_bucket_is_split_into_several_messages() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		let names: Vec<String> = (0..100).map(|n| format!("Alert{n:03}")).collect();
		let alerts = names.iter().map(|name| alert(name, "host1", Severity::Critical)).collect();
		assert_eq!(h.alerts(alerts).await, IngestReport::new(100, 100, 0));

		time::sleep(Duration::from_secs(11)).await;
		let messages = h.alert_messages();
		assert!(messages.len() > 1);
		assert!(messages.iter().all(|message| message.chars().count() <= MAX_MESSAGE_LEN));
		assert!(messages[0].starts_with("📦 "));
		assert!(messages[0].contains(&format!("part 1/{}", messages.len())));

		for name in &names {
			let carrying = messages.iter().filter(|message| message.contains(&format!("🔔 {name}\n"))).count();
			assert_eq!(carrying, 1, "{name} has to be sent exactly once");
		}
	}

	#[tokio::test(start_paused = true)]
	async fn failed_part_of_split_bucket_is_rolled_back() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		h.transport.fail(true);
		let alerts = (0..100).map(|n| alert(&format!("Alert{n:03}"), "host1", Severity::Critical)).collect();
		h.alerts(alerts).await;
		time::sleep(Duration::from_secs(11)).await;

		h.transport.fail(false);
		h.clock.advance(Duration::from_secs(61));
		let report = h.alerts(vec![alert("Alert099", "host1", Severity::Critical)]).await;
		assert_eq!(report, IngestReport::new(1, 1, 0));
	}

	#[tokio::test(start_paused = true)]
	async fn alert_category_is_rate_limited() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		let report = h.alerts(vec![alert("HighCPU", "host1", Severity::Warning)]).await;
		assert_eq!(report, IngestReport::new(1, 1, 0));

		// same category, different fingerprint
		h.clock.advance(Duration::from_secs(30));
		let report = h.alerts(vec![alert("HighCPU", "host2", Severity::Warning)]).await;
		assert_eq!(report, IngestReport::new(1, 0, 1));

		h.clock.advance(Duration::from_secs(30));
		let report = h.alerts(vec![alert("HighCPU", "host2", Severity::Warning)]).await;
		assert_eq!(report.accepted, 0);

		// the rate limited alert wasn't recorded as sent
		h.clock.advance(Duration::from_millis(1));
		let report = h.alerts(vec![alert("HighCPU", "host2", Severity::Warning)]).await;
		assert_eq!(report.accepted, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn held_back_alerts_count_towards_capacity() {
		let mut settings = Settings::for_tests();
		settings.batch.max_items = 3;
		let h = Harness::start(settings, ManualClock::at_hour(23, 0)).await;

		h.alerts(vec![
			alert("HighCPU", "host1", Severity::Warning),
			alert("HighMemory", "host2", Severity::Warning),
		])
		.await;
		h.alerts(vec![
			alert("ServiceDown", "host1", Severity::Critical),
			alert("DiskSpaceLow", "host1", Severity::Critical),
		])
		.await;

		time::sleep(Duration::from_secs(11)).await;
		assert_eq!(h.alert_messages().len(), 1);

		h.clock.set(Utc.ymd(2024, 3, 2).and_hms(7, 0, 0));
		time::sleep(Duration::from_secs(75)).await;

		let messages = h.alert_messages();
		assert_eq!(messages.len(), 2);
		assert!(messages[1].contains("High Memory Usage"));
		assert!(messages.iter().all(|message| !message.contains("High CPU Usage")));

		// the evicted alert wasn't recorded as sent
		let report = h.alerts(vec![alert("HighCPU", "host1", Severity::Warning)]).await;
		assert_eq!(report.accepted, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn quiet_hours_hold_back_non_critical_alerts() {
		let h = Harness::start(Settings::for_tests(), ManualClock::at_hour(23, 0)).await;

		let report = h
			.alerts(vec![
				alert("HighCPU", "host1", Severity::Warning),
				alert("ServiceDown", "host1", Severity::Critical),
			])
			.await;
		assert_eq!(report, IngestReport::new(2, 2, 0));

		time::sleep(Duration::from_secs(11)).await;
		let messages = h.alert_messages();
		assert_eq!(messages.len(), 1);
		assert!(messages[0].contains("ServiceDown"));

		h.clock.set(Utc.ymd(2024, 3, 2).and_hms(7, 0, 0));
		time::sleep(Duration::from_secs(75)).await;

		let messages = h.alert_messages();
		assert_eq!(messages.len(), 2);
		assert!(messages[1].contains("High CPU Usage"));
	}

	#[tokio::test(start_paused = true)]
	async fn quiet_hours_drop_policy() {
		let mut settings = Settings::for_tests();
		settings.quiet_hours.policy = QuietPolicy::Drop;
		let h = Harness::start(settings, ManualClock::at_hour(23, 0)).await;

		let report = h.alerts(vec![alert("HighCPU", "host1", Severity::Warning)]).await;
		assert_eq!(report, IngestReport::new(1, 0, 1));
		time::sleep(Duration::from_secs(11)).await;
		assert!(h.alert_messages().is_empty());

		// dropped alerts are not remembered as sent
		h.clock.set(Utc.ymd(2024, 3, 2).and_hms(8, 0, 0));
		let report = h.alerts(vec![alert("HighCPU", "host1", Severity::Warning)]).await;
		assert_eq!(report.accepted, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn introspection_lists_templates_and_categories() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		h.alerts(vec![alert("HighCPU", "host1", Severity::Warning)]).await;
		h.alerts(vec![alert("HighCPU", "host1", Severity::Warning)]).await;

		let (reply, rx_reply) = oneshot::channel();
		h.tx.send(GatewayEvent::Introspect(reply)).await.unwrap();
		let introspection = rx_reply.await.unwrap();

		assert_eq!(introspection.categories, vec!["alerts:warning:HighCPU"]);
		assert!(introspection.templates.contains(&"default".to_owned()));
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_flushes_pending_batches() {
		let h = Harness::start(Settings::for_tests(), day()).await;

		h.alerts(vec![alert("DiskSpaceLow", "host1", Severity::Warning)]).await;
		let transport = h.stop().await;

		let texts: Vec<String> = transport.sent().into_iter().map(|message| message.text).collect();
		assert_eq!(texts.len(), 2);
		assert!(texts[0].contains("Low Disk Space"));
		assert!(texts[1].contains("stopped"));
	}

	#[tokio::test(start_paused = true)]
	async fn system_prefix_is_applied() {
		let mut settings = Settings::for_tests();
		settings.system_prefix = Some("[PI]".into());
		let h = Harness::start(settings, day()).await;

		h.alerts(vec![alert("ServiceDown", "host1", Severity::Critical)]).await;
		time::sleep(Duration::from_secs(11)).await;

		assert!(h.alert_messages()[0].starts_with("[PI] 🚨 CRITICAL"));
	}
}
