//! Chat commands and confirmation buttons.
//!
//! Everyone in the alert chat may use the read only commands, admins may use
//! every command from anywhere. Everyone else gets the same generic denial,
//! as do failed authorization checks.

use std::{fmt::Write, time::Duration};

use tokio::time::Instant;

use super::{Completion, Gateway};
use crate::{
	allow_list::is_valid_unit_name,
	auth::{CodeOutcome, ConfirmOutcome, PendingActionId, RequestOutcome},
	executor::Outcome,
	rate_limit::{AUTH_RATE_CLASS, LOGS_RATE_CLASS, RESTART_RATE_CLASS},
	status::{render_metrics, render_services, render_status, MetricsSnapshot},
	transport::{ConfirmationControl, InboundEvent, OutboundMessage},
};

const DENIED: &str = "❌ Request denied.";

const CONFIRM_PREFIX: &str = "confirm:";
const CANCEL_PREFIX: &str = "cancel:";

const DEFAULT_LOG_LINES: usize = 10;
const MAX_LOG_LINES: usize = 50;

/// the message reporting a finished restart
pub(super) fn outcome_message(target: &str, outcome: &Outcome) -> String {
	match outcome {
		Outcome::Success => format!("✅ Service {target} restarted successfully"),
		Outcome::TimedOut => format!("⏱️ Timeout while restarting {target}"),
		Outcome::Failed(reason) => format!("❌ Failed to restart {target}:\n{reason}"),
	}
}

fn minutes(duration: Duration) -> u64 {
	(duration.as_secs() + 59) / 60
}

/// `/logs [lines] [service]`, the arguments may come in either order
fn log_args(args: &[String]) -> (usize, Option<&str>) {
	let mut lines = DEFAULT_LOG_LINES;
	let mut unit = None;

	for arg in args.iter().take(2) {
		match arg.parse::<usize>() {
			Ok(count) => lines = count,
			Err(_) if unit.is_none() => unit = Some(arg.as_str()),
			Err(_) => {}
		}
	}

	(lines.clamp(1, MAX_LOG_LINES), unit)
}

fn render_logs(unit: Option<&str>, entries: &[String]) -> String {
	if entries.is_empty() {
		return "No logs found".to_owned();
	}

	let title = match unit {
		Some(unit) => format!("📋 System logs [{unit}]"),
		None => "📋 System logs (warnings and errors)".to_owned(),
	};

	format!("{title}\nLast {} entries:\n\n{}", entries.len(), entries.join("\n"))
}

impl Gateway {
	pub(super) fn handle_inbound(&mut self, event: InboundEvent) {
		match event {
			InboundEvent::Command { user_id, chat_id, name, args } => {
				if !self.may_interact(&user_id, &chat_id) {
					tracing::warn!("denied command /{name} from {user_id} in chat {chat_id}");
					self.reply(&chat_id, DENIED.to_owned());
					return;
				}

				tracing::debug!("command /{name} from {user_id}");
				self.command(&user_id, &chat_id, &name, &args);
			}
			InboundEvent::Callback { user_id, chat_id, data } => {
				if !self.may_interact(&user_id, &chat_id) {
					tracing::warn!("denied button press from {user_id} in chat {chat_id}");
					self.reply(&chat_id, DENIED.to_owned());
					return;
				}

				if let Some(id) = data.strip_prefix(CONFIRM_PREFIX) {
					self.confirm(&user_id, &chat_id, &PendingActionId::from(id));
				} else if let Some(id) = data.strip_prefix(CANCEL_PREFIX) {
					let text = if self.authorizer.cancel(&PendingActionId::from(id)) {
						tracing::info!("{user_id} cancelled pending action {id}");
						"🚫 Cancelled."
					} else {
						"Nothing to cancel."
					};
					self.reply(&chat_id, text.to_owned());
				} else {
					tracing::debug!("ignoring unknown button data from {user_id}");
				}
			}
		}
	}

	fn may_interact(&self, user_id: &str, chat_id: &str) -> bool {
		chat_id == self.alert_chat || self.authorizer.is_admin(user_id)
	}

	/// a reply to a chat, doesn't carry alerts
	pub(super) fn reply(&mut self, chat_id: &str, text: String) {
		let message = OutboundMessage::to_chat(chat_id, self.renderer.finish(&text));
		self.deliver(message, Vec::new());
	}

	fn command(&mut self, user_id: &str, chat_id: &str, name: &str, args: &[String]) {
		match name {
			"start" | "help" | "h" => {
				let text = self.help(self.authorizer.is_admin(user_id));
				self.reply(chat_id, text);
			}
			"status" | "s" => self.report_metrics(chat_id, render_status),
			"services" | "v" => self.report_metrics(chat_id, render_services),
			"metrics" | "m" => self.report_metrics(chat_id, render_metrics),
			"logs" | "l" => self.report_logs(user_id, chat_id, args),
			"restart" | "r" => self.request_restart(user_id, chat_id, args.first().map(String::as_str)),
			"auth" | "a" => self.submit_code(user_id, chat_id, args.first().map(String::as_str)),
			"cancel" => {
				let cancelled = self.authorizer.cancel_all_for(user_id);
				let text = match cancelled {
					0 => "Nothing to cancel.".to_owned(),
					count => format!("🚫 Cancelled {count} pending restarts."),
				};
				self.reply(chat_id, text);
			}
			_ => self.reply(chat_id, "❓ Unknown command. Send /help for the list of commands.".to_owned()),
		}
	}

	fn help(&self, admin: bool) -> String {
		let mut text = format!(
			"🤖 {}\n\n📊 Monitoring:\n/status (/s) system status\n/services (/v) service states\n/metrics (/m) detailed metrics\n/logs (/l) [lines] [service] recent journal entries\n/help (/h) this message\n",
			clap::crate_name!()
		);

		if admin {
			text.push_str(
				"\n🔧 Administration:\n/restart (/r) <service> restart a service\n/auth (/a) <code> submit a one time code\n/cancel discard pending restarts\n\n🔐 Restarts need a one time code, a session lasts 1 hour.",
			);
		}

		text
	}

	/// collects metrics in the background and replies with the rendering
	fn report_metrics(&mut self, chat_id: &str, render: fn(&MetricsSnapshot) -> String) {
		let source = self.metrics_source.clone();
		let renderer = self.renderer.clone();
		let transport = self.transport.clone();
		let chat_id = chat_id.to_owned();

		self.spawn(async move {
			let snapshot = source.collect().await;
			let message = OutboundMessage::to_chat(chat_id, renderer.finish(&render(&snapshot)));

			Completion::Delivered { fingerprints: Vec::new(), result: transport.send(message).await }
		});
	}

	/// reads the journal in the background and replies with the entries
	fn report_logs(&mut self, user_id: &str, chat_id: &str, args: &[String]) {
		let (lines, unit) = log_args(args);

		if unit.map_or(false, |unit| !is_valid_unit_name(unit)) {
			self.reply(
				chat_id,
				"❌ Invalid service name. Use only letters, numbers, underscores, hyphens, dots and @.".to_owned(),
			);
			return;
		}

		if !self.rate_limiter.allow(&format!("{LOGS_RATE_CLASS}:{user_id}")) {
			tracing::info!("log request by {user_id} rate limited");
			self.reply(chat_id, "⏳ Too many log requests, try again later.".to_owned());
			return;
		}

		tracing::info!("{user_id} reads {lines} journal entries of {}", unit.unwrap_or("the system"));

		let executor = self.executor.clone();
		let renderer = self.renderer.clone();
		let transport = self.transport.clone();
		let chat_id = chat_id.to_owned();
		let unit = unit.map(str::to_owned);

		self.spawn(async move {
			let text = match executor.read_logs(unit.as_deref(), lines).await {
				Ok(entries) => render_logs(unit.as_deref(), &entries),
				Err(err) => {
					tracing::error!("failed to read logs: {err}");
					format!("❌ Error retrieving logs: {err}")
				}
			};
			let message = OutboundMessage::to_chat(chat_id, renderer.finish(&text));

			Completion::Delivered { fingerprints: Vec::new(), result: transport.send(message).await }
		});
	}

	fn request_restart(&mut self, user_id: &str, chat_id: &str, target: Option<&str>) {
		let target = match target {
			Some(target) => target,
			None if self.authorizer.is_admin(user_id) => {
				let mut text = String::from("🔧 Services that may be restarted:\n");
				for service in self.authorizer.actions().iter() {
					let _ = writeln!(text, "• {service}");
				}
				text.push_str("\nUsage: /restart <service>");
				self.reply(chat_id, text);
				return;
			}
			None => {
				self.reply(chat_id, DENIED.to_owned());
				return;
			}
		};

		match self.authorizer.request_action(user_id, target) {
			RequestOutcome::Denied => {
				self.metrics.record_privileged("denied");
				self.reply(chat_id, DENIED.to_owned());
			}
			RequestOutcome::NeedsAuth(code) => {
				self.metrics.record_privileged("needs_auth");

				// a private chat with a user has the user's id
				let text = format!(
					"🔐 Your one time code: {}\n\nValid for {} minutes. Send /auth <code> to continue.",
					code.expose(),
					minutes(self.code_ttl)
				);
				self.reply(user_id, text);

				if chat_id != user_id {
					self.reply(chat_id, "🔐 Authentication required. A one time code was sent to you privately.".to_owned());
				}
			}
			RequestOutcome::NeedsConfirmation(id) => {
				self.metrics.record_privileged("needs_confirmation");

				let control = ConfirmationControl {
					confirm_label: "✅ Confirm".to_owned(),
					confirm_id: format!("{CONFIRM_PREFIX}{id}"),
					cancel_label: "❌ Cancel".to_owned(),
					cancel_id: format!("{CANCEL_PREFIX}{id}"),
				};
				let text = format!(
					"⚠️ Restart {target}?\n\nConfirm within {} minutes.",
					minutes(self.confirmation_ttl)
				);

				let message =
					OutboundMessage::to_chat(chat_id, self.renderer.finish(&text)).with_confirmation(control);
				self.deliver(message, Vec::new());
			}
		}
	}

	fn submit_code(&mut self, user_id: &str, chat_id: &str, code: Option<&str>) {
		let code = match code {
			Some(code) => code,
			None => {
				self.reply(chat_id, "Usage: /auth <code>".to_owned());
				return;
			}
		};

		if !self.rate_limiter.allow(&format!("{AUTH_RATE_CLASS}:{user_id}")) {
			tracing::warn!("too many code submissions by {user_id}");
			self.metrics.record_privileged("rate_limited");
			self.reply(chat_id, "⏳ Too many attempts, try again later.".to_owned());
			return;
		}

		let text = match self.authorizer.submit_code(user_id, code) {
			CodeOutcome::Accepted => {
				self.metrics.record_privileged("code_accepted");
				"✅ Authenticated for 1 hour. Send /restart <service> again to continue."
			}
			CodeOutcome::Rejected => {
				self.metrics.record_privileged("code_rejected");
				"❌ Invalid code."
			}
			CodeOutcome::NoCodeOutstanding => {
				self.metrics.record_privileged("code_rejected");
				"❌ No valid code. Request a new one with /restart <service>."
			}
		};

		self.reply(chat_id, text.to_owned());
	}

	fn confirm(&mut self, user_id: &str, chat_id: &str, id: &PendingActionId) {
		let target = match self.authorizer.confirm(user_id, id) {
			ConfirmOutcome::Approved(target) => target,
			ConfirmOutcome::Denied => {
				self.metrics.record_privileged("confirm_denied");
				self.reply(chat_id, DENIED.to_owned());
				return;
			}
		};

		if !self.rate_limiter.allow(RESTART_RATE_CLASS) {
			tracing::warn!("restart of {target} by {user_id} rate limited");
			self.metrics.record_privileged("rate_limited");
			self.reply(chat_id, "⏳ Restart limit reached, try again later.".to_owned());
			return;
		}

		self.metrics.record_privileged("confirmed");
		self.reply(chat_id, format!("🔄 Restarting {target}…"));

		let executor = self.executor.clone();
		let (chat_id, user_id) = (chat_id.to_owned(), user_id.to_owned());

		self.spawn(async move {
			let started = Instant::now();
			let outcome = executor.execute(&target).await;

			Completion::ActionFinished { chat_id, user_id, target, outcome, elapsed: started.elapsed() }
		});
	}
}
