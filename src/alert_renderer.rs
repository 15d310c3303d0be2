//! Renders alerts via tera templates.
//!
//! The template is picked by alert name, alerts without a template of their
//! own use `default`. Built in templates can be replaced and new ones added by
//! placing `<alertname>.tera` files in the configured templates directory.

use std::{collections::HashSet, fmt::Write, fs, path::Path};

use anyhow::{Context, Result};
use tera::Tera;

use crate::alert::{Alert, AlertStatus};

/// longest outbound message, leaves room below telegram's own limit
pub const MAX_MESSAGE_LEN: usize = 4000;

const DEFAULT_TEMPLATE: &str = "default";

/// between the alerts of a grouped message
const SEPARATOR: &str = "\n\n───\n\n";

/// room left in a grouped message for its header
const HEADER_RESERVE: usize = 48;

/// one outbound message of a rendered bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMessage {
	pub text: String,
	/// number of alerts in this message. They follow the alerts of the
	/// previous message of the same bucket.
	pub count: usize,
}

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
	(
		DEFAULT_TEMPLATE,
		"{% if resolved %}✅{% else %}🔔{% endif %} {{ alertname }}\n\n📋 Status: {{ status }}\nSeverity: {{ severity_emoji }} {{ severity }}\n\nSummary: {{ summary }}",
	),
	(
		"ServiceDown",
		"{% if resolved %}✅ RESOLVED{% else %}🚨 CRITICAL{% endif %}: {{ alertname }}\n\n📋 Details:\n  Status: {{ status }}\n  Source: {{ source }}\n  {{ summary }}\n\n🔧 Check service status and logs",
	),
	(
		"HighCPU",
		"{% if resolved %}✅ RESOLVED{% else %}🔥 WARNING{% endif %}: High CPU Usage\n\n📋 Details:\n  {{ summary }}\n\n🔧 Check running processes",
	),
	(
		"HighMemory",
		"{% if resolved %}✅ RESOLVED{% else %}💾 WARNING{% endif %}: High Memory Usage\n\n📋 Details:\n  {{ summary }}\n\n🔧 Check memory-intensive processes",
	),
	(
		"DiskSpaceLow",
		"{% if resolved %}✅ RESOLVED{% else %}💽 WARNING{% endif %}: Low Disk Space\n\n📋 Details:\n  {{ summary }}\n\n🔧 Clean up disk space or expand storage",
	),
];

/// Alert renderer
#[derive(Debug)]
pub struct AlertRenderer {
	tera: Tera,
	/// templates that render the description themselves
	with_description: HashSet<String>,
	/// put in front of every outbound message
	prefix: Option<String>,
}

impl AlertRenderer {
	/// loads the built in templates, then every `*.tera` file of
	/// `templates_dir`
	pub fn new(templates_dir: Option<&Path>, prefix: Option<String>) -> Result<Self> {
		let mut renderer = Self {
			tera: Tera::default(),
			with_description: HashSet::new(),
			prefix: prefix.filter(|prefix| !prefix.trim().is_empty()),
		};

		for (name, source) in BUILTIN_TEMPLATES {
			renderer.register(name, source).context("could not load built in template")?;
		}

		if let Some(dir) = templates_dir {
			let entries = fs::read_dir(dir)
				.with_context(|| format!("could not read templates directory {}", dir.display()))?;

			for entry in entries {
				let path = entry.context("could not read templates directory")?.path();
				if path.extension().and_then(|ext| ext.to_str()) != Some("tera") {
					continue;
				}

				let name = match path.file_stem().and_then(|stem| stem.to_str()) {
					Some(name) => name.to_owned(),
					None => continue,
				};

				let source = fs::read_to_string(&path)
					.with_context(|| format!("could not read template {}", path.display()))?;
				renderer
					.register(&name, &source)
					.with_context(|| format!("could not load template {}", path.display()))?;
				tracing::info!("loaded template {name} from {}", path.display());
			}
		}

		Ok(renderer)
	}

	fn register(&mut self, name: &str, source: &str) -> Result<(), tera::Error> {
		self.tera.add_raw_template(name, source)?;

		if source.contains("description") {
			self.with_description.insert(name.to_owned());
		} else {
			self.with_description.remove(name);
		}

		Ok(())
	}

	/// names of all known templates, sorted
	pub fn template_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.tera.get_template_names().map(str::to_owned).collect();
		names.sort();
		names
	}

	/// Renders a single alert. A template that fails to render is reported
	/// in place of the alert, together with the alert's summary so the alert
	/// itself isn't lost.
	pub fn render_alert(&self, alert: &Alert) -> String {
		let name = if self.tera.get_template_names().any(|name| name == alert.name) {
			alert.name.as_str()
		} else {
			DEFAULT_TEMPLATE
		};

		let description = alert.annotations.description.as_deref().unwrap_or("");
		let summary = alert.annotations.summary.as_deref().unwrap_or("No summary provided");

		let mut context = tera::Context::new();
		context.insert("alertname", &alert.name);
		context.insert("status", &alert.status.as_str().to_uppercase());
		context.insert("resolved", &(alert.status == AlertStatus::Resolved));
		context.insert("severity", alert.severity.as_str());
		context.insert("severity_emoji", alert.severity.emoji());
		context.insert("summary", summary);
		context.insert("description", description);
		context.insert("source", alert.source());
		context.insert("labels", &alert.labels);
		context.insert("annotations", &alert.annotations.extra);
		context.insert("received_at", &alert.received_at.format("%Y-%m-%d %H:%M:%S UTC").to_string());

		let mut message = match self.tera.render(name, &context) {
			Ok(message) => message,
			Err(err) => {
				tracing::error!("failed to render alert {} with template {name}: {err:?}", alert.name);
				format!(
					"{} {}\n\nfailed to render template {name}: {err}\n\nSummary: {summary}",
					alert.severity.emoji(),
					alert.name
				)
			}
		};

		if !description.is_empty() && !self.with_description.contains(name) {
			let _ = write!(message, "\n\nDescription:\n{description}");
		}

		message
	}

	/// Renders the alerts of a bucket into as few messages as the length limit
	/// allows. A single alert is rendered as is, more alerts get a header
	/// naming the bucket and are separated by a rule. Alerts are never split
	/// across messages, only an alert too long for a message of its own is
	/// cut.
	pub fn render_batch<'a>(&self, key: &str, alerts: impl IntoIterator<Item = &'a Alert>) -> Vec<BatchMessage> {
		let rendered: Vec<String> = alerts.into_iter().map(|alert| self.render_alert(alert)).collect();

		if rendered.len() == 1 {
			return rendered.iter().map(|text| BatchMessage { text: self.finish(text), count: 1 }).collect();
		}

		let prefix_len = self.prefix.as_ref().map_or(0, |prefix| prefix.chars().count() + 1);
		let budget = MAX_MESSAGE_LEN.saturating_sub(prefix_len + key.chars().count() + HEADER_RESERVE).max(1);
		let separator_len = SEPARATOR.chars().count();

		let mut parts: Vec<Vec<String>> = Vec::new();
		let mut current: Vec<String> = Vec::new();
		let mut current_len = 0;

		for text in rendered {
			let text = truncate(&text, budget);
			let len = text.chars().count() + separator_len;

			if !current.is_empty() && current_len + len > budget {
				parts.push(std::mem::take(&mut current));
				current_len = 0;
			}

			current_len += len;
			current.push(text);
		}
		if !current.is_empty() {
			parts.push(current);
		}

		let total = parts.len();
		parts
			.into_iter()
			.enumerate()
			.map(|(index, part)| {
				let count = part.len();
				let header = match total {
					1 => format!("📦 {count} alerts ({key})"),
					_ => format!("📦 {count} alerts ({key}), part {}/{total}", index + 1),
				};

				BatchMessage { text: self.finish(&format!("{header}\n\n{}", part.join(SEPARATOR))), count }
			})
			.collect()
	}

	/// applies the system prefix and the length limit to an outbound message
	pub fn finish(&self, text: &str) -> String {
		match &self.prefix {
			Some(prefix) => truncate(&format!("{prefix} {text}"), MAX_MESSAGE_LEN),
			None => truncate(text, MAX_MESSAGE_LEN),
		}
	}
}

/// cuts `text` to at most `max` characters, marking the cut with `…`
pub fn truncate(text: &str, max: usize) -> String {
	if text.chars().count() <= max {
		return text.to_owned();
	}

	let mut truncated: String = text.chars().take(max.saturating_sub(1)).collect();
	truncated.push('…');
	truncated
}
