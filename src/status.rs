//! Host metrics for the `/status`, `/services` and `/metrics` commands.
//!
//! Collection is best effort: every value that can't be read is left out and
//! the messages show whatever is available.

use std::{collections::BTreeMap, fmt::Write, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{fs, process::Command};

/// used and total amount of memory or disk space, in kibibytes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
	pub used_kib: u64,
	pub total_kib: u64,
}

impl Usage {
	pub fn percent(&self) -> f64 {
		if self.total_kib == 0 {
			return 0.;
		}
		self.used_kib as f64 * 100. / self.total_kib as f64
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
	pub one: f64,
	pub five: f64,
	pub fifteen: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
	/// degrees celsius
	pub cpu_temp: Option<f64>,
	pub memory: Option<Usage>,
	pub disk: Option<Usage>,
	pub load: Option<LoadAverage>,
	/// service name to its state as reported by systemd
	pub services: BTreeMap<String, String>,
	pub collected_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
	async fn collect(&self) -> MetricsSnapshot;
}

/// reads metrics of the host the gateway runs on
#[derive(Debug, Clone)]
pub struct HostMetrics {
	services: Vec<String>,
	thermal_zone: PathBuf,
	proc_root: PathBuf,
}

impl HostMetrics {
	pub fn new(services: Vec<String>) -> Self {
		Self {
			services,
			thermal_zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
			proc_root: PathBuf::from("/proc"),
		}
	}

	async fn cpu_temp(&self) -> Option<f64> {
		parse_thermal(&fs::read_to_string(&self.thermal_zone).await.ok()?)
	}

	async fn memory(&self) -> Option<Usage> {
		parse_meminfo(&fs::read_to_string(self.proc_root.join("meminfo")).await.ok()?)
	}

	async fn load(&self) -> Option<LoadAverage> {
		parse_loadavg(&fs::read_to_string(self.proc_root.join("loadavg")).await.ok()?)
	}

	async fn disk(&self) -> Option<Usage> {
		let output = Command::new("df").args(["-Pk", "/"]).stdin(Stdio::null()).output().await.ok()?;
		if !output.status.success() {
			return None;
		}
		parse_df(&String::from_utf8_lossy(&output.stdout))
	}

	async fn service_state(name: &str) -> String {
		let output =
			Command::new("systemctl").args(["is-active", "--", name]).stdin(Stdio::null()).output().await;

		match output {
			Ok(output) => {
				let state = String::from_utf8_lossy(&output.stdout).trim().to_owned();
				if state.is_empty() {
					"unknown".to_owned()
				} else {
					state
				}
			}
			Err(err) => {
				tracing::debug!("failed to query state of {name}: {err}");
				"unknown".to_owned()
			}
		}
	}
}

#[async_trait]
impl MetricsSource for HostMetrics {
	async fn collect(&self) -> MetricsSnapshot {
		let (cpu_temp, memory, disk, load) =
			tokio::join!(self.cpu_temp(), self.memory(), self.disk(), self.load());

		let mut services = BTreeMap::new();
		for name in &self.services {
			services.insert(name.clone(), Self::service_state(name).await);
		}

		MetricsSnapshot { cpu_temp, memory, disk, load, services, collected_at: Utc::now() }
	}
}

/// millidegrees as written by the kernel
fn parse_thermal(content: &str) -> Option<f64> {
	content.trim().parse::<f64>().ok().map(|millis| millis / 1000.)
}

fn parse_meminfo(content: &str) -> Option<Usage> {
	let field = |name: &str| -> Option<u64> {
		content
			.lines()
			.find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))?
			.split_whitespace()
			.next()?
			.parse()
			.ok()
	};

	let total_kib = field("MemTotal")?;
	let available = field("MemAvailable").or_else(|| field("MemFree"))?;

	Some(Usage { used_kib: total_kib.saturating_sub(available), total_kib })
}

fn parse_loadavg(content: &str) -> Option<LoadAverage> {
	let mut values = content.split_whitespace().map(str::parse::<f64>);

	Some(LoadAverage {
		one: values.next()?.ok()?,
		five: values.next()?.ok()?,
		fifteen: values.next()?.ok()?,
	})
}

/// output of `df -Pk`, the second line holds the numbers
fn parse_df(content: &str) -> Option<Usage> {
	let mut columns = content.lines().nth(1)?.split_whitespace().skip(1);

	let total_kib = columns.next()?.parse().ok()?;
	let used_kib = columns.next()?.parse().ok()?;

	Some(Usage { used_kib, total_kib })
}

fn gib(kib: u64) -> f64 {
	kib as f64 / (1024. * 1024.)
}

/// ten cells, one per started ten percent
pub fn usage_bar(percent: f64) -> String {
	let filled = ((percent.clamp(0., 100.) / 10.) as usize).min(10);
	format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

fn service_line(message: &mut String, name: &str, state: &str) {
	let emoji = if state == "active" { "✅" } else { "❌" };
	let _ = writeln!(message, "{emoji} {name}: {state}");
}

fn footer(message: &mut String, snapshot: &MetricsSnapshot) {
	let _ = write!(message, "\n📅 {}", snapshot.collected_at.format("%Y-%m-%d %H:%M:%S UTC"));
}

pub fn render_status(snapshot: &MetricsSnapshot) -> String {
	let mut message = String::from("📊 System Status\n\n📊 Hardware:\n");
	let mut any = false;

	if let Some(temp) = snapshot.cpu_temp {
		let emoji = if temp < 70. { "🌡️" } else { "🔥" };
		let _ = writeln!(message, "{emoji} CPU: {temp:.1}°C");
		any = true;
	}
	if let Some(memory) = snapshot.memory {
		let emoji = if memory.percent() < 80. { "💾" } else { "⚠️" };
		let _ = writeln!(message, "{emoji} Memory: {:.1}% used", memory.percent());
		any = true;
	}
	if let Some(disk) = snapshot.disk {
		let emoji = if disk.percent() < 85. { "💽" } else { "⚠️" };
		let _ = writeln!(message, "{emoji} Disk: {:.1}% used", disk.percent());
		any = true;
	}
	if let Some(load) = snapshot.load {
		let _ = writeln!(message, "📈 Load: {:.2} / {:.2} / {:.2}", load.one, load.five, load.fifteen);
		any = true;
	}
	if !any {
		message.push_str("  no hardware metrics available\n");
	}

	message.push_str("\n🔧 Services:\n");
	if snapshot.services.is_empty() {
		message.push_str("  No services configured\n");
	}
	for (name, state) in &snapshot.services {
		service_line(&mut message, name, state);
	}

	footer(&mut message, snapshot);
	message
}

pub fn render_services(snapshot: &MetricsSnapshot) -> String {
	let mut message = String::from("🔧 Service Status\n\n");

	if snapshot.services.is_empty() {
		message.push_str("No services configured\n");
	}
	for (name, state) in &snapshot.services {
		service_line(&mut message, name, state);
	}

	footer(&mut message, snapshot);
	message
}

pub fn render_metrics(snapshot: &MetricsSnapshot) -> String {
	let mut message = String::from("📊 System Metrics\n\n");

	if let Some(memory) = snapshot.memory {
		let percent = memory.percent();
		let _ = writeln!(message, "💾 RAM: {} {percent:.1}%", usage_bar(percent));
		let _ = writeln!(message, "   Used: {:.1} GB / {:.1} GB", gib(memory.used_kib), gib(memory.total_kib));
	}
	if let Some(disk) = snapshot.disk {
		let percent = disk.percent();
		let _ = writeln!(message, "💿 Disk: {} {percent:.1}%", usage_bar(percent));
		let _ = writeln!(message, "   Used: {:.1} GB / {:.1} GB", gib(disk.used_kib), gib(disk.total_kib));
	}
	if let Some(temp) = snapshot.cpu_temp {
		let light = if temp < 60. {
			"🟢"
		} else if temp < 70. {
			"🟡"
		} else {
			"🔴"
		};
		let _ = writeln!(message, "🌡️ Temp: {light} {temp:.1}°C");
	}
	if let Some(load) = snapshot.load {
		let _ = writeln!(message, "📈 Load: {:.2} / {:.2} / {:.2}", load.one, load.five, load.fifteen);
	}
	if snapshot.memory.is_none() && snapshot.disk.is_none() && snapshot.cpu_temp.is_none() && snapshot.load.is_none() {
		message.push_str("no metrics available\n");
	}

	footer(&mut message, snapshot);
	message
}
