//! Runs confirmed privileged actions and reads the journal.
//!
//! The only action is restarting a service unit. A zero exit status isn't
//! trusted on its own: the unit's state is read back before reporting success.
//! Outcomes are reported once and never retried.

use std::{fmt::Debug, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tokio::process::Command;

use crate::alert_renderer::truncate;

/// longest error output shown to the requester
pub const MAX_REASON_LEN: usize = 200;

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ActionSettings {
	/// hard limit for the restart itself
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_timeout")]
	pub timeout: Duration,
	/// hard limit for reading back the unit state
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_verify_timeout")]
	pub verify_timeout: Duration,
	/// run systemctl through sudo
	#[serde(default = "use_sudo")]
	pub use_sudo: bool,
}

fn default_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_verify_timeout() -> Duration {
	Duration::from_secs(5)
}

fn use_sudo() -> bool {
	true
}

impl Default for ActionSettings {
	fn default() -> Self {
		Self { timeout: default_timeout(), verify_timeout: default_verify_timeout(), use_sudo: true }
	}
}

#[derive(Error, Debug)]
pub enum RunError {
	#[error("failed to spawn {command}: {source}")]
	Spawn {
		command: &'static str,
		#[source]
		source: std::io::Error,
	},
	#[error("{command} timed out")]
	TimedOut { command: &'static str },
}

/// exit status and error output of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
	pub success: bool,
	pub stderr: String,
}

/// executes the privileged operations on validated targets
#[async_trait]
pub trait ActionRunner: Send + Sync + Debug {
	async fn restart(&self, target: &str) -> Result<RunOutput, RunError>;
	/// whether the unit is running
	async fn is_active(&self, target: &str) -> Result<bool, RunError>;
	/// the last `lines` journal entries of `unit`, or the warnings and errors
	/// of the whole system without one. `unit` has to be a valid unit name.
	async fn logs(&self, unit: Option<&str>, lines: usize) -> Result<String, RunError>;
}

/// runs `systemctl`, optionally through `sudo`
#[derive(Debug, Clone)]
pub struct SystemctlRunner {
	use_sudo: bool,
}

impl SystemctlRunner {
	pub fn new(use_sudo: bool) -> Self {
		Self { use_sudo }
	}

	fn systemctl(&self, args: &[&str]) -> (Command, &'static str) {
		let (mut command, program) = if self.use_sudo {
			let mut command = Command::new("sudo");
			command.args(["-n", "systemctl"]);
			(command, "sudo")
		} else {
			(Command::new("systemctl"), "systemctl")
		};

		command.args(args).stdin(Stdio::null());
		(command, program)
	}
}

#[async_trait]
impl ActionRunner for SystemctlRunner {
	async fn restart(&self, target: &str) -> Result<RunOutput, RunError> {
		let (mut command, program) = self.systemctl(&["restart", "--", target]);

		let output = command
			.output()
			.await
			.map_err(|source| RunError::Spawn { command: program, source })?;

		Ok(RunOutput {
			success: output.status.success(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
		})
	}

	/// `systemctl is-active` doesn't need privileges
	async fn is_active(&self, target: &str) -> Result<bool, RunError> {
		let output = Command::new("systemctl")
			.args(["is-active", "--", target])
			.stdin(Stdio::null())
			.output()
			.await
			.map_err(|source| RunError::Spawn { command: "systemctl", source })?;

		Ok(String::from_utf8_lossy(&output.stdout).trim() == "active")
	}

	async fn logs(&self, unit: Option<&str>, lines: usize) -> Result<String, RunError> {
		let mut command = Command::new("journalctl");
		match unit {
			Some(unit) => command.arg(format!("--unit={unit}")),
			None => command.args(["-p", "4"]),
		};

		let output = command
			.args(["-n", &lines.to_string(), "--no-pager", "-o", "short"])
			.stdin(Stdio::null())
			.output()
			.await
			.map_err(|source| RunError::Spawn { command: "journalctl", source })?;

		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
	/// restarted and verified to be running
	Success,
	TimedOut,
	/// reason is truncated to [MAX_REASON_LEN]
	Failed(String),
}

impl Outcome {
	/// label used for metrics
	pub fn as_str(&self) -> &'static str {
		match self {
			Outcome::Success => "success",
			Outcome::TimedOut => "timed_out",
			Outcome::Failed(_) => "failed",
		}
	}
}

#[derive(Debug, Clone)]
pub struct ActionExecutor {
	runner: Arc<dyn ActionRunner>,
	timeout: Duration,
	verify_timeout: Duration,
}

impl ActionExecutor {
	pub fn new(runner: Arc<dyn ActionRunner>, settings: &ActionSettings) -> Self {
		Self { runner, timeout: settings.timeout, verify_timeout: settings.verify_timeout }
	}

	/// restarts `target` and checks that it's running afterwards. Once the
	/// timeout is hit the restart is no longer awaited, whatever it does later
	/// is discarded.
	pub async fn execute(&self, target: &str) -> Outcome {
		let output = match tokio::time::timeout(self.timeout, self.runner.restart(target)).await {
			Err(_) => {
				tracing::warn!("restart of {target} timed out after {:?}", self.timeout);
				return Outcome::TimedOut;
			}
			Ok(Err(err)) => {
				tracing::error!("restart of {target} failed: {err}");
				return Outcome::Failed(truncate(&err.to_string(), MAX_REASON_LEN));
			}
			Ok(Ok(output)) => output,
		};

		if !output.success {
			tracing::warn!("restart of {target} exited unsuccessfully");
			let reason = if output.stderr.is_empty() { "unknown error" } else { &output.stderr };
			return Outcome::Failed(truncate(reason, MAX_REASON_LEN));
		}

		match tokio::time::timeout(self.verify_timeout, self.runner.is_active(target)).await {
			Ok(Ok(true)) => {
				tracing::info!("restarted {target}");
				Outcome::Success
			}
			Ok(Ok(false)) => {
				tracing::warn!("{target} restarted but is not active");
				Outcome::Failed("restarted but not active".to_owned())
			}
			Ok(Err(err)) => {
				tracing::warn!("could not verify state of {target}: {err}");
				Outcome::Failed(truncate(&format!("restarted but state unknown: {err}"), MAX_REASON_LEN))
			}
			Err(_) => {
				tracing::warn!("verifying state of {target} timed out");
				Outcome::Failed("restarted but state unknown: verification timed out".to_owned())
			}
		}
	}

	/// the last `lines` journal entries, oldest first, see [ActionRunner::logs]
	pub async fn read_logs(&self, unit: Option<&str>, lines: usize) -> Result<Vec<String>, RunError> {
		let output = tokio::time::timeout(self.timeout, self.runner.logs(unit, lines))
			.await
			.map_err(|_| RunError::TimedOut { command: "journalctl" })??;

		let entries: Vec<String> =
			output.lines().map(str::trim_end).filter(|line| !line.is_empty()).map(str::to_owned).collect();
		let skip = entries.len().saturating_sub(lines);

		Ok(entries.into_iter().skip(skip).collect())
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::sync::Mutex;

	use super::*;

	/// records calls and answers with canned results
	#[derive(Debug)]
	pub(crate) struct FakeRunner {
		pub(crate) restarts: Mutex<Vec<String>>,
		pub(crate) output: RunOutput,
		pub(crate) active: bool,
		pub(crate) delay: Duration,
		/// journal reads as unit and line count
		pub(crate) log_reads: Mutex<Vec<(Option<String>, usize)>>,
		pub(crate) journal: String,
	}

	impl Default for FakeRunner {
		fn default() -> Self {
			Self {
				restarts: Mutex::new(Vec::new()),
				output: RunOutput { success: true, stderr: String::new() },
				active: true,
				delay: Duration::ZERO,
				log_reads: Mutex::new(Vec::new()),
				journal: "Mar 01 12:00:01 host nginx[1]: started\nMar 01 12:00:02 host nginx[1]: ready\n".to_owned(),
			}
		}
	}

	impl FakeRunner {
		pub(crate) fn restarted(&self) -> Vec<String> {
			self.restarts.lock().unwrap().clone()
		}

		pub(crate) fn log_reads(&self) -> Vec<(Option<String>, usize)> {
			self.log_reads.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl ActionRunner for FakeRunner {
		async fn restart(&self, target: &str) -> Result<RunOutput, RunError> {
			self.restarts.lock().unwrap().push(target.to_owned());
			tokio::time::sleep(self.delay).await;
			Ok(self.output.clone())
		}

		async fn is_active(&self, _: &str) -> Result<bool, RunError> {
			Ok(self.active)
		}

		async fn logs(&self, unit: Option<&str>, lines: usize) -> Result<String, RunError> {
			self.log_reads.lock().unwrap().push((unit.map(str::to_owned), lines));
			tokio::time::sleep(self.delay).await;
			Ok(self.journal.clone())
		}
	}

	fn executor(runner: FakeRunner) -> (ActionExecutor, Arc<FakeRunner>) {
		let runner = Arc::new(runner);
		(ActionExecutor::new(runner.clone(), &ActionSettings::default()), runner)
	}

	#[tokio::test]
	async fn verified_restart_succeeds() {
		let (executor, runner) = executor(FakeRunner::default());

		assert_eq!(executor.execute("nginx").await, Outcome::Success);
		assert_eq!(runner.restarted(), vec!["nginx"]);
	}

	#[tokio::test]
	async fn inactive_after_restart_fails() {
		let (executor, _) = executor(FakeRunner { active: false, ..Default::default() });

		assert_eq!(executor.execute("nginx").await, Outcome::Failed("restarted but not active".into()));
	}

	#[tokio::test]
	async fn error_output_is_truncated() {
		let stderr = "x".repeat(500);
		let (executor, _) = executor(FakeRunner {
			output: RunOutput { success: false, stderr },
			..Default::default()
		});

		match executor.execute("nginx").await {
			Outcome::Failed(reason) => assert_eq!(reason.chars().count(), MAX_REASON_LEN),
			other => panic!("unexpected outcome {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn slow_restart_times_out() {
		let (executor, runner) =
			executor(FakeRunner { delay: Duration::from_secs(60), ..Default::default() });

		assert_eq!(executor.execute("nginx").await, Outcome::TimedOut);
		assert_eq!(runner.restarted().len(), 1);
	}

	#[tokio::test]
	async fn reads_last_journal_entries() {
		let journal = (1..=60).map(|n| format!("entry {n}\n")).collect();
		let (executor, runner) = executor(FakeRunner { journal, ..Default::default() });

		let entries = executor.read_logs(Some("nginx"), 5).await.unwrap();
		assert_eq!(entries, vec!["entry 56", "entry 57", "entry 58", "entry 59", "entry 60"]);
		assert_eq!(runner.log_reads(), vec![(Some("nginx".to_owned()), 5)]);
	}

	#[tokio::test(start_paused = true)]
	async fn slow_journal_read_times_out() {
		let (executor, _) = executor(FakeRunner { delay: Duration::from_secs(60), ..Default::default() });

		assert!(matches!(
			executor.read_logs(None, 10).await,
			Err(RunError::TimedOut { command: "journalctl" })
		));
	}
}
