use std::{collections::HashMap, env, path::PathBuf, time::Duration};

use clap::{Arg, Command};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;

use crate::{
	alertmanager_webhook_receiver::AlertReceiverSettings,
	allow_list::AllowList,
	auth::AuthSettings,
	batch::BatchSettings,
	dedup::DedupSettings,
	executor::ActionSettings,
	log::LogSettings,
	quiet_hours::QuietHoursSettings,
	rate_limit::{default_policies, RateLimitPolicy},
	telemetry_endpoint::TelemetryEndpointSettings,
	transport::telegram::TelegramSettings,
};

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("can't load config: {0}")]
	Load(#[from] config::ConfigError),
	#[error("invalid config: {0}")]
	Invalid(String),
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub log: LogSettings,
	pub telegram: TelegramSettings,
	/// telegram user ids allowed to run privileged actions
	pub admins: AllowList,
	/// service units that may be restarted
	#[serde(default)]
	pub allowed_actions: AllowList,
	/// service units shown by `/status` and `/services`
	#[serde(default)]
	pub monitored_services: Vec<String>,
	#[serde(default)]
	pub system_prefix: Option<String>,
	#[serde(default)]
	pub dedup: DedupSettings,
	/// merged over [default_policies], see [Settings::rate_limit_policies]
	#[serde(default)]
	pub rate_limits: HashMap<String, RateLimitPolicy>,
	#[serde(default)]
	pub quiet_hours: QuietHoursSettings,
	#[serde(default)]
	pub batch: BatchSettings,
	#[serde(default)]
	pub auth: AuthSettings,
	#[serde(default)]
	pub actions: ActionSettings,
	/// how often expired dedup, rate limit and auth state is swept
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_housekeeping_interval")]
	pub housekeeping_interval: Duration,
	/// directory with `<alertname>.tera` templates
	#[serde(default)]
	pub templates_dir: Option<PathBuf>,
	pub alert_webhook_receiver: AlertReceiverSettings,
	pub telemetry_endpoint: TelemetryEndpointSettings,
}

fn default_housekeeping_interval() -> Duration {
	Duration::from_secs(60)
}

impl Settings {
	/// parses the command line and loads the config file it names. Returns the
	/// config path so the file can be read again on reload.
	pub fn load() -> Result<(String, Self), ConfigError> {
		let opts = Command::new(clap::crate_name!())
			.version(clap::crate_version!())
			.about(clap::crate_description!())
			.author(clap::crate_authors!())
			.args(&[
				Arg::new("config")
					.help("path of config file")
					.takes_value(true)
					.short('c')
					.long("config")
					.default_value("./config.yaml"),
				Arg::new("level")
					.help("log level")
					.possible_values(["error", "warn", "info", "debug", "trace"])
					.ignore_case(true)
					.takes_value(true)
					.long("log"),
			])
			.get_matches();

		let config_path = opts.value_of("config").unwrap_or("./config.yaml").to_owned();

		let mut settings = Self::from_file(&config_path)?;

		if let Some(level) = opts.value_of("level") {
			settings.log.level = level.to_string();
		}

		Ok((config_path, settings))
	}

	/// the config file, overridden by `BARKER_*` environment variables and the
	/// `TELEGRAM_*` variables
	pub fn from_file(path: &str) -> Result<Self, ConfigError> {
		let builder = Config::builder()
			.add_source(File::with_name(path))
			.add_source(
				Environment::with_prefix("BARKER")
					.prefix_separator("_")
					.separator("__")
					.try_parsing(true),
			);

		Self::build(with_telegram_overrides(builder)?)
	}

	fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
		let settings: Self = builder.build()?.try_deserialize()?;
		settings.validate()?;

		Ok(settings)
	}

	/// configured rate limits over the defaults
	pub fn rate_limit_policies(&self) -> HashMap<String, RateLimitPolicy> {
		let mut policies = default_policies();
		policies.extend(self.rate_limits.iter().map(|(class, policy)| (class.clone(), *policy)));
		policies
	}

	fn validate(&self) -> Result<(), ConfigError> {
		let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_owned()));

		if self.telegram.token.trim().is_empty() {
			return invalid("telegram.token is empty");
		}
		if self.telegram.chat_id.trim().is_empty() {
			return invalid("telegram.chat_id is empty");
		}
		if self.admins.is_empty() {
			return invalid("no admins configured");
		}

		let names = self.allowed_actions.invalid_unit_names();
		if !names.is_empty() {
			return Err(ConfigError::Invalid(format!(
				"allowed_actions contains invalid service names: {}",
				names.join(", ")
			)));
		}

		if self.quiet_hours.start > 23 || self.quiet_hours.end > 23 {
			return invalid("quiet_hours.start and quiet_hours.end have to be between 0 and 23");
		}
		if self.batch.max_items == 0 || self.batch.max_buckets == 0 {
			return invalid("batch.max_items and batch.max_buckets have to be positive");
		}
		if self.rate_limits.values().any(|policy| policy.max == 0) {
			return invalid("rate limits have to allow at least one attempt");
		}
		if self.housekeeping_interval.is_zero() {
			return invalid("housekeeping_interval has to be positive");
		}

		Ok(())
	}

	#[cfg(test)]
	pub fn for_tests() -> Self {
		use std::net::{IpAddr, Ipv4Addr};

		use crate::transport::telegram::tests::test_settings;

		Self {
			log: LogSettings::default(),
			telegram: test_settings(),
			admins: ["U1", "U2"].into_iter().collect(),
			allowed_actions: ["nginx", "postgresql"].into_iter().collect(),
			monitored_services: vec!["nginx".into()],
			system_prefix: None,
			dedup: DedupSettings::default(),
			rate_limits: HashMap::new(),
			quiet_hours: QuietHoursSettings { utc_offset_hours: Some(0), ..Default::default() },
			batch: BatchSettings::default(),
			auth: AuthSettings::default(),
			actions: ActionSettings::default(),
			housekeeping_interval: default_housekeeping_interval(),
			templates_dir: None,
			alert_webhook_receiver: AlertReceiverSettings {
				bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
				port: 9095,
			},
			telemetry_endpoint: TelemetryEndpointSettings {
				bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
				port: 9096,
			},
		}
	}
}

/// the environment variables the shell scripts of older deployments use
fn with_telegram_overrides(
	mut builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
	if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
		builder = builder.set_override("telegram.token", token)?;
	}
	if let Ok(chat_id) = env::var("TELEGRAM_CHAT_ID") {
		builder = builder.set_override("telegram.chat_id", chat_id)?;
	}
	if let Ok(ids) = env::var("TELEGRAM_ADMIN_IDS") {
		let ids: Vec<String> =
			ids.split(',').map(str::trim).filter(|id| !id.is_empty()).map(str::to_owned).collect();
		builder = builder.set_override("admins", ids)?;
	}

	Ok(builder)
}
