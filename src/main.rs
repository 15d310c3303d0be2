//! host monitoring notifier for a telegram chat
//!
//! Features:
//! - receives prometheus alertmanager webhooks, deduplicates, rate limits and
//!   batches the alerts and holds back non critical ones during quiet hours
//! - per alert name configurable tera templates
//! - service restarts from the chat, guarded by allow lists, a one time code
//!   and an explicit confirmation

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
	signal::unix::{signal, SignalKind},
	sync::mpsc,
};

use crate::{
	clock::SystemClock,
	executor::SystemctlRunner,
	gateway::{Collaborators, Gateway, GatewayEvent},
	settings::Settings,
	status::HostMetrics,
	transport::telegram::TelegramBot,
};

mod alert;
mod alert_renderer;
mod alertmanager_webhook_receiver;
mod allow_list;
mod auth;
mod batch;
mod clock;
mod dedup;
mod executor;
mod gateway;
mod log;
mod quiet_hours;
mod rate_limit;
mod settings;
mod status;
mod telemetry_endpoint;
mod transport;

/// exit the complete program if one thread panics
fn setup_panic_handler() {
	let default_panic = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		default_panic(info);
		std::process::exit(1);
	}));
}

/// SIGHUP reloads the allow lists from the config file, SIGINT and SIGTERM
/// stop the gateway
async fn handle_signals(config_path: String, tx: mpsc::Sender<GatewayEvent>) -> Result<()> {
	let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
	let mut interrupt = signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;
	let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;

	loop {
		tokio::select! {
			_ = hangup.recv() => match Settings::from_file(&config_path) {
				Ok(settings) => {
					let event = GatewayEvent::ReloadAllowLists {
						admins: settings.admins,
						actions: settings.allowed_actions,
					};
					if tx.send(event).await.is_err() {
						return Ok(());
					}
				}
				Err(err) => tracing::error!("failed to reload {config_path}, keeping the current allow lists: {err}"),
			},
			_ = interrupt.recv() => break,
			_ = terminate.recv() => break,
		}
	}

	tracing::info!("received termination signal");
	let _ = tx.send(GatewayEvent::Shutdown).await;

	Ok(())
}

/// the entry point of the program
#[tokio::main]
pub async fn main() -> Result<()> {
	setup_panic_handler();

	let (config_path, settings) = Settings::load().context("could not load settings")?;

	log::setup_logging(&settings.log).context("could not setup logging")?;
	tracing::info!("starting {} {}", clap::crate_name!(), clap::crate_version!());

	let registry = prometheus::default_registry().clone();

	let bot = TelegramBot::new(&settings.telegram).context("failed to construct telegram bot")?;

	let collaborators = Collaborators {
		transport: Arc::new(bot.clone()),
		runner: Arc::new(SystemctlRunner::new(settings.actions.use_sudo)),
		metrics_source: Arc::new(HostMetrics::new(settings.monitored_services.clone())),
		dedup_store: settings.dedup.store(),
	};

	let gateway = Gateway::new(&settings, collaborators, Arc::new(SystemClock), &registry)
		.context("failed to construct gateway")?;

	let (tx, rx) = mpsc::channel(64);

	tokio::spawn(bot.poll(tx.clone()));

	let tx_signals = tx.clone();
	tokio::spawn(async move {
		#[allow(clippy::expect_used)]
		handle_signals(config_path, tx_signals).await.expect("failed to install signal handlers");
	});

	let receiver_settings = settings.alert_webhook_receiver.clone();
	tokio::spawn(async move {
		#[allow(clippy::expect_used)]
		alertmanager_webhook_receiver::run_alert_receiver(receiver_settings, tx)
			.await
			.expect("alertmanager receiver endpoint failed to start or crashed");
	});

	let telemetry_settings = settings.telemetry_endpoint.clone();
	tokio::spawn(async move {
		#[allow(clippy::expect_used)]
		telemetry_endpoint::run_telemetry_endpoint(telemetry_settings, registry)
			.await
			.expect("telemetry endpoint failed to start or crashed");
	});

	gateway.run(rx).await;

	Ok(())
}
