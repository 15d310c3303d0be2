//! Here we expose prometheus metrics about barker
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use axum::{
	extract::Extension,
	http::{header::CONTENT_TYPE, StatusCode},
	response::{IntoResponse, Response},
	routing::get,
	Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryEndpointSettings {
	pub bind_address: IpAddr,
	pub port: u16,
}

impl TelemetryEndpointSettings {
	pub fn to_socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.bind_address, self.port)
	}
}

async fn metrics_handler(Extension(registry): Extension<Registry>) -> Response {
	let mut buffer = vec![];
	let encoder = TextEncoder::new();
	let metric_families = registry.gather();

	if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
		tracing::error!("failed to encode metrics: {err}");
		return StatusCode::INTERNAL_SERVER_ERROR.into_response();
	}

	([(CONTENT_TYPE, encoder.format_type().to_owned())], buffer).into_response()
}

pub fn router(registry: Registry) -> Router {
	Router::new().route("/metrics", get(metrics_handler)).layer(Extension(registry))
}

pub async fn run_telemetry_endpoint(settings: TelemetryEndpointSettings, registry: Registry) -> Result<()> {
	let addr = settings.to_socket_addr();
	tracing::info!("serving metrics on {addr}");

	axum::Server::bind(&addr)
		.serve(router(registry).into_make_service())
		.await
		.context("telemetry endpoint crashed")?;

	Ok(())
}
