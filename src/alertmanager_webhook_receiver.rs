//! http endpoint receiving alerts from prometheus alertmanager
//!
//! Alerts are validated here and handed to the [gateway](crate::gateway), the
//! gateway's verdict is returned to the caller. Malformed payloads are rejected
//! before they reach the gateway.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use axum::{
	extract::{rejection::JsonRejection, Extension, Json},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc::Sender, oneshot};

use crate::{alert::Payload, gateway::GatewayEvent};

#[derive(Debug, Deserialize, Clone)]
pub struct AlertReceiverSettings {
	pub bind_address: IpAddr,
	pub port: u16,
}

impl AlertReceiverSettings {
	pub fn to_socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.bind_address, self.port)
	}
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
	(status, Json(json!({ "status": "error", "message": message.into() }))).into_response()
}

fn gateway_unavailable() -> Response {
	error(StatusCode::SERVICE_UNAVAILABLE, "gateway is not running")
}

async fn receive_alerts(
	Extension(tx): Extension<Sender<GatewayEvent>>,
	payload: Result<Json<Payload>, JsonRejection>,
) -> Response {
	let payload = match payload {
		Ok(Json(payload)) => payload,
		Err(err) => {
			tracing::debug!("failed to deserialize alerts: {:?}", err);
			return error(StatusCode::BAD_REQUEST, err.to_string());
		}
	};

	let alerts = match payload.into_alerts(Utc::now()) {
		Ok(alerts) => alerts,
		Err(err) => {
			tracing::info!("rejected malformed alert payload: {err}");
			return error(StatusCode::BAD_REQUEST, err.to_string());
		}
	};

	if alerts.is_empty() {
		return Json(json!({ "status": "success", "message": "No alerts to process" })).into_response();
	}

	let (reply, rx_reply) = oneshot::channel();
	if tx.send(GatewayEvent::Alerts { alerts, reply }).await.is_err() {
		return gateway_unavailable();
	}

	match rx_reply.await {
		Ok(report) => Json(report).into_response(),
		Err(_) => gateway_unavailable(),
	}
}

async fn health() -> Response {
	Json(json!({ "status": "healthy", "service": clap::crate_name!(), "timestamp": Utc::now() }))
		.into_response()
}

/// known templates and the alert categories seen so far
async fn templates(Extension(tx): Extension<Sender<GatewayEvent>>) -> Response {
	let (reply, rx_reply) = oneshot::channel();
	if tx.send(GatewayEvent::Introspect(reply)).await.is_err() {
		return gateway_unavailable();
	}

	match rx_reply.await {
		Ok(introspection) => Json(introspection).into_response(),
		Err(_) => gateway_unavailable(),
	}
}

pub fn router(tx: Sender<GatewayEvent>) -> Router {
	Router::new()
		.route("/webhook", post(receive_alerts))
		.route("/api/v2/alerts", post(receive_alerts))
		.route("/health", get(health))
		.route("/templates", get(templates))
		.layer(Extension(tx))
}

pub async fn run_alert_receiver(settings: AlertReceiverSettings, tx: Sender<GatewayEvent>) -> Result<()> {
	let addr = settings.to_socket_addr();
	tracing::info!("receiving alerts on {addr}");

	axum::Server::bind(&addr)
		.serve(router(tx).into_make_service())
		.await
		.context("alert receiver endpoint crashed")?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use axum::{body::Body, http::Request};
	use serde_json::Value;
	use tokio::sync::mpsc;
	use tower::ServiceExt;

	use super::*;
	use crate::gateway::{IngestReport, Introspection};

	/// answers every ingestion with all alerts accepted
	fn fake_gateway() -> (Sender<GatewayEvent>, tokio::task::JoinHandle<usize>) {
		let (tx, mut rx) = mpsc::channel(8);

		let handle = tokio::spawn(async move {
			let mut received = 0;
			while let Some(event) = rx.recv().await {
				match event {
					GatewayEvent::Alerts { alerts, reply } => {
						received += alerts.len();
						let _ = reply.send(IngestReport::new(alerts.len(), alerts.len(), 0));
					}
					GatewayEvent::Introspect(reply) => {
						let _ = reply.send(Introspection {
							templates: vec!["default".into()],
							categories: vec!["alerts:warning:HighCPU".into()],
						});
					}
					_ => {}
				}
			}
			received
		});

		(tx, handle)
	}

	async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
		let request = Request::builder()
			.method(method)
			.uri(uri)
			.header("content-type", "application/json")
			.body(Body::from(body.to_owned()))
			.unwrap();

		let response = app.oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();

		(status, serde_json::from_slice(&bytes).unwrap())
	}

	#[tokio::test]
	async fn accepts_notification_and_bare_list() {
		let (tx, handle) = fake_gateway();

		let notification = r#"{"alerts":[{"status":"firing","labels":{"alertname":"HighCPU","severity":"warning"}}]}"#;
		let (status, body) = call(router(tx.clone()), "POST", "/webhook", notification).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], "success");
		assert_eq!(body["total"], 1);
		assert_eq!(body["accepted"], 1);

		let list = r#"[{"status":"resolved","labels":{"alertname":"A"}},{"status":"firing","labels":{"alertname":"B"}}]"#;
		let (status, body) = call(router(tx.clone()), "POST", "/api/v2/alerts", list).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["total"], 2);

		drop(tx);
		assert_eq!(handle.await.unwrap(), 3);
	}

	#[tokio::test]
	async fn rejects_malformed_payloads_without_forwarding() {
		let (tx, handle) = fake_gateway();

		let (status, _) = call(router(tx.clone()), "POST", "/webhook", "not json").await;
		assert_eq!(status, StatusCode::BAD_REQUEST);

		let missing_name = r#"{"alerts":[{"status":"firing","labels":{"instance":"host1"}}]}"#;
		let (status, body) = call(router(tx.clone()), "POST", "/webhook", missing_name).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body["status"], "error");

		drop(tx);
		assert_eq!(handle.await.unwrap(), 0);
	}

	#[tokio::test]
	async fn empty_payload() {
		let (tx, _) = fake_gateway();

		let (status, body) = call(router(tx), "POST", "/webhook", r#"{"alerts":[]}"#).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["message"], "No alerts to process");
	}

	#[tokio::test]
	async fn stopped_gateway() {
		let (tx, rx) = mpsc::channel(1);
		drop(rx);

		let alert = r#"[{"status":"firing","labels":{"alertname":"A"}}]"#;
		let (status, _) = call(router(tx), "POST", "/webhook", alert).await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn introspection() {
		let (tx, _) = fake_gateway();

		let (status, body) = call(router(tx.clone()), "GET", "/health", "").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], "healthy");

		let (status, body) = call(router(tx), "GET", "/templates", "").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["templates"][0], "default");
		assert_eq!(body["categories"][0], "alerts:warning:HighCPU");
	}
}
