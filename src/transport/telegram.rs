//! Telegram Bot API transport.
//!
//! Messages are sent with `sendMessage`, confirmation controls become an inline
//! keyboard with two buttons. Inbound events are fetched by long polling
//! `getUpdates`. The bot token is part of every request url, so request errors
//! are stripped of their url before they are logged.

use std::{fmt, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tokio::sync::mpsc;
use url::Url;

use super::{
	parse_command, ConfirmationControl, DeliveryError, InboundEvent, OutboundMessage, Recipient,
	Transport,
};
use crate::gateway::GatewayEvent;

#[serde_as]
#[derive(Clone, Deserialize)]
pub struct TelegramSettings {
	pub token: String,
	/// chat that receives alerts
	pub chat_id: String,
	#[serde(default = "default_api_url")]
	pub api_url: Url,
	/// how long a single `getUpdates` call waits for updates
	#[serde_as(as = "DurationSeconds<f64>")]
	#[serde(default = "default_poll_timeout")]
	pub poll_timeout: Duration,
}

fn default_api_url() -> Url {
	#[allow(clippy::expect_used)]
	Url::parse("https://api.telegram.org/").expect("constant url is valid")
}

fn default_poll_timeout() -> Duration {
	Duration::from_secs(30)
}

impl fmt::Debug for TelegramSettings {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TelegramSettings")
			.field("token", &"<redacted>")
			.field("chat_id", &self.chat_id)
			.field("api_url", &self.api_url.as_str())
			.field("poll_timeout", &self.poll_timeout)
			.finish()
	}
}

/// body of every bot api response
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
	ok: bool,
	result: Option<T>,
	description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
	chat_id: &'a str,
	text: &'a str,
	disable_web_page_preview: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	reply_markup: Option<InlineKeyboardMarkup>,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardMarkup {
	inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardButton {
	text: String,
	callback_data: String,
}

impl From<ConfirmationControl> for InlineKeyboardMarkup {
	fn from(control: ConfirmationControl) -> Self {
		Self {
			inline_keyboard: vec![vec![
				InlineKeyboardButton { text: control.confirm_label, callback_data: control.confirm_id },
				InlineKeyboardButton { text: control.cancel_label, callback_data: control.cancel_id },
			]],
		}
	}
}

#[derive(Debug, Serialize)]
struct GetUpdates<'a> {
	offset: i64,
	timeout: u64,
	allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct AnswerCallbackQuery<'a> {
	callback_query_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct Update {
	update_id: i64,
	message: Option<Message>,
	callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
	from: Option<User>,
	chat: Chat,
	text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
	id: i64,
}

#[derive(Debug, Deserialize)]
struct Chat {
	id: i64,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
	id: String,
	from: User,
	message: Option<Message>,
	data: Option<String>,
}

impl Update {
	fn into_event(self) -> Option<InboundEvent> {
		if let Some(query) = self.callback_query {
			let user_id = query.from.id.to_string();
			let chat_id = query.message.map_or_else(|| user_id.clone(), |message| message.chat.id.to_string());

			return Some(InboundEvent::Callback { user_id, chat_id, data: query.data? });
		}

		let message = self.message?;
		let (name, args) = parse_command(message.text.as_deref()?)?;

		Some(InboundEvent::Command {
			user_id: message.from?.id.to_string(),
			chat_id: message.chat.id.to_string(),
			name,
			args,
		})
	}
}

/// sends and receives through one bot account
#[derive(Clone)]
pub struct TelegramBot {
	http: reqwest::Client,
	/// `{api_url}/bot{token}/`, never log this
	base: Url,
	alert_chat: String,
	poll_timeout: Duration,
}

impl fmt::Debug for TelegramBot {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TelegramBot").field("alert_chat", &self.alert_chat).finish()
	}
}

impl TelegramBot {
	pub fn new(settings: &TelegramSettings) -> Result<Self> {
		let base = Url::parse(&format!(
			"{}/bot{}/",
			settings.api_url.as_str().trim_end_matches('/'),
			settings.token
		))
		.map_err(|_| anyhow::anyhow!("telegram api url or bot token is malformed"))?;

		// long polling requests stay open for the poll timeout
		let http = reqwest::Client::builder()
			.timeout(settings.poll_timeout + Duration::from_secs(10))
			.build()
			.context("failed to build http client")?;

		Ok(Self { http, base, alert_chat: settings.chat_id.clone(), poll_timeout: settings.poll_timeout })
	}

	async fn call<B: Serialize, T: DeserializeOwned>(
		&self,
		method: &str,
		body: &B,
	) -> Result<T, DeliveryError> {
		let url = self.base.join(method).map_err(|_| DeliveryError::Rejected {
			status: 0,
			description: format!("invalid method {method}"),
		})?;

		let response = self.http.post(url).json(body).send().await.map_err(reqwest::Error::without_url)?;
		let status = response.status().as_u16();
		let response: ApiResponse<T> = response.json().await.map_err(reqwest::Error::without_url)?;

		match response {
			ApiResponse { ok: true, result: Some(result), .. } => Ok(result),
			ApiResponse { description, .. } => Err(DeliveryError::Rejected {
				status,
				description: description.unwrap_or_else(|| "no description".to_owned()),
			}),
		}
	}

	async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, DeliveryError> {
		let body = GetUpdates {
			offset,
			timeout: self.poll_timeout.as_secs(),
			allowed_updates: &["message", "callback_query"],
		};

		self.call("getUpdates", &body).await
	}

	/// stops the spinner on the pressed button
	async fn answer_callback(&self, id: &str) {
		let body = AnswerCallbackQuery { callback_query_id: id };

		if let Err(err) = self.call::<_, bool>("answerCallbackQuery", &body).await {
			tracing::debug!("failed to answer callback query: {err}");
		}
	}

	/// Polls for updates and forwards commands and button presses to the
	/// gateway until the gateway goes away. Failed polls are retried with an
	/// exponential backoff.
	pub async fn poll(self, tx: mpsc::Sender<GatewayEvent>) {
		let mut backoff = ExponentialBackoff { max_elapsed_time: None, ..Default::default() };
		let mut offset = 0;

		loop {
			let updates = match self.get_updates(offset).await {
				Ok(updates) => {
					backoff.reset();
					updates
				}
				Err(err) => {
					let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
					tracing::warn!("polling telegram updates failed, retrying in {delay:?}: {err}");
					tokio::time::sleep(delay).await;
					continue;
				}
			};

			for update in updates {
				offset = offset.max(update.update_id + 1);

				if let Some(query) = &update.callback_query {
					self.answer_callback(&query.id).await;
				}

				let event = match update.into_event() {
					Some(event) => event,
					None => continue,
				};

				if tx.send(GatewayEvent::Inbound(event)).await.is_err() {
					tracing::info!("gateway stopped, stop polling telegram");
					return;
				}
			}
		}
	}
}

#[async_trait]
impl Transport for TelegramBot {
	async fn send(&self, message: OutboundMessage) -> Result<(), DeliveryError> {
		let chat_id = match &message.recipient {
			Recipient::AlertChannel => self.alert_chat.as_str(),
			Recipient::Chat(chat_id) => chat_id.as_str(),
		};

		let body = SendMessage {
			chat_id,
			text: &message.text,
			disable_web_page_preview: true,
			reply_markup: message.confirmation.map(InlineKeyboardMarkup::from),
		};

		self.call::<_, serde::de::IgnoredAny>("sendMessage", &body).await?;
		Ok(())
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use serde_json::json;

	use super::*;

	pub(crate) fn test_settings() -> TelegramSettings {
		TelegramSettings {
			token: "123:SECRET".into(),
			chat_id: "-100".into(),
			api_url: default_api_url(),
			poll_timeout: default_poll_timeout(),
		}
	}

	fn update(value: serde_json::Value) -> Update {
		serde_json::from_value(value).unwrap()
	}

	#[test]
	fn command_message() {
		let event = update(json!({
			"update_id": 7,
			"message": {
				"message_id": 1,
				"from": { "id": 42, "is_bot": false, "first_name": "ops" },
				"chat": { "id": -100, "type": "group" },
				"text": "/restart@barker_bot nginx",
			}
		}))
		.into_event();

		assert_eq!(
			event,
			Some(InboundEvent::Command {
				user_id: "42".into(),
				chat_id: "-100".into(),
				name: "restart".into(),
				args: vec!["nginx".into()],
			})
		);
	}

	#[test]
	fn plain_text_is_ignored() {
		let event = update(json!({
			"update_id": 8,
			"message": { "from": { "id": 42 }, "chat": { "id": 42 }, "text": "hello" }
		}))
		.into_event();

		assert_eq!(event, None);
	}

	#[test]
	fn button_press() {
		let event = update(json!({
			"update_id": 9,
			"callback_query": {
				"id": "abc",
				"from": { "id": 42 },
				"message": { "chat": { "id": 42 } },
				"data": "confirm:XYZ",
			}
		}))
		.into_event();

		assert_eq!(
			event,
			Some(InboundEvent::Callback { user_id: "42".into(), chat_id: "42".into(), data: "confirm:XYZ".into() })
		);
	}

	#[test]
	fn confirmation_becomes_inline_keyboard() {
		let markup = InlineKeyboardMarkup::from(ConfirmationControl {
			confirm_label: "✅ Confirm".into(),
			confirm_id: "confirm:1".into(),
			cancel_label: "❌ Cancel".into(),
			cancel_id: "cancel:1".into(),
		});

		assert_eq!(
			serde_json::to_value(&markup).unwrap(),
			json!({ "inline_keyboard": [[
				{ "text": "✅ Confirm", "callback_data": "confirm:1" },
				{ "text": "❌ Cancel", "callback_data": "cancel:1" },
			]] })
		);
	}

	#[test]
	fn token_stays_out_of_debug_output() {
		let settings = test_settings();

		assert!(!format!("{settings:?}").contains("SECRET"));
		let bot = TelegramBot::new(&settings).unwrap();
		assert!(!format!("{bot:?}").contains("SECRET"));
		assert_eq!(bot.base.as_str(), "https://api.telegram.org/bot123:SECRET/");
	}
}
