//! The chat the gateway talks through.
//!
//! Outbound messages go through the [Transport] trait. Inbound commands and
//! button presses are turned into [InboundEvent]s by the transport
//! implementation and handed to the gateway loop.

pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;

/// where an outbound message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
	/// the configured chat that receives alerts
	AlertChannel,
	/// a specific chat, a private chat with a user has the user's id
	Chat(String),
}

/// two buttons attached to a message. The ids are opaque to the transport and
/// come back in an [InboundEvent::Callback].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationControl {
	pub confirm_label: String,
	pub confirm_id: String,
	pub cancel_label: String,
	pub cancel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
	pub recipient: Recipient,
	pub text: String,
	pub confirmation: Option<ConfirmationControl>,
}

impl OutboundMessage {
	pub fn to_alert_channel(text: impl Into<String>) -> Self {
		Self { recipient: Recipient::AlertChannel, text: text.into(), confirmation: None }
	}

	pub fn to_chat(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
		Self { recipient: Recipient::Chat(chat_id.into()), text: text.into(), confirmation: None }
	}

	pub fn with_confirmation(mut self, control: ConfirmationControl) -> Self {
		self.confirmation = Some(control);
		self
	}
}

/// a failed send. Transient from the gateway's point of view, the message is
/// not retried but the alerts in it may be delivered again later.
#[derive(Error, Debug)]
pub enum DeliveryError {
	#[error("request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("api rejected message with status {status}: {description}")]
	Rejected { status: u16, description: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, message: OutboundMessage) -> Result<(), DeliveryError>;
}

/// something a user did in the chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
	/// a message starting with `/`
	Command { user_id: String, chat_id: String, name: String, args: Vec<String> },
	/// a button of a [ConfirmationControl] was pressed
	Callback { user_id: String, chat_id: String, data: String },
}

/// splits `/name@bot arg1 arg2` into the lowercase command name and its
/// arguments. Returns `None` if the text is not a command.
pub fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
	let mut words = text.split_whitespace();
	let command = words.next()?.strip_prefix('/')?;
	let name = command.split('@').next().unwrap_or(command);

	if name.is_empty() {
		return None;
	}

	Some((name.to_lowercase(), words.map(str::to_owned).collect()))
}
