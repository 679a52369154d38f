#![forbid(unsafe_code)]

pub mod telemetry;
pub mod twitch;
pub mod youtube;

#[cfg(test)]
pub(crate) mod test_http;

use std::fmt;
use std::sync::Arc;

use chatharvest_domain::{ChatMessage, Platform};
use chatharvest_util::shutdown::Shutdown;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub use crate::telemetry::ReceiverMetrics;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Receives every normalized message, once, in arrival order per receiver.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
	async fn handle(&self, msg: ChatMessage);
}

#[async_trait::async_trait]
impl MessageHandler for mpsc::Sender<ChatMessage> {
	async fn handle(&self, msg: ChatMessage) {
		if self.send(msg).await.is_err() {
			debug!("message handler channel closed; message discarded");
		}
	}
}

/// A long-running platform receiver.
#[async_trait::async_trait]
pub trait ChatReceiver: Send + 'static {
	/// Which platform this receiver ingests.
	fn platform(&self) -> Platform;

	/// Run until `shutdown` fires or an unrecoverable error occurs.
	async fn run(self: Box<Self>, shutdown: Shutdown, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;
}

/// Generate an opaque session id for log correlation.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Sleep for `delay` unless `shutdown` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: std::time::Duration, shutdown: &Shutdown) -> bool {
	tokio::select! {
		_ = shutdown.cancelled() => false,
		_ = tokio::time::sleep(delay) => !shutdown.is_cancelled(),
	}
}
