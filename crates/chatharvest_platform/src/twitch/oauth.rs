#![forbid(unsafe_code)]

//! Refresh-grant exchange for the IRC access token.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chatharvest_domain::normalize_token;
use chatharvest_util::backoff::Backoff;
use chatharvest_util::shutdown::Shutdown;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::SecretString;
use crate::telemetry::RefreshMetrics;

pub const TOKEN_ENDPOINT: &str = "https://id.twitch.tv/oauth2/token";
const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_LIFETIME: Duration = Duration::from_secs(60 * 60);
const MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RefreshError {
	#[error("twitch: refresh requires {0}")]
	MissingConfig(&'static str),
	#[error("twitch: refresh request: {0}")]
	Network(#[from] reqwest::Error),
	#[error("{0}")]
	Provider(String),
	#[error("twitch: refresh returned empty token")]
	EmptyToken,
	#[error("twitch: decode refresh response: {0}")]
	Decode(#[from] serde_json::Error),
	#[error("twitch: write {}: {source}", path.display())]
	Persist {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

impl RefreshError {
	/// Only a missing configuration is fatal; everything else is retried.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, Self::MissingConfig(_))
	}
}

#[derive(Debug, Default, Deserialize)]
struct RefreshResponse {
	#[serde(default)]
	access_token: String,
	#[serde(default)]
	refresh_token: String,
	#[serde(default)]
	expires_in: i64,
	#[serde(default)]
	message: String,
	#[serde(default)]
	error: String,
	#[serde(default)]
	error_description: String,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
	/// Normalized (`oauth:`-prefixed) access token.
	pub token: String,
	pub expires_in: Duration,
}

/// Something the IRC receiver can call when the server rejects its credential.
#[async_trait::async_trait]
pub trait RefreshAction: Send + Sync + 'static {
	/// Obtain a fresh access token.
	async fn refresh_now(&self) -> Result<RefreshOutcome, RefreshError>;
}

pub struct TokenRefresher {
	client_id: String,
	client_secret: SecretString,
	refresh_token: parking_lot::RwLock<SecretString>,
	token_file: PathBuf,
	refresh_token_file: Option<PathBuf>,
	endpoint: String,
	http: reqwest::Client,
	serial: tokio::sync::Mutex<()>,
	last_lifetime: parking_lot::Mutex<Option<Duration>>,
	metrics: RefreshMetrics,
}

impl TokenRefresher {
	pub fn new(
		client_id: impl Into<String>,
		client_secret: SecretString,
		refresh_token: SecretString,
		token_file: impl Into<PathBuf>,
	) -> Result<Self, RefreshError> {
		let client_id = client_id.into().trim().to_string();
		let token_file = token_file.into();
		if client_id.is_empty() || client_secret.is_blank() || refresh_token.is_blank() {
			return Err(RefreshError::MissingConfig("client credentials and refresh token"));
		}
		if token_file.as_os_str().is_empty() {
			return Err(RefreshError::MissingConfig("a token file"));
		}

		let http = reqwest::Client::builder()
			.user_agent(concat!("chatharvest/", env!("CARGO_PKG_VERSION"), " (oauth-refresh)"))
			.timeout(REFRESH_TIMEOUT)
			.build()?;

		Ok(Self {
			client_id,
			client_secret,
			refresh_token: parking_lot::RwLock::new(refresh_token),
			token_file,
			refresh_token_file: None,
			endpoint: TOKEN_ENDPOINT.to_string(),
			http,
			serial: tokio::sync::Mutex::new(()),
			last_lifetime: parking_lot::Mutex::new(None),
			metrics: RefreshMetrics::noop(),
		})
	}

	pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.endpoint = endpoint.into();
		self
	}

	/// Persist rotated refresh tokens here as well as keeping them in memory.
	pub fn with_refresh_token_file(mut self, path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		self.refresh_token_file = (!path.as_os_str().is_empty()).then_some(path);
		self
	}

	pub fn with_metrics(mut self, metrics: RefreshMetrics) -> Self {
		self.metrics = metrics;
		self
	}

	pub fn token_file(&self) -> &Path {
		&self.token_file
	}

	/// Replace the refresh token used by subsequent exchanges. Blank input is ignored.
	pub fn set_refresh_token(&self, token: &str) {
		let token = token.trim();
		if token.is_empty() {
			return;
		}
		*self.refresh_token.write() = SecretString::new(token);
	}

	/// Exchange the refresh token for a new access token and persist it.
	pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
		let _serial = self.serial.lock().await;
		let result = self.refresh_locked().await;
		match &result {
			Ok(_) => self.metrics.success.increment(1),
			Err(_) => self.metrics.failure.increment(1),
		}
		result
	}

	async fn refresh_locked(&self) -> Result<RefreshOutcome, RefreshError> {
		let refresh_token = self.refresh_token.read().clone();
		if refresh_token.is_blank() {
			return Err(RefreshError::MissingConfig("client credentials and refresh token"));
		}

		let resp = self
			.http
			.post(&self.endpoint)
			.form(&[
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose().trim()),
				("grant_type", "refresh_token"),
				("refresh_token", refresh_token.expose().trim()),
			])
			.send()
			.await?;

		let status = resp.status();
		let body = resp.text().await?;

		if !status.is_success() {
			let parsed: RefreshResponse = serde_json::from_str(&body).unwrap_or_default();
			let message = [&parsed.message, &parsed.error_description, &parsed.error]
				.into_iter()
				.map(|s| s.trim())
				.find(|s| !s.is_empty())
				.map_or_else(|| format!("unexpected status {}", status.as_u16()), str::to_string);
			return Err(RefreshError::Provider(message));
		}

		let parsed: RefreshResponse = serde_json::from_str(&body)?;
		let token = normalize_token(&parsed.access_token);
		if token.is_empty() {
			return Err(RefreshError::EmptyToken);
		}

		let expires_in = token_lifetime(parsed.expires_in);

		write_secret_file(&self.token_file, &token).await?;

		let rotated = parsed.refresh_token.trim();
		if !rotated.is_empty() && rotated != refresh_token.expose().trim() {
			*self.refresh_token.write() = SecretString::new(rotated);
			if let Some(path) = &self.refresh_token_file {
				write_secret_file(path, rotated).await?;
			}
			info!("twitch: refresh token rotated");
		}

		*self.last_lifetime.lock() = Some(expires_in);

		match chrono::TimeDelta::try_seconds(expires_in.as_secs() as i64)
			.and_then(|delta| chrono::Utc::now().checked_add_signed(delta))
		{
			Some(expires_at) => {
				info!(expires_at = %expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true), "twitch: refreshed token")
			}
			None => info!(expires_in = ?expires_in, "twitch: refreshed token"),
		}

		Ok(RefreshOutcome { token, expires_in })
	}

	/// Refresh in the background ahead of expiry, calling `on_update` with every new token.
	pub fn spawn_auto<F>(self: Arc<Self>, shutdown: Shutdown, on_update: F) -> JoinHandle<()>
	where
		F: Fn(String) + Send + Sync + 'static,
	{
		let first_wait = self.next_interval().unwrap_or(MIN_REFRESH_INTERVAL);
		spawn_auto_refresh(self, first_wait, shutdown, on_update)
	}

	pub(crate) fn next_interval(&self) -> Option<Duration> {
		let lifetime = *self.last_lifetime.lock();
		lifetime.map(refresh_interval)
	}
}

#[async_trait::async_trait]
impl RefreshAction for TokenRefresher {
	async fn refresh_now(&self) -> Result<RefreshOutcome, RefreshError> {
		self.refresh().await
	}
}

/// Drive `action` on the 85% schedule. Failures retry on a 1s..60s backoff that resets on success.
pub fn spawn_auto_refresh<F>(
	action: Arc<dyn RefreshAction>,
	first_wait: Duration,
	shutdown: Shutdown,
	on_update: F,
) -> JoinHandle<()>
where
	F: Fn(String) + Send + Sync + 'static,
{
	tokio::spawn(async move {
		let mut wait = first_wait;
		let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

		loop {
			if !crate::sleep_or_cancel(wait, &shutdown).await {
				return;
			}

			let result = tokio::select! {
				_ = shutdown.cancelled() => return,
				r = action.refresh_now() => r,
			};

			match result {
				Ok(outcome) => {
					backoff.reset();
					wait = refresh_interval(outcome.expires_in);
					on_update(outcome.token);
				}
				Err(err) => {
					wait = backoff.next_delay();
					warn!(error = %err, retry_in = ?wait, "twitch: auto-refresh failed");
				}
			}
		}
	})
}

/// Non-positive lifetimes fall back to one hour; anything above a day is capped.
fn token_lifetime(expires_in: i64) -> Duration {
	u64::try_from(expires_in)
		.ok()
		.filter(|secs| *secs > 0)
		.map_or(DEFAULT_LIFETIME, Duration::from_secs)
		.min(MAX_LIFETIME)
}

/// 85% of the measured lifetime, never less than one minute.
pub fn refresh_interval(lifetime: Duration) -> Duration {
	(lifetime / 100).saturating_mul(85).max(MIN_REFRESH_INTERVAL)
}

/// Write `contents` plus a newline to a 0600 sibling temp file, then rename it over `path`.
async fn write_secret_file(path: &Path, contents: &str) -> Result<(), RefreshError> {
	let persist = |source: std::io::Error| RefreshError::Persist {
		path: path.to_path_buf(),
		source,
	};

	if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
		tokio::fs::create_dir_all(dir).await.map_err(persist)?;
	}

	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);

	let mut opts = tokio::fs::OpenOptions::new();
	opts.write(true).create(true).truncate(true);
	#[cfg(unix)]
	opts.mode(0o600);

	let written: std::io::Result<()> = async {
		let mut file = opts.open(&tmp).await?;
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
		}
		file.write_all(format!("{contents}\n").as_bytes()).await?;
		file.sync_all().await?;
		drop(file);
		tokio::fs::rename(&tmp, path).await
	}
	.await;

	if written.is_err() {
		let _ = tokio::fs::remove_file(&tmp).await;
	}
	written.map_err(persist)
}
