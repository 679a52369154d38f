#![forbid(unsafe_code)]

//! Token files on disk: loading, change polling and operator-triggered reloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatharvest_domain::normalize_token;
use chatharvest_util::shutdown::Shutdown;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::credential::{CredentialReason, CredentialRegister};
use super::oauth::TokenRefresher;

pub const DEFAULT_TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TokenFileError {
	#[error("twitch: read token file {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("twitch: empty token in {}", path.display())]
	Empty { path: PathBuf },
}

/// Reads a token file and remembers the last normalized value.
pub struct FileTokenLoader {
	path: PathBuf,
	cached: parking_lot::Mutex<String>,
}

impl FileTokenLoader {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			cached: parking_lot::Mutex::new(String::new()),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Read and normalize the token. The flag reports whether it differs from the cached value.
	pub async fn load(&self) -> Result<(String, bool), TokenFileError> {
		let data = tokio::fs::read_to_string(&self.path)
			.await
			.map_err(|source| TokenFileError::Io {
				path: self.path.clone(),
				source,
			})?;

		let token = normalize_token(&data);
		let mut cached = self.cached.lock();
		if token.is_empty() {
			cached.clear();
			return Err(TokenFileError::Empty { path: self.path.clone() });
		}
		if *cached == token {
			return Ok((token, false));
		}
		*cached = token.clone();
		Ok((token, true))
	}

	/// Seed the cache, e.g. with a static fallback token, so that only later rotations count as changes.
	pub fn set_cached(&self, token: &str) {
		*self.cached.lock() = normalize_token(token);
	}
}

/// Poll the token file and offer every change to `register`.
pub fn spawn_token_file_watcher(
	loader: Arc<FileTokenLoader>,
	register: Arc<CredentialRegister>,
	interval: Duration,
	shutdown: Shutdown,
) -> JoinHandle<()> {
	let interval = if interval.is_zero() {
		DEFAULT_TOKEN_POLL_INTERVAL
	} else {
		interval
	};

	tokio::spawn(async move {
		let mut last_error: Option<String> = None;
		while crate::sleep_or_cancel(interval, &shutdown).await {
			match loader.load().await {
				Ok((token, true)) => {
					last_error = None;
					if register.offer(&token, CredentialReason::File) {
						info!(path = %loader.path().display(), "twitch: token file changed");
					}
				}
				Ok((_, false)) => last_error = None,
				Err(err) => {
					let msg = err.to_string();
					if last_error.as_deref() != Some(msg.as_str()) {
						warn!(error = %msg, "twitch: token file poll failed");
					} else {
						debug!(error = %msg, "twitch: token file poll failed");
					}
					last_error = Some(msg);
				}
			}
		}
	})
}

/// Operator-triggered credential reload: re-read the token files and force a reconnect.
pub struct TokenReloader {
	access_path: Option<PathBuf>,
	refresh_path: Option<PathBuf>,
	register: Arc<CredentialRegister>,
	refresher: Option<Arc<TokenRefresher>>,
	nick: String,
}

impl TokenReloader {
	pub fn new(
		access_path: Option<PathBuf>,
		refresh_path: Option<PathBuf>,
		register: Arc<CredentialRegister>,
		refresher: Option<Arc<TokenRefresher>>,
		nick: impl Into<String>,
	) -> Self {
		Self {
			access_path,
			refresh_path,
			register,
			refresher,
			nick: nick.into(),
		}
	}

	/// Returns the login the receiver will reconnect as.
	pub async fn reload(&self) -> anyhow::Result<String> {
		let Some(access_path) = &self.access_path else {
			anyhow::bail!("access token file not configured");
		};
		let access = tokio::fs::read_to_string(access_path)
			.await
			.with_context(|| format!("read access token {}", access_path.display()))?;
		let token = normalize_token(&access);
		if token.is_empty() {
			anyhow::bail!("access token empty");
		}

		if let Some(refresh_path) = &self.refresh_path {
			let refresh = tokio::fs::read_to_string(refresh_path)
				.await
				.with_context(|| format!("read refresh token {}", refresh_path.display()))?;
			if let Some(refresher) = &self.refresher {
				refresher.set_refresh_token(&refresh);
			}
		}

		self.register.offer(&token, CredentialReason::Manual);
		info!(login = %self.nick, "twitch: reloaded token; reconnecting");
		Ok(self.nick.clone())
	}
}
