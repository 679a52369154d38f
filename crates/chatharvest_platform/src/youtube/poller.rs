#![forbid(unsafe_code)]

//! Live chat continuation poller for one watch page.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatharvest_domain::{ChatMessage, Platform};
use chatharvest_util::backoff::Backoff;
use chatharvest_util::shutdown::Shutdown;
use chatharvest_util::time::unix_nanos_now;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::extract::{
	Bootstrap, ContinuationInfo, DEFAULT_POLL_INTERVAL, extract_continuation, extract_messages, log_poll_results,
	next_poll_delay, parse_bootstrap,
};
use crate::telemetry::DropReason;
use crate::{ChatReceiver, MessageHandler, ReceiverMetrics, new_session_id, sleep_or_cancel};

pub const YOUTUBE_ORIGIN: &str = "https://www.youtube.com";
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);
const USER_AGENT: &str = concat!("Mozilla/5.0 (compatible; chatharvest/", env!("CARGO_PKG_VERSION"), ")");
const BACKOFF_SEED: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const COUNT_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PollerConfig {
	/// Watch page to bootstrap from.
	pub live_url: String,
	/// Bound on each HTTP request; `None` waits indefinitely.
	pub poll_timeout: Option<Duration>,
	/// Delay used when the server suggests none.
	pub poll_interval: Duration,
	/// Log the JSON of actions that carried no chat text.
	pub dump_unhandled: bool,
	/// Scheme and host of the InnerTube API.
	pub origin: String,
	pub metrics: ReceiverMetrics,
}

impl PollerConfig {
	pub fn new(live_url: impl Into<String>) -> Self {
		Self {
			live_url: live_url.into(),
			poll_timeout: Some(DEFAULT_POLL_TIMEOUT),
			poll_interval: DEFAULT_POLL_INTERVAL,
			dump_unhandled: false,
			origin: YOUTUBE_ORIGIN.to_string(),
			metrics: ReceiverMetrics::noop(),
		}
	}

	/// Positive seconds set the bound, negative disables it, zero keeps the default.
	pub fn with_timeout_secs(mut self, secs: i64) -> Self {
		self.poll_timeout = match secs {
			s if s > 0 => Some(Duration::from_secs(s.unsigned_abs())),
			s if s < 0 => None,
			_ => Some(DEFAULT_POLL_TIMEOUT),
		};
		self
	}

	pub fn with_interval_ms(mut self, ms: u64) -> Self {
		self.poll_interval = if ms == 0 {
			DEFAULT_POLL_INTERVAL
		} else {
			Duration::from_millis(ms)
		};
		self
	}
}

pub struct YouTubePoller {
	cfg: PollerConfig,
	http: reqwest::Client,
}

impl YouTubePoller {
	pub fn new(cfg: PollerConfig) -> anyhow::Result<Self> {
		let live_url = cfg.live_url.trim();
		if live_url.is_empty() {
			anyhow::bail!("youtube: live url is required");
		}
		url::Url::parse(live_url).with_context(|| format!("youtube: invalid live url {live_url:?}"))?;

		let http = reqwest::Client::builder()
			.user_agent(USER_AGENT)
			.build()
			.context("build reqwest client")?;
		Ok(Self { cfg, http })
	}

	fn request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match self.cfg.poll_timeout {
			Some(timeout) => req.timeout(timeout),
			None => req,
		}
	}

	async fn bootstrap(&self) -> anyhow::Result<Bootstrap> {
		let resp = self
			.request(self.http.get(self.cfg.live_url.trim()))
			.send()
			.await
			.context("fetch watch page")?;
		let status = resp.status();
		if !status.is_success() {
			anyhow::bail!("unexpected status {status}");
		}
		let page = resp.text().await.context("read watch page")?;
		Ok(parse_bootstrap(&page)?)
	}

	async fn poll(&self, boot: &Bootstrap) -> anyhow::Result<(Vec<ChatMessage>, ContinuationInfo)> {
		let endpoint = format!(
			"{}/youtubei/v1/live_chat/get_live_chat?key={}",
			self.cfg.origin.trim_end_matches('/'),
			url::form_urlencoded::byte_serialize(boot.api_key.as_bytes()).collect::<String>()
		);
		let payload = json!({
			"context": {"client": {"clientName": "WEB", "clientVersion": boot.client_version, "hl": "en"}},
			"continuation": boot.continuation,
		});

		let resp = self
			.request(self.http.post(&endpoint).json(&payload))
			.send()
			.await
			.context("poll request")?;
		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			let snippet: String = body.trim().chars().take(256).collect();
			anyhow::bail!("poll status {status}: {snippet}");
		}

		let body: Value = resp.json().await.context("decode poll response")?;
		let info = extract_continuation(&body);
		let batch = extract_messages(&body, unix_nanos_now());
		log_poll_results(&batch, self.cfg.dump_unhandled);
		for _ in &batch.failures {
			self.cfg.metrics.dropped(DropReason::Malformed);
		}
		Ok((batch.messages, info))
	}

	async fn run_loop(&self, shutdown: Shutdown, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
		let mut backoff = Backoff::new(BACKOFF_SEED, BACKOFF_CAP);
		let mut session: Option<Bootstrap> = None;
		let mut session_id = new_session_id();
		let mut total = 0u64;
		let mut window = 0u64;
		let mut last_log = Instant::now();

		info!(url = %self.cfg.live_url, "youtube: poller starting");
		loop {
			if shutdown.is_cancelled() {
				return Ok(());
			}

			let boot = match session.take() {
				Some(boot) => boot,
				None => {
					let result = tokio::select! {
						_ = shutdown.cancelled() => return Ok(()),
						r = self.bootstrap() => r,
					};
					match result {
						Ok(boot) => {
							session_id = new_session_id();
							info!(session_id = %session_id, version = %boot.client_version, "youtube: bootstrap succeeded");
							backoff.reset();
							boot
						}
						Err(err) => {
							let delay = backoff.next_delay();
							warn!(error = ?err, delay_ms = delay.as_millis() as u64, "youtube: bootstrap failed");
							if !sleep_or_cancel(delay, &shutdown).await {
								return Ok(());
							}
							continue;
						}
					}
				}
			};

			debug!(session_id = %session_id, cont_len = boot.continuation.len(), "youtube: polling");
			let result = tokio::select! {
				_ = shutdown.cancelled() => return Ok(()),
				r = self.poll(&boot) => r,
			};
			let (messages, info) = match result {
				Ok(polled) => polled,
				Err(err) => {
					let delay = backoff.next_delay();
					warn!(session_id = %session_id, error = ?err, delay_ms = delay.as_millis() as u64, "youtube: poll error");
					self.cfg.metrics.reconnects.increment(1);
					if !sleep_or_cancel(delay, &shutdown).await {
						return Ok(());
					}
					continue;
				}
			};

			let count = messages.len() as u64;
			for msg in messages {
				self.cfg.metrics.received.increment(1);
				handler.handle(msg).await;
			}
			total += count;
			window += count;
			if last_log.elapsed() >= COUNT_LOG_INTERVAL {
				info!(session_id = %session_id, window, total, "youtube: recv msgs");
				window = 0;
				last_log = Instant::now();
			}

			match info.continuation {
				Some(continuation) => session = Some(Bootstrap { continuation, ..boot }),
				None => {
					info!(session_id = %session_id, "youtube: missing continuation, re-bootstrap");
					self.cfg.metrics.reconnects.increment(1);
				}
			}

			let (delay, from_server) = next_poll_delay(info.timeout_ms, self.cfg.poll_interval);
			debug!(delay_ms = delay.as_millis() as u64, from_server, "youtube: next poll");
			if !sleep_or_cancel(delay, &shutdown).await {
				return Ok(());
			}
		}
	}
}

#[async_trait::async_trait]
impl ChatReceiver for YouTubePoller {
	fn platform(&self) -> Platform {
		Platform::YouTube
	}

	async fn run(self: Box<Self>, shutdown: Shutdown, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
		let result = self.run_loop(shutdown, handler).await;
		info!(url = %self.cfg.live_url, "youtube: poller stopped");
		result
	}
}
