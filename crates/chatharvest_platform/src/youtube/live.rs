#![forbid(unsafe_code)]

//! Follows a channel across streams: resolves on an interval and keeps one
//! poller running against whatever is live.

use std::sync::Arc;
use std::time::Duration;

use chatharvest_domain::Platform;
use chatharvest_util::shutdown::{Shutdown, ShutdownTrigger};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::poller::{PollerConfig, YouTubePoller};
use super::resolver::{Resolution, Resolver};
use crate::{ChatReceiver, MessageHandler, sleep_or_cancel};

pub const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_secs(30);

struct ActivePoller {
	watch_url: String,
	trigger: ShutdownTrigger,
	task: JoinHandle<()>,
}

impl ActivePoller {
	async fn stop(self) {
		self.trigger.trigger();
		if let Err(err) = self.task.await {
			warn!(error = %err, "youtube: poller task failed");
		}
	}
}

pub struct YouTubeLiveWatcher {
	target: String,
	resolver: Resolver,
	poller: PollerConfig,
	interval: Duration,
}

impl YouTubeLiveWatcher {
	/// `poller` is a template; its `live_url` is replaced by each resolved watch page.
	pub fn new(target: impl Into<String>, resolver: Resolver, poller: PollerConfig) -> Self {
		Self {
			target: target.into(),
			resolver,
			poller,
			interval: DEFAULT_RESOLVE_INTERVAL,
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		if !interval.is_zero() {
			self.interval = interval;
		}
		self
	}

	fn start(&self, watch_url: &str, shutdown: &Shutdown, handler: &Arc<dyn MessageHandler>) -> Option<ActivePoller> {
		let mut cfg = self.poller.clone();
		cfg.live_url = self.resolver.fetch_url(watch_url);
		let poller = match YouTubePoller::new(cfg) {
			Ok(p) => p,
			Err(err) => {
				warn!(watch = %watch_url, error = ?err, "youtube: cannot start poller");
				return None;
			}
		};

		let (trigger, child) = shutdown.child();
		let handler = Arc::clone(handler);
		let task = tokio::spawn(async move {
			if let Err(err) = Box::new(poller).run(child, handler).await {
				warn!(error = ?err, "youtube: poller exited");
			}
		});
		Some(ActivePoller {
			watch_url: watch_url.to_string(),
			trigger,
			task,
		})
	}

	async fn run_loop(&self, shutdown: Shutdown, handler: Arc<dyn MessageHandler>) {
		let mut active: Option<ActivePoller> = None;
		info!(url = %self.target, interval_secs = self.interval.as_secs(), "youtube: live watcher started");

		loop {
			let resolved = tokio::select! {
				_ = shutdown.cancelled() => break,
				r = self.resolver.resolve(&self.target) => r,
			};

			match resolved {
				Err(err) => warn!(url = %self.target, error = %err, "youtube: resolve error"),
				Ok(Resolution { live: false, .. }) => {
					if let Some(poller) = active.take() {
						info!(watch = %poller.watch_url, "youtube: stream ended; stopping poller");
						poller.stop().await;
					}
					info!(url = %self.target, retry_secs = self.interval.as_secs(), "youtube: channel not live");
				}
				Ok(Resolution {
					watch_url: Some(watch_url),
					chat_url,
					..
				}) => {
					let current = active.as_ref().filter(|p| !p.task.is_finished()).map(|p| p.watch_url.as_str());
					if current != Some(watch_url.as_str()) {
						info!(
							from = current.unwrap_or("-"),
							to = %watch_url,
							chat = chat_url.as_deref().unwrap_or("-"),
							"youtube: live stream changed"
						);
						if let Some(poller) = active.take() {
							poller.stop().await;
						}
						active = self.start(&watch_url, &shutdown, &handler);
					}
				}
				Ok(_) => warn!(url = %self.target, "youtube: resolved live stream without watch url"),
			}

			if !sleep_or_cancel(self.interval, &shutdown).await {
				break;
			}
		}

		if let Some(poller) = active.take() {
			poller.stop().await;
		}
	}
}

#[async_trait::async_trait]
impl ChatReceiver for YouTubeLiveWatcher {
	fn platform(&self) -> Platform {
		Platform::YouTube
	}

	async fn run(self: Box<Self>, shutdown: Shutdown, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
		self.run_loop(shutdown, handler).await;
		info!(url = %self.target, "youtube: live watcher stopped");
		Ok(())
	}
}
