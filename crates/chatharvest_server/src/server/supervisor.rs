#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chatharvest_domain::{ChatMessage, Platform};
use chatharvest_platform::telemetry::RefreshMetrics;
use chatharvest_platform::twitch::badges::enrich_bounded;
use chatharvest_platform::twitch::{
	BadgeEnricher, CredentialReason, CredentialRegister, FileTokenLoader, IrcConfig, IrcReceiver, RefreshAction,
	TokenFileError, TokenRefresher, TokenReloader, TwitchBadgeEnricher, spawn_token_file_watcher,
};
use chatharvest_platform::youtube::{PollerConfig, Resolver, YouTubeLiveWatcher};
use chatharvest_platform::{ChatReceiver, MessageHandler, ReceiverMetrics, SecretString};
use chatharvest_util::shutdown::Shutdown;
use metrics::Recorder;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ServerConfig, TwitchSettings, YouTubeSettings};
use crate::server::hub::Hub;
use crate::server::metrics::SinkMetrics;
use crate::server::store::Sink;

/// Upper bound on badge enrichment per message.
pub const BADGE_ENRICH_LIMIT: Duration = Duration::from_secs(2);

/// Receiver output: persist, then fan out live.
pub struct Ingest {
	sink: Arc<dyn Sink>,
	hub: Hub,
	metrics: SinkMetrics,
	twitch_channel: String,
	enricher: Option<Arc<dyn BadgeEnricher>>,
}

impl Ingest {
	pub fn new(sink: Arc<dyn Sink>, hub: Hub, metrics: SinkMetrics) -> Self {
		Self {
			sink,
			hub,
			metrics,
			twitch_channel: String::new(),
			enricher: None,
		}
	}

	pub fn with_badge_enricher(mut self, channel: impl Into<String>, enricher: Arc<dyn BadgeEnricher>) -> Self {
		self.twitch_channel = channel.into();
		self.enricher = Some(enricher);
		self
	}
}

#[async_trait::async_trait]
impl MessageHandler for Ingest {
	async fn handle(&self, mut msg: ChatMessage) {
		if msg.platform == Platform::Twitch
			&& !msg.badges.is_empty()
			&& let Some(enricher) = &self.enricher
		{
			let badges = std::mem::take(&mut msg.badges);
			msg.badges = enrich_bounded(enricher.as_ref(), &self.twitch_channel, badges, BADGE_ENRICH_LIMIT).await;
		}

		if let Err(err) = self.sink.write(&msg).await {
			self.metrics.write_errors.increment(1);
			warn!(platform = %msg.platform, id = %msg.id, error = ?err, "ingest: sink write failed");
		}

		self.hub.broadcast(&Arc::new(msg));
	}
}

/// Receivers built from config, plus the background tasks that keep them fed.
#[derive(Default)]
pub struct Receivers {
	pub receivers: Vec<Box<dyn ChatReceiver>>,
	pub background: Vec<JoinHandle<()>>,
	pub reloader: Option<Arc<TokenReloader>>,
	pub badge_enricher: Option<(String, Arc<dyn BadgeEnricher>)>,
}

/// Build every configured receiver. Configuration errors are fatal.
pub async fn build_receivers(cfg: &ServerConfig, recorder: &dyn Recorder, shutdown: &Shutdown) -> anyhow::Result<Receivers> {
	let mut out = Receivers::default();

	if cfg.twitch.is_configured() {
		build_twitch(&cfg.twitch, recorder, shutdown, &mut out).await?;
	}

	if cfg.youtube.is_configured() {
		out.receivers.push(Box::new(build_youtube(&cfg.youtube, recorder)?));
	}

	Ok(out)
}

fn non_empty_token(token: Option<&SecretString>) -> Option<String> {
	token.map(|t| t.expose().trim().to_string()).filter(|t| !t.is_empty())
}

async fn build_twitch(
	cfg: &TwitchSettings,
	recorder: &dyn Recorder,
	shutdown: &Shutdown,
	out: &mut Receivers,
) -> anyhow::Result<()> {
	let channel = cfg.channel.clone().unwrap_or_default();
	let nick = cfg.nick.clone().context("twitch.nick is required when twitch.channel is set")?;

	let loader = cfg.token_file.as_ref().map(|p| Arc::new(FileTokenLoader::new(p)));
	let mut token = String::new();
	if let Some(loader) = &loader {
		match loader.load().await {
			Ok((loaded, _)) => token = loaded,
			Err(TokenFileError::Empty { .. }) => {}
			Err(err) => warn!(error = %err, "twitch: token file unreadable at startup"),
		}
	}

	let refresher = if cfg.wants_refresh() {
		let refresher = Arc::new(build_refresher(cfg, recorder).await?);
		let outcome = refresher.refresh().await.context("initial twitch token refresh")?;
		token = outcome.token;
		Some(refresher)
	} else {
		None
	};

	if token.is_empty() {
		token = non_empty_token(cfg.token.as_ref()).unwrap_or_default();
	}
	if token.is_empty() {
		warn!(channel = %channel, "twitch: no token available; skipping twitch receiver");
		return Ok(());
	}

	let register = Arc::new(CredentialRegister::new(&token));
	if let Some(loader) = &loader {
		loader.set_cached(&register.current());
		out.background.push(spawn_token_file_watcher(
			Arc::clone(loader),
			Arc::clone(&register),
			cfg.token_poll_interval,
			shutdown.clone(),
		));
	}

	let mut irc = IrcConfig::new(channel.clone(), nick.clone(), Arc::clone(&register));
	irc.use_tls = cfg.tls;
	irc.addr = cfg.addr.clone();
	irc.debug_drops = cfg.debug_drops;
	irc.metrics = ReceiverMetrics::register(recorder, Platform::Twitch);

	if let Some(refresher) = &refresher {
		irc.refresh = Some(Arc::clone(refresher) as Arc<dyn RefreshAction>);

		let register = Arc::clone(&register);
		let loader = loader.clone();
		out.background
			.push(Arc::clone(refresher).spawn_auto(shutdown.clone(), move |token| {
				if let Some(loader) = &loader {
					loader.set_cached(&token);
				}
				register.offer(&token, CredentialReason::Refresh);
			}));
	}

	out.reloader = Some(Arc::new(TokenReloader::new(
		cfg.token_file.clone(),
		cfg.refresh_token_file.clone(),
		Arc::clone(&register),
		refresher.clone(),
		nick.clone(),
	)));

	if cfg.badge_enrichment_enabled()
		&& let (Some(client_id), Some(secret)) = (&cfg.client_id, &cfg.client_secret)
	{
		match TwitchBadgeEnricher::new(client_id.clone(), secret.clone()) {
			Ok(enricher) => {
				info!("twitch: badge enrichment enabled");
				let enricher: Arc<dyn BadgeEnricher> = Arc::new(enricher);
				out.badge_enricher = Some((channel.clone(), enricher));
			}
			Err(err) => warn!(error = ?err, "twitch: badge enrichment unavailable"),
		}
	}

	info!(channel = %channel, nick = %nick, tls = cfg.tls, refresh = refresher.is_some(), "twitch: receiver configured");
	out.receivers.push(Box::new(IrcReceiver::new(irc)));
	Ok(())
}

async fn build_refresher(cfg: &TwitchSettings, recorder: &dyn Recorder) -> anyhow::Result<TokenRefresher> {
	let refresh_token = match &cfg.refresh_token_file {
		Some(path) => {
			let raw = tokio::fs::read_to_string(path)
				.await
				.with_context(|| format!("read twitch refresh token {}", path.display()))?;
			SecretString::new(raw.trim())
		}
		None => cfg.refresh_token.clone().unwrap_or_else(|| SecretString::new("")),
	};

	let client_id = cfg.client_id.clone().unwrap_or_default();
	let client_secret = cfg.client_secret.clone().unwrap_or_else(|| SecretString::new(""));
	let token_file = cfg.token_file.clone().unwrap_or_default();

	let mut refresher = TokenRefresher::new(client_id, client_secret, refresh_token, token_file)
		.context("configure twitch token refresh")?
		.with_metrics(RefreshMetrics::register(recorder));
	if let Some(path) = &cfg.refresh_token_file {
		refresher = refresher.with_refresh_token_file(path);
	}
	Ok(refresher)
}

fn build_youtube(cfg: &YouTubeSettings, recorder: &dyn Recorder) -> anyhow::Result<YouTubeLiveWatcher> {
	let url = cfg.url.clone().unwrap_or_default();
	let resolver = Resolver::new().context("build youtube resolver")?;

	let mut poller = PollerConfig::new(url.clone())
		.with_timeout_secs(cfg.poll_timeout_secs)
		.with_interval_ms(cfg.poll_interval_ms);
	poller.dump_unhandled = cfg.dump_unhandled;
	poller.metrics = ReceiverMetrics::register(recorder, Platform::YouTube);

	info!(url = %url, "youtube: receiver configured");
	Ok(YouTubeLiveWatcher::new(url, resolver, poller).with_interval(cfg.resolve_interval))
}

/// Runs every receiver until `shutdown` fires, then waits `grace` before aborting stragglers.
pub struct Supervisor {
	receivers: Vec<Box<dyn ChatReceiver>>,
	background: Vec<JoinHandle<()>>,
	handler: Arc<dyn MessageHandler>,
	grace: Duration,
}

impl Supervisor {
	pub fn new(receivers: Receivers, handler: Arc<dyn MessageHandler>, grace: Duration) -> Self {
		Self {
			receivers: receivers.receivers,
			background: receivers.background,
			handler,
			grace,
		}
	}

	pub async fn run(self, shutdown: Shutdown) {
		if self.receivers.is_empty() {
			warn!("no receivers configured; set [twitch] channel or [youtube] url. HTTP surface stays up");
		}

		let mut tasks = Vec::with_capacity(self.receivers.len());
		for receiver in self.receivers {
			let platform = receiver.platform();
			let handler = Arc::clone(&self.handler);
			let shutdown = shutdown.clone();
			tasks.push(tokio::spawn(async move {
				info!(%platform, "receiver started");
				match receiver.run(shutdown, handler).await {
					Ok(()) => info!(%platform, "receiver stopped"),
					Err(err) => warn!(%platform, error = ?err, "receiver exited with error"),
				}
			}));
		}

		shutdown.cancelled().await;

		let mut all = tasks;
		all.extend(self.background);
		let drain = async {
			for task in &mut all {
				let _ = task.await;
			}
		};
		if tokio::time::timeout(self.grace, drain).await.is_err() {
			let pending = all.iter().filter(|t| !t.is_finished()).count();
			warn!(pending, "supervisor: grace period elapsed; aborting remaining tasks");
			for task in &all {
				task.abort();
			}
		}
		info!("supervisor: stopped");
	}
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;

	use super::*;
	use crate::server::filters::Filters;
	use crate::server::hub::Transport;
	use crate::server::metrics::HubMetrics;
	use crate::server::store::{MemoryStore, Store};

	struct FailingSink;

	#[async_trait::async_trait]
	impl Sink for FailingSink {
		async fn write(&self, _msg: &ChatMessage) -> anyhow::Result<()> {
			anyhow::bail!("disk full")
		}
	}

	struct Renamer {
		seen_channel: Mutex<Option<String>>,
	}

	#[async_trait::async_trait]
	impl BadgeEnricher for Renamer {
		async fn enrich(&self, channel: &str, mut badges: Vec<chatharvest_domain::Badge>) -> Vec<chatharvest_domain::Badge> {
			*self.seen_channel.lock() = Some(channel.to_string());
			for b in &mut badges {
				b.version = format!("{}-enriched", b.version);
			}
			badges
		}
	}

	fn twitch_msg(id: &str) -> ChatMessage {
		let mut m = ChatMessage::new(Platform::Twitch, id, "viewer", "hi", 1);
		m.badges = vec![chatharvest_domain::Badge::new(Platform::Twitch, "subscriber", "6")];
		m
	}

	#[tokio::test]
	async fn ingest_persists_then_broadcasts() {
		let store = Arc::new(MemoryStore::new());
		let hub = Hub::new(4, HubMetrics::noop());
		let mut sub = hub.register(Filters::default().for_stream(), Transport::Sse).expect("open hub");

		let ingest = Ingest::new(store.clone(), hub.clone(), SinkMetrics::noop());
		ingest.handle(twitch_msg("a")).await;

		assert_eq!(store.count(&Filters::default()).await.expect("count"), 1);
		assert_eq!(sub.recv().await.expect("broadcast").id, "a");
	}

	#[tokio::test]
	async fn sink_failure_still_broadcasts() {
		let hub = Hub::new(4, HubMetrics::noop());
		let mut sub = hub.register(Filters::default().for_stream(), Transport::Ws).expect("open hub");

		let ingest = Ingest::new(Arc::new(FailingSink), hub.clone(), SinkMetrics::noop());
		ingest.handle(twitch_msg("b")).await;

		assert_eq!(sub.recv().await.expect("broadcast").id, "b");
	}

	#[tokio::test]
	async fn twitch_badges_are_enriched_with_channel() {
		let hub = Hub::new(4, HubMetrics::noop());
		let mut sub = hub.register(Filters::default().for_stream(), Transport::Sse).expect("open hub");
		let enricher = Arc::new(Renamer {
			seen_channel: Mutex::new(None),
		});

		let ingest = Ingest::new(Arc::new(MemoryStore::new()), hub.clone(), SinkMetrics::noop())
			.with_badge_enricher("somechannel", enricher.clone());
		ingest.handle(twitch_msg("c")).await;

		let got = sub.recv().await.expect("broadcast");
		assert_eq!(got.badges[0].version, "6-enriched");
		assert_eq!(enricher.seen_channel.lock().as_deref(), Some("somechannel"));

		let mut yt = ChatMessage::new(Platform::YouTube, "y", "viewer", "hi", 2);
		yt.badges = vec![chatharvest_domain::Badge::new(Platform::YouTube, "member", "")];
		ingest.handle(yt).await;
		let got = sub.recv().await.expect("broadcast");
		assert_eq!(got.badges[0].version, "");
	}

	#[tokio::test]
	async fn supervisor_without_receivers_stops_on_shutdown() {
		let (trigger, shutdown) = chatharvest_util::shutdown::channel();
		let hub = Hub::new(4, HubMetrics::noop());
		let handler: Arc<dyn MessageHandler> = Arc::new(Ingest::new(Arc::new(MemoryStore::new()), hub, SinkMetrics::noop()));
		let supervisor = Supervisor::new(Receivers::default(), handler, Duration::from_millis(50));

		let task = tokio::spawn(supervisor.run(shutdown));
		trigger.trigger();
		tokio::time::timeout(Duration::from_secs(1), task)
			.await
			.expect("supervisor stops promptly")
			.expect("supervisor task joined");
	}

	#[tokio::test]
	async fn unconfigured_platforms_build_nothing() {
		let cfg = crate::config::ServerConfig::default();
		let recorder = metrics::NoopRecorder;
		let built = build_receivers(&cfg, &recorder, &Shutdown::never()).await.expect("build");
		assert!(built.receivers.is_empty());
		assert!(built.reloader.is_none());
	}

	#[tokio::test]
	async fn twitch_without_any_token_is_skipped() {
		let mut cfg = crate::config::ServerConfig::default();
		cfg.twitch.channel = Some("chan".into());
		cfg.twitch.nick = Some("bot".into());
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("token");
		std::fs::write(&path, "\n").expect("write");
		cfg.twitch.token_file = Some(path);

		let recorder = metrics::NoopRecorder;
		let built = build_receivers(&cfg, &recorder, &Shutdown::never()).await.expect("build");
		assert!(built.receivers.is_empty());
	}

	#[tokio::test]
	async fn twitch_with_token_file_builds_receiver_and_reloader() {
		let mut cfg = crate::config::ServerConfig::default();
		cfg.twitch.channel = Some("chan".into());
		cfg.twitch.nick = Some("bot".into());
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("token");
		std::fs::write(&path, "abc\n").expect("write");
		cfg.twitch.token_file = Some(path);

		let (trigger, shutdown) = chatharvest_util::shutdown::channel();
		let recorder = metrics::NoopRecorder;
		let built = build_receivers(&cfg, &recorder, &shutdown).await.expect("build");
		assert_eq!(built.receivers.len(), 1);
		assert_eq!(built.receivers[0].platform(), Platform::Twitch);
		assert_eq!(built.background.len(), 1, "token file watcher");

		let reloader = built.reloader.expect("reloader");
		assert_eq!(reloader.reload().await.expect("reload"), "bot");
		trigger.trigger();
	}
}
