#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use chatharvest_platform::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8765";
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 100;
const DEFAULT_TOKEN_POLL_SECS: u64 = 10;
const DEFAULT_POLL_TIMEOUT_SECS: i64 = 20;
const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
const DEFAULT_RESOLVE_INTERVAL_SECS: u64 = 30;
const DEFAULT_RATE_LIMIT_RPS: u32 = 20;
const DEFAULT_RATE_LIMIT_BURST: u32 = 40;
const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_MEMORY_MAX_ROWS: usize = 50_000;

/// Default config path: `~/.chatharvest/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatharvest").join("config.toml"))
}

/// Load TOML (missing file = defaults), apply env overrides, validate.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.validate()?;
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
	pub youtube: YouTubeSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	pub http_bind: String,
	/// Log every request at info instead of debug.
	pub access_log: bool,
	/// Time allowed for in-flight handler calls after shutdown fires.
	pub shutdown_grace: Duration,
	/// Browser origins allowed to call the API; `*` allows any http(s) origin.
	pub cors_origins: Vec<String>,
	/// Per-client requests per second; `0` disables rate limiting.
	pub rate_limit_rps: u32,
	pub rate_limit_burst: u32,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub channel: Option<String>,
	pub nick: Option<String>,
	pub token: Option<SecretString>,
	pub token_file: Option<PathBuf>,
	pub tls: bool,
	pub addr: Option<String>,
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
	pub refresh_token_file: Option<PathBuf>,
	pub token_poll_interval: Duration,
	pub debug_drops: bool,
	/// `None` means enabled whenever app credentials are present.
	pub badge_enrichment: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct YouTubeSettings {
	pub url: Option<String>,
	/// `<= 0` disables the per-request bound.
	pub poll_timeout_secs: i64,
	pub poll_interval_ms: u64,
	pub resolve_interval: Duration,
	pub dump_unhandled: bool,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:` URL; absent keeps messages in memory.
	pub database_url: Option<String>,
	/// Messages written per database batch.
	pub batch_size: usize,
	/// Longest a buffered message waits for its batch; zero flushes only on size.
	pub flush_max: Duration,
	/// Rows kept by the in-memory store before the oldest are evicted.
	pub memory_max_rows: usize,
}

impl PersistenceSettings {
	pub fn is_buffered(&self) -> bool {
		self.batch_size > 1 || !self.flush_max.is_zero()
	}
}

impl TwitchSettings {
	pub fn is_configured(&self) -> bool {
		self.channel.is_some()
	}

	/// A refresh token source was supplied, so the refresher must be built.
	pub fn wants_refresh(&self) -> bool {
		self.refresh_token.is_some() || self.refresh_token_file.is_some()
	}

	pub fn badge_enrichment_enabled(&self) -> bool {
		let has_app_credentials = self.client_id.is_some() && self.client_secret.is_some();
		has_app_credentials && self.badge_enrichment.unwrap_or(true)
	}
}

impl YouTubeSettings {
	pub fn is_configured(&self) -> bool {
		self.url.is_some()
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	youtube: FileYouTubeSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	access_log: Option<bool>,
	shutdown_grace_ms: Option<u64>,
	cors_origins: Option<Vec<String>>,
	rate_limit_rps: Option<u32>,
	rate_limit_burst: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	channel: Option<String>,
	nick: Option<String>,
	token: Option<String>,
	token_file: Option<String>,
	tls: Option<bool>,
	addr: Option<String>,
	client_id: Option<String>,
	client_secret: Option<String>,
	refresh_token: Option<String>,
	refresh_token_file: Option<String>,
	token_poll_secs: Option<u64>,
	debug_drops: Option<bool>,
	badge_enrichment: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileYouTubeSettings {
	url: Option<String>,
	poll_timeout_secs: Option<i64>,
	poll_interval_ms: Option<u64>,
	resolve_interval_secs: Option<u64>,
	dump_unhandled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	batch_size: Option<usize>,
	flush_max_ms: Option<u64>,
	memory_max_rows: Option<usize>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn origin_list<'a>(origins: impl IntoIterator<Item = &'a str>) -> Vec<String> {
	origins
		.into_iter()
		.map(str::trim)
		.filter(|o| !o.is_empty())
		.map(str::to_string)
		.collect()
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let twitch = TwitchSettings {
			channel: non_blank(file.twitch.channel),
			nick: non_blank(file.twitch.nick),
			token: non_blank(file.twitch.token).map(SecretString::new),
			token_file: non_blank(file.twitch.token_file).map(PathBuf::from),
			tls: file.twitch.tls.unwrap_or(true),
			addr: non_blank(file.twitch.addr),
			client_id: non_blank(file.twitch.client_id),
			client_secret: non_blank(file.twitch.client_secret).map(SecretString::new),
			refresh_token: non_blank(file.twitch.refresh_token).map(SecretString::new),
			refresh_token_file: non_blank(file.twitch.refresh_token_file).map(PathBuf::from),
			token_poll_interval: Duration::from_secs(
				file.twitch
					.token_poll_secs
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_TOKEN_POLL_SECS),
			),
			debug_drops: file.twitch.debug_drops.unwrap_or(false),
			badge_enrichment: file.twitch.badge_enrichment,
		};

		let youtube = YouTubeSettings {
			url: non_blank(file.youtube.url),
			poll_timeout_secs: file.youtube.poll_timeout_secs.unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
			poll_interval_ms: file
				.youtube
				.poll_interval_ms
				.filter(|v| *v > 0)
				.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
			resolve_interval: Duration::from_secs(
				file.youtube
					.resolve_interval_secs
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_RESOLVE_INTERVAL_SECS),
			),
			dump_unhandled: file.youtube.dump_unhandled.unwrap_or(false),
		};

		Self {
			server: ServerSettings {
				http_bind: non_blank(file.server.http_bind).unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string()),
				access_log: file.server.access_log.unwrap_or(false),
				shutdown_grace: Duration::from_millis(
					file.server.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
				),
				cors_origins: origin_list(file.server.cors_origins.iter().flatten().map(String::as_str)),
				rate_limit_rps: file.server.rate_limit_rps.unwrap_or(DEFAULT_RATE_LIMIT_RPS),
				rate_limit_burst: file.server.rate_limit_burst.unwrap_or(DEFAULT_RATE_LIMIT_BURST),
			},
			twitch,
			youtube,
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
				batch_size: file
					.persistence
					.batch_size
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_BATCH_SIZE),
				flush_max: Duration::from_millis(file.persistence.flush_max_ms.unwrap_or(0)),
				memory_max_rows: file
					.persistence
					.memory_max_rows
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MEMORY_MAX_ROWS),
			},
		}
	}

	/// Reject configurations that cannot start.
	pub fn validate(&self) -> anyhow::Result<()> {
		self.server
			.http_bind
			.parse::<SocketAddr>()
			.with_context(|| format!("invalid server.http_bind {:?} (expected host:port)", self.server.http_bind))?;

		let tw = &self.twitch;
		if tw.is_configured() {
			if tw.nick.is_none() {
				bail!("twitch.nick is required when twitch.channel is set");
			}
			if tw.token.is_none() && tw.token_file.is_none() {
				bail!("twitch.token or twitch.token_file is required when twitch.channel is set");
			}
		}

		if tw.wants_refresh() {
			let mut missing = Vec::new();
			if tw.client_id.is_none() {
				missing.push("client_id");
			}
			if tw.client_secret.is_none() {
				missing.push("client_secret");
			}
			if tw.token_file.is_none() {
				missing.push("token_file");
			}
			if !missing.is_empty() {
				bail!("twitch refresh is partially configured; missing {}", missing.join(", "));
			}
		}

		if let Some(url) = &self.persistence.database_url
			&& !url.starts_with("sqlite:")
		{
			bail!("unsupported persistence.database_url (use sqlite:)");
		}

		Ok(())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Non-blank string value of `key`.
fn env_string(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
	non_blank(env(key))
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
	let raw = env(key)?;
	let parsed = parse_env_bool(&raw);
	if parsed.is_none() {
		warn!(key, value = %raw, "config: ignoring non-boolean env value");
	}
	parsed
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
	let raw = env(key)?;
	let parsed = raw.trim().parse::<T>().ok();
	if parsed.is_none() {
		warn!(key, value = %raw, "config: ignoring unparseable env value");
	}
	parsed
}

fn apply_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env_string(&env, "CHATHARVEST_HTTP_BIND") {
		info!(bind = %v, "server config: http_bind overridden by env");
		cfg.server.http_bind = v;
	}

	if let Some(enabled) = env_bool(&env, "CHATHARVEST_ACCESS_LOG") {
		cfg.server.access_log = enabled;
		info!(enabled, "server config: access_log overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&env, "CHATHARVEST_SHUTDOWN_GRACE_MS") {
		cfg.server.shutdown_grace = Duration::from_millis(ms);
		info!(ms, "server config: shutdown_grace overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_HTTP_CORS_ORIGINS") {
		cfg.server.cors_origins = origin_list(v.split(','));
		info!(origins = ?cfg.server.cors_origins, "server config: cors_origins overridden by env");
	}

	if let Some(rps) = env_parse::<u32>(&env, "CHATHARVEST_HTTP_RATE_RPS") {
		cfg.server.rate_limit_rps = rps;
		info!(rps, "server config: rate_limit_rps overridden by env");
	}

	if let Some(burst) = env_parse::<u32>(&env, "CHATHARVEST_HTTP_RATE_BURST") {
		cfg.server.rate_limit_burst = burst;
		info!(burst, "server config: rate_limit_burst overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_CHANNEL") {
		info!(channel = %v, "twitch config: channel overridden by env");
		cfg.twitch.channel = Some(v);
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_NICK") {
		info!(nick = %v, "twitch config: nick overridden by env");
		cfg.twitch.nick = Some(v);
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_TOKEN") {
		cfg.twitch.token = Some(SecretString::new(v));
		info!("twitch config: token overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_TOKEN_FILE") {
		cfg.twitch.token_file = Some(PathBuf::from(v));
		info!("twitch config: token_file overridden by env");
	}

	if let Some(tls) = env_bool(&env, "CHATHARVEST_TWITCH_TLS") {
		cfg.twitch.tls = tls;
		info!(tls, "twitch config: tls overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_ADDR") {
		info!(addr = %v, "twitch config: addr overridden by env");
		cfg.twitch.addr = Some(v);
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_REFRESH_TOKEN") {
		cfg.twitch.refresh_token = Some(SecretString::new(v));
		info!("twitch config: refresh_token overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_TWITCH_REFRESH_TOKEN_FILE") {
		cfg.twitch.refresh_token_file = Some(PathBuf::from(v));
		info!("twitch config: refresh_token_file overridden by env");
	}

	if let Some(secs) = env_parse::<u64>(&env, "CHATHARVEST_TWITCH_TOKEN_POLL_SECS").filter(|v| *v > 0) {
		cfg.twitch.token_poll_interval = Duration::from_secs(secs);
		info!(secs, "twitch config: token_poll_secs overridden by env");
	}

	if let Some(enabled) = env_bool(&env, "CHATHARVEST_TWITCH_DEBUG_DROPS") {
		cfg.twitch.debug_drops = enabled;
		info!(enabled, "twitch config: debug_drops overridden by env");
	}

	if let Some(enabled) = env_bool(&env, "CHATHARVEST_TWITCH_BADGE_ENRICHMENT") {
		cfg.twitch.badge_enrichment = Some(enabled);
		info!(enabled, "twitch config: badge_enrichment overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_YOUTUBE_URL") {
		info!(url = %v, "youtube config: url overridden by env");
		cfg.youtube.url = Some(v);
	}

	if let Some(secs) = env_parse::<i64>(&env, "CHATHARVEST_YOUTUBE_POLL_TIMEOUT_SECS") {
		cfg.youtube.poll_timeout_secs = secs;
		info!(secs, "youtube config: poll_timeout_secs overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&env, "CHATHARVEST_YOUTUBE_POLL_INTERVAL_MS").filter(|v| *v > 0) {
		cfg.youtube.poll_interval_ms = ms;
		info!(ms, "youtube config: poll_interval_ms overridden by env");
	}

	if let Some(secs) = env_parse::<u64>(&env, "CHATHARVEST_YOUTUBE_RESOLVE_INTERVAL_SECS").filter(|v| *v > 0) {
		cfg.youtube.resolve_interval = Duration::from_secs(secs);
		info!(secs, "youtube config: resolve_interval overridden by env");
	}

	if let Some(enabled) = env_bool(&env, "CHATHARVEST_YOUTUBE_DUMP_UNHANDLED") {
		cfg.youtube.dump_unhandled = enabled;
		info!(enabled, "youtube config: dump_unhandled overridden by env");
	}

	if let Some(v) = env_string(&env, "CHATHARVEST_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(size) = env_parse::<usize>(&env, "CHATHARVEST_SINK_BATCH_SIZE").filter(|v| *v > 0) {
		cfg.persistence.batch_size = size;
		info!(size, "persistence: batch_size overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&env, "CHATHARVEST_SINK_FLUSH_MS") {
		cfg.persistence.flush_max = Duration::from_millis(ms);
		info!(ms, "persistence: flush_max_ms overridden by env");
	}

	if let Some(rows) = env_parse::<usize>(&env, "CHATHARVEST_MEMORY_MAX_ROWS").filter(|v| *v > 0) {
		cfg.persistence.memory_max_rows = rows;
		info!(rows, "persistence: memory_max_rows overridden by env");
	}
}
