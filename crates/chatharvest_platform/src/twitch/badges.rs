#![forbid(unsafe_code)]

//! Badge image lookup against the Helix badge catalog.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::Context;
use chatharvest_domain::{Badge, Image, Platform};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::SecretString;

pub const HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";
const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const APP_TOKEN_FALLBACK_TTL: Duration = Duration::from_secs(60 * 60);

/// `set_id -> version -> images`.
type BadgeSets = HashMap<String, HashMap<String, Vec<Image>>>;

/// Attaches image variants to badges. Implementations must return the input
/// unchanged on any failure.
#[async_trait::async_trait]
pub trait BadgeEnricher: Send + Sync + 'static {
	async fn enrich(&self, channel: &str, badges: Vec<Badge>) -> Vec<Badge>;
}

/// Run `enricher` but give up after `limit`, returning the badges untouched.
pub async fn enrich_bounded(enricher: &dyn BadgeEnricher, channel: &str, badges: Vec<Badge>, limit: Duration) -> Vec<Badge> {
	let fallback = badges.clone();
	match tokio::time::timeout(limit, enricher.enrich(channel, badges)).await {
		Ok(enriched) => enriched,
		Err(_) => {
			warn!(channel = %channel, "twitch: badge enrichment timed out");
			fallback
		}
	}
}

#[derive(Debug, Deserialize)]
struct HelixBadgesResponse {
	#[serde(default)]
	data: Vec<HelixBadgeSet>,
}

#[derive(Debug, Deserialize)]
struct HelixBadgeSet {
	set_id: String,
	#[serde(default)]
	versions: Vec<HelixBadgeVersion>,
}

#[derive(Debug, Deserialize)]
struct HelixBadgeVersion {
	id: String,
	#[serde(default)]
	image_url_1x: String,
	#[serde(default)]
	image_url_2x: String,
	#[serde(default)]
	image_url_4x: String,
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	#[serde(default)]
	data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
	id: String,
}

#[derive(Debug, Deserialize)]
struct AppTokenResponse {
	#[serde(default)]
	access_token: String,
	#[serde(default)]
	expires_in: i64,
}

struct Cached<T> {
	expires_at: Instant,
	value: T,
}

impl<T: Clone> Cached<T> {
	fn fresh(&self) -> Option<T> {
		(Instant::now() < self.expires_at).then(|| self.value.clone())
	}
}

#[derive(Default)]
struct CacheState {
	app_token: Option<Cached<String>>,
	sets: HashMap<String, Cached<BadgeSets>>,
	users: HashMap<String, Cached<String>>,
}

/// Badge enricher backed by Helix, using an app access token from the client
/// credentials grant.
pub struct TwitchBadgeEnricher {
	client_id: String,
	client_secret: SecretString,
	helix_base: String,
	token_url: String,
	ttl: Duration,
	http: reqwest::Client,
	cache: Mutex<CacheState>,
	announced: Mutex<HashSet<String>>,
}

impl TwitchBadgeEnricher {
	pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("chatharvest/", env!("CARGO_PKG_VERSION"), " (badges)"))
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			client_id: client_id.into().trim().to_string(),
			client_secret,
			helix_base: HELIX_BASE_URL.to_string(),
			token_url: super::oauth::TOKEN_ENDPOINT.to_string(),
			ttl: DEFAULT_TTL,
			http,
			cache: Mutex::new(CacheState::default()),
			announced: Mutex::new(HashSet::new()),
		})
	}

	/// Point at a different Helix base and token endpoint.
	pub fn with_endpoints(mut self, helix_base: impl Into<String>, token_url: impl Into<String>) -> Self {
		self.helix_base = helix_base.into().trim_end_matches('/').to_string();
		self.token_url = token_url.into();
		self
	}

	pub fn with_ttl(mut self, ttl: Duration) -> Self {
		if !ttl.is_zero() {
			self.ttl = ttl;
		}
		self
	}

	async fn app_token(&self) -> anyhow::Result<String> {
		if let Some(token) = self.cache.lock().app_token.as_ref().and_then(Cached::fresh) {
			return Ok(token);
		}

		let resp = self
			.http
			.post(&self.token_url)
			.form(&[
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose().trim()),
				("grant_type", "client_credentials"),
			])
			.send()
			.await
			.context("app token request")?
			.error_for_status()
			.context("app token status")?;

		let body: AppTokenResponse = resp.json().await.context("app token json")?;
		let token = body.access_token.trim().to_string();
		if token.is_empty() {
			anyhow::bail!("empty access_token");
		}
		let lifetime = u64::try_from(body.expires_in)
			.ok()
			.filter(|s| *s > 0)
			.map_or(APP_TOKEN_FALLBACK_TTL, Duration::from_secs);

		self.cache.lock().app_token = Some(Cached {
			expires_at: Instant::now() + lifetime,
			value: token.clone(),
		});
		Ok(token)
	}

	async fn helix_get<T: serde::de::DeserializeOwned>(&self, token: &str, path_and_query: &str) -> anyhow::Result<T> {
		let url = format!("{}{path_and_query}", self.helix_base);
		let resp = self
			.http
			.get(&url)
			.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {token}"))
			.send()
			.await
			.with_context(|| format!("helix request {path_and_query}"))?
			.error_for_status()
			.with_context(|| format!("helix status {path_and_query}"))?;
		resp.json().await.with_context(|| format!("helix json {path_and_query}"))
	}

	async fn badge_sets(&self, token: &str, broadcaster_id: Option<&str>) -> anyhow::Result<BadgeSets> {
		let key = broadcaster_id.unwrap_or("global").to_string();
		if let Some(sets) = self.cache.lock().sets.get(&key).and_then(Cached::fresh) {
			return Ok(sets);
		}

		let path = match broadcaster_id {
			Some(id) => format!("/chat/badges?broadcaster_id={}", url::form_urlencoded::byte_serialize(id.as_bytes()).collect::<String>()),
			None => "/chat/badges/global".to_string(),
		};
		let body: HelixBadgesResponse = self.helix_get(token, &path).await?;
		let sets = convert_badge_sets(body.data);
		info!(scope = %key, sets = sets.len(), "twitch: fetched badge metadata");

		self.cache.lock().sets.insert(
			key,
			Cached {
				expires_at: Instant::now() + self.ttl,
				value: sets.clone(),
			},
		);
		Ok(sets)
	}

	async fn broadcaster_id(&self, token: &str, channel: &str) -> anyhow::Result<Option<String>> {
		if !channel.is_empty() && channel.bytes().all(|b| b.is_ascii_digit()) {
			return Ok(Some(channel.to_string()));
		}
		if let Some(id) = self.cache.lock().users.get(channel).and_then(Cached::fresh) {
			return Ok(Some(id));
		}

		let login: String = url::form_urlencoded::byte_serialize(channel.as_bytes()).collect();
		let body: HelixUsersResponse = self.helix_get(token, &format!("/users?login={login}")).await?;
		let Some(id) = body.data.into_iter().map(|u| u.id).find(|id| !id.is_empty()) else {
			anyhow::bail!("user {channel} not found");
		};

		self.cache.lock().users.insert(
			channel.to_string(),
			Cached {
				expires_at: Instant::now() + self.ttl,
				value: id.clone(),
			},
		);
		Ok(Some(id))
	}

	/// Global sets overlaid with the channel's own sets.
	async fn lookup(&self, channel: &str) -> BadgeSets {
		let token = match self.app_token().await {
			Ok(t) => t,
			Err(err) => {
				warn!(error = %err, "twitch: badge app token");
				return BadgeSets::new();
			}
		};

		let mut merged = BadgeSets::new();
		match self.badge_sets(&token, None).await {
			Ok(global) => merge_badge_sets(&mut merged, global),
			Err(err) => warn!(error = ?err, "twitch: fetch global badges"),
		}

		if channel.is_empty() {
			return merged;
		}

		let broadcaster = match self.broadcaster_id(&token, channel).await {
			Ok(id) => id,
			Err(err) => {
				warn!(channel = %channel, error = ?err, "twitch: badge user lookup");
				None
			}
		};
		if let Some(id) = broadcaster {
			match self.badge_sets(&token, Some(&id)).await {
				Ok(sets) => merge_badge_sets(&mut merged, sets),
				Err(err) => warn!(channel = %channel, error = ?err, "twitch: fetch channel badges"),
			}
		}
		merged
	}
}

#[async_trait::async_trait]
impl BadgeEnricher for TwitchBadgeEnricher {
	async fn enrich(&self, channel: &str, mut badges: Vec<Badge>) -> Vec<Badge> {
		if self.client_id.is_empty() || self.client_secret.is_blank() || badges.is_empty() {
			return badges;
		}

		let channel = channel.trim().trim_start_matches('#').to_ascii_lowercase();
		let sets = self.lookup(&channel).await;
		if sets.is_empty() {
			return badges;
		}

		let mut enriched = 0usize;
		for badge in badges.iter_mut().filter(|b| b.platform == Platform::Twitch) {
			let Some(versions) = sets.get(&badge.id) else {
				continue;
			};
			let images = versions
				.get(&badge.version)
				.filter(|imgs| !imgs.is_empty())
				.or_else(|| versions.get("").filter(|imgs| !imgs.is_empty()));
			if let Some(images) = images {
				badge.images = images.clone();
				enriched += 1;
			}
		}

		if enriched > 0 && self.announced.lock().insert(channel.clone()) {
			info!(channel = %channel, enriched, "twitch: enriched badges");
		}
		badges
	}
}

fn merge_badge_sets(dst: &mut BadgeSets, src: BadgeSets) {
	for (set_id, versions) in src {
		dst.entry(set_id).or_default().extend(versions);
	}
}

fn convert_badge_sets(sets: Vec<HelixBadgeSet>) -> BadgeSets {
	sets.into_iter()
		.filter(|set| !set.set_id.is_empty())
		.filter_map(|set| {
			let versions: HashMap<String, Vec<Image>> = set
				.versions
				.into_iter()
				.filter(|v| !v.id.is_empty())
				.map(|v| {
					let images = build_images(&v);
					(v.id, images)
				})
				.collect();
			(!versions.is_empty()).then_some((set.set_id, versions))
		})
		.collect()
}

fn build_images(version: &HelixBadgeVersion) -> Vec<Image> {
	let mut images: Vec<Image> = [
		(&version.image_url_1x, 18),
		(&version.image_url_2x, 36),
		(&version.image_url_4x, 72),
	]
	.into_iter()
	.filter(|(url, _)| !url.trim().is_empty())
	.map(|(url, px)| Image::new(url.as_str(), px, px))
	.collect();
	chatharvest_domain::rank_images(&mut images);
	images
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_http::{Route, serve};

	const GLOBAL: &str = r#"{"data":[
		{"set_id":"moderator","versions":[{"id":"1","image_url_1x":"https://cdn/mod-1x","image_url_2x":"https://cdn/mod-2x","image_url_4x":"https://cdn/mod-4x"}]},
		{"set_id":"subscriber","versions":[{"id":"0","image_url_1x":"https://cdn/sub0-1x"}]}
	]}"#;
	const CHANNEL: &str = r#"{"data":[
		{"set_id":"subscriber","versions":[{"id":"24","image_url_1x":"https://cdn/sub24-1x","image_url_2x":"https://cdn/sub24-2x"}]}
	]}"#;

	fn badge(id: &str, version: &str) -> Badge {
		Badge::new(Platform::Twitch, id, version)
	}

	#[tokio::test]
	async fn enriches_global_and_channel_badges() {
		let server = serve(vec![
			Route::new("POST", "/oauth2/token", 200, r#"{"access_token":"app","expires_in":3600}"#),
			Route::new("GET", "/helix/chat/badges/global", 200, GLOBAL),
			Route::new("GET", "/helix/users?login=chan", 200, r#"{"data":[{"id":"42"}]}"#),
			Route::new("GET", "/helix/chat/badges?broadcaster_id=42", 200, CHANNEL),
		])
		.await;
		let enricher = TwitchBadgeEnricher::new("client", SecretString::new("secret"))
			.expect("enricher")
			.with_endpoints(format!("{}/helix", server.base), format!("{}/oauth2/token", server.base));

		let input = vec![badge("moderator", "1"), badge("subscriber", "24"), badge("partner", "1")];
		let out = enricher.enrich("#Chan", input.clone()).await;

		assert_eq!(out.len(), 3);
		assert_eq!(out[0].images.len(), 3);
		assert_eq!(out[0].images[0].url, "https://cdn/mod-4x");
		assert_eq!(out[0].images[0].width, 72);
		assert_eq!(out[1].images[0].url, "https://cdn/sub24-2x");
		assert!(out[2].images.is_empty());

		enricher.enrich("chan", input).await;
		assert_eq!(server.count("/oauth2/token"), 1);
		assert_eq!(server.count("/helix/chat/badges/global"), 1);
		assert_eq!(server.count("/helix/users"), 1);

		let requests = server.requests();
		assert!(requests.iter().any(|r| r.to_ascii_lowercase().contains("authorization: bearer app")));
	}

	#[tokio::test]
	async fn failures_return_input_unchanged() {
		let server = serve(vec![Route::new("POST", "/oauth2/token", 500, "{}")]).await;
		let enricher = TwitchBadgeEnricher::new("client", SecretString::new("secret"))
			.expect("enricher")
			.with_endpoints(format!("{}/helix", server.base), format!("{}/oauth2/token", server.base));

		let input = vec![badge("moderator", "1")];
		assert_eq!(enricher.enrich("chan", input.clone()).await, input);
	}

	#[tokio::test]
	async fn disabled_without_credentials() {
		let enricher = TwitchBadgeEnricher::new("", SecretString::new("")).expect("enricher");
		let input = vec![badge("moderator", "1")];
		assert_eq!(enricher.enrich("chan", input.clone()).await, input);
	}

	struct Stalled;

	#[async_trait::async_trait]
	impl BadgeEnricher for Stalled {
		async fn enrich(&self, _channel: &str, badges: Vec<Badge>) -> Vec<Badge> {
			tokio::time::sleep(Duration::from_secs(3600)).await;
			badges
		}
	}

	#[tokio::test(start_paused = true)]
	async fn bounded_enrichment_fails_open() {
		let input = vec![badge("moderator", "1")];
		let out = enrich_bounded(&Stalled, "chan", input.clone(), Duration::from_secs(2)).await;
		assert_eq!(out, input);
	}
}
