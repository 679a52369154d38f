#![forbid(unsafe_code)]

//! Decides whether a channel handle or video URL is live right now.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use url::{Position, Url};

use super::extract::extract_json_assignment;
use super::poller::YOUTUBE_ORIGIN;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const PLAYER_STATE_MARKERS: [&str; 2] = ["ytInitialPlayerResponse", "ytInitialData"];

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("youtube: empty url")]
	Empty,
	#[error("youtube: parse url: {0}")]
	InvalidUrl(#[from] url::ParseError),
	#[error("youtube: unsupported host {0:?}")]
	UnsupportedHost(String),
	#[error("youtube: url is missing a video id")]
	MissingVideoId,
	#[error("youtube: resolve status {0}")]
	Status(reqwest::StatusCode),
	#[error("youtube: resolve request: {0}")]
	Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
	pub live: bool,
	pub watch_url: Option<String>,
	pub chat_url: Option<String>,
}

fn video_url(path: &str, video_id: &str) -> Option<String> {
	let video_id = video_id.trim();
	if video_id.is_empty() {
		return None;
	}
	let mut url = Url::parse(YOUTUBE_ORIGIN).ok()?;
	url.set_path(path);
	url.query_pairs_mut().append_pair("v", video_id);
	Some(url.into())
}

pub fn watch_url_for(video_id: &str) -> Option<String> {
	video_url("/watch", video_id)
}

pub fn chat_url_for(video_id: &str) -> Option<String> {
	video_url("/live_chat", video_id)
}

fn query_video_id(url: &Url) -> Option<String> {
	url.query_pairs()
		.find(|(k, _)| k == "v")
		.map(|(_, v)| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

/// Coerce handles and YouTube URLs into a fetchable `https://www.youtube.com` URL.
///
/// `@name`, `/@name` and `/@name/live` all become `/@name/live`; `youtu.be/ID`
/// becomes `/watch?v=ID`.
pub fn normalize_youtube_url(raw: &str) -> Result<Url, ResolveError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Err(ResolveError::Empty);
	}

	let mut candidate = trimmed.to_string();
	if candidate.starts_with('@') {
		candidate = format!("{YOUTUBE_ORIGIN}/{candidate}");
	}
	if !candidate.contains("://") {
		candidate = format!("https://{candidate}");
	}

	let mut url = Url::parse(&candidate)?;
	url.set_fragment(None);

	let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
	match host.as_str() {
		"youtu.be" => {
			let id = url.path().trim_matches('/');
			let watch = watch_url_for(id).ok_or(ResolveError::MissingVideoId)?;
			Ok(Url::parse(&watch)?)
		}
		"youtube.com" | "www.youtube.com" => {
			let path = url.path().to_string();
			let mut out = Url::parse(YOUTUBE_ORIGIN)?;
			if path.starts_with("/@") {
				let handle = path.trim_end_matches('/').trim_end_matches("/live");
				out.set_path(&format!("{handle}/live"));
				return Ok(out);
			}
			if path.eq_ignore_ascii_case("/watch") {
				let id = query_video_id(&url).ok_or(ResolveError::MissingVideoId)?;
				out.set_path("/watch");
				out.query_pairs_mut().append_pair("v", &id);
				return Ok(out);
			}
			out.set_path(path.trim_end_matches('/'));
			out.set_query(url.query());
			Ok(out)
		}
		_ => Err(ResolveError::UnsupportedHost(url.host_str().unwrap_or_default().to_string())),
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerResponse {
	#[serde(default)]
	streaming_data: Option<serde_json::Value>,
	#[serde(default)]
	video_details: VideoDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetails {
	#[serde(default)]
	video_id: String,
	#[serde(default)]
	is_live: bool,
	#[serde(default)]
	is_live_content: bool,
}

/// `(video_id, live)` from the embedded player state, if any marker carries a video.
fn initial_player_state(body: &str) -> Option<(String, bool)> {
	PLAYER_STATE_MARKERS.iter().find_map(|marker| {
		let raw = extract_json_assignment(body, marker)?;
		let root: serde_json::Value = serde_json::from_str(raw).ok()?;
		let player = match root {
			serde_json::Value::Object(mut map) if map.contains_key("playerResponse") => {
				map.remove("playerResponse").unwrap_or(serde_json::Value::Null)
			}
			other => other,
		};
		let player: PlayerResponse = serde_json::from_value(player).ok()?;
		let video_id = player.video_details.video_id.trim().to_string();
		if video_id.is_empty() {
			return None;
		}
		let live = player.video_details.is_live
			|| player.video_details.is_live_content
			|| player.streaming_data.is_some_and(|d| !d.is_null());
		Some((video_id, live))
	})
}

fn unescape_html(text: &str) -> String {
	text.replace("&quot;", "\"")
		.replace("&#39;", "'")
		.replace("&#x27;", "'")
		.replace("&lt;", "<")
		.replace("&gt;", ">")
		.replace("&amp;", "&")
}

fn decode_page(body: &str) -> String {
	unescape_html(&body.replace("\\/", "/").replace("\\u0026", "&"))
}

fn extract_chat_url(text: &str) -> Option<String> {
	let idx = text.find("/live_chat?")?;
	let start = text[..idx]
		.strip_suffix("https://www.youtube.com")
		.map_or(idx, |prefix| prefix.len());
	let end = text[start..]
		.find(['"', '\'', '<', '>'])
		.map_or(text.len(), |len| start + len);
	let raw = text[start..end].trim();

	if raw.starts_with("https://") {
		return Url::parse(raw).ok().map(String::from);
	}
	raw.starts_with('/').then(|| format!("{YOUTUBE_ORIGIN}{raw}"))
}

fn contains_live_indicator(text: &str) -> bool {
	let lowered = text.to_ascii_lowercase();
	["\"islivenow\":true", "\"islive\":true", "\"islivecontent\":true", "livechatrenderer"]
		.iter()
		.any(|needle| lowered.contains(needle))
}

/// Resolves channel handles and watch URLs to their current live stream.
pub struct Resolver {
	http: reqwest::Client,
	origin: String,
}

impl Resolver {
	pub fn new() -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(concat!("Mozilla/5.0 (compatible; chatharvest/", env!("CARGO_PKG_VERSION"), ")"))
			.timeout(RESOLVE_TIMEOUT)
			.build()
			.context("build reqwest client")?;
		Ok(Self {
			http,
			origin: YOUTUBE_ORIGIN.to_string(),
		})
	}

	/// Send requests for `www.youtube.com` URLs to another origin instead.
	pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
		self.origin = origin.into().trim_end_matches('/').to_string();
		self
	}

	/// `canonical` with its scheme and host replaced by the configured origin.
	pub fn fetch_url(&self, canonical: &str) -> String {
		match Url::parse(canonical) {
			Ok(url) => format!("{}{}", self.origin, &url[Position::BeforePath..]),
			Err(_) => canonical.to_string(),
		}
	}

	pub async fn resolve(&self, raw: &str) -> Result<Resolution, ResolveError> {
		let normalized = normalize_youtube_url(raw)?;
		let resp = self.http.get(self.fetch_url(normalized.as_str())).send().await?;
		let status = resp.status();
		if status.is_client_error() || status.is_server_error() {
			return Err(ResolveError::Status(status));
		}

		let final_url = resp.url().clone();
		let watch_url = final_url
			.path()
			.eq_ignore_ascii_case("/watch")
			.then(|| query_video_id(&final_url))
			.flatten()
			.and_then(|id| watch_url_for(&id));
		let body = resp.text().await?;

		if let Some((video_id, live)) = initial_player_state(&body) {
			if !live {
				return Ok(Resolution {
					live: false,
					watch_url: watch_url.or_else(|| watch_url_for(&video_id)),
					chat_url: None,
				});
			}
			return Ok(Resolution {
				live: true,
				watch_url: watch_url_for(&video_id),
				chat_url: chat_url_for(&video_id),
			});
		}

		let text = decode_page(&body);
		let mut chat_url = extract_chat_url(&text);
		let live = watch_url.is_some() && (chat_url.is_some() || contains_live_indicator(&text));
		if !live {
			return Ok(Resolution {
				live: false,
				watch_url,
				chat_url: None,
			});
		}
		if chat_url.is_none() {
			chat_url = query_video_id(&final_url).and_then(|id| chat_url_for(&id));
		}
		Ok(Resolution {
			live,
			watch_url,
			chat_url,
		})
	}
}
