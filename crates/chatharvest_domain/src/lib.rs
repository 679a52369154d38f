#![forbid(unsafe_code)]

pub mod text;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
	Twitch,
	YouTube,
}

impl Platform {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::YouTube => "youtube",
		}
	}

	pub const ALL: [Platform; 2] = [Platform::Twitch, Platform::YouTube];
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" | "tw" | "t" => Ok(Platform::Twitch),
			"youtube" | "yt" | "y" => Ok(Platform::YouTube),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// One rendition of an emote or badge image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
	pub url: String,
	#[serde(default)]
	pub width: u32,
	#[serde(default)]
	pub height: u32,
}

impl Image {
	pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
		Self {
			url: url.into(),
			width,
			height,
		}
	}

	pub fn area(&self) -> u64 {
		u64::from(self.width) * u64::from(self.height)
	}
}

/// Sort image variants largest first. Equal areas keep their input order.
pub fn rank_images(images: &mut [Image]) {
	images.sort_by_key(|img| std::cmp::Reverse(img.area()));
}

/// An emote placement inside `ChatMessage::text`.
///
/// `start` and `end` count UTF-16 code units; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emote {
	pub id: String,
	pub name: String,
	pub start: usize,
	pub end: usize,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub images: Vec<Image>,
}

/// A status marker attached to the message author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
	pub platform: Platform,
	pub id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub version: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub images: Vec<Image>,
}

impl Badge {
	pub fn new(platform: Platform, id: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			platform,
			id: id.into(),
			version: version.into(),
			images: Vec::new(),
		}
	}
}

/// Normalized chat message shared by every receiver, sink and transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	/// Stable id; never empty.
	pub id: String,

	/// Platform-native id when the source supplies one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub platform_msg_id: Option<String>,

	pub platform: Platform,

	/// UTC epoch milliseconds.
	pub timestamp_ms: i64,

	pub username: String,

	pub text: String,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub emotes: Vec<Emote>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub badges: Vec<Badge>,

	/// Platform badge payload as received, keyed by platform name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub badges_raw: Option<serde_json::Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub raw: Option<serde_json::Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub colour: Option<String>,
}

impl ChatMessage {
	pub fn new(
		platform: Platform,
		id: impl Into<String>,
		username: impl Into<String>,
		text: impl Into<String>,
		timestamp_ms: i64,
	) -> Self {
		Self {
			id: id.into(),
			platform_msg_id: None,
			platform,
			timestamp_ms,
			username: username.into(),
			text: text.into(),
			emotes: Vec::new(),
			badges: Vec::new(),
			badges_raw: None,
			raw: None,
			colour: None,
		}
	}

	/// The idempotency key used by sinks: the platform-native id when present, else `id`.
	pub fn dedup_key(&self) -> DedupKey<'_> {
		let native = self
			.platform_msg_id
			.as_deref()
			.filter(|s| !s.is_empty())
			.unwrap_or(&self.id);
		DedupKey {
			platform: self.platform,
			id: native,
		}
	}
}

/// `(platform, platform-native id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
	pub platform: Platform,
	pub id: &'a str,
}

impl DedupKey<'_> {
	pub fn to_owned_key(&self) -> (Platform, String) {
		(self.platform, self.id.to_string())
	}
}

impl fmt::Display for DedupKey<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.platform, self.id)
	}
}

/// Canonical textual form of an IRC credential: trimmed and `oauth:`-prefixed.
/// Blank input stays blank.
pub fn normalize_token(raw: &str) -> String {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return String::new();
	}
	if trimmed.starts_with("oauth:") {
		trimmed.to_string()
	} else {
		format!("oauth:{trimmed}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn platform_parse_and_display() {
		assert_eq!("twitch".parse::<Platform>().unwrap(), Platform::Twitch);
		assert_eq!("TW".parse::<Platform>().unwrap(), Platform::Twitch);
		assert_eq!("YT".parse::<Platform>().unwrap(), Platform::YouTube);
		assert_eq!("y".parse::<Platform>().unwrap(), Platform::YouTube);
		assert_eq!(Platform::YouTube.to_string(), "youtube");
		assert!(matches!("kick".parse::<Platform>(), Err(ParseIdError::UnknownPlatform(_))));
		assert_eq!(" ".parse::<Platform>(), Err(ParseIdError::Empty));
	}

	#[test]
	fn platform_serializes_lowercase() {
		assert_eq!(serde_json::to_string(&Platform::YouTube).unwrap(), "\"youtube\"");
		let p: Platform = serde_json::from_str("\"twitch\"").unwrap();
		assert_eq!(p, Platform::Twitch);
	}

	#[test]
	fn dedup_key_prefers_platform_id() {
		let mut m = ChatMessage::new(Platform::Twitch, "local-1", "alice", "hi", 1);
		assert_eq!(m.dedup_key().id, "local-1");

		m.platform_msg_id = Some("abc".to_string());
		assert_eq!(m.dedup_key().id, "abc");
		assert_eq!(m.dedup_key().to_string(), "twitch:abc");

		m.platform_msg_id = Some(String::new());
		assert_eq!(m.dedup_key().id, "local-1");
	}

	#[test]
	fn normalize_token_prefixes_once() {
		assert_eq!(normalize_token("  abc \n"), "oauth:abc");
		assert_eq!(normalize_token("oauth:abc"), "oauth:abc");
		assert_eq!(normalize_token("   "), "");
	}

	#[test]
	fn rank_images_largest_first() {
		let mut imgs = vec![Image::new("s", 28, 28), Image::new("l", 112, 112), Image::new("m", 56, 56)];
		rank_images(&mut imgs);
		let urls: Vec<_> = imgs.iter().map(|i| i.url.as_str()).collect();
		assert_eq!(urls, ["l", "m", "s"]);
	}

	#[test]
	fn message_json_omits_empty_optionals() {
		let m = ChatMessage::new(Platform::YouTube, "id1", "bob", "yo", 42);
		let v = serde_json::to_value(&m).unwrap();
		assert_eq!(v["platform"], "youtube");
		assert!(v.get("emotes").is_none());
		assert!(v.get("colour").is_none());
		let back: ChatMessage = serde_json::from_value(v).unwrap();
		assert_eq!(back, m);
	}
}
