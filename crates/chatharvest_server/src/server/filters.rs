#![forbid(unsafe_code)]

//! Query-string filters shared by the list, count and streaming endpoints.

use std::time::Duration;

use chatharvest_domain::{ChatMessage, Platform};
use thiserror::Error;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
	#[error("limit must be a positive integer")]
	Limit,
	#[error("order must be asc or desc")]
	Order,
	#[error("invalid platform filter: {0}")]
	Platform(String),
	#[error("invalid since parameter: {0}")]
	Since(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
	Asc,
	#[default]
	Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filters {
	/// Empty matches every platform.
	pub platforms: Vec<Platform>,
	/// Lowercased substrings; a message matches if its username contains any.
	pub usernames: Vec<String>,
	/// Inclusive lower bound, epoch milliseconds.
	pub since_ms: Option<i64>,
	/// `None` on streaming filters.
	pub limit: Option<usize>,
	pub order: Order,
}

impl Default for Filters {
	fn default() -> Self {
		Self {
			platforms: Vec::new(),
			usernames: Vec::new(),
			since_ms: None,
			limit: Some(DEFAULT_LIMIT),
			order: Order::Desc,
		}
	}
}

impl Filters {
	/// Parse a raw query string. `now_ms` anchors relative `since` durations.
	pub fn from_query(query: Option<&str>, now_ms: i64) -> Result<Self, FilterError> {
		let mut f = Filters::default();
		let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
			.map(|(k, v)| (k.into_owned(), v.into_owned()))
			.collect();
		let first = |key: &str| {
			pairs
				.iter()
				.find(|(k, _)| k == key)
				.map(|(_, v)| v.as_str())
				.filter(|v| !v.is_empty())
		};
		let all = |key: &'static str| {
			pairs
				.iter()
				.filter(move |(k, _)| k == key)
				.flat_map(|(_, v)| v.split(','))
				.map(str::trim)
				.filter(|v| !v.is_empty())
		};

		if let Some(raw) = first("limit") {
			let n = raw.trim().parse::<usize>().map_err(|_| FilterError::Limit)?;
			if n == 0 {
				return Err(FilterError::Limit);
			}
			f.limit = Some(n.min(MAX_LIMIT));
		}

		if let Some(raw) = first("order") {
			f.order = match raw.trim().to_ascii_lowercase().as_str() {
				"asc" => Order::Asc,
				"desc" => Order::Desc,
				_ => return Err(FilterError::Order),
			};
		}

		if let Some(raw) = first("since") {
			f.since_ms = Some(parse_since(raw.trim(), now_ms)?);
		}

		let mut allow_all = false;
		for part in all("platform") {
			match part.to_ascii_lowercase().as_str() {
				"all" | "*" => {
					allow_all = true;
					f.platforms.clear();
				}
				other => {
					let platform = other
						.parse::<Platform>()
						.map_err(|_| FilterError::Platform(part.to_string()))?;
					if !allow_all && !f.platforms.contains(&platform) {
						f.platforms.push(platform);
					}
				}
			}
		}

		for part in all("username") {
			let lowered = part.to_lowercase();
			if !f.usernames.contains(&lowered) {
				f.usernames.push(lowered);
			}
		}

		Ok(f)
	}

	/// Streaming transports ignore paging.
	pub fn for_stream(mut self) -> Self {
		self.limit = None;
		self.order = Order::Desc;
		self
	}

	pub fn matches(&self, msg: &ChatMessage) -> bool {
		if !self.platforms.is_empty() && !self.platforms.contains(&msg.platform) {
			return false;
		}

		if !self.usernames.is_empty() {
			let username = msg.username.to_lowercase();
			if !self.usernames.iter().any(|u| username.contains(u.as_str())) {
				return false;
			}
		}

		match self.since_ms {
			Some(since) => msg.timestamp_ms >= since,
			None => true,
		}
	}

	pub fn limit_or_default(&self) -> usize {
		self.limit.unwrap_or(DEFAULT_LIMIT)
	}
}

/// RFC3339, unix seconds, or a duration before `now_ms` (`90s`, `5m`, `1h30m`).
fn parse_since(raw: &str, now_ms: i64) -> Result<i64, FilterError> {
	if let Ok(t) = chrono::DateTime::parse_from_rfc3339(raw) {
		return Ok(t.timestamp_millis());
	}
	if let Ok(secs) = raw.parse::<i64>() {
		return Ok(secs.saturating_mul(1000));
	}
	if let Some(d) = parse_duration(raw) {
		let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
		return Ok(now_ms.saturating_sub(ms));
	}
	Err(FilterError::Since(raw.to_string()))
}

/// Sequence of `<decimal><unit>` terms with units `ms`, `s`, `m`, `h`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
	let mut rest = raw.trim();
	if rest.is_empty() {
		return None;
	}

	let mut total = 0f64;
	while !rest.is_empty() {
		let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
		if num_len == 0 {
			return None;
		}
		let value: f64 = rest[..num_len].parse().ok()?;
		rest = &rest[num_len..];

		let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
		let scale = match &rest[..unit_len] {
			"ms" => 0.001,
			"s" => 1.0,
			"m" => 60.0,
			"h" => 3600.0,
			_ => return None,
		};
		rest = &rest[unit_len..];
		total += value * scale;
	}

	Duration::try_from_secs_f64(total).ok()
}
