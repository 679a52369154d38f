#![forbid(unsafe_code)]

//! Cross-cutting request policy: CORS, per-client rate limiting and response compression.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::http::Extensions;
use hyper::{Method, StatusCode, Version};
use tracing::debug;

/// Keys tracked before idle clients are pruned.
const MAX_TRACKED_CLIENTS: usize = 1024;
const PREFLIGHT_MAX_AGE: &str = "300";

/// Allowed browser origins. Only `http://` and `https://` origins can ever match.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
	allow_all: bool,
	origins: HashSet<String>,
}

/// What the CORS layer decided before routing.
#[derive(Debug, PartialEq, Eq)]
pub enum CorsDecision {
	/// No `Origin` header; nothing to add.
	NotCors,
	/// Route the request and echo this origin back.
	Allow(String),
	/// Answer a preflight for this origin without routing.
	Preflight { origin: String, request_headers: Option<String> },
	Forbidden,
}

impl CorsPolicy {
	/// `None` when no origins are configured, which leaves CORS off.
	pub fn new(origins: &[String]) -> Option<Self> {
		let mut policy = Self {
			allow_all: false,
			origins: HashSet::new(),
		};
		for origin in origins.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
			if origin == "*" {
				policy.allow_all = true;
				policy.origins.clear();
				break;
			}
			policy.origins.insert(origin.to_string());
		}
		(policy.allow_all || !policy.origins.is_empty()).then_some(policy)
	}

	pub fn is_allowed(&self, origin: &str) -> bool {
		if !origin.starts_with("http://") && !origin.starts_with("https://") {
			return false;
		}
		self.allow_all || self.origins.contains(origin)
	}

	pub fn decide(&self, method: &Method, headers: &HeaderMap) -> CorsDecision {
		let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
			return CorsDecision::NotCors;
		};
		if origin.is_empty() {
			return CorsDecision::NotCors;
		}
		if !self.is_allowed(origin) {
			return CorsDecision::Forbidden;
		}
		if *method == Method::OPTIONS {
			let request_headers = headers
				.get(header::ACCESS_CONTROL_REQUEST_HEADERS)
				.and_then(|v| v.to_str().ok())
				.filter(|v| !v.is_empty())
				.map(str::to_string);
			return CorsDecision::Preflight {
				origin: origin.to_string(),
				request_headers,
			};
		}
		CorsDecision::Allow(origin.to_string())
	}
}

/// Headers for a successful preflight answer.
pub fn apply_preflight_headers(headers: &mut HeaderMap, origin: &str, request_headers: Option<&str>) {
	apply_origin_headers(headers, origin);
	headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET,OPTIONS"));
	if let Some(v) = request_headers.and_then(|v| HeaderValue::from_str(v).ok()) {
		headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, v);
	}
	headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(PREFLIGHT_MAX_AGE));
}

pub fn apply_origin_headers(headers: &mut HeaderMap, origin: &str) {
	if let Ok(v) = HeaderValue::from_str(origin) {
		headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
	}
	headers.append(header::VARY, HeaderValue::from_static("Origin"));
}

/// Token bucket per client address.
pub struct IpRateLimiter {
	limiter: DefaultKeyedRateLimiter<String>,
}

impl IpRateLimiter {
	/// `None` when either value is zero, which disables limiting.
	pub fn new(rps: u32, burst: u32) -> Option<Self> {
		let rps = NonZeroU32::new(rps)?;
		let burst = NonZeroU32::new(burst)?;
		let quota = Quota::per_second(rps).allow_burst(burst);
		Some(Self {
			limiter: RateLimiter::keyed(quota),
		})
	}

	pub fn allow(&self, client: &str) -> bool {
		let allowed = self.limiter.check_key(&client.to_string()).is_ok();
		if self.limiter.len() > MAX_TRACKED_CLIENTS {
			self.limiter.retain_recent();
			debug!(tracked = self.limiter.len(), "http: pruned idle rate limit entries");
		}
		allowed
	}
}

/// First non-empty `X-Forwarded-For` entry, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').map(str::trim).find(|p| !p.is_empty()))
		.map_or_else(|| peer.ip().to_string(), str::to_string)
}

/// Response marker for routes whose bodies may be gzip-encoded.
#[derive(Debug, Clone, Copy)]
pub struct Compressible;

/// Compression predicate: only marked responses qualify.
pub fn is_compressible(_: StatusCode, _: Version, _: &HeaderMap, extensions: &Extensions) -> bool {
	extensions.get::<Compressible>().is_some()
}
