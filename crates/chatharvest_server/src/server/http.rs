#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chatharvest_platform::twitch::TokenReloader;
use chatharvest_util::shutdown::Shutdown;
use chatharvest_util::time::unix_ms_now;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tower_http::compression::predicate::{DefaultPredicate, Predicate as _};
use tower_http::compression::CompressionLayer;
use tracing::{debug, info, warn};

use crate::server::filters::Filters;
use crate::server::hub::{Hub, Transport};
use crate::server::metrics::HttpMetrics;
use crate::server::middleware::{
	Compressible, CorsDecision, CorsPolicy, IpRateLimiter, apply_origin_headers, apply_preflight_headers, client_ip,
	is_compressible,
};
use crate::server::store::Store;
use crate::server::stream;

pub type Body = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Everything a request handler can reach.
pub struct HttpState {
	pub store: Arc<dyn Store>,
	pub hub: Hub,
	pub health: HealthState,
	pub prometheus: Option<PrometheusHandle>,
	pub reloader: Option<Arc<TokenReloader>>,
	pub metrics: HttpMetrics,
	pub access_log: bool,
	pub heartbeat: Duration,
	pub cors: Option<CorsPolicy>,
	pub rate_limit: Option<IpRateLimiter>,
}

impl HttpState {
	pub fn new(store: Arc<dyn Store>, hub: Hub) -> Self {
		Self {
			store,
			hub,
			health: HealthState::new(),
			prometheus: None,
			reloader: None,
			metrics: HttpMetrics::noop(),
			access_log: false,
			heartbeat: stream::HEARTBEAT_INTERVAL,
			cors: None,
			rate_limit: None,
		}
	}
}

/// Accept connections until `shutdown` fires, then let open connections finish gracefully.
pub async fn serve(listener: TcpListener, state: Arc<HttpState>, shutdown: Shutdown) -> anyhow::Result<()> {
	loop {
		let (tcp, peer) = tokio::select! {
			_ = shutdown.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok(conn) => conn,
				Err(err) => {
					warn!(error = %err, "http: accept failed");
					continue;
				}
			},
		};

		let state = Arc::clone(&state);
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			let service = tower::ServiceBuilder::new()
				.layer(
					CompressionLayer::new()
						.gzip(true)
						.compress_when(DefaultPredicate::new().and(is_compressible)),
				)
				.service_fn(move |req| handle(req, Arc::clone(&state), peer));
			let service = TowerToHyperService::new(service);
			let conn = http1::Builder::new()
				.serve_connection(TokioIo::new(tcp), service)
				.with_upgrades();
			tokio::pin!(conn);

			let result = tokio::select! {
				r = conn.as_mut() => r,
				_ = shutdown.cancelled() => {
					conn.as_mut().graceful_shutdown();
					conn.await
				}
			};
			if let Err(err) = result {
				debug!(peer = %peer, error = %err, "http: connection error");
			}
		});
	}

	info!("http: listener stopped");
	Ok(())
}

async fn handle(req: Request<Incoming>, state: Arc<HttpState>, peer: SocketAddr) -> Result<Response<Body>, Infallible> {
	let started = Instant::now();
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let (route, resp) = match admit(&req, &state, peer) {
		Ok(origin) => {
			let (route, mut resp) = route(req, &state).await;
			if let Some(origin) = origin {
				apply_origin_headers(resp.headers_mut(), &origin);
			}
			(route, resp)
		}
		Err(rejected) => rejected,
	};
	let status = resp.status().as_u16();
	state.metrics.observe(route, status);

	let elapsed = started.elapsed();
	if state.access_log {
		info!(%peer, %method, %path, status, ?elapsed, "http access");
	} else {
		debug!(%peer, %method, %path, status, ?elapsed, "http access");
	}
	Ok(resp)
}

/// CORS and rate limiting ahead of routing. `Ok` carries the origin to echo back.
fn admit(
	req: &Request<Incoming>,
	state: &HttpState,
	peer: SocketAddr,
) -> Result<Option<String>, (&'static str, Response<Body>)> {
	let cors = state
		.cors
		.as_ref()
		.map_or(CorsDecision::NotCors, |policy| policy.decide(req.method(), req.headers()));
	let origin = match cors {
		CorsDecision::NotCors => None,
		CorsDecision::Allow(origin) => Some(origin),
		CorsDecision::Forbidden => return Err(("cors", text(StatusCode::FORBIDDEN, "origin not allowed"))),
		CorsDecision::Preflight {
			origin,
			request_headers,
		} => {
			let mut resp = respond(StatusCode::NO_CONTENT, "text/plain; charset=utf-8", Bytes::new());
			apply_preflight_headers(resp.headers_mut(), &origin, request_headers.as_deref());
			return Err(("preflight", resp));
		}
	};

	if let Some(limiter) = &state.rate_limit
		&& !limiter.allow(&client_ip(req.headers(), peer))
	{
		state.metrics.rate_limited();
		let mut resp = text(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
		if let Some(origin) = &origin {
			apply_origin_headers(resp.headers_mut(), origin);
		}
		return Err(("rate_limited", resp));
	}

	Ok(origin)
}

fn route_name(path: &str) -> Option<&'static str> {
	Some(match path {
		"/healthz" => "healthz",
		"/readyz" => "readyz",
		"/count" => "count",
		"/messages" => "messages",
		"/stream" => "stream",
		"/ws" => "ws",
		"/metrics" => "metrics",
		"/info" => "info",
		"/admin/twitch/reload" => "admin_reload",
		_ => return None,
	})
}

async fn route(req: Request<Incoming>, state: &Arc<HttpState>) -> (&'static str, Response<Body>) {
	let Some(name) = route_name(req.uri().path()) else {
		return ("not_found", text(StatusCode::NOT_FOUND, "not found"));
	};

	let resp = match (req.method(), name) {
		(&Method::GET, "healthz") => text(StatusCode::OK, "ok"),
		(&Method::GET, "readyz") => {
			if state.health.is_ready() && !state.hub.is_closed() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		(&Method::GET, "count") => compressible(count(&req, state).await),
		(&Method::GET, "messages") => compressible(messages(&req, state).await),
		(&Method::GET | &Method::HEAD, "stream") => sse(&req, state),
		(&Method::GET, "ws") => websocket(req, state),
		(&Method::GET, "metrics") => match &state.prometheus {
			Some(handle) => respond(StatusCode::OK, "text/plain; version=0.0.4", handle.render()),
			None => text(StatusCode::NOT_FOUND, "metrics disabled"),
		},
		(&Method::GET, "info") => json_response(
			StatusCode::OK,
			&json!({
				"name": env!("CARGO_PKG_NAME"),
				"version": env!("CARGO_PKG_VERSION"),
			}),
		),
		(&Method::POST, "admin_reload") => reload_twitch(state).await,
		_ => text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
	};
	(name, resp)
}

fn filters(req: &Request<Incoming>) -> Result<Filters, Response<Body>> {
	Filters::from_query(req.uri().query(), unix_ms_now()).map_err(|err| text(StatusCode::BAD_REQUEST, err.to_string()))
}

async fn count(req: &Request<Incoming>, state: &HttpState) -> Response<Body> {
	let filters = match filters(req) {
		Ok(f) => f,
		Err(resp) => return resp,
	};
	match state.store.count(&filters).await {
		Ok(n) => json_response(StatusCode::OK, &json!({ "count": n })),
		Err(err) => {
			warn!(error = ?err, "http: count failed");
			text(StatusCode::INTERNAL_SERVER_ERROR, "count error")
		}
	}
}

async fn messages(req: &Request<Incoming>, state: &HttpState) -> Response<Body> {
	let filters = match filters(req) {
		Ok(f) => f,
		Err(resp) => return resp,
	};
	match state.store.list(&filters).await {
		Ok(rows) => json_response(StatusCode::OK, &rows),
		Err(err) => {
			warn!(error = ?err, "http: list failed");
			text(StatusCode::INTERNAL_SERVER_ERROR, "list error")
		}
	}
}

fn sse(req: &Request<Incoming>, state: &HttpState) -> Response<Body> {
	let filters = match filters(req) {
		Ok(f) => f.for_stream(),
		Err(resp) => return resp,
	};

	let body = if req.method() == Method::HEAD {
		Full::new(Bytes::new()).boxed_unsync()
	} else {
		let Some(sub) = state.hub.register(filters, Transport::Sse) else {
			return text(StatusCode::SERVICE_UNAVAILABLE, "server shutting down");
		};
		stream::sse_body(sub, state.heartbeat)
	};

	let mut resp = Response::new(body);
	let headers = resp.headers_mut();
	headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream; charset=utf-8"));
	headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate"));
	headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
	headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
	resp
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
	let has_token = |name: header::HeaderName, token: &str| {
		req.headers()
			.get_all(name)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(','))
			.any(|v| v.trim().eq_ignore_ascii_case(token))
	};
	has_token(header::CONNECTION, "upgrade") && has_token(header::UPGRADE, "websocket")
}

fn websocket(mut req: Request<Incoming>, state: &HttpState) -> Response<Body> {
	let filters = match filters(&req) {
		Ok(f) => f.for_stream(),
		Err(resp) => return resp,
	};
	if !is_websocket_upgrade(&req) {
		return text(StatusCode::BAD_REQUEST, "expected websocket upgrade");
	}
	let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
		return text(StatusCode::BAD_REQUEST, "missing sec-websocket-key");
	};
	let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
		return text(StatusCode::BAD_REQUEST, "invalid sec-websocket-key");
	};

	let Some(sub) = state.hub.register(filters, Transport::Ws) else {
		return text(StatusCode::SERVICE_UNAVAILABLE, "server shutting down");
	};

	let upgrade = hyper::upgrade::on(&mut req);
	let heartbeat = state.heartbeat;
	tokio::spawn(async move {
		match upgrade.await {
			Ok(upgraded) => {
				if let Err(err) = stream::serve_ws(upgraded, sub, heartbeat).await {
					debug!(error = ?err, "ws: stream ended with error");
				}
			}
			Err(err) => warn!(error = %err, "ws: upgrade failed"),
		}
	});

	let mut resp = Response::new(Full::new(Bytes::new()).boxed_unsync());
	*resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	let headers = resp.headers_mut();
	headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
	headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

async fn reload_twitch(state: &HttpState) -> Response<Body> {
	let Some(reloader) = &state.reloader else {
		return text(StatusCode::SERVICE_UNAVAILABLE, "twitch not configured");
	};
	match reloader.reload().await {
		Ok(login) => json_response(StatusCode::OK, &json!({ "ok": "true", "login": login })),
		Err(err) => {
			warn!(error = ?err, "admin: twitch reload failed");
			text(StatusCode::INTERNAL_SERVER_ERROR, format!("reload failed: {err:#}"))
		}
	}
}

fn compressible(mut resp: Response<Body>) -> Response<Body> {
	resp.extensions_mut().insert(Compressible);
	resp
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Body> {
	let mut resp = Response::new(Full::new(body.into()).boxed_unsync());
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
	resp
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
	respond(status, "text/plain; charset=utf-8", body)
}

fn json_response<T: serde::Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Body> {
	match serde_json::to_vec(value) {
		Ok(bytes) => respond(status, "application/json; charset=utf-8", bytes),
		Err(err) => {
			warn!(error = %err, "http: failed to encode response");
			text(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_routes_have_stable_names() {
		assert_eq!(route_name("/messages"), Some("messages"));
		assert_eq!(route_name("/admin/twitch/reload"), Some("admin_reload"));
		assert_eq!(route_name("/messages/"), None);
		assert_eq!(route_name("/"), None);
	}

	#[test]
	fn health_state_starts_not_ready() {
		let health = HealthState::new();
		assert!(!health.is_ready());
		health.clone().mark_ready();
		assert!(health.is_ready());
	}
}
