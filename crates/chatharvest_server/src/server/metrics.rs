#![forbid(unsafe_code)]

use chatharvest_platform::telemetry::{register_counter, register_gauge};
use metrics::{Counter, Gauge, Label, Recorder};

use crate::server::hub::Transport;

/// Broadcast hub counters and live client gauges.
#[derive(Clone)]
pub struct HubMetrics {
	pub delivered: Counter,
	dropped_sse: Counter,
	dropped_ws: Counter,
	clients_sse: Gauge,
	clients_ws: Gauge,
}

impl HubMetrics {
	pub fn register(recorder: &dyn Recorder) -> Self {
		let transport = |t: Transport| vec![Label::new("transport", t.as_str())];
		Self {
			delivered: register_counter(recorder, "chatharvest_broadcast_delivered_total", Vec::new()),
			dropped_sse: register_counter(recorder, "chatharvest_broadcast_dropped_total", transport(Transport::Sse)),
			dropped_ws: register_counter(recorder, "chatharvest_broadcast_dropped_total", transport(Transport::Ws)),
			clients_sse: register_gauge(recorder, "chatharvest_stream_clients", transport(Transport::Sse)),
			clients_ws: register_gauge(recorder, "chatharvest_stream_clients", transport(Transport::Ws)),
		}
	}

	pub fn noop() -> Self {
		Self {
			delivered: Counter::noop(),
			dropped_sse: Counter::noop(),
			dropped_ws: Counter::noop(),
			clients_sse: Gauge::noop(),
			clients_ws: Gauge::noop(),
		}
	}

	pub fn dropped(&self, transport: Transport) -> &Counter {
		match transport {
			Transport::Sse => &self.dropped_sse,
			Transport::Ws => &self.dropped_ws,
		}
	}

	pub fn clients(&self, transport: Transport) -> &Gauge {
		match transport {
			Transport::Sse => &self.clients_sse,
			Transport::Ws => &self.clients_ws,
		}
	}
}

/// Request counters keyed by `(route, status)`; registered lazily since statuses are open-ended.
pub struct HttpMetrics {
	recorder: Option<std::sync::Arc<dyn Recorder + Send + Sync>>,
}

impl HttpMetrics {
	pub fn register(recorder: std::sync::Arc<dyn Recorder + Send + Sync>) -> Self {
		Self { recorder: Some(recorder) }
	}

	pub fn noop() -> Self {
		Self { recorder: None }
	}

	pub fn observe(&self, route: &'static str, status: u16) {
		let Some(recorder) = &self.recorder else {
			return;
		};
		register_counter(
			recorder.as_ref(),
			"chatharvest_http_requests_total",
			vec![Label::new("route", route), Label::new("status", status.to_string())],
		)
		.increment(1);
	}

	pub fn rate_limited(&self) {
		if let Some(recorder) = &self.recorder {
			register_counter(recorder.as_ref(), "chatharvest_http_rate_limited_total", Vec::new()).increment(1);
		}
	}
}

/// Counters for the durable write path.
#[derive(Clone)]
pub struct SinkMetrics {
	pub write_errors: Counter,
}

impl SinkMetrics {
	pub fn register(recorder: &dyn Recorder) -> Self {
		Self {
			write_errors: register_counter(recorder, "chatharvest_sink_write_errors_total", Vec::new()),
		}
	}

	pub fn noop() -> Self {
		Self {
			write_errors: Counter::noop(),
		}
	}
}
