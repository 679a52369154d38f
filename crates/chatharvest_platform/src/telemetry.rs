#![forbid(unsafe_code)]

//! Metric handles registered against an explicitly supplied recorder.

use chatharvest_domain::Platform;
use metrics::{Counter, Gauge, Key, Label, Level, Metadata, Recorder};

fn metadata() -> Metadata<'static> {
	Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

pub fn register_counter(recorder: &dyn Recorder, name: &'static str, labels: Vec<Label>) -> Counter {
	recorder.register_counter(&Key::from_parts(name, labels), &metadata())
}

pub fn register_gauge(recorder: &dyn Recorder, name: &'static str, labels: Vec<Label>) -> Gauge {
	recorder.register_gauge(&Key::from_parts(name, labels), &metadata())
}

/// Why an inbound unit was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
	NotPrivmsg,
	OtherChannel,
	Malformed,
}

impl DropReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::NotPrivmsg => "not_privmsg",
			Self::OtherChannel => "other_channel",
			Self::Malformed => "malformed",
		}
	}

	/// Name used in the periodic drop summary log line.
	pub const fn log_name(self) -> &'static str {
		match self {
			Self::NotPrivmsg => "non_privmsg",
			Self::OtherChannel => "other_channel",
			Self::Malformed => "malformed",
		}
	}
}

/// Per-receiver counters.
#[derive(Clone)]
pub struct ReceiverMetrics {
	pub received: Counter,
	pub reconnects: Counter,
	pub auth_failures: Counter,
	dropped_not_privmsg: Counter,
	dropped_other_channel: Counter,
	dropped_malformed: Counter,
}

impl ReceiverMetrics {
	pub fn register(recorder: &dyn Recorder, platform: Platform) -> Self {
		let platform_label = || vec![Label::new("platform", platform.as_str())];
		let dropped = |reason: DropReason| {
			register_counter(
				recorder,
				"chatharvest_messages_dropped_total",
				vec![
					Label::new("platform", platform.as_str()),
					Label::new("reason", reason.as_str()),
				],
			)
		};

		Self {
			received: register_counter(recorder, "chatharvest_messages_received_total", platform_label()),
			reconnects: register_counter(recorder, "chatharvest_receiver_reconnects_total", platform_label()),
			auth_failures: register_counter(recorder, "chatharvest_receiver_auth_failures_total", platform_label()),
			dropped_not_privmsg: dropped(DropReason::NotPrivmsg),
			dropped_other_channel: dropped(DropReason::OtherChannel),
			dropped_malformed: dropped(DropReason::Malformed),
		}
	}

	pub fn noop() -> Self {
		Self {
			received: Counter::noop(),
			reconnects: Counter::noop(),
			auth_failures: Counter::noop(),
			dropped_not_privmsg: Counter::noop(),
			dropped_other_channel: Counter::noop(),
			dropped_malformed: Counter::noop(),
		}
	}

	pub fn dropped(&self, reason: DropReason) {
		match reason {
			DropReason::NotPrivmsg => self.dropped_not_privmsg.increment(1),
			DropReason::OtherChannel => self.dropped_other_channel.increment(1),
			DropReason::Malformed => self.dropped_malformed.increment(1),
		}
	}
}

/// Token refresh outcome counters.
#[derive(Clone)]
pub struct RefreshMetrics {
	pub success: Counter,
	pub failure: Counter,
}

impl RefreshMetrics {
	pub fn register(recorder: &dyn Recorder) -> Self {
		Self {
			success: register_counter(
				recorder,
				"chatharvest_token_refresh_total",
				vec![Label::new("outcome", "success")],
			),
			failure: register_counter(
				recorder,
				"chatharvest_token_refresh_total",
				vec![Label::new("outcome", "failure")],
			),
		}
	}

	pub fn noop() -> Self {
		Self {
			success: Counter::noop(),
			failure: Counter::noop(),
		}
	}
}
