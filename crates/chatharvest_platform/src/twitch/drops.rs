#![forbid(unsafe_code)]

//! Rate-limited summaries of IRC lines the receiver skipped.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info};

use super::parse::{DropReason, unescape_irc};

pub const DROP_SUMMARY_INTERVAL: Duration = Duration::from_secs(5);
const SAMPLE_MAX_LEN: usize = 96;
const CHANNEL_MAX_LEN: usize = 32;

static OAUTH_TOKEN_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"(?i)oauth:[^\s;]+").expect("oauth token regex is valid"));
static LONG_TOKEN_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/_=\-]{24,}").expect("long token regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IrcSummary {
	pub command: String,
	pub channel: String,
	pub sample: String,
}

#[derive(Debug, Default)]
struct ReasonSummary {
	total: usize,
	by_command: BTreeMap<String, usize>,
	sample_by_command: BTreeMap<String, String>,
	channel_by_command: BTreeMap<String, String>,
}

/// One flushed summary line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropReport {
	pub reason: DropReason,
	pub total: usize,
	pub commands: String,
	pub samples: String,
}

pub struct DropLogger {
	verbose: bool,
	interval: Duration,
	next_emit: Instant,
	reasons: BTreeMap<DropReason, ReasonSummary>,
}

impl DropLogger {
	pub fn new(now: Instant, verbose: bool, interval: Duration) -> Self {
		let interval = if interval.is_zero() { DROP_SUMMARY_INTERVAL } else { interval };
		Self {
			verbose,
			interval,
			next_emit: now + interval,
			reasons: BTreeMap::new(),
		}
	}

	pub fn note(&mut self, now: Instant, reason: DropReason, raw_line: &str) {
		let summary = summarize_irc(raw_line);
		if self.verbose {
			debug!(
				reason = reason.as_str(),
				command = %summary.command,
				channel = %summary.channel,
				sample = %summary.sample,
				"twitch: dropped line"
			);
		}

		let entry = self.reasons.entry(reason).or_default();
		entry.total += 1;
		*entry.by_command.entry(summary.command.clone()).or_default() += 1;
		entry
			.sample_by_command
			.entry(summary.command.clone())
			.or_insert(summary.sample);
		entry.channel_by_command.entry(summary.command).or_insert(summary.channel);

		if now >= self.next_emit {
			self.flush(now);
		}
	}

	pub fn has_pending(&self) -> bool {
		!self.reasons.is_empty()
	}

	/// When the gathered summaries are due to be logged.
	pub fn next_emit(&self) -> Instant {
		self.next_emit
	}

	/// Log and clear everything gathered since the last flush.
	pub fn flush(&mut self, now: Instant) -> Vec<DropReport> {
		let reports = self.reports();
		for report in &reports {
			info!(
				total = report.total,
				commands = %report.commands,
				samples = %report.samples,
				"twitch: dropped_{}",
				report.reason.log_name()
			);
		}
		self.reasons.clear();
		self.next_emit = now + self.interval;
		reports
	}

	fn reports(&self) -> Vec<DropReport> {
		self.reasons
			.iter()
			.filter(|(_, rs)| rs.total > 0)
			.map(|(reason, rs)| DropReport {
				reason: *reason,
				total: rs.total,
				commands: format_command_counts(&rs.by_command),
				samples: format_command_samples(&rs.sample_by_command, &rs.channel_by_command),
			})
			.collect()
	}
}

impl Drop for DropLogger {
	fn drop(&mut self) {
		if self.has_pending() {
			self.flush(Instant::now());
		}
	}
}

/// Extract command, channel and a short sanitized sample from a raw IRC line.
pub fn summarize_irc(raw_line: &str) -> IrcSummary {
	let unknown = |sample: String| IrcSummary {
		command: "UNKNOWN".to_string(),
		channel: String::new(),
		sample,
	};

	let mut line = raw_line.trim();
	if line.is_empty() {
		return unknown(String::new());
	}

	let mut tag_part = "";
	if let Some(tagged) = line.strip_prefix('@') {
		let Some((tags, tail)) = tagged.split_once(' ') else {
			return unknown(sanitize_and_truncate(line, SAMPLE_MAX_LEN));
		};
		tag_part = tags;
		line = tail.trim();
	}

	if line.starts_with(':') {
		let Some((_, tail)) = line.split_once(' ') else {
			return unknown(sanitize_and_truncate(line, SAMPLE_MAX_LEN));
		};
		line = tail.trim();
	}

	if line.is_empty() {
		return unknown(String::new());
	}

	let (cmd, rest) = match line.split_once(' ') {
		Some((cmd, rest)) => (cmd, rest.trim()),
		None => (line, ""),
	};
	let mut command = cmd.trim().to_ascii_uppercase();
	if command.is_empty() {
		command = "UNKNOWN".to_string();
	}

	let channel = rest.split_whitespace().find(|p| p.starts_with('#')).unwrap_or_default();

	let mut sample = String::new();
	if command == "USERNOTICE"
		&& let Some(msg_id) = tag_value(tag_part, "msg-id").filter(|v| !v.is_empty())
	{
		sample = format!("msg-id={msg_id}");
	}
	if sample.is_empty()
		&& let Some((_, trailing)) = rest.split_once(" :")
	{
		sample = trailing.trim().to_string();
	}
	if sample.is_empty() {
		sample = (if channel.is_empty() { rest } else { channel }).to_string();
	}
	let sample = sample.strip_prefix(':').unwrap_or(&sample);

	IrcSummary {
		command,
		channel: sanitize_and_truncate(channel, CHANNEL_MAX_LEN),
		sample: sanitize_and_truncate(sample, SAMPLE_MAX_LEN),
	}
}

/// Collapse whitespace, redact credential-looking substrings and cap the length
/// at `max` chars (ending in `...` when cut).
pub fn sanitize_and_truncate(s: &str, max: usize) -> String {
	let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
	if collapsed.is_empty() {
		return collapsed;
	}

	let upper = collapsed.to_ascii_uppercase();
	let s = if upper == "PASS" || upper.starts_with("PASS ") {
		"PASS [REDACTED]".to_string()
	} else {
		collapsed
	};

	let s = OAUTH_TOKEN_RE.replace_all(&s, "oauth:[REDACTED]");
	let s = LONG_TOKEN_RE.replace_all(&s, "[REDACTED]").into_owned();

	let len = s.chars().count();
	if max == 0 || len <= max {
		return s;
	}
	if max <= 3 {
		return s.chars().take(max).collect();
	}
	let mut out: String = s.chars().take(max - 3).collect();
	out.push_str("...");
	out
}

fn tag_value(raw_tags: &str, key: &str) -> Option<String> {
	raw_tags
		.split(';')
		.filter_map(|kv| kv.split_once('='))
		.find(|(k, _)| *k == key)
		.map(|(_, v)| unescape_irc(v))
}

fn format_command_counts(counts: &BTreeMap<String, usize>) -> String {
	let parts: Vec<String> = counts.iter().map(|(cmd, n)| format!("{cmd}:{n}")).collect();
	format!("{{{}}}", parts.join(" "))
}

fn format_command_samples(samples: &BTreeMap<String, String>, channels: &BTreeMap<String, String>) -> String {
	let parts: Vec<String> = samples
		.iter()
		.map(|(cmd, sample)| match channels.get(cmd).filter(|c| !c.is_empty()) {
			Some(channel) => format!("{cmd}:'{channel} {sample}'"),
			None => format!("{cmd}:'{sample}'"),
		})
		.collect();
	format!("{{{}}}", parts.join(" "))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn summary(command: &str, channel: &str, sample: &str) -> IrcSummary {
		IrcSummary {
			command: command.to_string(),
			channel: channel.to_string(),
			sample: sample.to_string(),
		}
	}

	#[test]
	fn summarizes_common_commands() {
		let cases = [
			("PING :tmi.twitch.tv", summary("PING", "", "tmi.twitch.tv")),
			(
				"@emote-only=0;followers-only=-1;room-id=123 :tmi.twitch.tv ROOMSTATE #chan",
				summary("ROOMSTATE", "#chan", "#chan"),
			),
			(
				"@badges=;display-name=bot :tmi.twitch.tv USERSTATE #chan",
				summary("USERSTATE", "#chan", "#chan"),
			),
			(
				"@msg-id=msg_channel_suspended :tmi.twitch.tv NOTICE #chan :This channel has been suspended.",
				summary("NOTICE", "#chan", "This channel has been suspended."),
			),
			(
				"@badge-info=subscriber/6;msg-id=resub :tmi.twitch.tv USERNOTICE #chan :great stream",
				summary("USERNOTICE", "#chan", "msg-id=resub"),
			),
			("", summary("UNKNOWN", "", "")),
			("@only-tags", summary("UNKNOWN", "", "@only-tags")),
		];

		for (raw, want) in cases {
			assert_eq!(summarize_irc(raw), want, "line: {raw:?}");
		}
	}

	#[test]
	fn redacts_tokens() {
		let raw = "oauth:abcdefghijklmnopqrstuvwxyz123456 token=QWxhZGRpbjpPcGVuU2VzYW1lMTIzNDU2Nzg5MA==";
		let got = sanitize_and_truncate(raw, 300);
		assert!(!got.to_lowercase().contains("oauth:abcdefghijkl"), "{got}");
		assert!(!got.contains("QWxhZGRpbjpPcGVuU2VzYW1lMTIzNDU2Nzg5MA=="), "{got}");
		assert!(got.contains("oauth:[REDACTED]"), "{got}");
	}

	#[test]
	fn redacts_pass_line() {
		assert_eq!(sanitize_and_truncate("PASS oauth:supersecrettokenvalue", 200), "PASS [REDACTED]");
	}

	#[test]
	fn truncates_on_char_boundary() {
		let got = sanitize_and_truncate("ééééééééééé", 6);
		assert_eq!(got, "ééé...");
		assert_eq!(sanitize_and_truncate("  a \r\n b  ", 10), "a b");
	}

	#[test]
	fn flush_groups_by_reason_and_command() {
		let start = Instant::now();
		let mut logger = DropLogger::new(start, false, Duration::from_secs(5));
		logger.note(start, DropReason::NotPrivmsg, ":tmi.twitch.tv ROOMSTATE #chan");
		logger.note(start, DropReason::NotPrivmsg, ":tmi.twitch.tv ROOMSTATE #chan");
		logger.note(start, DropReason::NotPrivmsg, "PING :tmi.twitch.tv");
		logger.note(start, DropReason::OtherChannel, ":u!u@u PRIVMSG #other :hi there");

		let reports = logger.flush(start);
		assert_eq!(
			reports,
			vec![
				DropReport {
					reason: DropReason::NotPrivmsg,
					total: 3,
					commands: "{PING:1 ROOMSTATE:2}".to_string(),
					samples: "{PING:'tmi.twitch.tv' ROOMSTATE:'#chan #chan'}".to_string(),
				},
				DropReport {
					reason: DropReason::OtherChannel,
					total: 1,
					commands: "{PRIVMSG:1}".to_string(),
					samples: "{PRIVMSG:'#other hi there'}".to_string(),
				},
			]
		);
		assert!(logger.flush(start).is_empty());
	}

	#[test]
	fn note_flushes_when_interval_elapsed() {
		let start = Instant::now();
		let mut logger = DropLogger::new(start, true, Duration::from_secs(5));
		logger.note(start, DropReason::Malformed, "@x");
		logger.note(start + Duration::from_secs(6), DropReason::Malformed, "@y");
		assert!(logger.flush(start + Duration::from_secs(7)).is_empty());
	}

	#[test]
	fn pending_summaries_expose_their_deadline() {
		let start = Instant::now();
		let mut logger = DropLogger::new(start, false, Duration::from_secs(5));
		assert!(!logger.has_pending());
		assert_eq!(logger.next_emit(), start + Duration::from_secs(5));

		logger.note(start + Duration::from_secs(1), DropReason::NotPrivmsg, "PING :tmi.twitch.tv");
		assert!(logger.has_pending());
		assert_eq!(logger.next_emit(), start + Duration::from_secs(5));

		// A lone drop is reported once its deadline passes, without waiting for another one.
		let reports = logger.flush(logger.next_emit());
		assert_eq!(reports.len(), 1);
		assert!(!logger.has_pending());
		assert_eq!(logger.next_emit(), start + Duration::from_secs(10));
	}
}
