#![forbid(unsafe_code)]

//! Page scraping and live-chat payload extraction.

use std::sync::LazyLock;
use std::time::Duration;

use chatharvest_domain::text::utf16_len;
use chatharvest_domain::{Badge, ChatMessage, Emote, Image, Platform, rank_images};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::json::{KNOWN_ACTION_TYPES, KnownKey, Node, Walk, accessibility_label};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

const INITIAL_DATA_MARKERS: &[&str] = &[
	"ytInitialData\"] = ",
	"ytInitialData\" = ",
	"ytInitialData\":",
	"ytInitialData = ",
	"window[\"ytInitialData\"] = ",
];

static BADGE_VERSION_PATTERNS: LazyLock<[Regex; 4]> = LazyLock::new(|| {
	[
		r"(?i)\(([^)]+)\)",
		r"(?i)(\d+\s*(?:month|months|year|years))",
		r"(?i)(level\s*\d+)",
		r"(?i)(tier\s*\d+)",
	]
	.map(|p| Regex::new(p).expect("badge version regex is valid"))
});

#[derive(Debug, Error)]
pub enum BootstrapError {
	#[error("youtube: could not locate api key or client version")]
	MissingKeys,
	#[error("youtube: could not locate initial data")]
	MissingInitialData,
	#[error("youtube: parse initial data: {0}")]
	InitialData(#[from] serde_json::Error),
	#[error("youtube: continuation not found in initial data")]
	MissingContinuation,
}

/// Parameters scraped from a watch page that let polling begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
	pub api_key: String,
	pub client_version: String,
	pub continuation: String,
}

pub fn parse_bootstrap(page: &str) -> Result<Bootstrap, BootstrapError> {
	let api_key = extract_quoted(page, "\"INNERTUBE_API_KEY\":\"");
	let client_version = extract_quoted(page, "\"INNERTUBE_CLIENT_VERSION\":\"");
	let (Some(api_key), Some(client_version)) = (api_key, client_version) else {
		return Err(BootstrapError::MissingKeys);
	};

	let initial = INITIAL_DATA_MARKERS
		.iter()
		.find_map(|marker| extract_object_after(page, marker))
		.ok_or(BootstrapError::MissingInitialData)?;
	let data: Value = serde_json::from_str(initial)?;

	let continuation = find_initial_continuation(&data).ok_or(BootstrapError::MissingContinuation)?;
	Ok(Bootstrap {
		api_key: api_key.to_string(),
		client_version: client_version.to_string(),
		continuation,
	})
}

fn is_live_chat_key(key: &str) -> bool {
	key.to_ascii_lowercase().contains("livechat")
}

/// The first continuation found inside a live-chat subtree, breadth first.
fn find_initial_continuation(data: &Value) -> Option<String> {
	Node::from(data).find_breadth_first(
		|key, node| match key {
			Some(key) => is_live_chat_key(key),
			None => node.as_object().is_some_and(|map| map.keys().any(|k| is_live_chat_key(k))),
		},
		|node, in_live_chat| {
			if !in_live_chat || node.as_object().is_none() {
				return None;
			}
			continuation_from_node(node).map(str::to_string)
		},
	)
}

fn continuation_from_node(node: Node<'_>) -> Option<&str> {
	let from_list = node.items(KnownKey::Continuations).find_map(|entry| {
		[
			KnownKey::InvalidationContinuationData,
			KnownKey::TimedContinuationData,
			KnownKey::ReloadContinuationData,
		]
		.into_iter()
		.find_map(|key| entry.get(key)?.str(KnownKey::Continuation))
	});
	from_list.or_else(|| command_token(node, KnownKey::ContinuationEndpoint))
}

fn command_token(node: Node<'_>, endpoint: KnownKey) -> Option<&str> {
	node.path(&[endpoint, KnownKey::ContinuationCommand])?.str(KnownKey::Token)
}

/// Next cursor and server-suggested wait from a poll response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContinuationInfo {
	pub continuation: Option<String>,
	pub timeout_ms: Option<u64>,
}

pub fn extract_continuation(payload: &Value) -> ContinuationInfo {
	let mut info = ContinuationInfo::default();
	Node::from(payload).walk(&mut |node| {
		if node.as_object().is_none() {
			return Walk::Descend;
		}
		if info.continuation.is_none() {
			info.continuation = command_token(node, KnownKey::LiveChatContinuationEndpoint)
				.or_else(|| command_token(node, KnownKey::ContinuationEndpoint))
				.or_else(|| node.str(KnownKey::Continuation))
				.map(str::to_string);
		}
		if info.timeout_ms.is_none() {
			info.timeout_ms = node
				.get(KnownKey::TimeoutMs)
				.and_then(Node::as_i64)
				.and_then(|ms| u64::try_from(ms).ok())
				.filter(|ms| *ms > 0);
		}
		if info.continuation.is_some() && info.timeout_ms.is_some() {
			Walk::Stop
		} else {
			Walk::Descend
		}
	});
	info
}

/// Delay before the next poll and whether it came from the server.
pub fn next_poll_delay(timeout_ms: Option<u64>, fallback: Duration) -> (Duration, bool) {
	match timeout_ms {
		Some(ms) if ms > 0 => (Duration::from_millis(ms), true),
		_ if fallback.is_zero() => (DEFAULT_POLL_INTERVAL, false),
		_ => (fallback, false),
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
	pub actions: usize,
	pub chat_messages: usize,
	pub stored: usize,
	pub skipped: usize,
}

/// A chat renderer that could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
	pub id: String,
	pub reason: &'static str,
}

/// An action that carried no chat text.
#[derive(Debug, Clone)]
pub struct SkippedAction<'a> {
	pub action_type: String,
	pub key: String,
	pub raw: &'a Value,
}

#[derive(Debug, Clone, Default)]
pub struct PollBatch<'a> {
	pub messages: Vec<ChatMessage>,
	pub summary: PollSummary,
	pub failures: Vec<RenderFailure>,
	pub skipped: Vec<SkippedAction<'a>>,
}

fn gather_actions(payload: &Value) -> Vec<&Value> {
	let root = Node::from(payload);
	let mut out = Vec::new();
	let lists = [
		root.get(KnownKey::Actions),
		root.get(KnownKey::OnResponseReceivedActions),
		root.path(&[KnownKey::ContinuationContents, KnownKey::LiveChatContinuation, KnownKey::Actions]),
	];
	for list in lists.into_iter().flatten() {
		if let Node::Array(items) = list {
			out.extend(items.iter().filter(|item| item.is_object()));
		}
	}
	out
}

fn collect_text_renderers(action: &Value) -> Vec<Node<'_>> {
	let mut renderers = Vec::new();
	Node::from(action).walk(&mut |node| {
		for key in [KnownKey::LiveChatTextMessageRenderer, KnownKey::LiveChatLegacyTextMessageRenderer] {
			if let Some(renderer) = node.get(key).filter(|r| r.as_object().is_some()) {
				renderers.push(renderer);
			}
		}
		Walk::Descend
	});
	renderers
}

fn detect_action_type(action: &Map<String, Value>) -> String {
	KNOWN_ACTION_TYPES
		.iter()
		.find(|key| action.contains_key(**key))
		.map(|key| key.to_string())
		.or_else(|| action.keys().next().cloned())
		.unwrap_or_else(|| "unknown".to_string())
}

/// A short identifier for log lines: the first id-like string found.
fn short_action_id(node: Node<'_>) -> String {
	const ID_KEYS: [&str; 4] = ["id", "key", "clientMessageId", "actionId"];
	let mut found = None;
	node.walk(&mut |n| {
		let hit = ID_KEYS
			.iter()
			.find_map(|k| n.field(k)?.as_str().filter(|s| !s.trim().is_empty()));
		match hit {
			Some(id) => {
				found = Some(id);
				Walk::Stop
			}
			None => Walk::Descend,
		}
	});
	match found {
		Some(id) => id.chars().take(12).collect(),
		None => "unknown".to_string(),
	}
}

/// Turn every chat renderer in a poll response into a message.
///
/// `received_nanos` stands in for renderers that lack `timestampUsec`.
pub fn extract_messages(payload: &Value, received_nanos: i128) -> PollBatch<'_> {
	let actions = gather_actions(payload);
	let mut batch = PollBatch {
		summary: PollSummary {
			actions: actions.len(),
			..PollSummary::default()
		},
		..PollBatch::default()
	};

	for action in actions {
		let renderers = collect_text_renderers(action);
		if renderers.is_empty() {
			let Value::Object(map) = action else {
				continue;
			};
			batch.skipped.push(SkippedAction {
				action_type: detect_action_type(map),
				key: short_action_id(Node::from(action)),
				raw: action,
			});
			continue;
		}

		batch.summary.chat_messages += renderers.len();
		for renderer in renderers {
			match build_message(renderer, received_nanos) {
				Ok(msg) => batch.messages.push(msg),
				Err(reason) => batch.failures.push(RenderFailure {
					id: short_action_id(renderer),
					reason,
				}),
			}
		}
	}

	batch.summary.stored = batch.messages.len();
	batch.summary.skipped = batch.summary.actions.saturating_sub(batch.summary.chat_messages);
	batch
}

pub fn log_poll_results(batch: &PollBatch<'_>, dump_unhandled: bool) {
	let s = batch.summary;
	debug!(
		actions = s.actions,
		chat_messages = s.chat_messages,
		stored = s.stored,
		skipped = s.skipped,
		"youtube: poll summary"
	);
	for failure in &batch.failures {
		warn!(id = %failure.id, reason = failure.reason, "youtube: dropped chat message");
	}
	for action in &batch.skipped {
		debug!(action_type = %action.action_type, key = %action.key, "youtube: skipped non-chat action");
		if dump_unhandled {
			let mut dump = action.raw.to_string();
			if dump.len() > 512 {
				let cut = (0..=512).rev().find(|i| dump.is_char_boundary(*i)).unwrap_or(0);
				dump.truncate(cut);
			}
			debug!(dump = %dump, "youtube: unhandled action dump");
		}
	}
}

/// Build a message from a `liveChatTextMessageRenderer`.
pub fn build_message(renderer: Node<'_>, received_nanos: i128) -> Result<ChatMessage, &'static str> {
	let (text, emotes) = message_text_and_emotes(renderer);
	if text.is_empty() {
		return Err("empty text");
	}
	let (badges, badges_raw) = parse_badges(renderer);
	let username = renderer.text(KnownKey::AuthorName).unwrap_or_default();

	let ts_usec = renderer.get(KnownKey::TimestampUsec).and_then(Node::as_i64).filter(|us| *us > 0);
	let (timestamp_ms, ts_nanos) = match ts_usec {
		Some(us) => (us / 1_000, i128::from(us) * 1_000),
		None => ((received_nanos / 1_000_000) as i64, received_nanos),
	};

	let native_id = renderer.str(KnownKey::Id).map(str::to_string);
	let id = native_id.clone().unwrap_or_else(|| format!("yt-{username}-{ts_nanos}"));

	let mut msg = ChatMessage::new(Platform::YouTube, id, username, text, timestamp_ms);
	msg.platform_msg_id = native_id;
	msg.emotes = emotes;
	msg.badges = badges;
	msg.badges_raw = badges_raw;
	msg.raw = renderer.as_object().map(|map| Value::Object(map.clone()));
	Ok(msg)
}

fn message_text_and_emotes(renderer: Node<'_>) -> (String, Vec<Emote>) {
	let Some(message) = renderer.get(KnownKey::Message) else {
		return (String::new(), Vec::new());
	};
	if let Some(Node::Array(_)) = message.get(KnownKey::Runs) {
		return runs_text_and_emotes(message);
	}
	let simple = message.get(KnownKey::SimpleText).and_then(Node::as_str).unwrap_or_default();
	(simple.to_string(), Vec::new())
}

/// Concatenate text runs; emoji runs become their shortcode, or their
/// accessibility label when they have none.
fn runs_text_and_emotes(message: Node<'_>) -> (String, Vec<Emote>) {
	let mut text = String::new();
	let mut emotes = Vec::new();
	let mut offset = 0usize;

	for run in message.items(KnownKey::Runs) {
		if let Some(part) = run.get(KnownKey::Text).and_then(Node::as_str) {
			text.push_str(part);
			offset += utf16_len(part);
			continue;
		}
		let Some(emoji) = run.get(KnownKey::Emoji).filter(|e| e.as_object().is_some()) else {
			continue;
		};

		let Some(shortcode) = emoji_shortcode(emoji) else {
			if let Some(label) = emoji.get(KnownKey::Image).and_then(accessibility_label) {
				text.push_str(label);
				offset += utf16_len(label);
			}
			continue;
		};

		let start = offset;
		text.push_str(&shortcode);
		offset += utf16_len(&shortcode);

		emotes.push(Emote {
			id: emoji.str(KnownKey::EmojiId).map_or_else(|| shortcode.clone(), str::to_string),
			name: shortcode,
			start,
			end: offset,
			images: emoji_images(emoji),
		});
	}
	(text, emotes)
}

fn emoji_shortcode(emoji: Node<'_>) -> Option<String> {
	let first = emoji
		.items(KnownKey::Shortcuts)
		.next()
		.and_then(Node::as_str)
		.map(str::trim)
		.filter(|s| !s.is_empty());
	match first {
		Some(code) => Some(code.to_string()),
		None => emoji.str(KnownKey::EmojiId).map(|id| format!(":{id}:")),
	}
}

fn emoji_images(emoji: Node<'_>) -> Vec<Image> {
	let Some(image) = emoji.get(KnownKey::Image) else {
		return Vec::new();
	};
	let dimension = |thumb: Node<'_>, key| {
		thumb
			.get(key)
			.and_then(Node::as_i64)
			.and_then(|v| u32::try_from(v).ok())
			.unwrap_or(0)
	};
	let mut images: Vec<Image> = image
		.items(KnownKey::Thumbnails)
		.filter_map(|thumb| {
			let url = thumb.str(KnownKey::Url)?;
			Some(Image::new(
				normalize_image_url(url),
				dimension(thumb, KnownKey::Width),
				dimension(thumb, KnownKey::Height),
			))
		})
		.collect();
	rank_images(&mut images);
	images
}

fn normalize_image_url(raw: &str) -> String {
	let raw = raw.trim();
	if let Some(rest) = raw.strip_prefix("//") {
		return format!("https://{rest}");
	}
	if let Some(rest) = raw.strip_prefix("http://") {
		return format!("https://{rest}");
	}
	raw.to_string()
}

/// Author badges from both renderer lists, deduplicated by id and version.
pub fn parse_badges(renderer: Node<'_>) -> (Vec<Badge>, Option<Value>) {
	let mut raw = Map::new();
	for key in [
		KnownKey::AuthorBadges,
		KnownKey::AuthorBadgesWithMetadata,
		KnownKey::AuthorExternalChannelId,
	] {
		if let Some(value) = renderer.as_object().and_then(|map| map.get(key.as_str())) {
			raw.insert(key.as_str().to_string(), value.clone());
		}
	}

	let mut badges: Vec<Badge> = Vec::new();
	let entries = renderer
		.items(KnownKey::AuthorBadges)
		.chain(renderer.items(KnownKey::AuthorBadgesWithMetadata));
	for entry in entries {
		let Some((id, version)) = interpret_badge(entry) else {
			continue;
		};
		if badges.iter().any(|b| b.id == id && b.version == version) {
			continue;
		}
		badges.push(Badge::new(Platform::YouTube, id, version));
	}

	let raw = (!raw.is_empty()).then(|| {
		let mut wrapped = Map::new();
		wrapped.insert("youtube".to_string(), Value::Object(raw));
		Value::Object(wrapped)
	});
	(badges, raw)
}

fn interpret_badge(entry: Node<'_>) -> Option<(&'static str, String)> {
	entry.as_object()?;
	let badge = entry
		.get(KnownKey::MetadataBadgeRenderer)
		.or_else(|| entry.get(KnownKey::LiveChatAuthorBadgeRenderer))
		.unwrap_or(entry);

	let style = badge.str(KnownKey::Style).unwrap_or_default();
	let tooltip = badge.str(KnownKey::Tooltip).unwrap_or_default();
	let label = badge.str(KnownKey::Label).unwrap_or_default();
	let icon_type = badge
		.get(KnownKey::Icon)
		.and_then(|icon| icon.str(KnownKey::IconType))
		.unwrap_or_default()
		.to_ascii_lowercase();
	let acc_label = accessibility_label(badge).unwrap_or_default();

	let combined = [style, tooltip, label, icon_type.as_str(), acc_label]
		.join(" ")
		.to_lowercase();

	if combined.contains("owner") {
		Some(("owner", String::new()))
	} else if combined.contains("moderator") {
		Some(("moderator", String::new()))
	} else if combined.contains("verified") || icon_type.contains("check") {
		Some(("verified", String::new()))
	} else if combined.contains("member") {
		Some(("member", extract_badge_version(&[tooltip, label, acc_label])))
	} else {
		None
	}
}

/// Membership tenure or level from free text; first matching pattern wins.
fn extract_badge_version(texts: &[&str]) -> String {
	texts
		.iter()
		.map(|t| t.trim())
		.filter(|t| !t.is_empty())
		.find_map(|text| {
			BADGE_VERSION_PATTERNS
				.iter()
				.find_map(|re| re.captures(text).and_then(|c| c.get(1)))
				.map(|m| m.as_str().trim().to_string())
		})
		.unwrap_or_default()
}

/// The string between `marker` and the next `"`.
pub(crate) fn extract_quoted<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
	let start = text.find(marker)? + marker.len();
	let len = text[start..].find('"')?;
	Some(&text[start..start + len]).filter(|s| !s.is_empty())
}

/// The JSON object that starts right after `marker`, allowing whitespace.
fn extract_object_after<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
	let start = text.find(marker)? + marker.len();
	let rest = text[start..].trim_start();
	if !rest.starts_with('{') {
		return None;
	}
	slice_balanced_json(rest)
}

/// The prefix of `s` holding one balanced JSON object or array, string aware.
pub(crate) fn slice_balanced_json(s: &str) -> Option<&str> {
	let mut stack = Vec::with_capacity(8);
	let mut in_string = false;
	let mut escape = false;
	for (i, ch) in s.char_indices() {
		if in_string {
			match ch {
				_ if escape => escape = false,
				'\\' => escape = true,
				'"' => in_string = false,
				_ => {}
			}
			continue;
		}
		match ch {
			'"' => in_string = true,
			'{' | '[' => stack.push(ch),
			'}' | ']' => {
				let open = stack.pop()?;
				if (open == '{') != (ch == '}') {
					return None;
				}
				if stack.is_empty() {
					return Some(&s[..=i]);
				}
			}
			_ => {}
		}
	}
	None
}

/// Find `marker = {...}` (with optional `"]).` noise before the `=`) and
/// return the assigned JSON value.
pub(crate) fn extract_json_assignment<'a>(body: &'a str, marker: &str) -> Option<&'a str> {
	let mut search = 0;
	while let Some(found) = body[search..].find(marker) {
		let after = search + found + marker.len();
		search = after;

		let rest = body[after..].trim_start_matches(|c: char| c.is_whitespace() || "]\"'.)".contains(c));
		let Some(rest) = rest.strip_prefix('=') else {
			continue;
		};
		let rest = rest.trim_start();
		if !(rest.starts_with('{') || rest.starts_with('[')) {
			continue;
		}
		if let Some(json) = slice_balanced_json(rest) {
			return Some(json);
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	const NOW: i128 = 1_700_000_000_000_000_000;

	fn renderer(id: &str, author: &str, text: &str) -> Value {
		json!({
			"id": id,
			"timestampUsec": "1234567890",
			"authorName": {"simpleText": author},
			"message": {"simpleText": text},
		})
	}

	#[test]
	fn continuation_with_suggested_wait() {
		let payload = json!({"continuationContents": {"liveChatContinuation": {"continuations": [
			{"timedContinuationData": {"continuation": "abc123", "timeoutMs": "2500"}}
		]}}});
		let info = extract_continuation(&payload);
		assert_eq!(info.continuation.as_deref(), Some("abc123"));
		assert_eq!(info.timeout_ms, Some(2500));
		assert_eq!(
			next_poll_delay(info.timeout_ms, DEFAULT_POLL_INTERVAL),
			(Duration::from_millis(2500), true)
		);
	}

	#[test]
	fn continuation_without_wait_uses_fallback() {
		let payload = json!({"continuationContents": {"liveChatContinuation": {"continuations": [
			{"timedContinuationData": {"continuation": "def456"}}
		]}}});
		let info = extract_continuation(&payload);
		assert_eq!(info.continuation.as_deref(), Some("def456"));
		assert_eq!(info.timeout_ms, None);
		assert_eq!(
			next_poll_delay(info.timeout_ms, Duration::from_millis(1500)),
			(Duration::from_millis(1500), false)
		);
		assert_eq!(next_poll_delay(Some(0), Duration::ZERO), (DEFAULT_POLL_INTERVAL, false));
	}

	#[test]
	fn command_token_continuation() {
		let payload = json!({"onResponseReceivedActions": [{"continuationEndpoint": {
			"continuationCommand": {"token": "tok"}
		}}]});
		assert_eq!(extract_continuation(&payload).continuation.as_deref(), Some("tok"));
		assert_eq!(extract_continuation(&json!({"actions": []})), ContinuationInfo::default());
	}

	#[test]
	fn extracts_chat_and_skips_other_actions() {
		let payload = json!({"actions": [
			{"addChatItemAction": {"item": {"liveChatTextMessageRenderer": renderer("chat-1", "User1", "Hello world")}}},
			{"addChatItemAction": {"item": {"liveChatTextMessageRenderer": renderer("chat-2", "User2", "Second line")}}},
			{"appendContinuationItemsAction": {"continuationItems": [
				{"liveChatLegacyTextMessageRenderer": renderer("chat-3", "User3", "Legacy line")}
			]}},
			{"addChatItemAction": {"item": {"liveChatPaidMessageRenderer": {"id": "nonchat-1"}}}},
			{"showLiveChatActionPanelAction": {"panelToShow": {"liveChatMembershipItemRenderer": {"id": "nonchat-2"}}}},
		]});

		let batch = extract_messages(&payload, NOW);
		assert_eq!(
			batch.summary,
			PollSummary {
				actions: 5,
				chat_messages: 3,
				stored: 3,
				skipped: 2
			}
		);
		assert!(batch.failures.is_empty());
		let types: Vec<&str> = batch.skipped.iter().map(|a| a.action_type.as_str()).collect();
		assert_eq!(types, ["addChatItemAction", "showLiveChatActionPanelAction"]);
		assert_eq!(batch.skipped[0].key, "nonchat-1");

		let first = &batch.messages[0];
		assert_eq!(first.id, "chat-1");
		assert_eq!(first.platform_msg_id.as_deref(), Some("chat-1"));
		assert_eq!(first.platform, Platform::YouTube);
		assert_eq!(first.username, "User1");
		assert_eq!(first.text, "Hello world");
		assert_eq!(first.timestamp_ms, 1_234_567);
		assert!(first.raw.is_some());
	}

	#[test]
	fn empty_text_is_a_failure() {
		let payload = json!({"actions": [
			{"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {"id": "abcdefghijklmnop", "message": {"runs": []}}}}}
		]});
		let batch = extract_messages(&payload, NOW);
		assert!(batch.messages.is_empty());
		assert_eq!(
			batch.failures,
			[RenderFailure {
				id: "abcdefghijkl".to_string(),
				reason: "empty text"
			}]
		);
	}

	#[test]
	fn missing_id_and_timestamp_are_synthesized() {
		let value = json!({"authorName": {"simpleText": "Bob"}, "message": {"simpleText": "hey"}});
		let msg = build_message(Node::from(&value), NOW).expect("message");
		assert_eq!(msg.id, format!("yt-Bob-{NOW}"));
		assert_eq!(msg.platform_msg_id, None);
		assert_eq!(msg.timestamp_ms, 1_700_000_000_000);

		let again = build_message(Node::from(&value), NOW).expect("message");
		assert_eq!(again.id, msg.id);
	}

	fn badges_of(value: &Value) -> Vec<(String, String)> {
		let (badges, _) = parse_badges(Node::from(value));
		badges.into_iter().map(|b| (b.id, b.version)).collect()
	}

	#[test]
	fn classifies_badges_from_both_lists() {
		let value = json!({
			"authorExternalChannelId": "channel-123",
			"authorBadges": [
				{"liveChatAuthorBadgeRenderer": {"icon": {"iconType": "OWNER"}, "tooltip": "Channel owner"}},
				{"liveChatAuthorBadgeRenderer": {
					"tooltip": "Member (12 months)",
					"accessibility": {"accessibilityData": {"label": "Member (12 months)"}}
				}},
			],
			"authorBadgesWithMetadata": [
				{"metadataBadgeRenderer": {"label": "Verified", "icon": {"iconType": "CHECK"}}},
			],
		});
		assert_eq!(
			badges_of(&value),
			[
				("owner".to_string(), String::new()),
				("member".to_string(), "12 months".to_string()),
				("verified".to_string(), String::new()),
			]
		);

		let (badges, raw) = parse_badges(Node::from(&value));
		assert!(badges.iter().all(|b| b.platform == Platform::YouTube));
		let raw = raw.expect("raw badges");
		assert_eq!(raw["youtube"]["authorExternalChannelId"], "channel-123");
		assert!(raw["youtube"].get("authorBadges").is_some());
		assert!(raw["youtube"].get("authorBadgesWithMetadata").is_some());
	}

	#[test]
	fn member_level_and_moderator_style() {
		let value = json!({"authorBadgesWithMetadata": [
			{"metadataBadgeRenderer": {"label": "Moderator", "style": "LIVE_CHAT_MODERATOR"}},
			{"metadataBadgeRenderer": {"label": "Level 3", "style": "MEMBER", "tooltip": "Member Level 3"}},
			{"metadataBadgeRenderer": {"label": "Moderator", "style": "LIVE_CHAT_MODERATOR"}},
		]});
		assert_eq!(
			badges_of(&value),
			[
				("moderator".to_string(), String::new()),
				("member".to_string(), "Level 3".to_string()),
			]
		);
	}

	#[test]
	fn emoji_runs_become_shortcodes_with_utf16_offsets() {
		let value = json!({
			"id": "msg-emotes",
			"authorName": {"simpleText": "User"},
			"message": {"runs": [
				{"text": "Hi 😀 "},
				{"emoji": {
					"emojiId": "smile",
					"shortcuts": [":smile:"],
					"image": {"thumbnails": [
						{"url": "http://example.com/24.png", "width": 24, "height": 24},
						{"url": "//example.com/48.png", "width": 48, "height": 48},
					]}
				}},
				{"text": " there"},
				{"emoji": {"image": {"accessibility": {"accessibilityData": {"label": "Grinning Face"}}}}},
				{"emoji": {"emojiId": "wave"}},
			]}
		});
		let msg = build_message(Node::from(&value), NOW).expect("message");
		assert_eq!(msg.text, "Hi 😀 :smile: thereGrinning Face:wave:");
		assert_eq!(msg.emotes.len(), 2);

		let smile = &msg.emotes[0];
		assert_eq!((smile.id.as_str(), smile.name.as_str()), ("smile", ":smile:"));
		assert_eq!((smile.start, smile.end), (6, 13));
		assert_eq!(smile.images[0].url, "https://example.com/48.png");
		assert_eq!(smile.images[1].url, "https://example.com/24.png");

		let wave = &msg.emotes[1];
		assert_eq!(wave.name, ":wave:");
		assert_eq!(wave.end - wave.start, 6);
		assert!(wave.images.is_empty());
	}

	#[test]
	fn bootstrap_from_watch_page() {
		let page = r#"<script>ytcfg.set({"INNERTUBE_API_KEY":"key-1","INNERTUBE_CLIENT_VERSION":"2.2024"});
			var ytInitialData = {"contents":{"twoColumnWatchNextResults":{"conversationBar":{"liveChatRenderer":{
			"continuations":[{"reloadContinuationData":{"continuation":"initial-cont"}}],"header":"a } brace"}}}}};</script>"#;
		let boot = parse_bootstrap(page).expect("bootstrap");
		assert_eq!(
			boot,
			Bootstrap {
				api_key: "key-1".to_string(),
				client_version: "2.2024".to_string(),
				continuation: "initial-cont".to_string(),
			}
		);
	}

	#[test]
	fn bootstrap_failures() {
		assert!(matches!(parse_bootstrap("<html></html>"), Err(BootstrapError::MissingKeys)));
		let keys = r#""INNERTUBE_API_KEY":"k","INNERTUBE_CLIENT_VERSION":"v""#;
		assert!(matches!(parse_bootstrap(keys), Err(BootstrapError::MissingInitialData)));
		let no_cont = format!(r#"{keys} var ytInitialData = {{"contents":{{}}}};"#);
		assert!(matches!(parse_bootstrap(&no_cont), Err(BootstrapError::MissingContinuation)));
	}

	#[test]
	fn assignment_skips_non_assignments() {
		let body = r#"if (window["ytInitialPlayerResponse"]) {} var ytInitialPlayerResponse = {"a":"}"};"#;
		assert_eq!(extract_json_assignment(body, "ytInitialPlayerResponse"), Some(r#"{"a":"}"}"#));
		assert_eq!(slice_balanced_json("{]"), None);
		assert_eq!(slice_balanced_json("[1,[2]] tail"), Some("[1,[2]]"));
	}
}
