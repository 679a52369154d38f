#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chatharvest_domain::text::codepoint_range_to_utf16;
use chatharvest_domain::{Badge, ChatMessage, Emote, Image, Platform, rank_images};
use serde_json::json;

pub use crate::telemetry::DropReason;

const PRIVMSG_PREFIX: &str = "PRIVMSG #";
const EMOTE_CDN: &str = "https://static-cdn.jtvnw.net/emoticons/v2";

/// Parse one IRC line into a chat message if it is a PRIVMSG to `channel`.
///
/// `received_nanos` is the local receive time, used when the server omits `tmi-sent-ts`.
pub fn parse_privmsg(line: &str, channel: &str, received_nanos: i128) -> Result<ChatMessage, DropReason> {
	let channel = channel.trim_start_matches('#');
	let mut rest = line;
	let mut tags: BTreeMap<String, String> = BTreeMap::new();

	if let Some(tagged) = rest.strip_prefix('@') {
		let (tag_part, tail) = tagged.split_once(' ').ok_or(DropReason::Malformed)?;
		for kv in tag_part.split(';').filter(|kv| !kv.is_empty()) {
			match kv.split_once('=') {
				Some((key, val)) => tags.insert(key.to_string(), unescape_irc(val)),
				None => tags.insert(kv.to_string(), String::new()),
			};
		}
		rest = tail.trim();
	}

	let Some(rest) = rest.strip_prefix(':') else {
		return Err(DropReason::NotPrivmsg);
	};
	let (prefix, rest) = rest.split_once(' ').ok_or(DropReason::Malformed)?;
	let rest = rest.trim();

	let rest = match rest.get(..PRIVMSG_PREFIX.len()) {
		Some(head) if head.eq_ignore_ascii_case(PRIVMSG_PREFIX) => &rest[PRIVMSG_PREFIX.len()..],
		_ => return Err(DropReason::NotPrivmsg),
	};

	let (chan_name, rest) = rest.split_once(' ').ok_or(DropReason::Malformed)?;
	if !chan_name.eq_ignore_ascii_case(channel) {
		return Err(DropReason::OtherChannel);
	}
	let text = rest.trim().strip_prefix(':').ok_or(DropReason::Malformed)?;

	let tag = |key: &str| tags.get(key).map(String::as_str).filter(|v| !v.is_empty());

	let username = tag("display-name").map_or_else(|| extract_user(prefix).to_string(), str::to_string);

	let (timestamp_ms, ts_nanos) = match tag("tmi-sent-ts").and_then(|v| v.parse::<i64>().ok()) {
		Some(ms) => (ms, i128::from(ms) * 1_000_000),
		None => ((received_nanos / 1_000_000) as i64, received_nanos),
	};

	let native_id = tag("id").map(str::to_string);
	let id = native_id.clone().unwrap_or_else(|| format!("{username}-{ts_nanos}"));

	let (badges, badges_raw) = parse_badges(tag("badges"), tag("badge-info"), channel);
	let emotes = tag("emotes").map(|raw| parse_emotes(raw, text)).unwrap_or_default();
	let colour = tag("color").map(str::to_string);

	let mut msg = ChatMessage::new(Platform::Twitch, id, username, text, timestamp_ms);
	msg.platform_msg_id = native_id;
	msg.emotes = emotes;
	msg.badges = badges;
	msg.badges_raw = badges_raw;
	msg.colour = colour;
	msg.raw = Some(json!({
		"tags": tags,
		"prefix": prefix,
		"line": line,
	}));
	Ok(msg)
}

/// Merge `badges` with `badge-info`: the info version wins when present, and a
/// versionless `broadcaster` badge takes the channel name.
pub fn parse_badges(
	badges: Option<&str>,
	badge_info: Option<&str>,
	channel: &str,
) -> (Vec<Badge>, Option<serde_json::Value>) {
	let info: BTreeMap<&str, &str> = split_list(badge_info.unwrap_or_default(), ',')
		.filter_map(|entry| entry.split_once('/'))
		.map(|(id, version)| (id.trim(), version.trim()))
		.filter(|(id, _)| !id.is_empty())
		.collect();

	let out = split_list(badges.unwrap_or_default(), ',')
		.filter_map(|entry| {
			let (id, version) = match entry.split_once('/') {
				Some((id, version)) => (id.trim(), version.trim()),
				None => (entry, ""),
			};
			if id.is_empty() {
				return None;
			}
			let mut version = match info.get(id) {
				Some(v) if !v.is_empty() => *v,
				_ => version,
			};
			if version.is_empty() && id == "broadcaster" {
				version = channel;
			}
			Some(Badge::new(Platform::Twitch, id, version))
		})
		.collect();

	let mut raw = serde_json::Map::new();
	if let Some(b) = badges {
		raw.insert("badges".to_string(), json!(b));
	}
	if let Some(i) = badge_info {
		raw.insert("badge_info".to_string(), json!(i));
	}
	let raw = (!raw.is_empty()).then(|| json!({ "twitch": raw }));

	(out, raw)
}

/// Convert the `emotes` tag (`id:s-e,s-e/id2:s-e`, inclusive code-point ranges)
/// into emotes with UTF-16 offsets, sorted by start.
pub fn parse_emotes(raw: &str, text: &str) -> Vec<Emote> {
	let mut out = Vec::new();
	for group in split_list(raw, '/') {
		let Some((id, ranges)) = group.split_once(':') else {
			continue;
		};
		for range in ranges.split(',') {
			let Some((s, e)) = range.split_once('-') else {
				continue;
			};
			let (Ok(s), Ok(e)) = (s.trim().parse::<usize>(), e.trim().parse::<usize>()) else {
				continue;
			};
			let Some((start, end)) = codepoint_range_to_utf16(text, s, e) else {
				continue;
			};
			out.push(Emote {
				id: id.to_string(),
				name: text.chars().skip(s).take(e - s + 1).collect(),
				start,
				end,
				images: emote_images(id),
			});
		}
	}
	out.sort_by_key(|e| e.start);
	out
}

fn emote_images(id: &str) -> Vec<Image> {
	let mut images: Vec<Image> = [("1.0", 28), ("2.0", 56), ("3.0", 112)]
		.into_iter()
		.map(|(scale, px)| Image::new(format!("{EMOTE_CDN}/{id}/default/dark/{scale}"), px, px))
		.collect();
	rank_images(&mut images);
	images
}

fn split_list(s: &str, sep: char) -> impl Iterator<Item = &str> {
	s.split(sep).map(str::trim).filter(|p| !p.is_empty())
}

fn extract_user(prefix: &str) -> &str {
	let prefix = prefix.strip_prefix(':').unwrap_or(prefix);
	prefix.split_once('!').map_or(prefix, |(user, _)| user)
}

/// Undo IRCv3 tag escaping. Unknown escapes yield the escaped char; a trailing
/// lone backslash is kept.
pub fn unescape_irc(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut chars = s.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some('s') => out.push(' '),
			Some('n') => out.push('\n'),
			Some('r') => out.push('\r'),
			Some(':') => out.push(';'),
			Some('\\') => out.push('\\'),
			Some(other) => out.push(other),
			None => out.push('\\'),
		}
	}
	out
}

/// The IRC command of `line`, after any tags and prefix.
pub fn command_of(line: &str) -> Option<&str> {
	let mut rest = line.trim_start();
	if rest.starts_with('@') {
		rest = rest.split_once(' ')?.1.trim_start();
	}
	if rest.starts_with(':') {
		rest = rest.split_once(' ')?.1.trim_start();
	}
	rest.split_whitespace().next()
}

/// Whether `line` is the server's NOTICE rejecting our credentials.
pub fn is_auth_failure(line: &str) -> bool {
	if !command_of(line).is_some_and(|cmd| cmd.eq_ignore_ascii_case("NOTICE")) {
		return false;
	}
	let lower = line.to_ascii_lowercase();
	["login authentication failed", "improperly formatted auth", "authentication failed"]
		.iter()
		.any(|needle| lower.contains(needle))
}

pub fn is_reconnect(line: &str) -> bool {
	let mut fields = line.split_whitespace();
	fields.next() == Some(":tmi.twitch.tv") && fields.next() == Some("RECONNECT")
}

/// Payload of a server `PING`, to be echoed back in `PONG`.
pub fn ping_payload(line: &str) -> Option<&str> {
	line.strip_prefix("PING ")
}
