#![forbid(unsafe_code)]

//! Borrowed view over loosely typed InnerTube JSON.

use std::collections::VecDeque;

use serde_json::{Map, Value};

/// Keys the extractors look up. Anything else is reached only by walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownKey {
	Actions,
	OnResponseReceivedActions,
	ContinuationContents,
	LiveChatContinuation,
	Continuations,
	Continuation,
	ContinuationEndpoint,
	LiveChatContinuationEndpoint,
	ContinuationCommand,
	Token,
	TimeoutMs,
	InvalidationContinuationData,
	TimedContinuationData,
	ReloadContinuationData,
	LiveChatTextMessageRenderer,
	LiveChatLegacyTextMessageRenderer,
	Id,
	TimestampUsec,
	AuthorName,
	Message,
	Runs,
	Text,
	SimpleText,
	Emoji,
	EmojiId,
	Shortcuts,
	Image,
	Thumbnails,
	Url,
	Width,
	Height,
	Accessibility,
	AccessibilityData,
	Label,
	AuthorBadges,
	AuthorBadgesWithMetadata,
	AuthorExternalChannelId,
	LiveChatAuthorBadgeRenderer,
	MetadataBadgeRenderer,
	Style,
	Tooltip,
	Icon,
	IconType,
}

impl KnownKey {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Actions => "actions",
			Self::OnResponseReceivedActions => "onResponseReceivedActions",
			Self::ContinuationContents => "continuationContents",
			Self::LiveChatContinuation => "liveChatContinuation",
			Self::Continuations => "continuations",
			Self::Continuation => "continuation",
			Self::ContinuationEndpoint => "continuationEndpoint",
			Self::LiveChatContinuationEndpoint => "liveChatContinuationEndpoint",
			Self::ContinuationCommand => "continuationCommand",
			Self::Token => "token",
			Self::TimeoutMs => "timeoutMs",
			Self::InvalidationContinuationData => "invalidationContinuationData",
			Self::TimedContinuationData => "timedContinuationData",
			Self::ReloadContinuationData => "reloadContinuationData",
			Self::LiveChatTextMessageRenderer => "liveChatTextMessageRenderer",
			Self::LiveChatLegacyTextMessageRenderer => "liveChatLegacyTextMessageRenderer",
			Self::Id => "id",
			Self::TimestampUsec => "timestampUsec",
			Self::AuthorName => "authorName",
			Self::Message => "message",
			Self::Runs => "runs",
			Self::Text => "text",
			Self::SimpleText => "simpleText",
			Self::Emoji => "emoji",
			Self::EmojiId => "emojiId",
			Self::Shortcuts => "shortcuts",
			Self::Image => "image",
			Self::Thumbnails => "thumbnails",
			Self::Url => "url",
			Self::Width => "width",
			Self::Height => "height",
			Self::Accessibility => "accessibility",
			Self::AccessibilityData => "accessibilityData",
			Self::Label => "label",
			Self::AuthorBadges => "authorBadges",
			Self::AuthorBadgesWithMetadata => "authorBadgesWithMetadata",
			Self::AuthorExternalChannelId => "authorExternalChannelId",
			Self::LiveChatAuthorBadgeRenderer => "liveChatAuthorBadgeRenderer",
			Self::MetadataBadgeRenderer => "metadataBadgeRenderer",
			Self::Style => "style",
			Self::Tooltip => "tooltip",
			Self::Icon => "icon",
			Self::IconType => "iconType",
		}
	}
}

/// Action wrappers recognised when naming a skipped action.
pub const KNOWN_ACTION_TYPES: &[&str] = &[
	"addChatItemAction",
	"addLiveChatTickerItemAction",
	"addLiveChatTickerHeaderAction",
	"addLiveChatItemAction",
	"markChatItemAsDeletedAction",
	"markChatItemsByAuthorAsDeletedAction",
	"liveChatItemListRenderer",
	"addLiveChatWarningMessageAction",
	"showLiveChatActionPanelAction",
	"showLiveChatTooltipAction",
	"updateLiveChatPollAction",
	"addLiveChatPollAction",
];

/// A JSON node tagged by shape.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
	Object(&'a Map<String, Value>),
	Array(&'a [Value]),
	Scalar(&'a Value),
}

/// Returned by walk callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
	Descend,
	Stop,
}

impl<'a> From<&'a Value> for Node<'a> {
	fn from(value: &'a Value) -> Self {
		match value {
			Value::Object(map) => Node::Object(map),
			Value::Array(items) => Node::Array(items),
			other => Node::Scalar(other),
		}
	}
}

impl<'a> Node<'a> {
	pub fn as_object(self) -> Option<&'a Map<String, Value>> {
		match self {
			Node::Object(map) => Some(map),
			_ => None,
		}
	}

	pub fn as_str(self) -> Option<&'a str> {
		match self {
			Node::Scalar(Value::String(s)) => Some(s),
			_ => None,
		}
	}

	/// Integer value, accepting numbers and numeric strings.
	pub fn as_i64(self) -> Option<i64> {
		match self {
			Node::Scalar(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
			Node::Scalar(Value::String(s)) => s.trim().parse().ok(),
			_ => None,
		}
	}

	pub fn get(self, key: KnownKey) -> Option<Node<'a>> {
		self.field(key.as_str())
	}

	pub fn field(self, name: &str) -> Option<Node<'a>> {
		self.as_object()?.get(name).map(Node::from)
	}

	/// Follow a chain of object keys.
	pub fn path(self, keys: &[KnownKey]) -> Option<Node<'a>> {
		keys.iter().try_fold(self, |node, key| node.get(*key))
	}

	/// Non-empty string at `key`.
	pub fn str(self, key: KnownKey) -> Option<&'a str> {
		self.get(key)?.as_str().filter(|s| !s.is_empty())
	}

	/// Children of the array at `key`; empty when absent.
	pub fn items(self, key: KnownKey) -> impl Iterator<Item = Node<'a>> {
		let items: &'a [Value] = match self.get(key) {
			Some(Node::Array(items)) => items,
			_ => &[],
		};
		items.iter().map(Node::from)
	}

	/// Immediate children in document order (objects iterate their values).
	pub fn children(self) -> Box<dyn Iterator<Item = (Option<&'a str>, Node<'a>)> + 'a> {
		match self {
			Node::Object(map) => Box::new(map.iter().map(|(k, v)| (Some(k.as_str()), Node::from(v)))),
			Node::Array(items) => Box::new(items.iter().map(|v| (None, Node::from(v)))),
			Node::Scalar(_) => Box::new(std::iter::empty()),
		}
	}

	/// Depth-first pre-order walk. Returns `false` if the callback stopped it.
	pub fn walk(self, visit: &mut impl FnMut(Node<'a>) -> Walk) -> bool {
		if visit(self) == Walk::Stop {
			return false;
		}
		self.children().all(|(_, child)| child.walk(visit))
	}

	/// Breadth-first search carrying a flag inherited from ancestors and
	/// recomputed per object key.
	pub fn find_breadth_first<T>(
		self,
		mark: impl Fn(Option<&str>, Node<'a>) -> bool,
		mut found: impl FnMut(Node<'a>, bool) -> Option<T>,
	) -> Option<T> {
		let mut queue = VecDeque::from([(self, false)]);
		while let Some((node, inherited)) = queue.pop_front() {
			let marked = inherited || mark(None, node);
			if let Some(hit) = found(node, marked) {
				return Some(hit);
			}
			for (key, child) in node.children() {
				queue.push_back((child, marked || mark(key, child)));
			}
		}
		None
	}

	/// Text from a `simpleText` or `runs` container at `key`.
	pub fn text(self, key: KnownKey) -> Option<String> {
		let container = self.get(key)?;
		if let Some(simple) = container.str(KnownKey::SimpleText) {
			return Some(simple.to_string());
		}
		let joined: String = container.items(KnownKey::Runs).filter_map(run_text).collect();
		(!joined.is_empty()).then_some(joined)
	}
}

/// Display text of a single run, used for names rather than message bodies.
fn run_text(run: Node<'_>) -> Option<String> {
	if let Some(text) = run.get(KnownKey::Text).and_then(Node::as_str) {
		return Some(text.to_string());
	}
	let emoji = run.get(KnownKey::Emoji)?;
	if let Some(first) = emoji.items(KnownKey::Shortcuts).next().and_then(Node::as_str) {
		return Some(first.to_string());
	}
	emoji
		.get(KnownKey::Image)
		.and_then(accessibility_label)
		.or_else(|| emoji.str(KnownKey::EmojiId))
		.map(str::to_string)
}

/// `accessibility.accessibilityData.label` under `node`.
pub fn accessibility_label<'a>(node: Node<'a>) -> Option<&'a str> {
	node.path(&[KnownKey::Accessibility, KnownKey::AccessibilityData])?
		.str(KnownKey::Label)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn path_and_lenient_integers() {
		let doc = json!({"a": {"timeoutMs": "2500"}, "continuation": {"timeoutMs": 7}});
		let root = Node::from(&doc);
		assert_eq!(root.field("a").and_then(|n| n.get(KnownKey::TimeoutMs)).and_then(Node::as_i64), Some(2500));
		assert_eq!(
			root.path(&[KnownKey::Continuation, KnownKey::TimeoutMs]).and_then(Node::as_i64),
			Some(7)
		);
		assert!(root.path(&[KnownKey::Continuation, KnownKey::Token]).is_none());
	}

	#[test]
	fn walk_stops_early() {
		let doc = json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]);
		let mut seen = Vec::new();
		let finished = Node::from(&doc).walk(&mut |node| {
			if let Some(id) = node.str(KnownKey::Id) {
				seen.push(id.to_string());
				if id == "b" {
					return Walk::Stop;
				}
			}
			Walk::Descend
		});
		assert!(!finished);
		assert_eq!(seen, ["a", "b"]);
	}

	#[test]
	fn text_prefers_simple_text_then_runs() {
		let doc = json!({
			"authorName": {"simpleText": "Alice"},
			"message": {"runs": [{"text": "hi "}, {"emoji": {"shortcuts": [":wave:"]}}]}
		});
		let root = Node::from(&doc);
		assert_eq!(root.text(KnownKey::AuthorName).as_deref(), Some("Alice"));
		assert_eq!(root.text(KnownKey::Message).as_deref(), Some("hi :wave:"));
		assert_eq!(root.text(KnownKey::Label), None);
	}

	#[test]
	fn breadth_first_inherits_marks() {
		let doc = json!({
			"other": {"continuation": "wrong"},
			"liveChatRenderer": {"inner": {"continuation": "right"}}
		});
		let hit = Node::from(&doc).find_breadth_first(
			|key, _| key.is_some_and(|k| k.to_ascii_lowercase().contains("livechat")),
			|node, marked| marked.then(|| node.str(KnownKey::Continuation)).flatten(),
		);
		assert_eq!(hit, Some("right"));
	}
}
