#![forbid(unsafe_code)]

//! Durable write side (`Sink`) and read side (`Store`).

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;

use anyhow::{Context, anyhow};
use chatharvest_domain::{ChatMessage, Platform};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::server::filters::{Filters, Order};

#[async_trait::async_trait]
pub trait Sink: Send + Sync {
	/// Idempotent on the message's dedup key: a repeat is a no-op, not an error.
	async fn write(&self, msg: &ChatMessage) -> anyhow::Result<()>;

	async fn write_batch(&self, msgs: &[ChatMessage]) -> anyhow::Result<()> {
		for msg in msgs {
			self.write(msg).await?;
		}
		Ok(())
	}
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
	async fn count(&self, filters: &Filters) -> anyhow::Result<u64>;

	async fn list(&self, filters: &Filters) -> anyhow::Result<Vec<ChatMessage>>;
}

pub const DEFAULT_MEMORY_ROWS: usize = 50_000;

/// Process-local store used when no database is configured.
///
/// Holds at most `max_rows` messages; the oldest insert is evicted first and
/// its dedup key goes with it.
pub struct MemoryStore {
	max_rows: usize,
	inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	seen: HashSet<(Platform, String)>,
	messages: VecDeque<ChatMessage>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::with_max_rows(DEFAULT_MEMORY_ROWS)
	}

	pub fn with_max_rows(max_rows: usize) -> Self {
		Self {
			max_rows: max_rows.max(1),
			inner: RwLock::new(MemoryInner::default()),
		}
	}

	pub fn len(&self) -> usize {
		self.inner.read().messages.len()
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl Sink for MemoryStore {
	async fn write(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		let mut inner = self.inner.write();
		if !inner.seen.insert(msg.dedup_key().to_owned_key()) {
			return Ok(());
		}
		inner.messages.push_back(msg.clone());
		while inner.messages.len() > self.max_rows {
			if let Some(evicted) = inner.messages.pop_front() {
				let key = evicted.dedup_key().to_owned_key();
				inner.seen.remove(&key);
			}
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn count(&self, filters: &Filters) -> anyhow::Result<u64> {
		let inner = self.inner.read();
		Ok(inner.messages.iter().filter(|m| filters.matches(m)).count() as u64)
	}

	async fn list(&self, filters: &Filters) -> anyhow::Result<Vec<ChatMessage>> {
		let inner = self.inner.read();
		let mut out: Vec<ChatMessage> = inner.messages.iter().filter(|m| filters.matches(m)).cloned().collect();
		match filters.order {
			Order::Asc => out.sort_by_key(|m| m.timestamp_ms),
			Order::Desc => out.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms)),
		}
		out.truncate(filters.limit_or_default());
		Ok(out)
	}
}

/// SQLite-backed store with embedded migrations.
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "SELECT id, platform_msg_id, platform, ts, username, text, emotes_json, badges_json, \
	badges_raw_json, raw_json, colour FROM messages";

type MessageRow = (
	String,
	String,
	String,
	String,
	String,
	String,
	String,
	String,
	String,
	String,
	String,
);

impl SqliteStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (use sqlite:)"));
		}

		let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
		let opts = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite url")?
			.create_if_missing(true);

		// An in-memory database lives and dies with its one connection.
		let pool_opts = if in_memory {
			SqlitePoolOptions::new()
				.max_connections(1)
				.idle_timeout(None)
				.max_lifetime(None)
		} else {
			SqlitePoolOptions::new().max_connections(4)
		};
		let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;

		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;
		info!(url = %database_url, "sqlite store ready");

		Ok(Self { pool })
	}

	fn push_conditions<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filters: &'a Filters) {
		let mut first = true;
		let mut next_clause = |builder: &mut QueryBuilder<'a, Sqlite>| {
			builder.push(if first { " WHERE " } else { " AND " });
			first = false;
		};

		if !filters.platforms.is_empty() {
			next_clause(builder);
			builder.push("platform IN (");
			let mut sep = builder.separated(", ");
			for p in &filters.platforms {
				sep.push_bind(p.as_str());
			}
			sep.push_unseparated(")");
		}

		if !filters.usernames.is_empty() {
			next_clause(builder);
			builder.push("(");
			for (i, u) in filters.usernames.iter().enumerate() {
				if i > 0 {
					builder.push(" OR ");
				}
				builder.push("instr(LOWER(username), ");
				builder.push_bind(u.as_str());
				builder.push(") > 0");
			}
			builder.push(")");
		}

		if let Some(since) = filters.since_ms {
			next_clause(builder);
			builder.push("ts >= ");
			builder.push_bind(format_ts(since));
		}
	}
}

/// Fixed-width RFC3339 so lexical order matches time order.
fn format_ts(ms: i64) -> String {
	let ts = Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
	ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Option<i64> {
	DateTime::parse_from_rfc3339(raw).ok().map(|t| t.timestamp_millis())
}

fn json_or_empty<T: serde::Serialize>(value: &T, empty: &str) -> String {
	serde_json::to_string(value).unwrap_or_else(|_| empty.to_string())
}

fn row_to_message(row: MessageRow) -> anyhow::Result<ChatMessage> {
	let (id, platform_msg_id, platform, ts, username, text, emotes, badges, badges_raw, raw, colour) = row;
	let platform = Platform::from_str(&platform).with_context(|| format!("row {id}: platform"))?;
	let timestamp_ms = parse_ts(&ts).with_context(|| format!("row {id}: timestamp {ts:?}"))?;

	let mut msg = ChatMessage::new(platform, id, username, text, timestamp_ms);
	msg.platform_msg_id = Some(platform_msg_id).filter(|v| !v.is_empty() && *v != msg.id);
	msg.emotes = serde_json::from_str(&emotes).unwrap_or_default();
	msg.badges = serde_json::from_str(&badges).unwrap_or_default();
	msg.badges_raw = (!badges_raw.is_empty()).then(|| serde_json::from_str(&badges_raw).ok()).flatten();
	msg.raw = (!raw.is_empty()).then(|| serde_json::from_str(&raw).ok()).flatten();
	msg.colour = Some(colour).filter(|c| !c.is_empty());
	Ok(msg)
}

const INSERT_MESSAGE: &str = "INSERT INTO messages (id, platform_msg_id, platform, ts, username, text, \
	emotes_json, badges_json, badges_raw_json, raw_json, colour) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
	ON CONFLICT(platform, platform_msg_id) DO NOTHING";

async fn insert_message<'e, E>(executor: E, msg: &ChatMessage) -> anyhow::Result<()>
where
	E: sqlx::Executor<'e, Database = Sqlite>,
{
	let key = msg.dedup_key();
	let badges_raw = msg.badges_raw.as_ref().map(|v| v.to_string()).unwrap_or_default();
	let raw = msg.raw.as_ref().map(|v| v.to_string()).unwrap_or_default();

	sqlx::query(INSERT_MESSAGE)
		.bind(&msg.id)
		.bind(key.id)
		.bind(msg.platform.as_str())
		.bind(format_ts(msg.timestamp_ms))
		.bind(&msg.username)
		.bind(&msg.text)
		.bind(json_or_empty(&msg.emotes, "[]"))
		.bind(json_or_empty(&msg.badges, "[]"))
		.bind(badges_raw)
		.bind(raw)
		.bind(msg.colour.as_deref().unwrap_or_default())
		.execute(executor)
		.await
		.with_context(|| format!("insert message {key}"))?;
	Ok(())
}

#[async_trait::async_trait]
impl Sink for SqliteStore {
	async fn write(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		insert_message(&self.pool, msg).await
	}

	/// One transaction per batch.
	async fn write_batch(&self, msgs: &[ChatMessage]) -> anyhow::Result<()> {
		if msgs.is_empty() {
			return Ok(());
		}
		let mut tx = self.pool.begin().await.context("begin batch")?;
		for msg in msgs {
			insert_message(&mut *tx, msg).await?;
		}
		tx.commit().await.context("commit batch")?;
		Ok(())
	}
}

#[async_trait::async_trait]
impl Store for SqliteStore {
	async fn count(&self, filters: &Filters) -> anyhow::Result<u64> {
		let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM messages");
		Self::push_conditions(&mut builder, filters);
		let (n,): (i64,) = builder
			.build_query_as()
			.fetch_one(&self.pool)
			.await
			.context("count messages")?;
		Ok(n.max(0) as u64)
	}

	async fn list(&self, filters: &Filters) -> anyhow::Result<Vec<ChatMessage>> {
		let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
		Self::push_conditions(&mut builder, filters);
		builder.push(match filters.order {
			Order::Asc => " ORDER BY ts ASC, rowid ASC",
			Order::Desc => " ORDER BY ts DESC, rowid DESC",
		});
		builder.push(" LIMIT ");
		builder.push_bind(filters.limit_or_default() as i64);

		let rows: Vec<MessageRow> = builder
			.build_query_as()
			.fetch_all(&self.pool)
			.await
			.context("list messages")?;
		rows.into_iter().map(row_to_message).collect()
	}
}
