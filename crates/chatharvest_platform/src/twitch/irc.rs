#![forbid(unsafe_code)]

//! Twitch IRC receiver: one resilient session to a single channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chatharvest_domain::Platform;
use chatharvest_util::backoff::Backoff;
use chatharvest_util::shutdown::Shutdown;
use chatharvest_util::time::unix_nanos_now;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::credential::{CredentialReason, CredentialRegister};
use super::drops::{DROP_SUMMARY_INTERVAL, DropLogger};
use super::oauth::RefreshAction;
use super::parse::{command_of, is_auth_failure, is_reconnect, parse_privmsg, ping_payload};
use crate::{ChatReceiver, MessageHandler, ReceiverMetrics, new_session_id, sleep_or_cancel};

pub const TWITCH_IRC_HOST: &str = "irc.chat.twitch.tv";
const PLAIN_PORT: u16 = 6667;
const TLS_PORT: u16 = 6697;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(240);
const COUNT_LOG_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_SEED: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ReceiverError {
	#[error("twitch: channel and nick are required")]
	MissingIdentity,
	#[error("twitch: token is required")]
	MissingToken,
	#[error("twitch: authentication failed")]
	Auth,
	#[error("twitch: dial {addr} timed out")]
	DialTimeout { addr: String },
	#[error("twitch: tls: {0}")]
	Tls(String),
	#[error("twitch: {context}: {source}")]
	Io {
		context: &'static str,
		#[source]
		source: std::io::Error,
	},
	#[error("twitch: keepalive ping unanswered")]
	KeepaliveTimeout,
	#[error("twitch: connection closed by server")]
	Closed,
}

fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> ReceiverError {
	move |source| ReceiverError::Io { context, source }
}

/// Why a session ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
	Cancelled,
	ServerReconnect,
	CredentialChanged(CredentialReason),
}

impl fmt::Display for SessionEnd {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Cancelled => f.write_str("cancelled"),
			Self::ServerReconnect => f.write_str("server requested reconnect"),
			Self::CredentialChanged(reason) => write!(f, "credential updated ({})", reason.as_str()),
		}
	}
}

/// Twitch IRC receiver configuration.
#[derive(Clone)]
pub struct IrcConfig {
	/// Channel to join, with or without the leading `#`.
	pub channel: String,
	pub nick: String,
	/// Source of the access token; read once per connection attempt.
	pub register: Arc<CredentialRegister>,
	pub use_tls: bool,
	/// `host:port` override, mostly for tests.
	pub addr: Option<String>,
	/// Called when the server rejects the credential.
	pub refresh: Option<Arc<dyn RefreshAction>>,
	/// Log every dropped line at debug.
	pub debug_drops: bool,
	pub metrics: ReceiverMetrics,
}

impl IrcConfig {
	pub fn new(channel: impl Into<String>, nick: impl Into<String>, register: Arc<CredentialRegister>) -> Self {
		Self {
			channel: channel.into(),
			nick: nick.into(),
			register,
			use_tls: true,
			addr: None,
			refresh: None,
			debug_drops: false,
			metrics: ReceiverMetrics::noop(),
		}
	}

	fn dial_addr(&self) -> String {
		if let Some(addr) = self.addr.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
			return addr.to_string();
		}
		let port = if self.use_tls { TLS_PORT } else { PLAIN_PORT };
		format!("{TWITCH_IRC_HOST}:{port}")
	}

	fn channel_name(&self) -> String {
		self.channel.trim().trim_start_matches('#').to_ascii_lowercase()
	}
}

pub struct IrcReceiver {
	cfg: IrcConfig,
}

impl IrcReceiver {
	pub fn new(cfg: IrcConfig) -> Self {
		Self { cfg }
	}

	async fn run_loop(&self, shutdown: Shutdown, handler: Arc<dyn MessageHandler>) -> Result<(), ReceiverError> {
		let cfg = &self.cfg;
		if cfg.channel_name().is_empty() || cfg.nick.trim().is_empty() {
			return Err(ReceiverError::MissingIdentity);
		}

		let mut backoff = Backoff::new(BACKOFF_SEED, BACKOFF_CAP);
		let mut refresh_backoff = Backoff::new(BACKOFF_SEED, BACKOFF_CAP);

		loop {
			if shutdown.is_cancelled() {
				return Ok(());
			}

			let session_id = new_session_id();
			let err = match self.run_session(&session_id, &shutdown, handler.as_ref(), &mut backoff).await {
				Ok(SessionEnd::Cancelled) => return Ok(()),
				Ok(end) => {
					info!(session_id = %session_id, reason = %end, "twitch: reconnecting");
					backoff.reset();
					cfg.metrics.reconnects.increment(1);
					continue;
				}
				Err(err) => err,
			};

			if matches!(err, ReceiverError::Auth) {
				cfg.metrics.auth_failures.increment(1);
				if let Some(refresh) = &cfg.refresh {
					info!(session_id = %session_id, "twitch: authentication failed; refreshing token");
					loop {
						let result = tokio::select! {
							_ = shutdown.cancelled() => return Ok(()),
							r = refresh.refresh_now() => r,
						};
						match result {
							Ok(outcome) => {
								cfg.register.offer(&outcome.token, CredentialReason::Refresh);
								cfg.register.take_pending();
								refresh_backoff.reset();
								backoff.reset();
								break;
							}
							Err(err) => {
								let delay = refresh_backoff.next_delay();
								warn!(error = %err, retry_in = ?delay, "twitch: refresh failed");
								if !sleep_or_cancel(delay, &shutdown).await {
									return Ok(());
								}
							}
						}
					}
					cfg.metrics.reconnects.increment(1);
					continue;
				}
			}

			let delay = backoff.next_delay();
			warn!(session_id = %session_id, error = %err, retry_in = ?delay, "twitch: disconnected; reconnecting");
			if !sleep_or_cancel(delay, &shutdown).await {
				return Ok(());
			}
			cfg.metrics.reconnects.increment(1);
		}
	}

	async fn run_session(
		&self,
		session_id: &str,
		shutdown: &Shutdown,
		handler: &dyn MessageHandler,
		backoff: &mut Backoff,
	) -> Result<SessionEnd, ReceiverError> {
		let cfg = &self.cfg;
		let channel = cfg.channel_name();

		cfg.register.take_pending();
		let token = cfg.register.current();
		if token.is_empty() {
			return Err(ReceiverError::MissingToken);
		}

		let addr = cfg.dial_addr();
		info!(session_id = %session_id, addr = %addr, tls = cfg.use_tls, "twitch: connecting");
		let stream = tokio::select! {
			_ = shutdown.cancelled() => return Ok(SessionEnd::Cancelled),
			s = connect(&addr, cfg.use_tls) => s?,
		};

		let (read_half, mut writer) = tokio::io::split(stream);
		let mut lines = BufReader::new(read_half).lines();

		send_line(&mut writer, &format!("PASS {token}"))
			.await
			.map_err(io_err("send PASS"))?;
		send_line(&mut writer, &format!("NICK {}", cfg.nick.trim()))
			.await
			.map_err(io_err("send NICK"))?;
		send_line(&mut writer, "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership")
			.await
			.map_err(io_err("send CAP REQ"))?;
		send_line(&mut writer, &format!("JOIN #{channel}"))
			.await
			.map_err(io_err("send JOIN"))?;
		info!(session_id = %session_id, channel = %channel, nick = %cfg.nick, "twitch: joined");

		let mut drops = DropLogger::new(std::time::Instant::now(), cfg.debug_drops, DROP_SUMMARY_INTERVAL);
		let (mut total, mut window) = (0u64, 0u64);
		let mut next_tick = Instant::now() + COUNT_LOG_INTERVAL;
		let mut next_ping = Instant::now() + KEEPALIVE_IDLE;
		let mut ping_sent: Option<Instant> = None;

		loop {
			let read = tokio::select! {
				_ = shutdown.cancelled() => return Ok(SessionEnd::Cancelled),
				reason = cfg.register.pending() => return Ok(SessionEnd::CredentialChanged(reason)),
				_ = tokio::time::sleep_until(Instant::from_std(drops.next_emit())), if drops.has_pending() => {
					drops.flush(std::time::Instant::now());
					continue;
				}
				r = tokio::time::timeout(READ_TIMEOUT, lines.next_line()) => r,
			};

			let now = Instant::now();
			if now >= next_tick {
				if window > 0 {
					info!(session_id = %session_id, window, total, "twitch: recv msgs");
				} else {
					debug!(session_id = %session_id, window, total, "twitch: recv msgs");
				}
				window = 0;
				next_tick = now + COUNT_LOG_INTERVAL;
			}

			let line = match read {
				Err(_elapsed) => {
					if let Some(sent) = ping_sent
						&& now.duration_since(sent) >= READ_TIMEOUT
					{
						return Err(ReceiverError::KeepaliveTimeout);
					}
					if now >= next_ping {
						send_line(&mut writer, "PING :keepalive")
							.await
							.map_err(io_err("send PING"))?;
						ping_sent = Some(now);
						next_ping = now + KEEPALIVE_IDLE;
					}
					continue;
				}
				Ok(Err(err)) => return Err(ReceiverError::Io { context: "read", source: err }),
				Ok(Ok(None)) => return Err(ReceiverError::Closed),
				Ok(Ok(Some(line))) => line,
			};

			next_ping = now + KEEPALIVE_IDLE;
			ping_sent = None;

			let line = line.trim_end_matches(['\r', '\n']);
			if line.is_empty() {
				continue;
			}

			if is_auth_failure(line) {
				warn!(session_id = %session_id, "twitch: authentication failed per server NOTICE");
				return Err(ReceiverError::Auth);
			}

			if let Some(payload) = ping_payload(line) {
				send_line(&mut writer, &format!("PONG {payload}"))
					.await
					.map_err(io_err("send PONG"))?;
				continue;
			}

			if is_reconnect(line) {
				return Ok(SessionEnd::ServerReconnect);
			}

			// 001 only arrives after the server accepted our credential.
			if command_of(line) == Some("001") {
				backoff.reset();
			}

			match parse_privmsg(line, &channel, unix_nanos_now()) {
				Ok(msg) => {
					total += 1;
					window += 1;
					cfg.metrics.received.increment(1);
					handler.handle(msg).await;
				}
				Err(reason) => {
					cfg.metrics.dropped(reason);
					drops.note(std::time::Instant::now(), reason, line);
				}
			}
		}
	}
}

#[async_trait::async_trait]
impl ChatReceiver for IrcReceiver {
	fn platform(&self) -> Platform {
		Platform::Twitch
	}

	async fn run(self: Box<Self>, shutdown: Shutdown, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
		self.run_loop(shutdown, handler).await?;
		info!("twitch: receiver stopped");
		Ok(())
	}
}

trait IrcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IrcStream for T {}

async fn connect(addr: &str, use_tls: bool) -> Result<Box<dyn IrcStream>, ReceiverError> {
	let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
		.await
		.map_err(|_| ReceiverError::DialTimeout { addr: addr.to_string() })?
		.map_err(io_err("dial"))?;
	let _ = tcp.set_nodelay(true);

	if !use_tls {
		return Ok(Box::new(tcp));
	}

	let server_name = ServerName::try_from(TWITCH_IRC_HOST).map_err(|e| ReceiverError::Tls(e.to_string()))?;
	let tls = tokio::time::timeout(DIAL_TIMEOUT, tls_connector()?.connect(server_name, tcp))
		.await
		.map_err(|_| ReceiverError::DialTimeout { addr: addr.to_string() })?
		.map_err(io_err("tls handshake"))?;
	Ok(Box::new(tls))
}

fn tls_connector() -> Result<TlsConnector, ReceiverError> {
	let mut roots = rustls::RootCertStore::empty();
	roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

	let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
		.with_safe_default_protocol_versions()
		.map_err(|e| ReceiverError::Tls(e.to_string()))?
		.with_root_certificates(roots)
		.with_no_client_auth();
	Ok(TlsConnector::from(Arc::new(config)))
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\r\n").await?;
	writer.flush().await
}
