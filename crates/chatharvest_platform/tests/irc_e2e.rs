#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chatharvest_domain::{ChatMessage, Platform};
use chatharvest_platform::ChatReceiver;
use chatharvest_platform::twitch::{
	CredentialReason, CredentialRegister, IrcConfig, IrcReceiver, RefreshAction, RefreshError, RefreshOutcome,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("CHATHARVEST_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

const PRIVMSG: &str = "@badge-info=;badges=moderator/1;color=#1E90FF;display-name=Viewer;emotes=;id=msg-1;tmi-sent-ts=1700000000123 :viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #chan :hello twitch";

/// Reads the client handshake up to JOIN and returns the PASS line.
async fn accept_handshake(stream: TcpStream) -> anyhow::Result<(String, BufReader<TcpStream>)> {
	let mut reader = BufReader::new(stream);
	let mut pass = String::new();
	loop {
		let mut line = String::new();
		if reader.read_line(&mut line).await? == 0 {
			anyhow::bail!("client closed during handshake");
		}
		let line = line.trim_end().to_string();
		if line.starts_with("PASS ") {
			pass = line;
		} else if line.starts_with("JOIN ") {
			return Ok((pass, reader));
		}
	}
}

async fn write_lines(reader: &mut BufReader<TcpStream>, lines: &[&str]) -> anyhow::Result<()> {
	let stream = reader.get_mut();
	for line in lines {
		stream.write_all(line.as_bytes()).await?;
		stream.write_all(b"\r\n").await?;
	}
	stream.flush().await?;
	Ok(())
}

fn plain_config(addr: String, register: Arc<CredentialRegister>) -> IrcConfig {
	let mut cfg = IrcConfig::new("#Chan", "harvester", register);
	cfg.use_tls = false;
	cfg.addr = Some(addr);
	cfg
}

#[tokio::test]
async fn privmsg_reaches_handler_once() -> anyhow::Result<()> {
	init_test_logging();

	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let addr = listener.local_addr()?.to_string();
	let server = tokio::spawn(async move {
		let (stream, _) = listener.accept().await?;
		let (pass, mut reader) = accept_handshake(stream).await?;
		write_lines(
			&mut reader,
			&[
				":tmi.twitch.tv 001 harvester :Welcome, GLHF!",
				":tmi.twitch.tv CAP * ACK :twitch.tv/tags",
				PRIVMSG,
				"@id=other :someone!someone@someone.tmi.twitch.tv PRIVMSG #elsewhere :not ours",
			],
		)
		.await?;
		// Hold the connection open until the client goes away.
		let mut sink = String::new();
		while reader.read_line(&mut sink).await? > 0 {
			sink.clear();
		}
		anyhow::Ok(pass)
	});

	let register = Arc::new(CredentialRegister::new("secret"));
	let receiver = IrcReceiver::new(plain_config(addr, register));
	let (tx, mut rx) = mpsc::channel::<ChatMessage>(8);
	let (trigger, shutdown) = chatharvest_util::shutdown::channel();
	let task = tokio::spawn(Box::new(receiver).run(shutdown, Arc::new(tx)));

	let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await?
		.ok_or_else(|| anyhow::anyhow!("handler channel closed"))?;
	assert_eq!(msg.platform, Platform::Twitch);
	assert_eq!(msg.username, "Viewer");
	assert_eq!(msg.text, "hello twitch");
	assert_eq!(msg.timestamp_ms, 1_700_000_000_123);
	assert_eq!(msg.platform_msg_id.as_deref(), Some("msg-1"));
	assert_eq!(msg.colour.as_deref(), Some("#1E90FF"));

	// The other-channel line must not produce a second delivery.
	assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());

	trigger.trigger();
	tokio::time::timeout(Duration::from_secs(2), task).await???;

	let pass = tokio::time::timeout(Duration::from_secs(2), server).await???;
	assert_eq!(pass, "PASS oauth:secret");
	Ok(())
}

struct CountingRefresh {
	calls: AtomicUsize,
}

#[async_trait::async_trait]
impl RefreshAction for CountingRefresh {
	async fn refresh_now(&self) -> Result<RefreshOutcome, RefreshError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		Ok(RefreshOutcome {
			token: "fresh".to_string(),
			expires_in: Duration::from_secs(3600),
		})
	}
}

#[tokio::test]
async fn auth_notice_refreshes_before_reconnect() -> anyhow::Result<()> {
	init_test_logging();

	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let addr = listener.local_addr()?.to_string();
	let (pass_tx, mut pass_rx) = mpsc::unbounded_channel::<String>();
	let server = tokio::spawn(async move {
		let (stream, _) = listener.accept().await?;
		let (pass, mut reader) = accept_handshake(stream).await?;
		pass_tx.send(pass)?;
		write_lines(&mut reader, &[":tmi.twitch.tv NOTICE * :Login authentication failed"]).await?;
		drop(reader);

		let (stream, _) = listener.accept().await?;
		let (pass, mut reader) = accept_handshake(stream).await?;
		pass_tx.send(pass)?;
		write_lines(&mut reader, &[":tmi.twitch.tv 001 harvester :Welcome, GLHF!", PRIVMSG]).await?;
		let mut sink = String::new();
		while reader.read_line(&mut sink).await? > 0 {
			sink.clear();
		}
		anyhow::Ok(())
	});

	let refresh = Arc::new(CountingRefresh { calls: AtomicUsize::new(0) });
	let register = Arc::new(CredentialRegister::new("stale"));
	let mut cfg = plain_config(addr, register);
	cfg.refresh = Some(refresh.clone() as Arc<dyn RefreshAction>);
	let (tx, mut rx) = mpsc::channel::<ChatMessage>(8);
	let (trigger, shutdown) = chatharvest_util::shutdown::channel();
	let task = tokio::spawn(Box::new(IrcReceiver::new(cfg)).run(shutdown, Arc::new(tx)));

	let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await?
		.ok_or_else(|| anyhow::anyhow!("handler channel closed"))?;
	assert_eq!(msg.text, "hello twitch");
	assert_eq!(refresh.calls.load(Ordering::SeqCst), 1);

	assert_eq!(pass_rx.recv().await.as_deref(), Some("PASS oauth:stale"));
	assert_eq!(pass_rx.recv().await.as_deref(), Some("PASS oauth:fresh"));

	trigger.trigger();
	tokio::time::timeout(Duration::from_secs(2), task).await???;
	tokio::time::timeout(Duration::from_secs(2), server).await???;
	Ok(())
}

async fn drain(reader: &mut BufReader<TcpStream>) -> anyhow::Result<()> {
	let mut sink = String::new();
	while reader.read_line(&mut sink).await? > 0 {
		sink.clear();
	}
	Ok(())
}

#[tokio::test]
async fn credential_burst_reconnects_once_with_latest() -> anyhow::Result<()> {
	init_test_logging();

	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let addr = listener.local_addr()?.to_string();
	let (pass_tx, mut pass_rx) = mpsc::unbounded_channel::<String>();
	let server = tokio::spawn(async move {
		let (stream, _) = listener.accept().await?;
		let (pass, mut reader) = accept_handshake(stream).await?;
		write_lines(&mut reader, &[":tmi.twitch.tv 001 harvester :Welcome, GLHF!"]).await?;
		pass_tx.send(pass)?;
		drain(&mut reader).await?;

		let (stream, _) = listener.accept().await?;
		let (pass, mut reader) = accept_handshake(stream).await?;
		pass_tx.send(pass)?;

		let extra = tokio::time::timeout(Duration::from_millis(500), listener.accept()).await;
		anyhow::ensure!(extra.is_err(), "unexpected third connection");
		drain(&mut reader).await?;
		anyhow::Ok(())
	});

	let register = Arc::new(CredentialRegister::new("initial"));
	let receiver = IrcReceiver::new(plain_config(addr, Arc::clone(&register)));
	let (tx, _rx) = mpsc::channel::<ChatMessage>(8);
	let (trigger, shutdown) = chatharvest_util::shutdown::channel();
	let task = tokio::spawn(Box::new(receiver).run(shutdown, Arc::new(tx)));

	let first = tokio::time::timeout(Duration::from_secs(5), pass_rx.recv()).await?;
	assert_eq!(first.as_deref(), Some("PASS oauth:initial"));

	for token in ["a", "b", "c"] {
		assert!(register.offer(token, CredentialReason::Manual));
	}

	let second = tokio::time::timeout(Duration::from_secs(5), pass_rx.recv()).await?;
	assert_eq!(second.as_deref(), Some("PASS oauth:c"));

	tokio::time::sleep(Duration::from_millis(600)).await;
	trigger.trigger();
	tokio::time::timeout(Duration::from_secs(2), task).await???;
	tokio::time::timeout(Duration::from_secs(2), server).await???;
	assert!(pass_rx.try_recv().is_err());
	Ok(())
}

#[tokio::test]
async fn auth_failure_without_refresher_backs_off() -> anyhow::Result<()> {
	init_test_logging();

	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let addr = listener.local_addr()?.to_string();
	let server = tokio::spawn(async move {
		let (stream, _) = listener.accept().await?;
		let (first_pass, mut reader) = accept_handshake(stream).await?;
		write_lines(&mut reader, &[":tmi.twitch.tv NOTICE * :Login authentication failed"]).await?;
		let rejected_at = tokio::time::Instant::now();
		drop(reader);

		let (stream, _) = listener.accept().await?;
		let gap = rejected_at.elapsed();
		let (second_pass, mut reader) = accept_handshake(stream).await?;
		drain(&mut reader).await?;
		anyhow::Ok((first_pass, second_pass, gap))
	});

	let register = Arc::new(CredentialRegister::new("stale"));
	let receiver = IrcReceiver::new(plain_config(addr, register));
	let (tx, _rx) = mpsc::channel::<ChatMessage>(8);
	let (trigger, shutdown) = chatharvest_util::shutdown::channel();
	let task = tokio::spawn(Box::new(receiver).run(shutdown, Arc::new(tx)));

	// Give the second handshake time to land before stopping the receiver.
	tokio::time::sleep(Duration::from_millis(1500)).await;
	trigger.trigger();
	tokio::time::timeout(Duration::from_secs(2), task).await???;

	let (first_pass, second_pass, gap) = tokio::time::timeout(Duration::from_secs(2), server).await???;
	assert_eq!(first_pass, "PASS oauth:stale");
	assert_eq!(second_pass, "PASS oauth:stale");
	assert!(gap >= Duration::from_millis(900), "reconnected after {gap:?}");
	assert!(gap < Duration::from_millis(1500), "reconnected after {gap:?}");
	Ok(())
}
