#![forbid(unsafe_code)]

//! Per-connection transport loops for live subscribers.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use chatharvest_domain::ChatMessage;
use chatharvest_util::time::unix_ms_now;
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, warn};

use crate::server::hub::Subscription;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Frames queued between the SSE pump and the response body.
const SSE_BODY_BUFFER: usize = 16;

fn heartbeat_ticker(every: Duration) -> tokio::time::Interval {
	let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	ticker
}

fn encode_json(msg: &ChatMessage) -> Option<String> {
	match serde_json::to_string(msg) {
		Ok(json) => Some(json),
		Err(err) => {
			warn!(id = %msg.id, error = %err, "stream: failed to encode message");
			None
		}
	}
}

pub fn sse_event(json: &str) -> Bytes {
	Bytes::from(format!("event: message\ndata: {json}\n\n"))
}

/// Start an event-stream for `sub` and return the response body that carries it.
///
/// The pump ends when the hub closes the subscription or the client goes away.
pub fn sse_body(sub: Subscription, heartbeat: Duration) -> UnsyncBoxBody<Bytes, Infallible> {
	let (tx, rx) = mpsc::channel::<Bytes>(SSE_BODY_BUFFER);
	tokio::spawn(pump_sse(sub, tx, heartbeat));

	let frames = futures::stream::unfold(rx, |mut rx| async move {
		let chunk = rx.recv().await?;
		Some((Ok::<_, Infallible>(Frame::data(chunk)), rx))
	});
	StreamBody::new(frames).boxed_unsync()
}

async fn pump_sse(mut sub: Subscription, tx: mpsc::Sender<Bytes>, heartbeat: Duration) {
	if tx.send(Bytes::from_static(b":ok\n\n")).await.is_err() {
		return;
	}

	let mut ticker = heartbeat_ticker(heartbeat);
	loop {
		let chunk = tokio::select! {
			_ = tx.closed() => break,
			_ = ticker.tick() => Bytes::from(format!(":ping {}\n\n", unix_ms_now() / 1000)),
			msg = sub.recv() => {
				let Some(msg) = msg else {
					break;
				};
				let Some(json) = encode_json(&msg) else {
					continue;
				};
				sse_event(&json)
			}
		};

		if tx.send(chunk).await.is_err() {
			break;
		}
	}
	debug!("sse: stream closed");
}

/// Relay `sub` over an upgraded WebSocket until either side closes.
pub async fn serve_ws(upgraded: Upgraded, mut sub: Subscription, heartbeat: Duration) -> anyhow::Result<()> {
	let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
	let (mut sink, mut incoming) = ws.split();
	let mut ticker = heartbeat_ticker(heartbeat);

	loop {
		tokio::select! {
			frame = incoming.next() => match frame {
				None | Some(Ok(Message::Close(_))) => break,
				Some(Err(err)) => {
					debug!(error = %err, "ws: read failed");
					break;
				}
				// Pongs are queued by tungstenite itself; inbound data is ignored.
				Some(Ok(_)) => {}
			},
			_ = ticker.tick() => sink.send(Message::Ping(Bytes::new())).await?,
			msg = sub.recv() => {
				let Some(msg) = msg else {
					let close = CloseFrame {
						code: CloseCode::Away,
						reason: Utf8Bytes::from_static("server shutting down"),
					};
					let _ = sink.send(Message::Close(Some(close))).await;
					break;
				};
				if let Some(json) = encode_json(&msg) {
					sink.send(Message::text(json)).await?;
				}
			}
		}
	}

	debug!("ws: stream closed");
	Ok(())
}
