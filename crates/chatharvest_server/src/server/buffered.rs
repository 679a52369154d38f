#![forbid(unsafe_code)]

//! Batching front for a [`Sink`].

use std::sync::Arc;
use std::time::Duration;

use chatharvest_domain::ChatMessage;
use chatharvest_util::shutdown::Shutdown;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::metrics::SinkMetrics;
use crate::server::store::Sink;

/// Collects writes and hands them to the inner sink `batch_size` at a time.
///
/// With a non-zero `flush_max` a background task also flushes whatever is
/// buffered on that period, so a quiet channel still reaches the database.
pub struct BufferedSink {
	inner: Arc<dyn Sink>,
	batch_size: usize,
	buffer: Mutex<Vec<ChatMessage>>,
	metrics: SinkMetrics,
}

impl BufferedSink {
	pub fn new(inner: Arc<dyn Sink>, batch_size: usize, metrics: SinkMetrics) -> Self {
		let batch_size = batch_size.max(1);
		Self {
			inner,
			batch_size,
			buffer: Mutex::new(Vec::with_capacity(batch_size)),
			metrics,
		}
	}

	pub fn buffered(&self) -> usize {
		self.buffer.lock().len()
	}

	/// Write out everything buffered so far.
	pub async fn flush(&self) -> anyhow::Result<()> {
		let batch = std::mem::take(&mut *self.buffer.lock());
		self.write_out(batch).await
	}

	async fn write_out(&self, batch: Vec<ChatMessage>) -> anyhow::Result<()> {
		if batch.is_empty() {
			return Ok(());
		}
		debug!(size = batch.len(), "sink: flushing batch");
		self.inner.write_batch(&batch).await
	}

	/// Flush every `period` until shutdown, then flush once more.
	pub fn spawn_flusher(self: &Arc<Self>, period: Duration, shutdown: Shutdown) -> JoinHandle<()> {
		let sink = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			ticker.tick().await;

			loop {
				let stopping = tokio::select! {
					_ = shutdown.cancelled() => true,
					_ = ticker.tick() => false,
				};
				if let Err(err) = sink.flush().await {
					sink.metrics.write_errors.increment(1);
					warn!(error = ?err, "sink: timed flush failed");
				}
				if stopping {
					return;
				}
			}
		})
	}
}

#[async_trait::async_trait]
impl Sink for BufferedSink {
	async fn write(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		let batch = {
			let mut buffer = self.buffer.lock();
			buffer.push(msg.clone());
			if buffer.len() < self.batch_size {
				return Ok(());
			}
			std::mem::replace(&mut *buffer, Vec::with_capacity(self.batch_size))
		};
		self.write_out(batch).await
	}
}

#[cfg(test)]
mod tests {
	use chatharvest_domain::Platform;

	use super::*;
	use crate::server::filters::Filters;
	use crate::server::store::{MemoryStore, Store};

	fn msg(id: &str) -> ChatMessage {
		ChatMessage::new(Platform::Twitch, id, "alice", "hi", 1_700_000_000_000)
	}

	/// Records the size of every batch it receives.
	#[derive(Default)]
	struct BatchLog {
		batches: Mutex<Vec<usize>>,
	}

	#[async_trait::async_trait]
	impl Sink for BatchLog {
		async fn write(&self, _msg: &ChatMessage) -> anyhow::Result<()> {
			self.batches.lock().push(1);
			Ok(())
		}

		async fn write_batch(&self, msgs: &[ChatMessage]) -> anyhow::Result<()> {
			self.batches.lock().push(msgs.len());
			Ok(())
		}
	}

	#[tokio::test]
	async fn writes_whole_batches() {
		let log = Arc::new(BatchLog::default());
		let sink = BufferedSink::new(log.clone(), 3, SinkMetrics::noop());

		for id in ["a", "b", "c", "d", "e"] {
			sink.write(&msg(id)).await.expect("write");
		}
		assert_eq!(*log.batches.lock(), [3]);
		assert_eq!(sink.buffered(), 2);

		sink.flush().await.expect("flush");
		assert_eq!(*log.batches.lock(), [3, 2]);
		assert_eq!(sink.buffered(), 0);

		sink.flush().await.expect("empty flush");
		assert_eq!(log.batches.lock().len(), 2);
	}

	#[tokio::test]
	async fn batch_of_one_writes_through() {
		let store = Arc::new(MemoryStore::new());
		let sink = BufferedSink::new(store.clone(), 0, SinkMetrics::noop());
		sink.write(&msg("a")).await.expect("write");
		assert_eq!(store.count(&Filters::default()).await.expect("count"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn flusher_drains_partial_batches() {
		let log = Arc::new(BatchLog::default());
		let sink = Arc::new(BufferedSink::new(log.clone(), 100, SinkMetrics::noop()));
		let (trigger, shutdown) = chatharvest_util::shutdown::channel();
		let task = sink.spawn_flusher(Duration::from_millis(250), shutdown);

		sink.write(&msg("a")).await.expect("write");
		sink.write(&msg("b")).await.expect("write");
		tokio::time::sleep(Duration::from_millis(300)).await;
		assert_eq!(*log.batches.lock(), [2]);

		sink.write(&msg("c")).await.expect("write");
		trigger.trigger();
		task.await.expect("flusher stops");
		assert_eq!(*log.batches.lock(), [2, 1]);
	}
}
