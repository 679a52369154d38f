#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatharvest_domain::ChatMessage;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::filters::Filters;
use crate::server::metrics::HubMetrics;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
	Sse,
	Ws,
}

impl Transport {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Sse => "sse",
			Self::Ws => "ws",
		}
	}
}

/// Outcome of one broadcast, mostly for tests and debug logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	pub dropped: usize,
}

/// Fans live messages out to filtered subscribers without ever blocking the producer.
///
/// Delivery is at-most-once: when a subscriber's queue is full the message is
/// dropped for that subscriber only.
#[derive(Clone)]
pub struct Hub {
	shared: Arc<Shared>,
}

struct Shared {
	inner: RwLock<Inner>,
	capacity: usize,
	metrics: HubMetrics,
}

#[derive(Default)]
struct Inner {
	next_id: u64,
	subscribers: HashMap<u64, Subscriber>,
	closed: bool,
}

struct Subscriber {
	tx: mpsc::Sender<Arc<ChatMessage>>,
	filters: Filters,
	transport: Transport,
}

/// A registered subscriber. Dropping it unregisters.
pub struct Subscription {
	id: u64,
	transport: Transport,
	rx: mpsc::Receiver<Arc<ChatMessage>>,
	shared: Arc<Shared>,
}

impl Hub {
	pub fn new(capacity: usize, metrics: HubMetrics) -> Self {
		Self {
			shared: Arc::new(Shared {
				inner: RwLock::new(Inner::default()),
				capacity: capacity.max(1),
				metrics,
			}),
		}
	}

	/// `None` once the hub has shut down.
	pub fn register(&self, filters: Filters, transport: Transport) -> Option<Subscription> {
		let (tx, rx) = mpsc::channel(self.shared.capacity);
		let mut inner = self.shared.inner.write();
		if inner.closed {
			return None;
		}

		let id = inner.next_id;
		inner.next_id += 1;
		inner.subscribers.insert(id, Subscriber { tx, filters, transport });
		self.shared.metrics.clients(transport).increment(1.0);
		debug!(id, transport = transport.as_str(), subs = inner.subscribers.len(), "hub: subscribed");

		Some(Subscription {
			id,
			transport,
			rx,
			shared: Arc::clone(&self.shared),
		})
	}

	pub fn broadcast(&self, msg: &Arc<ChatMessage>) -> BroadcastReport {
		let mut report = BroadcastReport::default();
		let inner = self.shared.inner.read();
		for sub in inner.subscribers.values() {
			if !sub.filters.matches(msg) {
				continue;
			}
			match sub.tx.try_send(Arc::clone(msg)) {
				Ok(()) => report.delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					report.dropped += 1;
					self.shared.metrics.dropped(sub.transport).increment(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}
		drop(inner);

		self.shared.metrics.delivered.increment(report.delivered as u64);
		if report.dropped > 0 {
			debug!(dropped = report.dropped, "hub: dropped due to full subscriber queues");
		}
		report
	}

	/// Close every subscriber channel and reject further registration.
	pub fn shutdown(&self) {
		let mut inner = self.shared.inner.write();
		if inner.closed {
			return;
		}
		inner.closed = true;
		for (_, sub) in inner.subscribers.drain() {
			self.shared.metrics.clients(sub.transport).decrement(1.0);
		}
		debug!("hub: shut down");
	}

	pub fn is_closed(&self) -> bool {
		self.shared.inner.read().closed
	}

	#[cfg(test)]
	pub fn subscriber_count(&self) -> usize {
		self.shared.inner.read().subscribers.len()
	}
}

impl Subscription {
	/// Next message; `None` once the hub shut down.
	pub async fn recv(&mut self) -> Option<Arc<ChatMessage>> {
		self.rx.recv().await
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		let mut inner = self.shared.inner.write();
		if inner.subscribers.remove(&self.id).is_some() {
			self.shared.metrics.clients(self.transport).decrement(1.0);
			debug!(id = self.id, transport = self.transport.as_str(), "hub: unsubscribed");
		}
	}
}
