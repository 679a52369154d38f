#![forbid(unsafe_code)]

use chatharvest_domain::normalize_token;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

/// Where a credential update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialReason {
	/// Periodic token file poll.
	File,
	/// The token refresher produced a new access token.
	Refresh,
	/// Operator reload request.
	Manual,
}

impl CredentialReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::File => "file",
			Self::Refresh => "refresh",
			Self::Manual => "manual",
		}
	}
}

/// Single-slot holder for the IRC credential.
///
/// Writers `offer` new values; the receiver reads `current()` once per
/// connection attempt and waits on `pending()` to learn it must reconnect.
/// Any number of offers between two reads collapse into one pending flag, and
/// the value read afterwards is always the latest one.
pub struct CredentialRegister {
	current: RwLock<String>,
	pending: Mutex<Option<CredentialReason>>,
	notify: Notify,
}

impl CredentialRegister {
	pub fn new(initial: &str) -> Self {
		Self {
			current: RwLock::new(normalize_token(initial)),
			pending: Mutex::new(None),
			notify: Notify::new(),
		}
	}

	pub fn current(&self) -> String {
		self.current.read().clone()
	}

	/// Store `token` and mark the register dirty. File offers that match the
	/// current value are ignored. Returns whether the register became dirty.
	pub fn offer(&self, token: &str, reason: CredentialReason) -> bool {
		let token = normalize_token(token);
		if token.is_empty() {
			return false;
		}

		{
			let mut current = self.current.write();
			if reason == CredentialReason::File && *current == token {
				return false;
			}
			*current = token;
			*self.pending.lock() = Some(reason);
		}

		debug!(reason = reason.as_str(), "twitch: credential updated");
		self.notify.notify_one();
		true
	}

	/// Read and clear the dirty flag.
	pub fn take_pending(&self) -> Option<CredentialReason> {
		self.pending.lock().take()
	}

	/// Wait until an offer marks the register dirty, then clear it.
	pub async fn pending(&self) -> CredentialReason {
		loop {
			if let Some(reason) = self.take_pending() {
				return reason;
			}
			self.notify.notified().await;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use super::*;

	#[test]
	fn file_offer_ignores_unchanged_value() {
		let reg = CredentialRegister::new("abc");
		assert_eq!(reg.current(), "oauth:abc");
		assert!(!reg.offer("oauth:abc", CredentialReason::File));
		assert_eq!(reg.take_pending(), None);

		assert!(reg.offer(" def ", CredentialReason::File));
		assert_eq!(reg.current(), "oauth:def");
		assert_eq!(reg.take_pending(), Some(CredentialReason::File));
		assert_eq!(reg.take_pending(), None);
	}

	#[test]
	fn refresh_and_manual_always_mark_dirty() {
		let reg = CredentialRegister::new("oauth:abc");
		assert!(reg.offer("oauth:abc", CredentialReason::Manual));
		assert_eq!(reg.take_pending(), Some(CredentialReason::Manual));
		assert!(reg.offer("oauth:abc", CredentialReason::Refresh));
		assert_eq!(reg.take_pending(), Some(CredentialReason::Refresh));
		assert!(!reg.offer("   ", CredentialReason::Manual));
	}

	#[test]
	fn burst_collapses_to_latest() {
		let reg = CredentialRegister::new("a");
		for token in ["b", "c", "d"] {
			reg.offer(token, CredentialReason::File);
		}
		assert_eq!(reg.take_pending(), Some(CredentialReason::File));
		assert_eq!(reg.take_pending(), None);
		assert_eq!(reg.current(), "oauth:d");
	}

	#[tokio::test]
	async fn pending_wakes_on_offer() {
		let reg = Arc::new(CredentialRegister::new("a"));
		let waiter = tokio::spawn({
			let reg = reg.clone();
			async move { reg.pending().await }
		});
		tokio::task::yield_now().await;
		reg.offer("b", CredentialReason::Refresh);

		let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("pending resolved")
			.expect("task joined");
		assert_eq!(reason, CredentialReason::Refresh);
		assert_eq!(reg.take_pending(), None);
	}
}
