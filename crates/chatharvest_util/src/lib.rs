#![forbid(unsafe_code)]

pub mod backoff {
	use std::time::Duration;

	/// `min * 2^attempt`, clamped to `[min, max]`.
	pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	/// Exponential retry delay: `seed`, `2*seed`, `4*seed`, ... up to `cap`.
	#[derive(Debug, Clone)]
	pub struct Backoff {
		seed: Duration,
		cap: Duration,
		attempt: u32,
	}

	impl Backoff {
		pub fn new(seed: Duration, cap: Duration) -> Self {
			let cap = cap.max(seed);
			Self { seed, cap, attempt: 0 }
		}

		/// The delay the next call to [`Backoff::next_delay`] returns.
		pub fn current(&self) -> Duration {
			backoff_delay(self.attempt, self.seed, self.cap)
		}

		/// Return the delay for this failure and advance.
		pub fn next_delay(&mut self) -> Duration {
			let d = self.current();
			self.attempt = self.attempt.saturating_add(1);
			d
		}

		pub fn reset(&mut self) {
			self.attempt = 0;
		}

		pub fn attempt(&self) -> u32 {
			self.attempt
		}

		pub fn seed(&self) -> Duration {
			self.seed
		}

		pub fn cap(&self) -> Duration {
			self.cap
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;
		use proptest::prelude::*;

		#[test]
		fn doubles_until_cap() {
			let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
			let got: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
			assert_eq!(got, [1, 2, 4, 8, 16, 32, 60, 60]);
		}

		#[test]
		fn reset_returns_to_seed() {
			let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
			b.next_delay();
			b.next_delay();
			assert_eq!(b.current(), Duration::from_secs(4));
			b.reset();
			assert_eq!(b.next_delay(), Duration::from_secs(1));
		}

		#[test]
		fn cap_below_seed_is_raised() {
			let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
			assert_eq!(b.cap(), Duration::from_secs(5));
			assert_eq!(b.current(), Duration::from_secs(5));
		}

		proptest! {
			#[test]
			fn never_decreases_without_reset(seed_ms in 1u64..5_000, cap_mult in 1u64..200, steps in 1usize..64) {
				let seed = Duration::from_millis(seed_ms);
				let cap = Duration::from_millis(seed_ms * cap_mult);
				let mut b = Backoff::new(seed, cap);
				let mut prev = Duration::ZERO;
				for _ in 0..steps {
					let d = b.next_delay();
					prop_assert!(d >= prev);
					prop_assert!(d >= seed && d <= cap);
					prev = d;
				}
				b.reset();
				prop_assert_eq!(b.next_delay(), seed);
			}
		}
	}
}

pub mod shutdown {
	use tokio_util::sync::CancellationToken;

	/// Fires a [`Shutdown`] signal. Dropping a trigger does not cancel.
	#[derive(Debug, Clone)]
	pub struct ShutdownTrigger {
		token: CancellationToken,
	}

	/// Cancellation signal observed by long-running tasks.
	///
	/// A child signal fires when either its own trigger or any ancestor fires.
	#[derive(Debug, Clone)]
	pub struct Shutdown {
		token: CancellationToken,
	}

	/// Create a root signal.
	pub fn channel() -> (ShutdownTrigger, Shutdown) {
		let token = CancellationToken::new();
		(ShutdownTrigger { token: token.clone() }, Shutdown { token })
	}

	impl ShutdownTrigger {
		pub fn trigger(&self) {
			self.token.cancel();
		}

		pub fn is_triggered(&self) -> bool {
			self.token.is_cancelled()
		}
	}

	impl Shutdown {
		/// A signal that never fires on its own.
		pub fn never() -> Self {
			Self {
				token: CancellationToken::new(),
			}
		}

		pub fn is_cancelled(&self) -> bool {
			self.token.is_cancelled()
		}

		/// Derive a child that can be cancelled independently of `self`.
		pub fn child(&self) -> (ShutdownTrigger, Shutdown) {
			let token = self.token.child_token();
			(ShutdownTrigger { token: token.clone() }, Shutdown { token })
		}

		/// Resolve once cancelled.
		pub async fn cancelled(&self) {
			self.token.cancelled().await
		}
	}

}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}

	/// Current Unix time in nanoseconds.
	#[inline]
	pub fn unix_nanos_now() -> i128 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_nanos() as i128
	}
}
