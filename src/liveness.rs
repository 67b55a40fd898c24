//! The one-shot stop signal shared between a watcher and its owner.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Observed state of a [`Liveness`] signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Unreleased,
	Released,
}

/// A wait-capable stop signal with exactly one transition,
/// unreleased -> released.
///
/// Releasing is the sole mechanism by which a caller asks [`crate::watch`]
/// to return. Clones share the same underlying signal, so the usual shape
/// is: clone one handle into the watching thread, keep the other, release
/// it when done.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
	inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	released: Mutex<bool>,
	cond: Condvar,
}

impl Liveness {
	pub fn new() -> Self {
		Self::default()
	}

	/// Blocks the calling thread until the signal is released.
	pub fn wait(&self) -> State {
		let mut released = self
			.inner
			.released
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		while !*released {
			released = self
				.inner
				.cond
				.wait(released)
				.unwrap_or_else(PoisonError::into_inner);
		}
		State::Released
	}

	/// Transitions unreleased -> released and wakes every waiter. Safe to
	/// call from any thread; later calls are no-ops.
	pub fn release(&self) {
		let mut released = self
			.inner
			.released
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if !*released {
			*released = true;
			self.inner.cond.notify_all();
		}
	}

	/// Non-blocking probe, used by the Linux event loop between polls.
	pub fn is_released(&self) -> bool {
		*self
			.inner
			.released
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}
}
