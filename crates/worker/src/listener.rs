use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct ListenerInner {
	pending: AtomicUsize,
	idle: Notify,
}

/// Counts outstanding asynchronous operations.
///
/// Producers attach an [`AsyncToken`] to each queued work item; the token is
/// released when the item is coalesced away or its handler finishes. Hosts
/// and tests use [`AsyncListener::wait_idle`] to wait for background work to
/// settle.
#[derive(Debug, Clone, Default)]
pub struct AsyncListener {
	inner: Arc<ListenerInner>,
}

impl AsyncListener {
	pub fn new() -> Self {
		Self::default()
	}

	/// Starts tracking one operation.
	pub fn begin(&self, label: &'static str) -> AsyncToken {
		let pending = self.inner.pending.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
		tracing::trace!(label, pending, "async.begin");
		AsyncToken {
			inner: Arc::clone(&self.inner),
			label,
		}
	}

	/// Number of operations not yet released.
	pub fn pending(&self) -> usize {
		self.inner.pending.load(Ordering::Acquire)
	}

	/// Resolves once every issued token has been released.
	pub async fn wait_idle(&self) {
		loop {
			// Register before checking to avoid a lost wakeup.
			let notified = self.inner.idle.notified();
			if self.pending() == 0 {
				return;
			}
			notified.await;
		}
	}
}

/// Release token for one tracked operation. Dropping it releases the
/// operation.
#[derive(Debug)]
pub struct AsyncToken {
	inner: Arc<ListenerInner>,
	label: &'static str,
}

impl AsyncToken {
	pub fn label(&self) -> &'static str {
		self.label
	}
}

impl Drop for AsyncToken {
	fn drop(&mut self) {
		let prev = self
			.inner
			.pending
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
			.unwrap_or(0);
		tracing::trace!(label = self.label, pending = prev.saturating_sub(1), "async.release");
		if prev <= 1 {
			self.inner.idle.notify_waiters();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn wait_idle_resolves_after_last_release() {
		let listener = AsyncListener::new();
		let a = listener.begin("a");
		let b = listener.begin("b");
		assert_eq!(listener.pending(), 2);

		let waiter = {
			let listener = listener.clone();
			tokio::spawn(async move { listener.wait_idle().await })
		};

		drop(a);
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!waiter.is_finished(), "one token still outstanding");

		drop(b);
		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("wait_idle should resolve")
			.unwrap();
		assert_eq!(listener.pending(), 0);
	}

	#[tokio::test]
	async fn wait_idle_is_immediate_when_nothing_pending() {
		let listener = AsyncListener::new();
		tokio::time::timeout(Duration::from_millis(100), listener.wait_idle())
			.await
			.expect("idle listener should not wait");
	}
}
