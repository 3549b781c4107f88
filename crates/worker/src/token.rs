use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

/// Monotonic generation clock for per-key executions.
#[derive(Debug, Default)]
pub(crate) struct GenerationClock {
	next: AtomicU64,
}

impl GenerationClock {
	/// Returns the next generation ID, starting at 1.
	pub fn next(&self) -> u64 {
		self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}
}

struct HandleEntry {
	generation: u64,
	cancel: CancellationToken,
	refs: usize,
}

/// Key -> live cancellation handle map. At most one entry per key.
pub(crate) struct HandleTable<K> {
	entries: Mutex<FxHashMap<K, HandleEntry>>,
	clock: GenerationClock,
	root: CancellationToken,
}

impl<K> HandleTable<K>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
	pub fn new() -> Self {
		Self {
			entries: Mutex::new(FxHashMap::default()),
			clock: GenerationClock::default(),
			root: CancellationToken::new(),
		}
	}

	/// Establishes a fresh handle for `key`, cancelling the one it replaces.
	pub fn issue(self: &Arc<Self>, key: K) -> WorkLease<K> {
		let generation = self.clock.next();
		let cancel = self.root.child_token();
		let previous = self.entries.lock().insert(
			key.clone(),
			HandleEntry {
				generation,
				cancel: cancel.clone(),
				refs: 1,
			},
		);
		if let Some(prev) = previous {
			prev.cancel.cancel();
			tracing::trace!(?key, superseded = prev.generation, generation, "work.lease.supersede");
		}
		WorkLease {
			table: Arc::clone(self),
			key,
			generation,
			cancel,
			released: false,
		}
	}

	/// Cancels and forgets every live handle.
	pub fn cancel_all(&self) -> usize {
		let drained: Vec<_> = self.entries.lock().drain().collect();
		for (_, entry) in &drained {
			entry.cancel.cancel();
		}
		drained.len()
	}

	/// Cancels every current and future handle.
	pub fn close(&self) {
		self.root.cancel();
		self.cancel_all();
	}

	pub fn live_count(&self, key: &K) -> usize {
		usize::from(self.entries.lock().contains_key(key))
	}

	pub fn live_total(&self) -> usize {
		self.entries.lock().len()
	}

	fn retain(&self, key: &K, generation: u64) {
		if let Some(entry) = self.entries.lock().get_mut(key)
			&& entry.generation == generation
		{
			entry.refs = entry.refs.wrapping_add(1);
		}
	}

	fn release(&self, key: &K, generation: u64) {
		let removed = {
			let mut entries = self.entries.lock();
			let last = match entries.get_mut(key) {
				Some(entry) if entry.generation == generation => {
					entry.refs = entry.refs.saturating_sub(1);
					entry.refs == 0
				}
				_ => false,
			};
			if last { entries.remove(key) } else { None }
		};
		if let Some(entry) = removed {
			entry.cancel.cancel();
			tracing::trace!(?key, generation, "work.lease.release");
		}
	}
}

/// Reference-counted cancellation handle for one in-flight execution of a
/// key.
///
/// Clones share the handle; the handle is removed once the last clone of the
/// current generation is released. Cancellation is controlled by the owning
/// queue: taking a newer item for the same key, an explicit whole-queue
/// cancellation, or disposal.
pub struct WorkLease<K>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
	table: Arc<HandleTable<K>>,
	key: K,
	generation: u64,
	cancel: CancellationToken,
	released: bool,
}

impl<K> WorkLease<K>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
	pub fn key(&self) -> &K {
		&self.key
	}

	pub const fn generation(&self) -> u64 {
		self.generation
	}

	/// Token observed by the handler. Child tokens may be handed to sub-tasks.
	pub fn token(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Resolves when the lease is cancelled.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}

	/// Ends this holder's span of work.
	pub fn release(mut self) {
		self.release_inner();
	}

	fn release_inner(&mut self) {
		if !self.released {
			self.released = true;
			self.table.release(&self.key, self.generation);
		}
	}
}

impl<K> Clone for WorkLease<K>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
	fn clone(&self) -> Self {
		self.table.retain(&self.key, self.generation);
		Self {
			table: Arc::clone(&self.table),
			key: self.key.clone(),
			generation: self.generation,
			cancel: self.cancel.clone(),
			released: self.released,
		}
	}
}

impl<K> Drop for WorkLease<K>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
	fn drop(&mut self) {
		self.release_inner();
	}
}

impl<K> fmt::Debug for WorkLease<K>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WorkLease")
			.field("key", &self.key)
			.field("generation", &self.generation)
			.field("cancelled", &self.cancel.is_cancelled())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn table() -> Arc<HandleTable<&'static str>> {
		Arc::new(HandleTable::new())
	}

	#[test]
	fn issuing_again_cancels_previous_handle() {
		let table = table();
		let first = table.issue("a");
		let second = table.issue("a");

		assert!(first.is_cancelled());
		assert!(!second.is_cancelled());
		assert_eq!(table.live_count(&"a"), 1);
		assert!(second.generation() > first.generation());
	}

	#[test]
	fn stale_release_leaves_newer_handle_alone() {
		let table = table();
		let first = table.issue("a");
		let second = table.issue("a");

		first.release();
		assert_eq!(table.live_count(&"a"), 1);
		assert!(!second.is_cancelled());
	}

	#[test]
	fn last_clone_release_removes_handle() {
		let table = table();
		let lease = table.issue("a");
		let sub = lease.clone();

		lease.release();
		assert_eq!(table.live_count(&"a"), 1, "clone still holds the handle");
		assert!(!sub.is_cancelled());

		drop(sub);
		assert_eq!(table.live_count(&"a"), 0);
	}

	#[test]
	fn close_cancels_live_and_future_handles() {
		let table = table();
		let live = table.issue("a");
		table.close();
		assert!(live.is_cancelled());
		assert_eq!(table.live_total(), 0);

		let late = table.issue("b");
		assert!(late.is_cancelled());
	}
}
