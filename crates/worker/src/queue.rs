use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use indexmap::IndexMap;
use indexmap::map::Entry;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use tokio::sync::Notify;

use crate::config::DispatcherConfig;
use crate::item::WorkItem;
use crate::token::{HandleTable, WorkLease};

/// Graph knowledge consulted when choosing which pending key to take next.
///
/// Implementations are queried outside the queue lock and should be cheap.
pub trait TakePriority<K> {
	/// The key the user is focused on, if any.
	fn preferred(&self) -> Option<&K> {
		None
	}

	/// Whether `key` directly depends on `on`.
	fn is_direct_dependent(&self, key: &K, on: &K) -> bool;

	/// Whether `key` is already known to have problems.
	fn has_known_problems(&self, key: &K) -> bool;
}

/// Priority without graph knowledge: keys are taken in insertion order.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertionOrder;

impl<K> TakePriority<K> for InsertionOrder {
	fn is_direct_dependent(&self, _key: &K, _on: &K) -> bool {
		false
	}

	fn has_known_problems(&self, _key: &K) -> bool {
		false
	}
}

struct QueueState<K, S>
where
	S: Eq + Hash,
{
	pending: IndexMap<K, WorkItem<K, S>, FxBuildHasher>,
}

/// Pending work coalesced by key, with per-key cancellation handles.
///
/// Producers call [`add_or_replace`](Self::add_or_replace) from any thread;
/// a consumer takes items with [`try_take`](Self::try_take) or
/// [`try_take_any`](Self::try_take_any). The pending map and the handle map
/// each have their own lock, and neither is held across handler code.
pub struct KeyedWorkQueue<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash,
{
	state: Mutex<QueueState<K, S>>,
	handles: Arc<HandleTable<K>>,
	has_pending: AtomicBool,
	disposed: AtomicBool,
	available: Notify,
}

impl<K, S> Default for KeyedWorkQueue<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<K, S> KeyedWorkQueue<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash,
{
	pub fn new() -> Self {
		Self {
			state: Mutex::new(QueueState {
				pending: IndexMap::with_hasher(FxBuildHasher),
			}),
			handles: Arc::new(HandleTable::new()),
			has_pending: AtomicBool::new(false),
			disposed: AtomicBool::new(false),
			available: Notify::new(),
		}
	}

	/// Merges `item` into the pending entry for its key, or inserts it.
	///
	/// Returns `true` when a new pending entry was created. The availability
	/// signal fires once per key that becomes newly pending. Items offered
	/// after disposal are dropped.
	pub fn add_or_replace(&self, item: WorkItem<K, S>) -> bool {
		let mut state = self.state.lock();
		if self.disposed.load(Ordering::Acquire) {
			drop(state);
			tracing::trace!(key = ?item.key(), "work.queue.disposed");
			return false;
		}

		let key = item.key().clone();
		match state.pending.entry(key) {
			Entry::Occupied(mut existing) => {
				let class = existing.get().class();
				existing.get_mut().merge(item);
				let escalated = existing.get().class() != class;
				tracing::trace!(key = ?existing.key(), escalated, "work.queue.coalesce");
				drop(state);
				// A more urgent class can move the key's deadline earlier.
				if escalated {
					self.available.notify_one();
				}
				false
			}
			Entry::Vacant(slot) => {
				tracing::trace!(key = ?slot.key(), class = item.class().as_str(), "work.queue.insert");
				slot.insert(item);
				self.has_pending.store(true, Ordering::Release);
				drop(state);
				self.available.notify_one();
				true
			}
		}
	}

	/// Removes the pending entry for `key` and issues a fresh lease for it,
	/// cancelling any lease still live for that key.
	pub fn try_take(&self, key: &K) -> Option<(WorkItem<K, S>, WorkLease<K>)> {
		let item = {
			let mut state = self.state.lock();
			let item = state.pending.shift_remove(key)?;
			self.sync_pending_flag(&state);
			item
		};
		let lease = self.handles.issue(key.clone());
		Some((item, lease))
	}

	/// Removes some pending entry, preferring in order: `preferred` itself, a
	/// direct dependent of `preferred` with known problems, any key with known
	/// problems, then the oldest pending key.
	pub fn try_take_any(&self, preferred: Option<&K>, priority: &dyn TakePriority<K>) -> Option<(WorkItem<K, S>, WorkLease<K>)> {
		loop {
			let keys: Vec<K> = {
				let state = self.state.lock();
				if state.pending.is_empty() {
					return None;
				}
				state.pending.keys().cloned().collect()
			};

			let choice = select_key(&keys, preferred, priority)?;
			// A concurrent taker may have won the race; pick again.
			if let Some(taken) = self.try_take(&choice) {
				return Some(taken);
			}
		}
	}

	/// Like [`try_take_any`](Self::try_take_any), but only considers keys
	/// whose debounce deadline under `config` has passed at `now`.
	pub fn try_take_due(
		&self,
		config: &DispatcherConfig,
		now: Instant,
		preferred: Option<&K>,
		priority: &dyn TakePriority<K>,
	) -> Option<(WorkItem<K, S>, WorkLease<K>)> {
		loop {
			let keys: Vec<K> = {
				let state = self.state.lock();
				state
					.pending
					.iter()
					.filter(|(_, item)| due_at(config, item) <= now)
					.map(|(key, _)| key.clone())
					.collect()
			};
			if keys.is_empty() {
				return None;
			}

			let choice = select_key(&keys, preferred, priority)?;
			if let Some(taken) = self.try_take(&choice) {
				return Some(taken);
			}
		}
	}

	/// Cancels every in-flight lease. Pending entries stay queued.
	pub fn request_cancellation_on_running_tasks(&self) {
		let cancelled = self.handles.cancel_all();
		tracing::debug!(cancelled, "work.queue.cancel_running");
	}

	/// Cancels all leases and drops all pending entries. Idempotent.
	pub fn dispose(&self) {
		let dropped = {
			let mut state = self.state.lock();
			if self.disposed.swap(true, Ordering::AcqRel) {
				return;
			}
			self.has_pending.store(false, Ordering::Release);
			std::mem::take(&mut state.pending)
		};
		self.handles.close();
		self.available.notify_waiters();
		tracing::debug!(dropped = dropped.len(), "work.queue.dispose");
	}

	/// Cheap "is anything pending" check that never takes the lock.
	pub fn has_pending(&self) -> bool {
		self.has_pending.load(Ordering::Acquire)
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}

	pub fn len(&self) -> usize {
		self.state.lock().pending.len()
	}

	pub fn is_empty(&self) -> bool {
		!self.has_pending()
	}

	pub fn contains(&self, key: &K) -> bool {
		self.state.lock().pending.contains_key(key)
	}

	/// Live leases for `key`; always 0 or 1.
	pub fn live_handle_count(&self, key: &K) -> usize {
		self.handles.live_count(key)
	}

	pub fn live_handles(&self) -> usize {
		self.handles.live_total()
	}

	/// Earliest debounce deadline among pending keys, or `None` when nothing
	/// is pending. Each key is timed from its own requests only.
	pub fn next_due(&self, config: &DispatcherConfig) -> Option<Instant> {
		let state = self.state.lock();
		state.pending.values().map(|item| due_at(config, item)).min()
	}

	/// Resolves once something is pending or the queue is disposed.
	pub async fn wait_for_work(&self) {
		loop {
			// Register before checking to avoid a lost wakeup.
			let notified = self.available.notified();
			if self.has_pending() || self.is_disposed() {
				return;
			}
			notified.await;
		}
	}

	/// Resolves on the next newly pending key or class escalation.
	pub(crate) async fn changed(&self) {
		self.available.notified().await;
	}

	fn sync_pending_flag(&self, state: &QueueState<K, S>) {
		self.has_pending.store(!state.pending.is_empty(), Ordering::Release);
	}
}

fn due_at<K, S>(config: &DispatcherConfig, item: &WorkItem<K, S>) -> Instant
where
	S: Eq + Hash,
{
	config.due_at(item.class(), item.first_enqueued_at(), item.enqueued_at())
}

fn select_key<K>(keys: &[K], preferred: Option<&K>, priority: &dyn TakePriority<K>) -> Option<K>
where
	K: Eq + Clone,
{
	if let Some(preferred) = preferred {
		if keys.contains(preferred) {
			return Some(preferred.clone());
		}
		if let Some(key) = keys
			.iter()
			.find(|key| priority.is_direct_dependent(key, preferred) && priority.has_known_problems(key))
		{
			return Some(key.clone());
		}
	}
	keys.iter()
		.find(|key| priority.has_known_problems(key))
		.or_else(|| keys.first())
		.cloned()
}
