use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use kiln_worker::{DebouncedDispatcher, DispatcherConfig, HandlerError, WorkClass, WorkHandler, WorkItem, WorkLease};
use parking_lot::Mutex;
use rustc_hash::{FxBuildHasher, FxHashSet};
use tokio_util::sync::CancellationToken;

use crate::{Checksum, IndexError, IndexSource, PersistentStore, ReferenceSet, SlotOrigin, VersionedCacheSlot};

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
	/// The input checksum matched the cached slot.
	Unchanged,
	/// The store held a value for the current checksum.
	Loaded,
	/// The value was computed and published.
	Recomputed,
}

#[derive(Debug, Clone)]
pub struct IndexCacheConfig {
	pub dispatcher: DispatcherConfig,
	/// Class of refreshes requested by reads.
	pub refresh_class: WorkClass,
}

impl Default for IndexCacheConfig {
	fn default() -> Self {
		Self {
			dispatcher: DispatcherConfig::default(),
			refresh_class: WorkClass::Dependents,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
	/// Keys with an in-memory cell.
	pub slots: usize,
	/// Cells holding a value.
	pub populated: usize,
	/// Cells with at least one referencing node.
	pub referenced: usize,
	/// Refresh requests waiting in the queue.
	pub pending: usize,
	/// Refreshes currently running.
	pub running: usize,
}

struct SlotCell<N, V> {
	slot: ArcSwapOption<VersionedCacheSlot<V>>,
	refs: Mutex<ReferenceSet<N>>,
	/// Serializes refreshes of this key.
	refresh: tokio::sync::Mutex<()>,
	/// Whether a read already tried the persistent store.
	probed: AtomicBool,
}

impl<N, V> Default for SlotCell<N, V> {
	fn default() -> Self {
		Self {
			slot: ArcSwapOption::empty(),
			refs: Mutex::new(ReferenceSet::default()),
			refresh: tokio::sync::Mutex::new(()),
			probed: AtomicBool::new(false),
		}
	}
}

struct CacheCore<K, N, V> {
	name: Arc<str>,
	slots: DashMap<K, Arc<SlotCell<N, V>>, FxBuildHasher>,
	/// Keys each node references, so evicting a node visits only its keys.
	owners: DashMap<N, FxHashSet<K>, FxBuildHasher>,
	source: Arc<dyn IndexSource<K, V>>,
	store: Arc<dyn PersistentStore<K, V>>,
}

impl<K, N, V> CacheCore<K, N, V>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	N: Eq + Hash + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
{
	fn cell(&self, key: &K) -> Arc<SlotCell<N, V>> {
		Arc::clone(self.slots.entry(key.clone()).or_default().value())
	}

	fn existing(&self, key: &K) -> Option<Arc<SlotCell<N, V>>> {
		self.slots.get(key).map(|entry| Arc::clone(entry.value()))
	}

	async fn refresh(&self, key: &K, cancel: &CancellationToken) -> Result<RefreshOutcome, IndexError> {
		let cell = self.cell(key);
		let _guard = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(IndexError::Cancelled),
			guard = cell.refresh.lock() => guard,
		};

		let checksum = self.source.checksum(key).await?;
		let current = cell.slot.load_full();
		if let Some(current) = &current
			&& current.checksum() == checksum
		{
			if !current.is_verified() {
				cell.slot.store(Some(Arc::new(current.verified())));
			}
			tracing::trace!(cache = %self.name, ?key, %checksum, "index.unchanged");
			return Ok(RefreshOutcome::Unchanged);
		}
		if cancel.is_cancelled() {
			return Err(IndexError::Cancelled);
		}

		if let Some((stored, value)) = self.read_store(key, Some(checksum)).await
			&& stored == checksum
		{
			let slot = VersionedCacheSlot::new(Arc::new(value), checksum, SlotOrigin::Verified);
			cell.slot.store(Some(Arc::new(slot)));
			tracing::debug!(cache = %self.name, ?key, %checksum, "index.loaded");
			return Ok(RefreshOutcome::Loaded);
		}

		let value = match self.source.compute(key, checksum, cancel).await {
			Ok(value) => Arc::new(value),
			Err(IndexError::Cancelled) => return Err(IndexError::Cancelled),
			Err(error) => {
				tracing::warn!(cache = %self.name, ?key, %error, kept_prior = current.is_some(), "index.compute_failed");
				return Err(error);
			}
		};
		if cancel.is_cancelled() {
			tracing::trace!(cache = %self.name, ?key, "index.discard_superseded");
			return Err(IndexError::Cancelled);
		}

		cell.slot.store(Some(Arc::new(VersionedCacheSlot::new(Arc::clone(&value), checksum, SlotOrigin::Verified))));
		tracing::debug!(
			cache = %self.name,
			?key,
			%checksum,
			previous = ?current.as_ref().map(|slot| slot.checksum()),
			"index.recomputed"
		);
		self.write_back(key, checksum, value).await;
		Ok(RefreshOutcome::Recomputed)
	}

	/// Installs any persisted version for `key` unless a slot appeared in the
	/// meantime. The store is probed at most once per cell.
	async fn load_persisted(&self, key: &K) -> Option<Arc<VersionedCacheSlot<V>>> {
		let cell = self.cell(key);
		if cell.probed.swap(true, Ordering::AcqRel) {
			return cell.slot.load_full();
		}
		if let Some((checksum, value)) = self.read_store(key, None).await {
			let loaded = Arc::new(VersionedCacheSlot::new(Arc::new(value), checksum, SlotOrigin::Persisted));
			cell.slot.rcu(|current| current.clone().or_else(|| Some(Arc::clone(&loaded))));
			tracing::trace!(cache = %self.name, ?key, %checksum, "index.persisted_hit");
		}
		cell.slot.load_full()
	}

	async fn read_store(&self, key: &K, expected: Option<Checksum>) -> Option<(Checksum, V)> {
		let store = Arc::clone(&self.store);
		let owned = key.clone();
		match kiln_worker::spawn_blocking("index.store_read", move || store.read(&owned, expected)).await {
			Ok(Ok(hit)) => hit,
			Ok(Err(error)) => {
				tracing::warn!(cache = %self.name, ?key, %error, "index.store_read_failed");
				None
			}
			Err(err) => {
				let panic = kiln_worker::join_error_panic_message(err).unwrap_or_default();
				tracing::warn!(cache = %self.name, ?key, %panic, "index.store_read_panicked");
				None
			}
		}
	}

	async fn write_back(&self, key: &K, checksum: Checksum, value: Arc<V>) {
		let store = Arc::clone(&self.store);
		let owned = key.clone();
		match kiln_worker::spawn_blocking("index.store_write", move || store.write(&owned, checksum, &value)).await {
			Ok(Ok(written)) => tracing::trace!(cache = %self.name, ?key, written, "index.store_write"),
			Ok(Err(error)) => tracing::warn!(cache = %self.name, ?key, %error, "index.store_write_failed"),
			Err(err) => {
				let panic = kiln_worker::join_error_panic_message(err).unwrap_or_default();
				tracing::warn!(cache = %self.name, ?key, %panic, "index.store_write_panicked");
			}
		}
	}
}

struct RefreshHandler<K, N, V> {
	core: Arc<CacheCore<K, N, V>>,
}

#[async_trait]
impl<K, N, V> WorkHandler<K, ()> for RefreshHandler<K, N, V>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	N: Eq + Hash + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
{
	async fn handle(&self, item: WorkItem<K, ()>, lease: &WorkLease<K>) -> Result<(), HandlerError> {
		match self.core.refresh(item.key(), lease.token()).await {
			Ok(_) => Ok(()),
			Err(IndexError::Cancelled) => Err(HandlerError::Cancelled),
			Err(err) => Err(HandlerError::failed(err)),
		}
	}
}

/// Best-effort derived index per key.
///
/// Reads never wait for computation: [`get_possibly_stale`] returns whatever
/// is cached (falling back to any persisted version) and queues a refresh.
/// Refreshes run on the cache's own [`DebouncedDispatcher`] and only compute
/// when the input checksum moved.
///
/// Keys shared by several graph nodes are reference counted with
/// [`add_reference`] and [`evict`]; keys that vanish from the graph are
/// dropped by [`sweep`]. Persisted copies are never deleted.
///
/// [`get_possibly_stale`]: Self::get_possibly_stale
/// [`add_reference`]: Self::add_reference
/// [`evict`]: Self::evict
/// [`sweep`]: Self::sweep
pub struct IncrementalIndexCache<K, N, V>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	N: Eq + Hash + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
{
	core: Arc<CacheCore<K, N, V>>,
	dispatcher: DebouncedDispatcher<K, ()>,
	refresh_class: WorkClass,
}

impl<K, N, V> IncrementalIndexCache<K, N, V>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	N: Eq + Hash + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
{
	pub fn new(
		name: impl Into<Arc<str>>,
		source: Arc<dyn IndexSource<K, V>>,
		store: Arc<dyn PersistentStore<K, V>>,
		config: IndexCacheConfig,
	) -> Self {
		let name = name.into();
		let core = Arc::new(CacheCore {
			name: Arc::clone(&name),
			slots: DashMap::with_hasher(FxBuildHasher),
			owners: DashMap::with_hasher(FxBuildHasher),
			source,
			store,
		});
		let handler = Arc::new(RefreshHandler { core: Arc::clone(&core) });
		let dispatcher = DebouncedDispatcher::start(format!("index:{name}"), config.dispatcher, handler);
		Self {
			core,
			dispatcher,
			refresh_class: config.refresh_class,
		}
	}

	/// Current value for `key`, possibly stale, and queues a refresh.
	///
	/// With no in-memory slot, any persisted version is loaded first. Returns
	/// `None` only when neither exists.
	pub async fn get_possibly_stale(&self, key: &K) -> Option<Arc<VersionedCacheSlot<V>>> {
		self.request_refresh(key);
		if let Some(cell) = self.core.existing(key)
			&& let Some(slot) = cell.slot.load_full()
		{
			return Some(slot);
		}
		self.core.load_persisted(key).await
	}

	/// In-memory slot for `key`, without side effects.
	pub fn cached(&self, key: &K) -> Option<Arc<VersionedCacheSlot<V>>> {
		self.core.existing(key).and_then(|cell| cell.slot.load_full())
	}

	/// Queues a debounced refresh of `key`.
	pub fn request_refresh(&self, key: &K) -> bool {
		self.dispatcher.enqueue(WorkItem::new(key.clone(), self.refresh_class))
	}

	/// Recomputes `key` if its input checksum differs from the cached one.
	///
	/// On failure the prior slot stays in place.
	pub async fn refresh_if_checksum_differs(&self, key: &K, cancel: &CancellationToken) -> Result<RefreshOutcome, IndexError> {
		self.core.refresh(key, cancel).await
	}

	/// Records `node` as referencing `key`. Returns `false` if it already was.
	pub fn add_reference(&self, key: &K, node: N) -> bool {
		let cell = self.core.cell(key);
		let mut refs = cell.refs.lock();
		self.core.owners.entry(node.clone()).or_default().insert(key.clone());
		refs.add(node)
	}

	pub fn references(&self, key: &K) -> usize {
		self.core.existing(key).map_or(0, |cell| cell.refs.lock().len())
	}

	/// Number of keys `node` currently references.
	pub fn referenced_by(&self, node: &N) -> usize {
		self.core.owners.get(node).map_or(0, |keys| keys.len())
	}

	/// Drops `node` from every reference set. Entries whose last reference
	/// was `node` are evicted. Returns the number of evicted entries.
	///
	/// Only the keys `node` references are visited.
	pub fn evict(&self, node: &N) -> usize {
		let Some((_, keys)) = self.core.owners.remove(node) else {
			return 0;
		};
		keys.iter().filter(|key| self.release(key, node)).count()
	}

	/// Drops `node`'s reference to `key`, evicting the entry if that was its
	/// last reference. Returns whether the entry was evicted.
	pub fn remove_reference(&self, key: &K, node: &N) -> bool {
		self.core.owners.remove_if_mut(node, |_, keys| {
			keys.remove(key);
			keys.is_empty()
		});
		self.release(key, node)
	}

	fn release(&self, key: &K, node: &N) -> bool {
		let evicted = self
			.core
			.slots
			.remove_if(key, |_, cell| {
				let mut refs = cell.refs.lock();
				refs.remove(node) && refs.is_orphaned()
			})
			.is_some();
		if evicted {
			tracing::trace!(cache = %self.core.name, ?key, "index.evict");
		}
		evicted
	}

	/// Drops entries whose key is no longer live, and tracked entries with no
	/// remaining references. Returns the number of removed entries.
	pub fn sweep(&self, is_live: impl Fn(&K) -> bool) -> usize {
		let mut swept = 0usize;
		self.core.slots.retain(|key, cell| {
			let refs = cell.refs.lock();
			let keep = is_live(key) && !refs.is_orphaned();
			if !keep {
				swept = swept.wrapping_add(1);
				for node in refs.nodes() {
					self.core.owners.remove_if_mut(node, |_, keys| {
						keys.remove(key);
						keys.is_empty()
					});
				}
			}
			keep
		});
		if swept > 0 {
			tracing::debug!(cache = %self.core.name, swept, "index.sweep");
		}
		swept
	}

	pub fn stats(&self) -> CacheStats {
		let mut stats = CacheStats {
			pending: self.dispatcher.queue().len(),
			running: self.dispatcher.running(),
			..CacheStats::default()
		};
		for entry in self.core.slots.iter() {
			let cell = entry.value();
			stats.slots += 1;
			if cell.slot.load().is_some() {
				stats.populated += 1;
			}
			if !cell.refs.lock().is_empty() {
				stats.referenced += 1;
			}
		}
		stats
	}

	pub fn dispatcher(&self) -> &DebouncedDispatcher<K, ()> {
		&self.dispatcher
	}

	/// Stops the refresh dispatcher and waits for running refreshes.
	pub async fn shutdown(&self) {
		self.dispatcher.shutdown().await;
	}
}
