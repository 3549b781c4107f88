use std::fmt;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::item::WorkItem;
use crate::queue::{InsertionOrder, KeyedWorkQueue, TakePriority};
use crate::spawn::join_error_panic_message;
use crate::token::WorkLease;

/// Outcome of a handler that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
	/// The handler observed its lease being cancelled. Never logged as a
	/// failure.
	#[error("cancelled")]
	Cancelled,
	/// Transient failure. Logged; the dispatcher keeps going.
	#[error("handler failed: {0}")]
	Failed(String),
	/// The host itself is inconsistent. The dispatcher requests shutdown and
	/// stops.
	#[error("host fault: {0}")]
	HostFault(String),
}

impl HandlerError {
	pub fn failed(err: impl fmt::Display) -> Self {
		Self::Failed(err.to_string())
	}
}

/// Work executed by a [`DebouncedDispatcher`] for each taken item.
///
/// Handlers are cooperative: they are never aborted, so long-running work
/// should watch [`WorkLease::cancelled`] and return
/// [`HandlerError::Cancelled`] promptly once a newer item for the same key
/// supersedes it.
#[async_trait]
pub trait WorkHandler<K, S>: Send + Sync + 'static
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash + Send + Sync + 'static,
{
	async fn handle(&self, item: WorkItem<K, S>, lease: &WorkLease<K>) -> Result<(), HandlerError>;
}

/// Supplies fresh priority knowledge at the start of every drain cycle.
pub trait PrioritySource<K>: Send + Sync + 'static {
	fn snapshot(&self) -> Arc<dyn TakePriority<K> + Send + Sync>;
}

impl<K: 'static> PrioritySource<K> for InsertionOrder {
	fn snapshot(&self) -> Arc<dyn TakePriority<K> + Send + Sync> {
		Arc::new(InsertionOrder)
	}
}

/// Drain loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DispatcherState {
	/// Waiting for work to arrive.
	Idle = 0,
	/// Work is pending; waiting out the debounce window.
	Waiting = 1,
	/// Taking items and handing them to the handler.
	Draining = 2,
	ShuttingDown = 3,
	Stopped = 4,
}

impl DispatcherState {
	const fn from_u8(raw: u8) -> Self {
		match raw {
			0 => Self::Idle,
			1 => Self::Waiting,
			2 => Self::Draining,
			3 => Self::ShuttingDown,
			_ => Self::Stopped,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Idle => "idle",
			Self::Waiting => "waiting",
			Self::Draining => "draining",
			Self::ShuttingDown => "shutting_down",
			Self::Stopped => "stopped",
		}
	}

	fn is_terminal(self) -> bool {
		self >= Self::ShuttingDown
	}
}

/// Lifecycle notifications broadcast to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherEvent {
	/// Work arrived while the dispatcher was idle.
	Busy,
	/// Nothing pending and no handler running.
	Idle,
	/// A handler reported a host fault; the dispatcher is stopping.
	ShutdownRequested,
	Stopped,
}

#[derive(Debug)]
struct Shared {
	state: AtomicU8,
	running: AtomicUsize,
}

impl Shared {
	fn state(&self) -> DispatcherState {
		DispatcherState::from_u8(self.state.load(Ordering::Acquire))
	}

	/// Moves to `next` unless shutdown has already begun.
	fn advance(&self, next: DispatcherState) {
		let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
			let current = DispatcherState::from_u8(raw);
			(!current.is_terminal() || next > current).then_some(next as u8)
		});
	}
}

/// Continuously drains one [`KeyedWorkQueue`], debouncing bursts of work
/// and running at most one handler per key at a time.
///
/// The drain loop runs on its own task. Handlers for different keys run
/// concurrently up to the configured limit. Dropping the dispatcher cancels
/// it without waiting; use [`shutdown`](Self::shutdown) to wait for in-flight
/// handlers.
pub struct DebouncedDispatcher<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash + Send + Sync + 'static,
{
	name: Arc<str>,
	queue: Arc<KeyedWorkQueue<K, S>>,
	shared: Arc<Shared>,
	events: broadcast::Sender<DispatcherEvent>,
	cancel: CancellationToken,
	stopped: watch::Receiver<bool>,
}

impl<K, S> DebouncedDispatcher<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash + Send + Sync + 'static,
{
	/// Starts a dispatcher that takes keys in insertion order.
	pub fn start(name: impl Into<Arc<str>>, config: DispatcherConfig, handler: Arc<dyn WorkHandler<K, S>>) -> Self {
		Self::start_with_priority(name, config, handler, Arc::new(InsertionOrder))
	}

	/// Starts a dispatcher whose take order is driven by `priority`, which is
	/// re-snapshotted at the start of every drain cycle.
	pub fn start_with_priority(
		name: impl Into<Arc<str>>,
		config: DispatcherConfig,
		handler: Arc<dyn WorkHandler<K, S>>,
		priority: Arc<dyn PrioritySource<K>>,
	) -> Self {
		let name = name.into();
		let queue = Arc::new(KeyedWorkQueue::new());
		let shared = Arc::new(Shared {
			state: AtomicU8::new(DispatcherState::Idle as u8),
			running: AtomicUsize::new(0),
		});
		let (events, _) = broadcast::channel(config.event_buffer.max(1));
		let cancel = CancellationToken::new();
		let (stopped_tx, stopped) = watch::channel(false);

		tracing::debug!(
			dispatcher = %name,
			max_concurrency = config.max_concurrency,
			"dispatcher.start"
		);

		let drain = DrainLoop {
			name: Arc::clone(&name),
			queue: Arc::clone(&queue),
			handler,
			priority,
			permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
			config,
			shared: Arc::clone(&shared),
			events: events.clone(),
			cancel: cancel.clone(),
			stopped: stopped_tx,
			tasks: JoinSet::new(),
			in_flight: FxHashMap::default(),
			gates: FxHashMap::default(),
			busy: false,
		};
		crate::spawn("dispatcher", drain.run());

		Self {
			name,
			queue,
			shared,
			events,
			cancel,
			stopped,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Offers an item to the queue. Returns `true` if it created a new pending
	/// entry; `false` if it coalesced or the dispatcher is shutting down.
	pub fn enqueue(&self, item: WorkItem<K, S>) -> bool {
		if self.cancel.is_cancelled() {
			tracing::trace!(dispatcher = %self.name, key = ?item.key(), "dispatcher.enqueue_rejected");
			return false;
		}
		self.queue.add_or_replace(item)
	}

	pub fn queue(&self) -> &KeyedWorkQueue<K, S> {
		&self.queue
	}

	pub fn state(&self) -> DispatcherState {
		self.shared.state()
	}

	/// Handlers currently executing or waiting on their key's gate.
	pub fn running(&self) -> usize {
		self.shared.running.load(Ordering::Acquire)
	}

	pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
		self.events.subscribe()
	}

	/// Cancels in-flight handlers while keeping queued work.
	pub fn request_cancellation_on_running_tasks(&self) {
		self.queue.request_cancellation_on_running_tasks();
	}

	pub fn is_stopped(&self) -> bool {
		*self.stopped.borrow()
	}

	/// Requests shutdown without waiting for it.
	pub fn stop(&self) {
		self.shared.advance(DispatcherState::ShuttingDown);
		self.cancel.cancel();
	}

	/// Stops the dispatcher and waits until every in-flight handler has
	/// returned. Idempotent; concurrent callers all wait.
	pub async fn shutdown(&self) {
		self.stop();
		let mut stopped = self.stopped.clone();
		let _ = stopped.wait_for(|stopped| *stopped).await;
	}
}

impl<K, S> Drop for DebouncedDispatcher<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash + Send + Sync + 'static,
{
	fn drop(&mut self) {
		self.cancel.cancel();
		self.queue.dispose();
	}
}

impl<K, S> fmt::Debug for DebouncedDispatcher<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash + Send + Sync + 'static,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DebouncedDispatcher")
			.field("name", &self.name)
			.field("state", &self.state())
			.field("pending", &self.queue.len())
			.field("running", &self.running())
			.finish()
	}
}

/// A failure reported after the lease was cancelled is treated as
/// cancellation. Host faults are kept.
fn quiet_if_superseded<K>(outcome: Result<(), HandlerError>, lease: &WorkLease<K>) -> Result<(), HandlerError>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
{
	match outcome {
		Err(HandlerError::Failed(_)) if lease.is_cancelled() => Err(HandlerError::Cancelled),
		outcome => outcome,
	}
}

type Joined = Result<(Id, Result<(), HandlerError>), JoinError>;

struct DrainLoop<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash + Send + Sync + 'static,
{
	name: Arc<str>,
	queue: Arc<KeyedWorkQueue<K, S>>,
	handler: Arc<dyn WorkHandler<K, S>>,
	priority: Arc<dyn PrioritySource<K>>,
	config: DispatcherConfig,
	permits: Arc<Semaphore>,
	shared: Arc<Shared>,
	events: broadcast::Sender<DispatcherEvent>,
	cancel: CancellationToken,
	stopped: watch::Sender<bool>,
	tasks: JoinSet<Result<(), HandlerError>>,
	in_flight: FxHashMap<Id, K>,
	/// Per-key execution gates. An entry lives while some task holds it.
	gates: FxHashMap<K, Arc<tokio::sync::Mutex<()>>>,
	busy: bool,
}

impl<K, S> DrainLoop<K, S>
where
	K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
	S: Eq + Hash + Send + Sync + 'static,
{
	async fn run(mut self) {
		loop {
			self.shared.advance(DispatcherState::Idle);
			tokio::select! {
				biased;
				_ = self.cancel.cancelled() => break,
				joined = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
					if let Some(joined) = joined
						&& self.on_joined(joined).is_break()
					{
						break;
					}
					self.maybe_idle();
					continue;
				}
				_ = self.queue.wait_for_work() => {}
			}
			if self.queue.is_disposed() {
				break;
			}
			if !self.busy {
				self.busy = true;
				self.emit(DispatcherEvent::Busy);
			}

			if self.debounce().await.is_break() || self.drain().await.is_break() {
				break;
			}
			self.maybe_idle();
		}
		self.finish().await;
	}

	/// Sleeps until some pending key is due. Each key is timed from its own
	/// requests, so work for one key never postpones another.
	async fn debounce(&mut self) -> ControlFlow<()> {
		self.shared.advance(DispatcherState::Waiting);
		while let Some(deadline) = self.queue.next_due(&self.config) {
			if Instant::now() >= deadline {
				break;
			}
			tokio::select! {
				biased;
				_ = self.cancel.cancelled() => return ControlFlow::Break(()),
				joined = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
					if let Some(joined) = joined {
						self.on_joined(joined)?;
					}
				}
				_ = self.queue.changed() => {}
				_ = tokio::time::sleep_until(deadline.into()) => {}
			}
		}
		ControlFlow::Continue(())
	}

	async fn drain(&mut self) -> ControlFlow<()> {
		self.shared.advance(DispatcherState::Draining);
		let priority = self.priority.snapshot();
		tracing::trace!(dispatcher = %self.name, pending = self.queue.len(), "dispatcher.drain");

		while let Some((item, lease)) = self.queue.try_take_due(&self.config, Instant::now(), priority.preferred(), &*priority) {
			let permit = loop {
				tokio::select! {
					biased;
					_ = self.cancel.cancelled() => return ControlFlow::Break(()),
					joined = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
						if let Some(joined) = joined {
							self.on_joined(joined)?;
						}
					}
					permit = Arc::clone(&self.permits).acquire_owned() => match permit {
						Ok(permit) => break permit,
						Err(_) => return ControlFlow::Break(()),
					},
				}
			};
			self.dispatch(item, lease, permit);
		}
		ControlFlow::Continue(())
	}

	fn dispatch(&mut self, mut item: WorkItem<K, S>, lease: WorkLease<K>, permit: OwnedSemaphorePermit) {
		let key = item.key().clone();
		let gate = Arc::clone(self.gates.entry(key.clone()).or_default());
		let handler = Arc::clone(&self.handler);
		let release = item.take_token();

		tracing::trace!(
			dispatcher = %self.name,
			key = ?key,
			generation = lease.generation(),
			class = item.class().as_str(),
			"dispatcher.dispatch"
		);

		self.shared.running.fetch_add(1, Ordering::AcqRel);
		let abort = self.tasks.spawn(async move {
			let _permit = permit;
			let _release = release;
			// Waits for the previous handler of this key to return.
			let _gate = gate.lock_owned().await;
			if lease.is_cancelled() {
				return Err(HandlerError::Cancelled);
			}
			let outcome = handler.handle(item, &lease).await;
			quiet_if_superseded(outcome, &lease)
		});
		self.in_flight.insert(abort.id(), key);
	}

	fn on_joined(&mut self, joined: Joined) -> ControlFlow<()> {
		let (id, outcome) = match joined {
			Ok((id, result)) => (id, Ok(result)),
			Err(err) => (err.id(), Err(err)),
		};
		let key = self.in_flight.remove(&id);
		let _ = self
			.shared
			.running
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
		self.gates.retain(|_, gate| Arc::strong_count(gate) > 1);

		match outcome {
			Ok(Ok(())) => {
				tracing::trace!(dispatcher = %self.name, key = ?key, "dispatcher.complete");
			}
			Ok(Err(HandlerError::Cancelled)) => {
				tracing::trace!(dispatcher = %self.name, key = ?key, "dispatcher.cancelled");
			}
			Ok(Err(HandlerError::Failed(error))) => {
				tracing::warn!(dispatcher = %self.name, key = ?key, %error, "dispatcher.handler_failed");
			}
			Ok(Err(HandlerError::HostFault(error))) => {
				tracing::error!(dispatcher = %self.name, key = ?key, %error, "dispatcher.host_fault");
				self.emit(DispatcherEvent::ShutdownRequested);
				return ControlFlow::Break(());
			}
			Err(err) => {
				let panic = join_error_panic_message(err).unwrap_or_else(|| "<aborted>".to_string());
				tracing::warn!(dispatcher = %self.name, key = ?key, %panic, "dispatcher.handler_panicked");
			}
		}
		ControlFlow::Continue(())
	}

	fn maybe_idle(&mut self) {
		if self.busy && !self.queue.has_pending() && self.tasks.is_empty() {
			self.busy = false;
			tracing::trace!(dispatcher = %self.name, "dispatcher.idle");
			self.emit(DispatcherEvent::Idle);
		}
	}

	fn emit(&self, event: DispatcherEvent) {
		let _ = self.events.send(event);
	}

	async fn finish(mut self) {
		self.shared.advance(DispatcherState::ShuttingDown);
		self.cancel.cancel();
		self.queue.dispose();

		tracing::debug!(dispatcher = %self.name, in_flight = self.tasks.len(), "dispatcher.shutdown");
		while let Some(joined) = self.tasks.join_next_with_id().await {
			let _ = self.on_joined(joined);
		}

		self.shared.advance(DispatcherState::Stopped);
		self.emit(DispatcherEvent::Stopped);
		let _ = self.stopped.send(true);
		tracing::debug!(dispatcher = %self.name, "dispatcher.stopped");
	}
}
