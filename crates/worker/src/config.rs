use std::time::{Duration, Instant};

use crate::WorkClass;

/// Debounce windows per work class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
	pub active: Duration,
	pub open_documents: Duration,
	pub project: Duration,
	pub dependents: Duration,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			active: Duration::from_millis(100),
			open_documents: Duration::from_millis(500),
			project: Duration::from_millis(1500),
			dependents: Duration::from_millis(3000),
		}
	}
}

impl BackoffConfig {
	/// Same window for every class.
	pub fn uniform(window: Duration) -> Self {
		Self {
			active: window,
			open_documents: window,
			project: window,
			dependents: window,
		}
	}

	pub fn window(&self, class: WorkClass) -> Duration {
		match class {
			WorkClass::Active => self.active,
			WorkClass::OpenDocuments => self.open_documents,
			WorkClass::Project => self.project,
			WorkClass::Dependents => self.dependents,
		}
	}
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub(crate) backoff: BackoffConfig,
	pub(crate) max_concurrency: usize,
	pub(crate) event_buffer: usize,
	pub(crate) max_delay: Duration,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			backoff: BackoffConfig::default(),
			max_concurrency: 2,
			event_buffer: 64,
			max_delay: Duration::from_secs(10),
		}
	}
}

impl DispatcherConfig {
	#[must_use]
	pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
		self.backoff = backoff;
		self
	}

	/// Caps handlers running at once across keys. Clamped to at least 1.
	#[must_use]
	pub fn max_concurrency(mut self, max: usize) -> Self {
		self.max_concurrency = max.max(1);
		self
	}

	/// Sets the event broadcast buffer capacity.
	///
	/// # Panics
	///
	/// Panics if `size` is zero.
	#[must_use]
	pub fn event_buffer(mut self, size: usize) -> Self {
		assert!(size > 0, "event buffer size must be > 0");
		self.event_buffer = size;
		self
	}

	/// Caps how long a key that keeps receiving work may wait after its
	/// first pending request. Never shorter than the key's own window.
	#[must_use]
	pub fn max_delay(mut self, max_delay: Duration) -> Self {
		self.max_delay = max_delay;
		self
	}

	/// When a pending item becomes due: its class window after the latest
	/// request, but no later than `max_delay` after the oldest one.
	pub fn due_at(&self, class: WorkClass, first: Instant, last: Instant) -> Instant {
		let window = self.backoff.window(class);
		(last + window).min(first + self.max_delay.max(window))
	}

	pub fn backoff_config(&self) -> &BackoffConfig {
		&self.backoff
	}

	pub fn concurrency(&self) -> usize {
		self.max_concurrency
	}

	pub fn delay_cap(&self) -> Duration {
		self.max_delay
	}
}
