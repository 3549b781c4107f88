use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::WorkClass;
use crate::listener::AsyncToken;

bitflags::bitflags! {
	/// Why a unit of work was requested.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct ChangeReasons: u16 {
		const DOCUMENT_ADDED = 1 << 0;
		const DOCUMENT_REMOVED = 1 << 1;
		const SYNTAX_CHANGED = 1 << 2;
		const SEMANTIC_CHANGED = 1 << 3;
		const PROJECT_CONFIGURATION_CHANGED = 1 << 4;
		const PROJECT_DEPENDENCY_CHANGED = 1 << 5;
		/// Explicit bulk re-trigger.
		const REANALYZE = 1 << 6;
	}
}

/// Portion of a key that needs work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkScope<S>
where
	S: Eq + Hash,
{
	/// Everything under the key.
	Full,
	/// Only the listed sub-keys.
	Partial(FxHashSet<S>),
}

impl<S> WorkScope<S>
where
	S: Eq + Hash,
{
	pub fn partial(items: impl IntoIterator<Item = S>) -> Self {
		Self::Partial(items.into_iter().collect())
	}

	pub fn is_full(&self) -> bool {
		matches!(self, Self::Full)
	}

	pub fn contains(&self, sub: &S) -> bool {
		match self {
			Self::Full => true,
			Self::Partial(set) => set.contains(sub),
		}
	}

	/// Unions `other` into `self`. `Full` absorbs any partial scope.
	pub fn merge(&mut self, other: Self) {
		match (&mut *self, other) {
			(Self::Full, _) => {}
			(this, Self::Full) => *this = Self::Full,
			(Self::Partial(mine), Self::Partial(theirs)) => mine.extend(theirs),
		}
	}
}

/// One pending unit of work, coalesced by key inside a
/// [`KeyedWorkQueue`](crate::KeyedWorkQueue).
#[derive(Debug)]
pub struct WorkItem<K, S>
where
	S: Eq + Hash,
{
	key: K,
	scope: WorkScope<S>,
	reasons: ChangeReasons,
	/// `None` targets every analyzer.
	analyzers: Option<FxHashSet<Arc<str>>>,
	class: WorkClass,
	first_enqueued_at: Instant,
	enqueued_at: Instant,
	token: Option<AsyncToken>,
}

impl<K, S> WorkItem<K, S>
where
	S: Eq + Hash,
{
	/// Creates a full-scope item targeting every analyzer.
	pub fn new(key: K, class: WorkClass) -> Self {
		let now = Instant::now();
		Self {
			key,
			scope: WorkScope::Full,
			reasons: ChangeReasons::empty(),
			analyzers: None,
			class,
			first_enqueued_at: now,
			enqueued_at: now,
			token: None,
		}
	}

	#[must_use]
	pub fn scope(mut self, scope: WorkScope<S>) -> Self {
		self.scope = scope;
		self
	}

	#[must_use]
	pub fn reasons(mut self, reasons: ChangeReasons) -> Self {
		self.reasons = reasons;
		self
	}

	/// Restricts the item to one named analyzer. Repeated calls accumulate.
	#[must_use]
	pub fn analyzer(mut self, name: impl Into<Arc<str>>) -> Self {
		self.analyzers.get_or_insert_with(FxHashSet::default).insert(name.into());
		self
	}

	#[must_use]
	pub fn with_token(mut self, token: AsyncToken) -> Self {
		self.token = Some(token);
		self
	}

	pub fn key(&self) -> &K {
		&self.key
	}

	pub fn work_scope(&self) -> &WorkScope<S> {
		&self.scope
	}

	pub fn change_reasons(&self) -> ChangeReasons {
		self.reasons
	}

	pub fn class(&self) -> WorkClass {
		self.class
	}

	/// Time of the latest request folded into this item.
	pub fn enqueued_at(&self) -> Instant {
		self.enqueued_at
	}

	/// Time of the oldest request folded into this item.
	pub fn first_enqueued_at(&self) -> Instant {
		self.first_enqueued_at
	}

	/// Whether the analyzer named `name` should run for this item.
	pub fn targets(&self, name: &str) -> bool {
		self.analyzers.as_ref().is_none_or(|set| set.contains(name))
	}

	pub fn analyzer_filter(&self) -> Option<&FxHashSet<Arc<str>>> {
		self.analyzers.as_ref()
	}

	/// Detaches the release token so it can outlive the item.
	pub fn take_token(&mut self) -> Option<AsyncToken> {
		self.token.take()
	}

	/// Folds a newer request for the same key into this one.
	///
	/// Scopes, reasons and analyzer filters are unioned, the most urgent class
	/// is kept, and the older release token is dropped in favour of the newer.
	pub(crate) fn merge(&mut self, newer: Self) {
		let Self {
			scope,
			reasons,
			analyzers,
			class,
			first_enqueued_at,
			enqueued_at,
			token,
			..
		} = newer;

		self.scope.merge(scope);
		self.reasons |= reasons;
		self.analyzers = match (self.analyzers.take(), analyzers) {
			(Some(mut mine), Some(theirs)) => {
				mine.extend(theirs);
				Some(mine)
			}
			_ => None,
		};
		self.class = self.class.most_urgent(class);
		self.first_enqueued_at = self.first_enqueued_at.min(first_enqueued_at);
		self.enqueued_at = self.enqueued_at.max(enqueued_at);
		if token.is_some() {
			self.token = token;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::AsyncListener;

	type Item = WorkItem<u32, u32>;

	#[test]
	fn full_scope_absorbs_partial() {
		let mut scope = WorkScope::partial([1u32, 2]);
		scope.merge(WorkScope::Full);
		assert!(scope.is_full());

		let mut full: WorkScope<u32> = WorkScope::Full;
		full.merge(WorkScope::partial([3]));
		assert!(full.is_full());
	}

	#[test]
	fn partial_scopes_union() {
		let mut scope = WorkScope::partial([1u32, 2]);
		scope.merge(WorkScope::partial([2, 3]));
		assert_eq!(scope, WorkScope::partial([1, 2, 3]));
	}

	#[test]
	fn merge_keeps_most_urgent_class_and_unions_reasons() {
		let mut item = Item::new(7, WorkClass::Dependents).reasons(ChangeReasons::SYNTAX_CHANGED);
		item.merge(Item::new(7, WorkClass::Active).reasons(ChangeReasons::SEMANTIC_CHANGED));

		assert_eq!(item.class(), WorkClass::Active);
		assert_eq!(item.change_reasons(), ChangeReasons::SYNTAX_CHANGED | ChangeReasons::SEMANTIC_CHANGED);
	}

	#[test]
	fn merge_spans_oldest_and_newest_request() {
		let mut item = Item::new(7, WorkClass::Project);
		let first = item.first_enqueued_at();
		std::thread::sleep(std::time::Duration::from_millis(2));
		item.merge(Item::new(7, WorkClass::Project));

		assert_eq!(item.first_enqueued_at(), first);
		assert!(item.enqueued_at() > first);
	}

	#[test]
	fn unrestricted_analyzer_filter_wins() {
		let mut item = Item::new(1, WorkClass::Project).analyzer("diagnostics");
		assert!(item.targets("diagnostics"));
		assert!(!item.targets("symbols"));

		item.merge(Item::new(1, WorkClass::Project));
		assert!(item.analyzer_filter().is_none());
		assert!(item.targets("symbols"));
	}

	#[test]
	fn restricted_analyzer_filters_union() {
		let mut item = Item::new(1, WorkClass::Project).analyzer("a");
		item.merge(Item::new(1, WorkClass::Project).analyzer("b"));
		assert!(item.targets("a"));
		assert!(item.targets("b"));
		assert!(!item.targets("c"));
	}

	#[test]
	fn merge_releases_superseded_token() {
		let listener = AsyncListener::new();
		let mut item = Item::new(1, WorkClass::Project).with_token(listener.begin("first"));
		item.merge(Item::new(1, WorkClass::Project).with_token(listener.begin("second")));

		assert_eq!(listener.pending(), 1);
		assert_eq!(item.take_token().map(|t| t.label()), Some("second"));
	}
}
