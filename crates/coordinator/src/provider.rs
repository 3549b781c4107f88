use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use kiln_worker::ChangeReasons;
use rustc_hash::FxBuildHasher;
use tokio_util::sync::CancellationToken;

use crate::error::AnalyzerError;
use crate::graph::GraphSnapshot;
use crate::ids::{DocumentId, ProjectId, WorkspaceId, WorkspaceKind};

/// Registration metadata for an analyzer provider.
///
/// A provider either lists the workspace kinds it applies to, or is the
/// default for its name and applies to every kind without a kind-specific
/// registration. Lower `priority` runs first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
	name: Arc<str>,
	kinds: Vec<WorkspaceKind>,
	is_default: bool,
	priority: i32,
}

impl ProviderDescriptor {
	/// A default provider for every workspace kind.
	pub fn new(name: impl Into<Arc<str>>) -> Self {
		Self {
			name: name.into(),
			kinds: Vec::new(),
			is_default: true,
			priority: 0,
		}
	}

	/// Restricts the provider to `kinds`; it is no longer a default.
	#[must_use]
	pub fn kinds(mut self, kinds: impl IntoIterator<Item = WorkspaceKind>) -> Self {
		self.kinds = kinds.into_iter().collect();
		self.is_default = self.kinds.is_empty();
		self
	}

	#[must_use]
	pub fn priority(mut self, priority: i32) -> Self {
		self.priority = priority;
		self
	}

	pub fn name(&self) -> &Arc<str> {
		&self.name
	}

	pub fn applicable_kinds(&self) -> &[WorkspaceKind] {
		&self.kinds
	}

	pub fn is_default(&self) -> bool {
		self.is_default
	}

	pub fn order(&self) -> i32 {
		self.priority
	}

	pub fn matches_exactly(&self, kind: &WorkspaceKind) -> bool {
		self.kinds.contains(kind)
	}
}

/// Creates an analyzer for each workspace the provider applies to.
pub trait AnalyzerProvider: Send + Sync + 'static {
	fn create(&self, workspace: &WorkspaceId) -> Arc<dyn IncrementalAnalyzer>;
}

impl<F> AnalyzerProvider for F
where
	F: Fn(&WorkspaceId) -> Arc<dyn IncrementalAnalyzer> + Send + Sync + 'static,
{
	fn create(&self, workspace: &WorkspaceId) -> Arc<dyn IncrementalAnalyzer> {
		self(workspace)
	}
}

/// State handed to analyzers for one project's work item.
#[derive(Clone)]
pub struct AnalysisContext {
	workspace: WorkspaceId,
	graph: Arc<dyn GraphSnapshot>,
	reasons: ChangeReasons,
	cancel: CancellationToken,
}

impl AnalysisContext {
	pub(crate) fn new(workspace: WorkspaceId, graph: Arc<dyn GraphSnapshot>, reasons: ChangeReasons, cancel: CancellationToken) -> Self {
		Self {
			workspace,
			graph,
			reasons,
			cancel,
		}
	}

	pub fn workspace(&self) -> &WorkspaceId {
		&self.workspace
	}

	pub fn graph(&self) -> &Arc<dyn GraphSnapshot> {
		&self.graph
	}

	pub fn reasons(&self) -> ChangeReasons {
		self.reasons
	}

	/// Cancelled once a newer item for the same project is taken, or the
	/// workspace shuts down.
	pub fn cancel(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}
}

/// Incremental analysis hooks. Every hook defaults to doing nothing.
#[async_trait]
pub trait IncrementalAnalyzer: Send + Sync + 'static {
	async fn analyze_document(&self, _ctx: &AnalysisContext, _document: DocumentId) -> Result<(), AnalyzerError> {
		Ok(())
	}

	async fn document_removed(&self, _ctx: &AnalysisContext, _document: DocumentId) -> Result<(), AnalyzerError> {
		Ok(())
	}

	async fn analyze_project(&self, _ctx: &AnalysisContext, _project: ProjectId) -> Result<(), AnalyzerError> {
		Ok(())
	}

	async fn project_removed(&self, _project: ProjectId) {}

	/// Runs after every project item, once the document and project passes
	/// are done.
	async fn batch_completed(&self, _graph: &dyn GraphSnapshot) {}

	async fn shutdown(&self) {}
}

#[derive(Clone)]
pub(crate) struct ProviderEntry {
	pub(crate) descriptor: ProviderDescriptor,
	pub(crate) provider: Arc<dyn AnalyzerProvider>,
}

/// Immutable provider table, grouped by name in registration order.
#[derive(Clone, Default)]
pub(crate) struct ProviderSet {
	groups: IndexMap<Arc<str>, Vec<ProviderEntry>, FxBuildHasher>,
}

impl ProviderSet {
	pub(crate) fn has_default(&self, name: &str) -> bool {
		self.groups.get(name).is_some_and(|group| group.iter().any(|entry| entry.descriptor.is_default()))
	}

	#[must_use]
	pub(crate) fn with(&self, entry: ProviderEntry) -> Self {
		let mut next = self.clone();
		next.groups.entry(Arc::clone(entry.descriptor.name())).or_default().push(entry);
		next
	}

	/// The entry that applies to `kind` for the group `name`: the first
	/// kind-specific registration, else the default, else none.
	pub(crate) fn resolve_name(&self, name: &str, kind: &WorkspaceKind) -> Option<&ProviderEntry> {
		let group = self.groups.get(name)?;
		if let Some(exact) = group.iter().find(|entry| entry.descriptor.matches_exactly(kind)) {
			return Some(exact);
		}
		group.iter().find(|entry| entry.descriptor.is_default())
	}

	/// Entries applying to `kind`, one per name, in run order.
	pub(crate) fn resolve(&self, kind: &WorkspaceKind) -> Vec<&ProviderEntry> {
		let mut entries: Vec<_> = self.groups.keys().filter_map(|name| self.resolve_name(name, kind)).collect();
		entries.sort_by(|a, b| {
			a.descriptor
				.order()
				.cmp(&b.descriptor.order())
				.then_with(|| a.descriptor.name().cmp(b.descriptor.name()))
		});
		entries
	}

	pub(crate) fn len(&self) -> usize {
		self.groups.values().map(Vec::len).sum()
	}
}
