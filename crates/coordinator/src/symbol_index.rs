//! Analyzer provider keeping a per-project and per-reference symbol index
//! fresh in an [`IncrementalIndexCache`].

use std::sync::Arc;

use async_trait::async_trait;
use kiln_index::{Checksum, IncrementalIndexCache, IndexCacheConfig, IndexError, IndexSource, PersistentStore, StoreKey};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::AnalyzerError;
use crate::graph::GraphSnapshot;
use crate::ids::{ProjectId, ReferenceId, WorkspaceId};
use crate::provider::{AnalysisContext, AnalyzerProvider, IncrementalAnalyzer, ProviderDescriptor};

pub const SYMBOL_INDEX: &str = "symbol_index";

/// Cache key of a symbol index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
	/// Symbols declared by one project of one workspace.
	Project(WorkspaceId, ProjectId),
	/// Symbols of an external reference, shared by every project using it.
	Reference(ReferenceId),
}

impl StoreKey for IndexKey {
	fn storage_name(&self) -> String {
		match self {
			Self::Project(workspace, project) => {
				let raw = format!("{workspace}/{}", project.0);
				format!("project-{}-{}", sanitize(&raw), Checksum::of_str(&raw))
			}
			Self::Reference(reference) => {
				format!("ref-{}-{}", sanitize(reference.as_str()), Checksum::of_str(reference.as_str()))
			}
		}
	}
}

fn sanitize(raw: &str) -> String {
	raw.chars()
		.take(48)
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
		.collect()
}

/// Graph node referencing a shared index entry.
pub type IndexNode = (WorkspaceId, ProjectId);

pub type SymbolCache<V> = IncrementalIndexCache<IndexKey, IndexNode, V>;

/// Provides one [`SymbolIndexAnalyzer`] per workspace, all sharing one
/// cache so reference indexes are computed once across projects.
pub struct SymbolIndexProvider<V>
where
	V: Send + Sync + 'static,
{
	cache: Arc<SymbolCache<V>>,
}

impl<V> SymbolIndexProvider<V>
where
	V: Send + Sync + 'static,
{
	pub fn new(source: Arc<dyn IndexSource<IndexKey, V>>, store: Arc<dyn PersistentStore<IndexKey, V>>, config: IndexCacheConfig) -> Self {
		Self {
			cache: Arc::new(IncrementalIndexCache::new(SYMBOL_INDEX, source, store, config)),
		}
	}

	/// Default registration: every workspace kind, after cheaper analyzers.
	pub fn descriptor() -> ProviderDescriptor {
		ProviderDescriptor::new(SYMBOL_INDEX).priority(100)
	}

	pub fn cache(&self) -> &Arc<SymbolCache<V>> {
		&self.cache
	}

	/// Stops the cache's refresh dispatcher.
	pub async fn shutdown(&self) {
		self.cache.shutdown().await;
	}
}

impl<V> AnalyzerProvider for SymbolIndexProvider<V>
where
	V: Send + Sync + 'static,
{
	fn create(&self, workspace: &WorkspaceId) -> Arc<dyn IncrementalAnalyzer> {
		Arc::new(SymbolIndexAnalyzer {
			workspace: workspace.clone(),
			cache: Arc::clone(&self.cache),
			used: Mutex::new(FxHashMap::default()),
		})
	}
}

pub struct SymbolIndexAnalyzer<V>
where
	V: Send + Sync + 'static,
{
	workspace: WorkspaceId,
	cache: Arc<SymbolCache<V>>,
	/// References each project used at its last analysis.
	used: Mutex<FxHashMap<ProjectId, FxHashSet<ReferenceId>>>,
}

impl<V> SymbolIndexAnalyzer<V>
where
	V: Send + Sync + 'static,
{
	fn node(&self, project: ProjectId) -> IndexNode {
		(self.workspace.clone(), project)
	}

	/// Swaps in the project's current references and releases the dropped
	/// ones.
	fn track_references(&self, project: ProjectId, current: &[ReferenceId]) {
		let node = self.node(project);
		let current: FxHashSet<_> = current.iter().cloned().collect();
		for reference in &current {
			self.cache.add_reference(&IndexKey::Reference(reference.clone()), node.clone());
		}
		let previous = self.used.lock().insert(project, current.clone()).unwrap_or_default();
		for dropped in previous.difference(&current) {
			self.cache.remove_reference(&IndexKey::Reference(dropped.clone()), &node);
		}
	}
}

fn analyzer_error(err: IndexError) -> AnalyzerError {
	match err {
		IndexError::Cancelled => AnalyzerError::Cancelled,
		other => AnalyzerError::failed(other),
	}
}

#[async_trait]
impl<V> IncrementalAnalyzer for SymbolIndexAnalyzer<V>
where
	V: Send + Sync + 'static,
{
	async fn analyze_project(&self, ctx: &AnalysisContext, project: ProjectId) -> Result<(), AnalyzerError> {
		let references = ctx.graph().references(project);
		self.track_references(project, &references);

		let key = IndexKey::Project(self.workspace.clone(), project);
		let outcome = self.cache.refresh_if_checksum_differs(&key, ctx.cancel()).await.map_err(analyzer_error)?;
		tracing::trace!(workspace = %self.workspace, ?project, ?outcome, "symbol_index.project");

		let mut first_failure = None;
		for reference in references {
			let key = IndexKey::Reference(reference);
			match self.cache.refresh_if_checksum_differs(&key, ctx.cancel()).await {
				Ok(outcome) => tracing::trace!(?key, ?outcome, "symbol_index.reference"),
				Err(IndexError::Cancelled) => return Err(AnalyzerError::Cancelled),
				Err(err) => {
					first_failure.get_or_insert(analyzer_error(err));
				}
			}
		}
		first_failure.map_or(Ok(()), Err)
	}

	async fn project_removed(&self, project: ProjectId) {
		self.used.lock().remove(&project);
		let evicted = self.cache.evict(&self.node(project));
		tracing::debug!(workspace = %self.workspace, ?project, evicted, "symbol_index.project_removed");
	}

	async fn batch_completed(&self, graph: &dyn GraphSnapshot) {
		self.cache.sweep(|key| match key {
			IndexKey::Project(workspace, project) if *workspace == self.workspace => graph.contains_project(*project),
			IndexKey::Project(..) | IndexKey::Reference(_) => true,
		});
	}

	/// Releases every reference this workspace holds and drops its project
	/// indexes. Other workspaces keep their shared entries.
	async fn shutdown(&self) {
		let projects: Vec<ProjectId> = self.used.lock().drain().map(|(project, _)| project).collect();
		let evicted: usize = projects.into_iter().map(|project| self.cache.evict(&self.node(project))).sum();
		let swept = self
			.cache
			.sweep(|key| !matches!(key, IndexKey::Project(workspace, _) if *workspace == self.workspace));
		tracing::debug!(workspace = %self.workspace, evicted, swept, "symbol_index.released");
	}
}
