use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use kiln_worker::{PrioritySource, TakePriority};
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

use crate::ids::{DocumentId, ProjectId, ReferenceId};

/// Read-only view of the host's projects, documents and dependency edges.
///
/// Snapshots are fetched fresh for every drain cycle and never cached by the
/// coordinator.
pub trait GraphSnapshot: Send + Sync {
	fn projects(&self) -> Vec<ProjectId>;

	fn contains_project(&self, project: ProjectId) -> bool;

	fn documents(&self, project: ProjectId) -> Vec<DocumentId>;

	fn project_of(&self, document: DocumentId) -> Option<ProjectId>;

	/// Whether `project` directly depends on `on`.
	fn depends_on(&self, project: ProjectId, on: ProjectId) -> bool;

	/// External references used by `project`.
	fn references(&self, project: ProjectId) -> Vec<ReferenceId>;

	fn has_known_problems(&self, project: ProjectId) -> bool;

	/// The document the user is focused on.
	fn active_document(&self) -> Option<DocumentId>;
}

/// Supplies the current graph on demand.
pub trait GraphSource: Send + Sync + 'static {
	fn current(&self) -> Arc<dyn GraphSnapshot>;
}

impl<F> GraphSource for F
where
	F: Fn() -> Arc<dyn GraphSnapshot> + Send + Sync + 'static,
{
	fn current(&self) -> Arc<dyn GraphSnapshot> {
		self()
	}
}

#[derive(Debug, Clone, Default)]
struct ProjectNode {
	documents: Vec<DocumentId>,
	dependencies: FxHashSet<ProjectId>,
	references: Vec<ReferenceId>,
	has_problems: bool,
}

/// Immutable in-memory graph built up front.
#[derive(Debug, Clone, Default)]
pub struct StaticGraph {
	projects: IndexMap<ProjectId, ProjectNode, FxBuildHasher>,
	owners: FxHashMap<DocumentId, ProjectId>,
	active: Option<DocumentId>,
}

impl StaticGraph {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_project(mut self, project: ProjectId) -> Self {
		self.projects.entry(project).or_default();
		self
	}

	/// Adds `document` to `project`, creating the project if needed.
	#[must_use]
	pub fn with_document(mut self, project: ProjectId, document: DocumentId) -> Self {
		let node = self.projects.entry(project).or_default();
		if !node.documents.contains(&document) {
			node.documents.push(document);
		}
		if let Some(previous) = self.owners.insert(document, project)
			&& previous != project
			&& let Some(old) = self.projects.get_mut(&previous)
		{
			old.documents.retain(|doc| *doc != document);
		}
		self
	}

	#[must_use]
	pub fn with_dependency(mut self, project: ProjectId, on: ProjectId) -> Self {
		self.projects.entry(project).or_default().dependencies.insert(on);
		self
	}

	#[must_use]
	pub fn with_reference(mut self, project: ProjectId, reference: ReferenceId) -> Self {
		let node = self.projects.entry(project).or_default();
		if !node.references.contains(&reference) {
			node.references.push(reference);
		}
		self
	}

	#[must_use]
	pub fn with_problems(mut self, project: ProjectId, has_problems: bool) -> Self {
		self.projects.entry(project).or_default().has_problems = has_problems;
		self
	}

	#[must_use]
	pub fn with_active_document(mut self, document: Option<DocumentId>) -> Self {
		self.active = document;
		self
	}

	/// Drops `project`, its documents and every edge pointing at it.
	#[must_use]
	pub fn without_project(mut self, project: ProjectId) -> Self {
		if let Some(node) = self.projects.shift_remove(&project) {
			for document in node.documents {
				self.owners.remove(&document);
			}
		}
		for node in self.projects.values_mut() {
			node.dependencies.remove(&project);
		}
		if self.active.is_some_and(|doc| !self.owners.contains_key(&doc)) {
			self.active = None;
		}
		self
	}

	#[must_use]
	pub fn without_document(mut self, document: DocumentId) -> Self {
		if let Some(project) = self.owners.remove(&document)
			&& let Some(node) = self.projects.get_mut(&project)
		{
			node.documents.retain(|doc| *doc != document);
		}
		if self.active == Some(document) {
			self.active = None;
		}
		self
	}
}

impl GraphSnapshot for StaticGraph {
	fn projects(&self) -> Vec<ProjectId> {
		self.projects.keys().copied().collect()
	}

	fn contains_project(&self, project: ProjectId) -> bool {
		self.projects.contains_key(&project)
	}

	fn documents(&self, project: ProjectId) -> Vec<DocumentId> {
		self.projects.get(&project).map(|node| node.documents.clone()).unwrap_or_default()
	}

	fn project_of(&self, document: DocumentId) -> Option<ProjectId> {
		self.owners.get(&document).copied()
	}

	fn depends_on(&self, project: ProjectId, on: ProjectId) -> bool {
		self.projects.get(&project).is_some_and(|node| node.dependencies.contains(&on))
	}

	fn references(&self, project: ProjectId) -> Vec<ReferenceId> {
		self.projects.get(&project).map(|node| node.references.clone()).unwrap_or_default()
	}

	fn has_known_problems(&self, project: ProjectId) -> bool {
		self.projects.get(&project).is_some_and(|node| node.has_problems)
	}

	fn active_document(&self) -> Option<DocumentId> {
		self.active
	}
}

/// Graph slot a host republishes whenever its topology changes.
pub struct SharedGraph {
	current: ArcSwap<StaticGraph>,
}

impl SharedGraph {
	pub fn new(graph: StaticGraph) -> Self {
		Self {
			current: ArcSwap::from_pointee(graph),
		}
	}

	pub fn publish(&self, graph: StaticGraph) {
		self.current.store(Arc::new(graph));
	}

	/// Applies `edit` to the current graph and publishes the result.
	pub fn update(&self, edit: impl Fn(StaticGraph) -> StaticGraph) {
		self.current.rcu(|graph| edit(StaticGraph::clone(graph)));
	}

	pub fn load(&self) -> Arc<StaticGraph> {
		self.current.load_full()
	}
}

impl GraphSource for SharedGraph {
	fn current(&self) -> Arc<dyn GraphSnapshot> {
		self.current.load_full()
	}
}

/// Take order for a workspace's project queue: the active document's
/// project first, then dependents of it with known problems, then any
/// project with known problems.
pub(crate) struct GraphPriority {
	graph: Arc<dyn GraphSnapshot>,
	preferred: Option<ProjectId>,
}

impl GraphPriority {
	pub(crate) fn new(graph: Arc<dyn GraphSnapshot>) -> Self {
		let preferred = graph.active_document().and_then(|doc| graph.project_of(doc));
		Self { graph, preferred }
	}
}

impl TakePriority<ProjectId> for GraphPriority {
	fn preferred(&self) -> Option<&ProjectId> {
		self.preferred.as_ref()
	}

	fn is_direct_dependent(&self, key: &ProjectId, on: &ProjectId) -> bool {
		self.graph.depends_on(*key, *on)
	}

	fn has_known_problems(&self, key: &ProjectId) -> bool {
		self.graph.has_known_problems(*key)
	}
}

pub(crate) struct GraphPrioritySource {
	source: Arc<dyn GraphSource>,
}

impl GraphPrioritySource {
	pub(crate) fn new(source: Arc<dyn GraphSource>) -> Self {
		Self { source }
	}
}

impl PrioritySource<ProjectId> for GraphPrioritySource {
	fn snapshot(&self) -> Arc<dyn TakePriority<ProjectId> + Send + Sync> {
		Arc::new(GraphPriority::new(self.source.current()))
	}
}
