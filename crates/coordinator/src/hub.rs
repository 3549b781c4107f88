use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use kiln_worker::{AsyncListener, ChangeReasons, DebouncedDispatcher, DispatcherEvent, WorkClass, WorkItem, WorkScope};
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use tokio::sync::broadcast::error::RecvError;

use crate::config::CoordinatorConfig;
use crate::graph::{GraphPrioritySource, GraphSource};
use crate::handler::{AnalysisHandler, AnalyzerSet, AttachedAnalyzer, sort_analyzers};
use crate::ids::{DocumentId, HostId, ProjectId, WorkspaceId, WorkspaceKind};
use crate::provider::{AnalyzerProvider, ProviderDescriptor, ProviderEntry, ProviderSet};

/// What changed in a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTarget {
	/// One document of a project was added, edited or removed.
	Document { project: ProjectId, document: DocumentId },
	/// Project-level input changed (options, references).
	Project(ProjectId),
	/// The project left the graph.
	ProjectRemoved(ProjectId),
}

/// Subset of the graph a bulk reanalysis covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReanalyzeScope {
	All,
	Projects(Vec<ProjectId>),
	Documents(Vec<DocumentId>),
}

type AnalysisDispatcher = DebouncedDispatcher<ProjectId, DocumentId>;

struct Workspace {
	id: WorkspaceId,
	graph: Arc<dyn GraphSource>,
	analyzers: Arc<AnalyzerSet>,
	dispatcher: AnalysisDispatcher,
}

impl Workspace {
	async fn shutdown(&self) {
		self.dispatcher.shutdown().await;
		for attached in self.analyzers.load_full().iter() {
			attached.analyzer.shutdown().await;
		}
		tracing::debug!(workspace = %self.id, "coordinator.workspace_stopped");
	}
}

#[derive(Default)]
struct HubState {
	workspaces: IndexMap<WorkspaceId, Arc<Workspace>, FxBuildHasher>,
	stopped: bool,
}

struct HubInner {
	config: CoordinatorConfig,
	/// Replaced whole under `state`'s lock; readers never see a partial set.
	providers: ArcSwap<ProviderSet>,
	state: Mutex<HubState>,
	listener: AsyncListener,
}

impl HubInner {
	fn workspace(&self, id: &WorkspaceId) -> Option<Arc<Workspace>> {
		let state = self.state.lock();
		if state.stopped {
			return None;
		}
		state.workspaces.get(id).cloned()
	}

	/// Marks the hub stopped and hands back every live workspace.
	fn stop_all(&self) -> Vec<Arc<Workspace>> {
		let mut state = self.state.lock();
		state.stopped = true;
		let workspaces: Vec<_> = state.workspaces.drain(..).map(|(_, workspace)| workspace).collect();
		for workspace in &workspaces {
			workspace.dispatcher.stop();
		}
		workspaces
	}

	fn attach(&self, id: &WorkspaceId, entries: &[&ProviderEntry]) -> Vec<AttachedAnalyzer> {
		let mut analyzers: Vec<_> = entries
			.iter()
			.map(|entry| AttachedAnalyzer {
				name: Arc::clone(entry.descriptor.name()),
				priority: entry.descriptor.order(),
				analyzer: entry.provider.create(id),
			})
			.collect();
		sort_analyzers(&mut analyzers);
		analyzers
	}
}

/// Owns one analysis dispatcher per registered workspace and routes change
/// notifications and provider registrations to them.
///
/// Registration-table mutation happens under one hub lock. Each dispatcher
/// keeps its own queue lock, so adding a provider never blocks a drain.
pub struct RegistrationHub {
	inner: Arc<HubInner>,
}

impl RegistrationHub {
	pub fn new(config: CoordinatorConfig) -> Self {
		Self {
			inner: Arc::new(HubInner {
				config,
				providers: ArcSwap::from_pointee(ProviderSet::default()),
				state: Mutex::new(HubState::default()),
				listener: AsyncListener::new(),
			}),
		}
	}

	pub fn config(&self) -> &CoordinatorConfig {
		&self.inner.config
	}

	/// Adds a provider and attaches its analyzer to every live workspace it
	/// now applies to.
	///
	/// Each attached workspace gets a low-priority full reanalysis restricted
	/// to the new analyzer. Returns `false` if the hub is stopped or the
	/// registration would be a second default for its name.
	pub fn add_provider(&self, descriptor: ProviderDescriptor, provider: Arc<dyn AnalyzerProvider>) -> bool {
		let name = Arc::clone(descriptor.name());
		let entry = ProviderEntry { descriptor, provider };
		let mut attached = Vec::new();
		let registered = {
			let state = self.inner.state.lock();
			if state.stopped {
				return false;
			}
			let current = self.inner.providers.load();
			let duplicate_default = entry.descriptor.is_default() && current.has_default(&name);
			debug_assert!(!duplicate_default, "provider `{name}` registered two defaults");
			if duplicate_default {
				tracing::warn!(provider = %name, "coordinator.duplicate_default_provider");
				return false;
			}
			let next = current.with(entry.clone());

			for workspace in state.workspaces.values() {
				let applies = next
					.resolve_name(&name, &workspace.id.kind)
					.is_some_and(|resolved| Arc::ptr_eq(&resolved.provider, &entry.provider));
				if !applies {
					continue;
				}
				let analyzer = AttachedAnalyzer {
					name: Arc::clone(&name),
					priority: entry.descriptor.order(),
					analyzer: entry.provider.create(&workspace.id),
				};
				let mut analyzers: Vec<_> = workspace
					.analyzers
					.load()
					.iter()
					.filter(|existing| existing.name != name)
					.cloned()
					.collect();
				analyzers.push(analyzer);
				sort_analyzers(&mut analyzers);
				workspace.analyzers.store(Arc::new(analyzers));
				attached.push(Arc::clone(workspace));
			}
			let registered = next.len();
			self.inner.providers.store(Arc::new(next));
			registered
		};

		tracing::debug!(provider = %name, registered, workspaces = attached.len(), "coordinator.provider_added");
		for workspace in attached {
			let graph = workspace.graph.current();
			for project in graph.projects() {
				let item = WorkItem::new(project, WorkClass::Dependents)
					.reasons(ChangeReasons::REANALYZE)
					.analyzer(Arc::clone(&name))
					.with_token(self.inner.listener.begin("provider_added"));
				workspace.dispatcher.enqueue(item);
			}
		}
		true
	}

	/// Starts a dispatcher for `(kind, host)` with the providers applicable to
	/// `kind`. Registering a live pair again is a no-op and returns `false`.
	pub fn register(&self, kind: impl Into<WorkspaceKind>, host: HostId, graph: Arc<dyn GraphSource>) -> bool {
		let id = WorkspaceId::new(kind.into(), host);
		let mut state = self.inner.state.lock();
		if state.stopped {
			return false;
		}
		if state.workspaces.contains_key(&id) {
			tracing::trace!(workspace = %id, "coordinator.already_registered");
			return false;
		}

		let providers = self.inner.providers.load_full();
		let analyzers = self.inner.attach(&id, &providers.resolve(&id.kind));
		let names: Vec<_> = analyzers.iter().map(|attached| attached.name.to_string()).collect();
		let analyzers = Arc::new(ArcSwap::from_pointee(analyzers));
		let handler = Arc::new(AnalysisHandler {
			workspace: id.clone(),
			graph: Arc::clone(&graph),
			analyzers: Arc::clone(&analyzers),
			document_fanout: self.inner.config.document_fanout(),
		});
		let dispatcher = DebouncedDispatcher::start_with_priority(
			format!("analysis:{id}"),
			self.inner.config.dispatcher_config(),
			handler,
			Arc::new(GraphPrioritySource::new(Arc::clone(&graph))),
		);
		spawn_fault_watcher(Arc::downgrade(&self.inner), &id, &dispatcher);

		tracing::debug!(workspace = %id, analyzers = ?names, "coordinator.register");
		state.workspaces.insert(
			id.clone(),
			Arc::new(Workspace {
				id,
				graph,
				analyzers,
				dispatcher,
			}),
		);
		true
	}

	/// Shuts down the dispatcher for `(kind, host)` and forgets it. Returns
	/// `false` if the pair was not registered.
	pub async fn unregister(&self, kind: impl Into<WorkspaceKind>, host: HostId) -> bool {
		let id = WorkspaceId::new(kind.into(), host);
		let removed = self.inner.state.lock().workspaces.shift_remove(&id);
		let Some(workspace) = removed else {
			return false;
		};
		tracing::debug!(workspace = %id, "coordinator.unregister");
		workspace.shutdown().await;
		true
	}

	/// Queues analysis for a change. Returns `true` when a new pending item
	/// was created, `false` when it coalesced into an existing one or the
	/// workspace is unknown.
	pub fn notify_changed(&self, kind: impl Into<WorkspaceKind>, host: HostId, change: ChangeTarget, reasons: ChangeReasons) -> bool {
		let id = WorkspaceId::new(kind.into(), host);
		let Some(workspace) = self.inner.workspace(&id) else {
			tracing::trace!(workspace = %id, ?change, "coordinator.unknown_workspace");
			return false;
		};

		let item = match change {
			ChangeTarget::Document { project, document } => {
				let active = workspace.graph.current().active_document() == Some(document);
				let class = if active { WorkClass::Active } else { WorkClass::OpenDocuments };
				WorkItem::new(project, class).scope(WorkScope::partial([document]))
			}
			ChangeTarget::Project(project) => WorkItem::new(project, WorkClass::Project),
			ChangeTarget::ProjectRemoved(project) => WorkItem::new(project, WorkClass::Project),
		};
		tracing::trace!(workspace = %id, ?change, class = item.class().as_str(), "coordinator.notify_changed");
		workspace
			.dispatcher
			.enqueue(item.reasons(reasons).with_token(self.inner.listener.begin("notify_changed")))
	}

	/// Queues analysis for every project (or the subset named by `scope`) in
	/// the workspace's current graph. `analyzer` restricts the items to one
	/// analyzer. Returns the number of items offered.
	pub fn reanalyze(&self, kind: impl Into<WorkspaceKind>, host: HostId, analyzer: Option<&str>, scope: ReanalyzeScope, high_priority: bool) -> usize {
		let id = WorkspaceId::new(kind.into(), host);
		let Some(workspace) = self.inner.workspace(&id) else {
			return 0;
		};
		let graph = workspace.graph.current();
		let class = if high_priority { WorkClass::Active } else { WorkClass::Project };

		let targets: Vec<(ProjectId, WorkScope<DocumentId>)> = match scope {
			ReanalyzeScope::All => graph.projects().into_iter().map(|project| (project, WorkScope::Full)).collect(),
			ReanalyzeScope::Projects(projects) => projects
				.into_iter()
				.filter(|project| graph.contains_project(*project))
				.map(|project| (project, WorkScope::Full))
				.collect(),
			ReanalyzeScope::Documents(documents) => {
				let mut grouped: IndexMap<ProjectId, Vec<DocumentId>, FxBuildHasher> = IndexMap::default();
				for document in documents {
					if let Some(project) = graph.project_of(document) {
						grouped.entry(project).or_default().push(document);
					}
				}
				grouped
					.into_iter()
					.map(|(project, documents)| (project, WorkScope::partial(documents)))
					.collect()
			}
		};

		let offered = targets.len();
		for (project, scope) in targets {
			let mut item = WorkItem::new(project, class).scope(scope).reasons(ChangeReasons::REANALYZE);
			if let Some(name) = analyzer {
				item = item.analyzer(name);
			}
			workspace.dispatcher.enqueue(item.with_token(self.inner.listener.begin("reanalyze")));
		}
		tracing::debug!(workspace = %id, analyzer, offered, high_priority, "coordinator.reanalyze");
		offered
	}

	/// Cancels analysis running in `(kind, host)` after a workspace-wide
	/// structural change. Queued work stays and runs against the new graph.
	/// Returns `false` if the pair is not registered.
	pub fn cancel_running(&self, kind: impl Into<WorkspaceKind>, host: HostId) -> bool {
		let id = WorkspaceId::new(kind.into(), host);
		let Some(workspace) = self.inner.workspace(&id) else {
			return false;
		};
		tracing::debug!(workspace = %id, running = workspace.dispatcher.running(), "coordinator.cancel_running");
		workspace.dispatcher.request_cancellation_on_running_tasks();
		true
	}

	pub fn registered_workspaces(&self) -> Vec<WorkspaceId> {
		self.inner.state.lock().workspaces.keys().cloned().collect()
	}

	/// Analyzers attached to `(kind, host)`, in run order.
	pub fn analyzer_names(&self, kind: impl Into<WorkspaceKind>, host: HostId) -> Vec<Arc<str>> {
		let id = WorkspaceId::new(kind.into(), host);
		self.inner.workspace(&id).map_or_else(Vec::new, |workspace| {
			workspace
				.analyzers
				.load()
				.iter()
				.map(|attached| Arc::clone(&attached.name))
				.collect()
		})
	}

	/// Change notifications and reanalysis requests not yet fully handled.
	pub fn pending_operations(&self) -> usize {
		self.inner.listener.pending()
	}

	/// Resolves once every queued operation has been handled or dropped.
	pub async fn wait_idle(&self) {
		self.inner.listener.wait_idle().await;
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.state.lock().stopped
	}

	/// Stops every dispatcher and waits for in-flight analysis to return.
	/// Later calls on the hub are no-ops.
	pub async fn shutdown(&self) {
		let workspaces = self.inner.stop_all();
		tracing::debug!(workspaces = workspaces.len(), "coordinator.shutdown");
		for workspace in workspaces {
			workspace.shutdown().await;
		}
	}
}

impl Drop for RegistrationHub {
	fn drop(&mut self) {
		self.inner.stop_all();
	}
}

/// Stops the whole hub when `dispatcher` reports a host fault.
fn spawn_fault_watcher(hub: Weak<HubInner>, id: &WorkspaceId, dispatcher: &AnalysisDispatcher) {
	let mut events = dispatcher.subscribe();
	let id = id.clone();
	kiln_worker::spawn("coordinator.fault_watcher", async move {
		loop {
			match events.recv().await {
				Ok(DispatcherEvent::ShutdownRequested) => break,
				Ok(DispatcherEvent::Stopped) | Err(RecvError::Closed) => return,
				Ok(_) | Err(RecvError::Lagged(_)) => {}
			}
		}
		let Some(hub) = hub.upgrade() else {
			return;
		};
		tracing::error!(workspace = %id, "coordinator.host_fault_shutdown");
		let workspaces = hub.stop_all();
		drop(hub);
		for workspace in workspaces {
			workspace.shutdown().await;
		}
	});
}

#[cfg(test)]
mod tests;
