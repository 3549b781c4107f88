use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use super::*;
use crate::config::BackoffSection;
use crate::error::AnalyzerError;
use crate::graph::{GraphSnapshot, SharedGraph, StaticGraph};
use crate::provider::{AnalysisContext, IncrementalAnalyzer};

const HOST: HostId = HostId(1);

fn fast_config() -> CoordinatorConfig {
	CoordinatorConfig {
		backoff: BackoffSection {
			active_ms: 5,
			open_documents_ms: 5,
			project_ms: 5,
			dependents_ms: 5,
		},
		..CoordinatorConfig::default()
	}
}

fn graph() -> Arc<SharedGraph> {
	Arc::new(SharedGraph::new(
		StaticGraph::new()
			.with_document(ProjectId(1), DocumentId(10))
			.with_document(ProjectId(1), DocumentId(11))
			.with_document(ProjectId(2), DocumentId(20)),
	))
}

#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
	fn push(&self, entry: String) {
		self.0.lock().push(entry);
	}

	fn entries(&self) -> Vec<String> {
		self.0.lock().clone()
	}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
	Ok,
	Fail,
	Fault,
}

struct Recording {
	tag: &'static str,
	log: Arc<Log>,
	behavior: Behavior,
}

#[async_trait]
impl IncrementalAnalyzer for Recording {
	async fn analyze_document(&self, _ctx: &AnalysisContext, document: DocumentId) -> Result<(), AnalyzerError> {
		self.log.push(format!("{}:doc:{}", self.tag, document.0));
		Ok(())
	}

	async fn analyze_project(&self, _ctx: &AnalysisContext, project: ProjectId) -> Result<(), AnalyzerError> {
		self.log.push(format!("{}:project:{}", self.tag, project.0));
		match self.behavior {
			Behavior::Ok => Ok(()),
			Behavior::Fail => Err(AnalyzerError::failed("bad input")),
			Behavior::Fault => Err(AnalyzerError::HostFault("host gone".into())),
		}
	}

	async fn project_removed(&self, project: ProjectId) {
		self.log.push(format!("{}:removed:{}", self.tag, project.0));
	}

	async fn batch_completed(&self, _graph: &dyn GraphSnapshot) {
		self.log.push(format!("{}:batch", self.tag));
	}
}

/// Runs until its analysis is cancelled.
struct Blocking {
	log: Arc<Log>,
}

#[async_trait]
impl IncrementalAnalyzer for Blocking {
	async fn analyze_project(&self, ctx: &AnalysisContext, project: ProjectId) -> Result<(), AnalyzerError> {
		self.log.push(format!("start:{}", project.0));
		tokio::select! {
			_ = ctx.cancel().cancelled() => {
				self.log.push(format!("cancelled:{}", project.0));
				Err(AnalyzerError::Cancelled)
			}
			_ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
		}
	}
}

fn recording(tag: &'static str, log: &Arc<Log>, behavior: Behavior) -> Arc<dyn AnalyzerProvider> {
	let log = Arc::clone(log);
	Arc::new(move |_: &WorkspaceId| -> Arc<dyn IncrementalAnalyzer> {
		Arc::new(Recording {
			tag,
			log: Arc::clone(&log),
			behavior,
		})
	})
}

async fn settle(hub: &RegistrationHub) {
	tokio::time::timeout(Duration::from_secs(2), hub.wait_idle())
		.await
		.expect("hub should go idle");
}

#[tokio::test]
async fn register_is_idempotent() {
	let hub = RegistrationHub::new(fast_config());
	assert!(hub.register("host", HOST, graph()));
	assert!(!hub.register("host", HOST, graph()));
	assert!(hub.register("misc", HOST, graph()));
	assert_eq!(hub.registered_workspaces().len(), 2);
	hub.shutdown().await;
}

#[tokio::test]
async fn analyzers_run_in_priority_order() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	hub.add_provider(ProviderDescriptor::new("later").priority(5), recording("later", &log, Behavior::Ok));
	hub.add_provider(ProviderDescriptor::new("first").priority(0), recording("first", &log, Behavior::Ok));
	hub.register("host", HOST, graph());
	assert_eq!(hub.analyzer_names("host", HOST), [Arc::<str>::from("first"), Arc::from("later")]);

	hub.notify_changed(
		"host",
		HOST,
		ChangeTarget::Document {
			project: ProjectId(1),
			document: DocumentId(10),
		},
		ChangeReasons::SYNTAX_CHANGED,
	);
	settle(&hub).await;

	assert_eq!(
		log.entries(),
		["first:doc:10", "first:project:1", "later:doc:10", "later:project:1", "first:batch", "later:batch"]
	);
	hub.shutdown().await;
}

#[tokio::test]
async fn failing_analyzer_does_not_stop_the_others() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	hub.add_provider(ProviderDescriptor::new("broken").priority(0), recording("broken", &log, Behavior::Fail));
	hub.add_provider(ProviderDescriptor::new("healthy").priority(1), recording("healthy", &log, Behavior::Ok));
	hub.register("host", HOST, graph());

	hub.notify_changed("host", HOST, ChangeTarget::Project(ProjectId(2)), ChangeReasons::PROJECT_CONFIGURATION_CHANGED);
	settle(&hub).await;

	let entries = log.entries();
	assert!(entries.contains(&"broken:project:2".to_string()));
	assert!(entries.contains(&"healthy:project:2".to_string()));
	assert!(!hub.is_stopped());
	hub.shutdown().await;
}

#[tokio::test]
async fn kind_specific_provider_replaces_default_for_its_kind() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	hub.add_provider(ProviderDescriptor::new("diag"), recording("generic", &log, Behavior::Ok));
	hub.add_provider(
		ProviderDescriptor::new("diag").kinds([WorkspaceKind::from("host")]),
		recording("special", &log, Behavior::Ok),
	);
	hub.register("host", HOST, graph());
	hub.register("misc", HOST, graph());

	hub.reanalyze("host", HOST, None, ReanalyzeScope::Projects(vec![ProjectId(2)]), true);
	settle(&hub).await;
	assert_eq!(log.entries(), ["special:doc:20", "special:project:2", "special:batch"]);
	hub.shutdown().await;
}

#[tokio::test]
async fn late_provider_attaches_and_reanalyzes_live_workspaces() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	hub.register("host", HOST, graph());
	assert!(hub.analyzer_names("host", HOST).is_empty());

	assert!(hub.add_provider(ProviderDescriptor::new("late"), recording("late", &log, Behavior::Ok)));
	assert_eq!(hub.analyzer_names("host", HOST), [Arc::<str>::from("late")]);
	settle(&hub).await;

	let entries = log.entries();
	assert!(entries.contains(&"late:project:1".to_string()), "{entries:?}");
	assert!(entries.contains(&"late:project:2".to_string()), "{entries:?}");
	hub.shutdown().await;
}

#[tokio::test]
async fn removed_project_notifies_analyzers() {
	let log = Arc::new(Log::default());
	let shared = graph();
	let hub = RegistrationHub::new(fast_config());
	hub.add_provider(ProviderDescriptor::new("a"), recording("a", &log, Behavior::Ok));
	hub.register("host", HOST, Arc::clone(&shared) as Arc<dyn GraphSource>);

	shared.update(|graph| graph.without_project(ProjectId(1)));
	hub.notify_changed("host", HOST, ChangeTarget::ProjectRemoved(ProjectId(1)), ChangeReasons::empty());
	settle(&hub).await;

	assert_eq!(log.entries(), ["a:removed:1", "a:batch"]);
	hub.shutdown().await;
}

#[tokio::test]
async fn reanalyze_documents_groups_by_project() {
	let hub = RegistrationHub::new(fast_config());
	hub.register("host", HOST, graph());
	let offered = hub.reanalyze(
		"host",
		HOST,
		Some("anything"),
		ReanalyzeScope::Documents(vec![DocumentId(10), DocumentId(11), DocumentId(20), DocumentId(99)]),
		false,
	);
	assert_eq!(offered, 2);
	assert_eq!(hub.reanalyze("host", HOST, None, ReanalyzeScope::All, false), 2);
	assert_eq!(hub.reanalyze("nowhere", HOST, None, ReanalyzeScope::All, false), 0);
	hub.shutdown().await;
}

#[tokio::test]
async fn unknown_workspace_changes_are_ignored() {
	let hub = RegistrationHub::new(fast_config());
	assert!(!hub.notify_changed("host", HOST, ChangeTarget::Project(ProjectId(1)), ChangeReasons::empty()));
	assert_eq!(hub.pending_operations(), 0);
	assert!(!hub.unregister("host", HOST).await);
}

#[tokio::test]
async fn unregister_stops_the_workspace() {
	let hub = RegistrationHub::new(fast_config());
	hub.register("host", HOST, graph());
	assert!(hub.unregister("host", HOST).await);
	assert!(hub.registered_workspaces().is_empty());
	assert!(!hub.notify_changed("host", HOST, ChangeTarget::Project(ProjectId(1)), ChangeReasons::empty()));
	assert!(hub.register("host", HOST, graph()), "can register again after unregister");
	hub.shutdown().await;
}

#[tokio::test]
async fn host_fault_stops_the_hub() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	hub.add_provider(ProviderDescriptor::new("fatal"), recording("fatal", &log, Behavior::Fault));
	hub.register("host", HOST, graph());
	hub.register("misc", HOST, graph());

	hub.notify_changed("host", HOST, ChangeTarget::Project(ProjectId(1)), ChangeReasons::empty());
	tokio::time::timeout(Duration::from_secs(2), async {
		while !hub.is_stopped() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("hub should stop after a host fault");

	assert!(hub.registered_workspaces().is_empty());
	assert!(!hub.register("host", HOST, graph()));
	assert!(!hub.add_provider(ProviderDescriptor::new("other"), recording("other", &log, Behavior::Ok)));
	assert_eq!(hub.reanalyze("misc", HOST, None, ReanalyzeScope::All, true), 0);
	hub.shutdown().await;
}

#[tokio::test]
async fn cancel_running_interrupts_in_flight_analysis() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	let blocking = Arc::clone(&log);
	hub.add_provider(
		ProviderDescriptor::new("blocking"),
		Arc::new(move |_: &WorkspaceId| -> Arc<dyn IncrementalAnalyzer> { Arc::new(Blocking { log: Arc::clone(&blocking) }) }),
	);
	hub.register("host", HOST, graph());
	hub.notify_changed("host", HOST, ChangeTarget::Project(ProjectId(1)), ChangeReasons::PROJECT_DEPENDENCY_CHANGED);

	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	while log.entries().is_empty() {
		assert!(std::time::Instant::now() < deadline, "analysis never started");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	assert!(hub.cancel_running("host", HOST));
	settle(&hub).await;

	assert_eq!(log.entries(), ["start:1", "cancelled:1"]);
	assert!(!hub.is_stopped());
	assert!(!hub.cancel_running("misc", HOST));
	hub.shutdown().await;
}

#[cfg(debug_assertions)]
#[tokio::test]
#[should_panic(expected = "registered two defaults")]
async fn second_default_for_a_name_panics_in_debug() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	hub.add_provider(ProviderDescriptor::new("lint"), recording("a", &log, Behavior::Ok));
	hub.add_provider(ProviderDescriptor::new("lint"), recording("b", &log, Behavior::Ok));
}

#[cfg(not(debug_assertions))]
#[tokio::test]
async fn second_default_for_a_name_is_rejected() {
	let log = Arc::new(Log::default());
	let hub = RegistrationHub::new(fast_config());
	assert!(hub.add_provider(ProviderDescriptor::new("lint"), recording("a", &log, Behavior::Ok)));
	assert!(!hub.add_provider(ProviderDescriptor::new("lint"), recording("b", &log, Behavior::Ok)));
	assert!(hub.add_provider(ProviderDescriptor::new("lint").kinds([WorkspaceKind::from("host")]), recording("c", &log, Behavior::Ok)));

	hub.register("host", HOST, graph());
	hub.register("misc", HOST, graph());
	hub.reanalyze("misc", HOST, None, ReanalyzeScope::Projects(vec![ProjectId(2)]), false);
	settle(&hub).await;
	assert_eq!(log.entries(), ["a:doc:20", "a:project:2", "a:batch"]);
	hub.shutdown().await;
}
