use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kiln_coordinator::{
	AnalysisContext, AnalyzerError, AnalyzerProvider, BackoffSection, ChangeTarget, CoordinatorConfig, DocumentId, HostId,
	IncrementalAnalyzer, ProjectId, ProviderDescriptor, RegistrationHub, SharedGraph, StaticGraph, WorkspaceId,
};
use kiln_worker::ChangeReasons;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

const HOST: HostId = HostId(1);

#[derive(Default)]
struct Calls {
	projects: Mutex<Vec<(ProjectId, Instant)>>,
	documents: Mutex<Vec<DocumentId>>,
}

struct Counting(Arc<Calls>);

#[async_trait]
impl IncrementalAnalyzer for Counting {
	async fn analyze_document(&self, _ctx: &AnalysisContext, document: DocumentId) -> Result<(), AnalyzerError> {
		self.0.documents.lock().push(document);
		Ok(())
	}

	async fn analyze_project(&self, _ctx: &AnalysisContext, project: ProjectId) -> Result<(), AnalyzerError> {
		self.0.projects.lock().push((project, Instant::now()));
		Ok(())
	}
}

fn hub_with(window_ms: u64, calls: &Arc<Calls>) -> RegistrationHub {
	let config = CoordinatorConfig {
		backoff: BackoffSection {
			active_ms: window_ms,
			open_documents_ms: window_ms,
			project_ms: window_ms,
			dependents_ms: window_ms,
		},
		..CoordinatorConfig::default()
	};
	let hub = RegistrationHub::new(config);
	let calls = Arc::clone(calls);
	let provider: Arc<dyn AnalyzerProvider> =
		Arc::new(move |_: &WorkspaceId| -> Arc<dyn IncrementalAnalyzer> { Arc::new(Counting(Arc::clone(&calls))) });
	hub.add_provider(ProviderDescriptor::new("counting"), provider);

	let graph = SharedGraph::new(
		StaticGraph::new()
			.with_document(ProjectId(1), DocumentId(1))
			.with_document(ProjectId(1), DocumentId(2))
			.with_document(ProjectId(1), DocumentId(3)),
	);
	hub.register("host", HOST, Arc::new(graph));
	hub
}

#[tokio::test]
async fn burst_of_edits_runs_one_analysis_after_the_window() {
	let _ = tracing_subscriber::fmt::try_init();
	let calls = Arc::new(Calls::default());
	let hub = hub_with(100, &calls);

	let mut sent = Vec::new();
	for document in [1, 2, 3, 1, 2] {
		sent.push(Instant::now());
		hub.notify_changed(
			"host",
			HOST,
			ChangeTarget::Document {
				project: ProjectId(1),
				document: DocumentId(document),
			},
			ChangeReasons::SYNTAX_CHANGED,
		);
		tokio::time::sleep(Duration::from_millis(2)).await;
	}
	tokio::time::timeout(Duration::from_secs(2), hub.wait_idle())
		.await
		.expect("analysis should finish");

	let last = *sent.last().unwrap();
	let projects = calls.projects.lock().clone();
	assert_eq!(projects.len(), 1, "burst coalesced into one item");
	assert!(projects[0].1.duration_since(last) >= Duration::from_millis(100));

	let mut documents = calls.documents.lock().clone();
	documents.sort();
	assert_eq!(documents, [DocumentId(1), DocumentId(2), DocumentId(3)], "scopes unioned");
	hub.shutdown().await;
}

#[tokio::test]
async fn separate_projects_are_not_coalesced() {
	let calls = Arc::new(Calls::default());
	let hub = hub_with(5, &calls);
	hub.notify_changed("host", HOST, ChangeTarget::Project(ProjectId(1)), ChangeReasons::empty());
	hub.notify_changed("host", HOST, ChangeTarget::Project(ProjectId(2)), ChangeReasons::empty());
	tokio::time::timeout(Duration::from_secs(2), hub.wait_idle())
		.await
		.expect("analysis should finish");

	// Project 2 is not in the graph, so only project 1 reaches the analyzer.
	let projects: Vec<_> = calls.projects.lock().iter().map(|(project, _)| *project).collect();
	assert_eq!(projects, [ProjectId(1)]);
	hub.shutdown().await;
}
