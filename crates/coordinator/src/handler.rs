use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use kiln_worker::{HandlerError, WorkHandler, WorkItem, WorkLease, WorkScope};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::AnalyzerError;
use crate::graph::{GraphSnapshot, GraphSource};
use crate::ids::{DocumentId, ProjectId, WorkspaceId};
use crate::provider::{AnalysisContext, IncrementalAnalyzer};

/// An analyzer instance bound to one workspace.
#[derive(Clone)]
pub(crate) struct AttachedAnalyzer {
	pub(crate) name: Arc<str>,
	pub(crate) priority: i32,
	pub(crate) analyzer: Arc<dyn IncrementalAnalyzer>,
}

/// Analyzers of one workspace in run order. Swapped whole when a provider
/// attaches, so a running item keeps the set it started with.
pub(crate) type AnalyzerSet = ArcSwap<Vec<AttachedAnalyzer>>;

pub(crate) fn sort_analyzers(analyzers: &mut [AttachedAnalyzer]) {
	analyzers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

/// Runs every targeted analyzer for one project work item.
pub(crate) struct AnalysisHandler {
	pub(crate) workspace: WorkspaceId,
	pub(crate) graph: Arc<dyn GraphSource>,
	pub(crate) analyzers: Arc<AnalyzerSet>,
	pub(crate) document_fanout: usize,
}

impl AnalysisHandler {
	/// Analyzes `documents` with bounded parallelism. Cancellation and host
	/// faults win over plain failures.
	async fn document_pass(
		&self,
		attached: &AttachedAnalyzer,
		ctx: &AnalysisContext,
		documents: &[DocumentId],
		removed: &[DocumentId],
	) -> Result<(), AnalyzerError> {
		let permits = Arc::new(Semaphore::new(self.document_fanout.max(1)));
		let mut tasks = JoinSet::new();
		for &document in documents.iter().chain(removed) {
			let analyzer = Arc::clone(&attached.analyzer);
			let ctx = ctx.clone();
			let permits = Arc::clone(&permits);
			let is_removed = removed.contains(&document);
			tasks.spawn(async move {
				let Ok(_permit) = permits.acquire_owned().await else {
					return Err(AnalyzerError::Cancelled);
				};
				if ctx.is_cancelled() {
					return Err(AnalyzerError::Cancelled);
				}
				if is_removed {
					analyzer.document_removed(&ctx, document).await
				} else {
					analyzer.analyze_document(&ctx, document).await
				}
			});
		}

		let mut outcome = Ok(());
		while let Some(joined) = tasks.join_next().await {
			let result = match joined {
				Ok(result) => result,
				Err(err) => Err(AnalyzerError::Failed(
					kiln_worker::join_error_panic_message(err).unwrap_or_else(|| "document task aborted".to_string()),
				)),
			};
			outcome = match (outcome, result) {
				(Err(AnalyzerError::HostFault(fault)), _) | (_, Err(AnalyzerError::HostFault(fault))) => Err(AnalyzerError::HostFault(fault)),
				(Err(AnalyzerError::Cancelled), _) | (_, Err(AnalyzerError::Cancelled)) => Err(AnalyzerError::Cancelled),
				(Err(failed), _) | (Ok(()), Err(failed)) => Err(failed),
				(Ok(()), Ok(())) => Ok(()),
			};
		}
		outcome
	}

	async fn run_analyzer(
		&self,
		attached: &AttachedAnalyzer,
		ctx: &AnalysisContext,
		project: ProjectId,
		documents: &[DocumentId],
		removed: &[DocumentId],
	) -> Result<(), AnalyzerError> {
		self.document_pass(attached, ctx, documents, removed).await?;
		if ctx.is_cancelled() {
			return Err(AnalyzerError::Cancelled);
		}
		attached.analyzer.analyze_project(ctx, project).await
	}

	async fn complete_batch(&self, analyzers: &[&AttachedAnalyzer], graph: &dyn GraphSnapshot) {
		for attached in analyzers {
			attached.analyzer.batch_completed(graph).await;
		}
	}
}

/// Splits the item's scope into documents to analyze and documents that
/// left the project.
fn scoped_documents(scope: &WorkScope<DocumentId>, graph: &dyn GraphSnapshot, project: ProjectId) -> (Vec<DocumentId>, Vec<DocumentId>) {
	match scope {
		WorkScope::Full => (graph.documents(project), Vec::new()),
		WorkScope::Partial(requested) => {
			let mut requested: Vec<_> = requested.iter().copied().collect();
			requested.sort_unstable();
			requested
				.into_iter()
				.partition(|document| graph.project_of(*document) == Some(project))
		}
	}
}

#[async_trait]
impl WorkHandler<ProjectId, DocumentId> for AnalysisHandler {
	async fn handle(&self, item: WorkItem<ProjectId, DocumentId>, lease: &WorkLease<ProjectId>) -> Result<(), HandlerError> {
		let project = *item.key();
		let graph = self.graph.current();
		let analyzers = self.analyzers.load_full();
		let targeted: Vec<&AttachedAnalyzer> = analyzers.iter().filter(|attached| item.targets(&attached.name)).collect();

		if !graph.contains_project(project) {
			tracing::debug!(workspace = %self.workspace, ?project, "coordinator.project_removed");
			for attached in &targeted {
				attached.analyzer.project_removed(project).await;
			}
			self.complete_batch(&targeted, &*graph).await;
			return Ok(());
		}

		let (documents, removed) = scoped_documents(item.work_scope(), &*graph, project);
		let ctx = AnalysisContext::new(self.workspace.clone(), Arc::clone(&graph), item.change_reasons(), lease.token().clone());
		tracing::trace!(
			workspace = %self.workspace,
			?project,
			documents = documents.len(),
			removed = removed.len(),
			analyzers = targeted.len(),
			"coordinator.analyze"
		);

		for attached in &targeted {
			match self.run_analyzer(attached, &ctx, project, &documents, &removed).await {
				Ok(()) => {}
				Err(AnalyzerError::Cancelled) => return Err(HandlerError::Cancelled),
				Err(AnalyzerError::Failed(error)) => {
					tracing::warn!(workspace = %self.workspace, ?project, analyzer = %attached.name, %error, "coordinator.analyzer_failed");
				}
				Err(AnalyzerError::HostFault(fault)) => return Err(HandlerError::HostFault(fault)),
			}
		}
		if lease.is_cancelled() {
			return Err(HandlerError::Cancelled);
		}
		self.complete_batch(&targeted, &*graph).await;
		Ok(())
	}
}
