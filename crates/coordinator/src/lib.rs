//! Multi-workspace analysis coordinator.
//!
//! A [`RegistrationHub`] owns one debounced analysis dispatcher per
//! registered workspace. Hosts report edits with
//! [`RegistrationHub::notify_changed`]; the hub coalesces them per project
//! and runs every applicable [`IncrementalAnalyzer`] once the workspace's
//! backoff window has passed. Analyzers come from [`AnalyzerProvider`]s that
//! may be added at any time.

mod config;
mod error;
mod graph;
mod handler;
mod hub;
mod ids;
pub mod logging;
mod provider;
mod symbol_index;

pub use config::{BackoffSection, CoordinatorConfig, DispatcherSection, IndexSection, RefreshClass};
pub use error::{AnalyzerError, ConfigError};
pub use graph::{GraphSnapshot, GraphSource, SharedGraph, StaticGraph};
pub use hub::{ChangeTarget, RegistrationHub, ReanalyzeScope};
pub use ids::{DocumentId, HostId, ProjectId, ReferenceId, WorkspaceId, WorkspaceKind};
pub use provider::{AnalysisContext, AnalyzerProvider, IncrementalAnalyzer, ProviderDescriptor};
pub use symbol_index::{IndexKey, IndexNode, SYMBOL_INDEX, SymbolCache, SymbolIndexAnalyzer, SymbolIndexProvider};
