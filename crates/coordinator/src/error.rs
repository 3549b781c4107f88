use std::path::PathBuf;

/// Failure reported by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalyzerError {
	/// The analyzer observed cancellation. Not logged as a failure.
	#[error("analysis cancelled")]
	Cancelled,
	/// Transient failure; the remaining analyzers still run.
	#[error("analysis failed: {0}")]
	Failed(String),
	/// The analyzer host is inconsistent and the coordinator should stop.
	#[error("analyzer host fault: {0}")]
	HostFault(String),
}

impl AnalyzerError {
	pub fn failed(err: impl std::fmt::Display) -> Self {
		Self::Failed(err.to_string())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}
