//! TOML-backed coordinator settings.

use std::path::Path;
use std::time::Duration;

use kiln_index::IndexCacheConfig;
use kiln_worker::{BackoffConfig, DispatcherConfig, WorkClass};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Debounce windows in milliseconds, per work class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffSection {
	pub active_ms: u64,
	pub open_documents_ms: u64,
	pub project_ms: u64,
	pub dependents_ms: u64,
}

impl Default for BackoffSection {
	fn default() -> Self {
		let backoff = BackoffConfig::default();
		Self {
			active_ms: millis(backoff.active),
			open_documents_ms: millis(backoff.open_documents),
			project_ms: millis(backoff.project),
			dependents_ms: millis(backoff.dependents),
		}
	}
}

fn millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherSection {
	/// Project items handled at once per workspace.
	pub max_concurrency: usize,
	/// Documents analyzed at once within one project item.
	pub document_fanout: usize,
	/// Longest a project that keeps changing may wait for analysis.
	pub max_delay_ms: u64,
}

impl Default for DispatcherSection {
	fn default() -> Self {
		Self {
			max_concurrency: DispatcherConfig::default().concurrency(),
			document_fanout: 4,
			max_delay_ms: millis(DispatcherConfig::default().delay_cap()),
		}
	}
}

/// Serializable mirror of [`WorkClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshClass {
	Active,
	OpenDocuments,
	Project,
	#[default]
	Dependents,
}

impl From<RefreshClass> for WorkClass {
	fn from(class: RefreshClass) -> Self {
		match class {
			RefreshClass::Active => Self::Active,
			RefreshClass::OpenDocuments => Self::OpenDocuments,
			RefreshClass::Project => Self::Project,
			RefreshClass::Dependents => Self::Dependents,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexSection {
	/// Class of refreshes queued by cache reads.
	pub refresh_class: RefreshClass,
}

/// Coordinator settings. Every section and key is optional.
///
/// ```toml
/// [backoff]
/// active_ms = 50
///
/// [dispatcher]
/// max_concurrency = 4
///
/// [index]
/// refresh_class = "project"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
	pub backoff: BackoffSection,
	pub dispatcher: DispatcherSection,
	pub index: IndexSection,
}

impl CoordinatorConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		let config = Self::from_toml_str(&input)?;
		tracing::debug!(path = %path.display(), "coordinator.config_loaded");
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.dispatcher.max_concurrency == 0 {
			return Err(ConfigError::Invalid("dispatcher.max_concurrency must be at least 1".into()));
		}
		if self.dispatcher.document_fanout == 0 {
			return Err(ConfigError::Invalid("dispatcher.document_fanout must be at least 1".into()));
		}
		Ok(())
	}

	pub fn backoff(&self) -> BackoffConfig {
		let section = &self.backoff;
		BackoffConfig {
			active: Duration::from_millis(section.active_ms),
			open_documents: Duration::from_millis(section.open_documents_ms),
			project: Duration::from_millis(section.project_ms),
			dependents: Duration::from_millis(section.dependents_ms),
		}
	}

	/// Settings for each workspace's analysis dispatcher.
	pub fn dispatcher_config(&self) -> DispatcherConfig {
		DispatcherConfig::default()
			.backoff(self.backoff())
			.max_concurrency(self.dispatcher.max_concurrency)
			.max_delay(Duration::from_millis(self.dispatcher.max_delay_ms))
	}

	pub fn document_fanout(&self) -> usize {
		self.dispatcher.document_fanout.max(1)
	}

	/// Settings for index caches created by providers.
	pub fn index_cache_config(&self) -> IndexCacheConfig {
		IndexCacheConfig {
			dispatcher: self.dispatcher_config(),
			refresh_class: self.index.refresh_class.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn empty_document_uses_defaults() {
		let config = CoordinatorConfig::from_toml_str("").unwrap();
		assert_eq!(config, CoordinatorConfig::default());
		assert_eq!(config.backoff(), BackoffConfig::default());
		assert_eq!(config.document_fanout(), 4);
		assert_eq!(config.index_cache_config().refresh_class, WorkClass::Dependents);
	}

	#[test]
	fn partial_sections_keep_other_defaults() {
		let config = CoordinatorConfig::from_toml_str(
			r#"
			[backoff]
			active_ms = 25

			[dispatcher]
			max_concurrency = 8

			[index]
			refresh_class = "open_documents"
			"#,
		)
		.unwrap();

		assert_eq!(config.backoff().active, Duration::from_millis(25));
		assert_eq!(config.backoff().project, Duration::from_millis(1500));
		assert_eq!(config.dispatcher_config().concurrency(), 8);
		assert_eq!(config.dispatcher_config().delay_cap(), Duration::from_secs(10));
		assert_eq!(config.index_cache_config().refresh_class, WorkClass::OpenDocuments);
	}

	#[test]
	fn zero_fanout_is_rejected() {
		let err = CoordinatorConfig::from_toml_str("[dispatcher]\ndocument_fanout = 0\n").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
	}

	#[test]
	fn unknown_keys_are_parse_errors() {
		let err = CoordinatorConfig::from_toml_str("[backoff]\nactive = 1\n").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)), "{err}");
	}

	#[test]
	fn load_reports_missing_file_path() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("kiln.toml");
		match CoordinatorConfig::load(&path) {
			Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
			other => panic!("expected io error, got {other:?}"),
		}

		std::fs::write(&path, "[dispatcher]\nmax_concurrency = 3\n").unwrap();
		assert_eq!(CoordinatorConfig::load(&path).unwrap().dispatcher.max_concurrency, 3);
	}
}
