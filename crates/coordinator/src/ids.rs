use std::fmt;
use std::sync::Arc;

/// Kind of workspace a host exposes, such as `"host"` or `"misc"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkspaceKind(Arc<str>);

impl WorkspaceKind {
	pub fn new(kind: impl Into<Arc<str>>) -> Self {
		Self(kind.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for WorkspaceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for WorkspaceKind {
	fn from(kind: &str) -> Self {
		Self::new(kind)
	}
}

/// Identity of one host services instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub u64);

/// One registered workspace: a (kind, host) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkspaceId {
	pub kind: WorkspaceKind,
	pub host: HostId,
}

impl WorkspaceId {
	pub fn new(kind: WorkspaceKind, host: HostId) -> Self {
		Self { kind, host }
	}
}

impl fmt::Display for WorkspaceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.kind, self.host.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u32);

/// External reference shared between projects, such as a library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(Arc<str>);

impl ReferenceId {
	pub fn new(id: impl Into<Arc<str>>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ReferenceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
