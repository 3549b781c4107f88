/// Scheduling classes for queued work.
///
/// The class picks the debounce window a dispatcher waits out before it
/// drains, and decides urgency when two pending items for one key merge.
/// Variants are declared most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkClass {
	/// The unit the user is currently looking at.
	Active,
	/// Open but unfocused units.
	OpenDocuments,
	/// Whole-project reanalysis.
	Project,
	/// Low-priority propagation to dependents.
	Dependents,
}

impl WorkClass {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Active => "active",
			Self::OpenDocuments => "open_documents",
			Self::Project => "project",
			Self::Dependents => "dependents",
		}
	}

	/// Returns the more urgent of two classes.
	pub fn most_urgent(self, other: Self) -> Self {
		self.min(other)
	}
}
