use std::hash::Hash;

use rustc_hash::FxHashSet;

/// Graph nodes referencing one shared cache entry.
#[derive(Debug, Clone)]
pub struct ReferenceSet<N> {
	nodes: FxHashSet<N>,
	/// Set once any node has referenced the entry. Untracked entries are only
	/// removed by a sweep.
	tracked: bool,
}

impl<N> Default for ReferenceSet<N> {
	fn default() -> Self {
		Self {
			nodes: FxHashSet::default(),
			tracked: false,
		}
	}
}

impl<N: Eq + Hash> ReferenceSet<N> {
	/// Returns `true` if `node` was not already referencing the entry.
	pub fn add(&mut self, node: N) -> bool {
		self.tracked = true;
		self.nodes.insert(node)
	}

	/// Returns `true` if `node` was referencing the entry.
	pub fn remove(&mut self, node: &N) -> bool {
		self.nodes.remove(node)
	}

	pub fn nodes(&self) -> impl Iterator<Item = &N> {
		self.nodes.iter()
	}

	pub fn contains(&self, node: &N) -> bool {
		self.nodes.contains(node)
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn is_tracked(&self) -> bool {
		self.tracked
	}

	/// A tracked entry whose last reference is gone.
	pub fn is_orphaned(&self) -> bool {
		self.tracked && self.nodes.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn orphaned_only_after_tracking() {
		let mut refs = ReferenceSet::default();
		assert!(!refs.is_orphaned());

		assert!(refs.add("a"));
		assert!(!refs.add("a"));
		assert!(refs.add("b"));
		assert!(refs.remove(&"a"));
		assert!(!refs.is_orphaned());
		assert!(refs.remove(&"b"));
		assert!(refs.is_orphaned());
		assert!(!refs.remove(&"b"));
	}
}
