use std::sync::Arc;

use crate::Checksum;

/// Where a slot's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
	/// The checksum matched the key's input at the last refresh.
	Verified,
	/// Loaded from the persistent store without checking the current input.
	/// Possibly stale.
	Persisted,
}

/// A value paired with the checksum of the input it was derived from.
///
/// Slots are immutable. The cache replaces a key's slot with a single atomic
/// swap, so a reader sees either the old pair or the new pair.
#[derive(Debug)]
pub struct VersionedCacheSlot<V> {
	value: Arc<V>,
	checksum: Checksum,
	origin: SlotOrigin,
}

impl<V> VersionedCacheSlot<V> {
	pub fn new(value: Arc<V>, checksum: Checksum, origin: SlotOrigin) -> Self {
		Self { value, checksum, origin }
	}

	pub fn value(&self) -> &Arc<V> {
		&self.value
	}

	pub fn checksum(&self) -> Checksum {
		self.checksum
	}

	pub fn origin(&self) -> SlotOrigin {
		self.origin
	}

	pub fn is_verified(&self) -> bool {
		self.origin == SlotOrigin::Verified
	}

	/// Same value and checksum, marked as verified.
	pub(crate) fn verified(&self) -> Self {
		Self {
			value: Arc::clone(&self.value),
			checksum: self.checksum,
			origin: SlotOrigin::Verified,
		}
	}
}
