use std::fmt;
use std::hash::Hasher;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Deterministic digest of a unit's input.
///
/// Equal inputs always produce equal checksums across processes, so a
/// checksum can be persisted next to the value derived from that input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum(u64);

impl Checksum {
	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	pub const fn raw(self) -> u64 {
		self.0
	}

	pub fn of_bytes(bytes: &[u8]) -> Self {
		let mut hasher = FxHasher::default();
		hasher.write_usize(bytes.len());
		hasher.write(bytes);
		Self(hasher.finish())
	}

	pub fn of_str(text: &str) -> Self {
		Self::of_bytes(text.as_bytes())
	}

	/// Folds child checksums into one, order-sensitively.
	pub fn combine(parts: impl IntoIterator<Item = Self>) -> Self {
		let mut hasher = FxHasher::default();
		let mut count = 0usize;
		for part in parts {
			hasher.write_u64(part.0);
			count = count.wrapping_add(1);
		}
		hasher.write_usize(count);
		Self(hasher.finish())
	}
}

impl fmt::Debug for Checksum {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Checksum({:016x})", self.0)
	}
}

impl fmt::Display for Checksum {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn equal_input_equal_checksum() {
		assert_eq!(Checksum::of_str("fn main() {}"), Checksum::of_str("fn main() {}"));
		assert_ne!(Checksum::of_str("a"), Checksum::of_str("b"));
	}

	#[test]
	fn combine_is_order_sensitive() {
		let a = Checksum::of_str("a");
		let b = Checksum::of_str("b");
		assert_eq!(Checksum::combine([a, b]), Checksum::combine([a, b]));
		assert_ne!(Checksum::combine([a, b]), Checksum::combine([b, a]));
		assert_ne!(Checksum::combine([a]), Checksum::combine([a, a]));
	}
}
