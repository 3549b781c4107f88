/// Persistent store failure. Always swallowed by the cache and treated as a
/// miss or a skipped write.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("store I/O failed: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to encode stored value: {0}")]
	Encode(#[source] postcard::Error),
	#[error("failed to decode stored value: {0}")]
	Decode(#[source] postcard::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
	/// The refresh was superseded. Not a failure.
	#[error("refresh cancelled")]
	Cancelled,
	/// The index source could not produce a checksum or value.
	#[error("index computation failed: {0}")]
	Compute(String),
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl IndexError {
	pub fn compute(err: impl std::fmt::Display) -> Self {
		Self::Compute(err.to_string())
	}
}
