use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{Checksum, IndexError};

/// Producer of derived index data, consulted by
/// [`IncrementalIndexCache`](crate::IncrementalIndexCache).
#[async_trait]
pub trait IndexSource<K, V>: Send + Sync + 'static {
	/// Digest of `key`'s current input. Called on every refresh, so it must be
	/// cheap relative to [`compute`](Self::compute).
	async fn checksum(&self, key: &K) -> Result<Checksum, IndexError>;

	/// Builds the value for `key` at `checksum`. Only called when the checksum
	/// differs from the cached one. Long computations should watch `cancel`.
	async fn compute(&self, key: &K, checksum: Checksum, cancel: &CancellationToken) -> Result<V, IndexError>;
}
