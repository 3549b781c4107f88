use std::fmt;
use std::hash::Hash;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Checksum, StoreError};

/// Stable, filesystem-safe name for a key in a persistent store.
pub trait StoreKey {
	fn storage_name(&self) -> String;
}

/// Best-effort key/blob store addressed by key and checksum.
///
/// Calls may block on I/O; the cache runs them on the blocking pool.
pub trait PersistentStore<K, V>: Send + Sync + 'static {
	/// Reads the stored value for `key`. With `expected` set, a value persisted
	/// under a different checksum is a miss. Without it, any persisted
	/// version is returned.
	fn read(&self, key: &K, expected: Option<Checksum>) -> Result<Option<(Checksum, V)>, StoreError>;

	/// Stores `value` under `key` at `checksum`. Returns whether it was
	/// written.
	fn write(&self, key: &K, checksum: Checksum, value: &V) -> Result<bool, StoreError>;
}

/// Store that never holds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStore;

impl<K, V> PersistentStore<K, V> for NoStore {
	fn read(&self, _key: &K, _expected: Option<Checksum>) -> Result<Option<(Checksum, V)>, StoreError> {
		Ok(None)
	}

	fn write(&self, _key: &K, _checksum: Checksum, _value: &V) -> Result<bool, StoreError> {
		Ok(false)
	}
}

/// In-process store.
pub struct MemoryStore<K, V> {
	entries: Mutex<FxHashMap<K, (Checksum, Arc<V>)>>,
}

impl<K, V> Default for MemoryStore<K, V> {
	fn default() -> Self {
		Self {
			entries: Mutex::new(FxHashMap::default()),
		}
	}
}

impl<K, V> MemoryStore<K, V>
where
	K: Eq + Hash,
{
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	pub fn checksum_of(&self, key: &K) -> Option<Checksum> {
		self.entries.lock().get(key).map(|(checksum, _)| *checksum)
	}
}

impl<K, V> fmt::Debug for MemoryStore<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MemoryStore").field("len", &self.entries.lock().len()).finish()
	}
}

impl<K, V> PersistentStore<K, V> for MemoryStore<K, V>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
{
	fn read(&self, key: &K, expected: Option<Checksum>) -> Result<Option<(Checksum, V)>, StoreError> {
		let entries = self.entries.lock();
		Ok(entries
			.get(key)
			.filter(|(stored, _)| expected.is_none_or(|expected| expected == *stored))
			.map(|(stored, value)| (*stored, V::clone(value))))
	}

	fn write(&self, key: &K, checksum: Checksum, value: &V) -> Result<bool, StoreError> {
		self.entries.lock().insert(key.clone(), (checksum, Arc::new(value.clone())));
		Ok(true)
	}
}

/// Directory of `postcard`-encoded `(checksum, value)` blobs, one file per
/// key.
///
/// Writes land in a temporary file in the same directory and are renamed
/// into place, so a reader never sees a partial blob.
pub struct FileStore<K, V> {
	dir: PathBuf,
	_marker: PhantomData<fn(&K) -> V>,
}

impl<K, V> FileStore<K, V> {
	/// Opens `dir`, creating it if needed.
	pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir)?;
		Ok(Self { dir, _marker: PhantomData })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}
}

impl<K: StoreKey, V> FileStore<K, V> {
	fn path_for(&self, key: &K) -> PathBuf {
		self.dir.join(format!("{}.bin", key.storage_name()))
	}
}

impl<K, V> fmt::Debug for FileStore<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FileStore").field("dir", &self.dir).finish()
	}
}

impl<K, V> PersistentStore<K, V> for FileStore<K, V>
where
	K: StoreKey + Send + Sync + 'static,
	V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
	fn read(&self, key: &K, expected: Option<Checksum>) -> Result<Option<(Checksum, V)>, StoreError> {
		let bytes = match std::fs::read(self.path_for(key)) {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};
		let (stored, value): (Checksum, V) = postcard::from_bytes(&bytes).map_err(StoreError::Decode)?;
		if expected.is_some_and(|expected| expected != stored) {
			return Ok(None);
		}
		Ok(Some((stored, value)))
	}

	fn write(&self, key: &K, checksum: Checksum, value: &V) -> Result<bool, StoreError> {
		let bytes = postcard::to_stdvec(&(checksum, value)).map_err(StoreError::Encode)?;
		let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
		tmp.write_all(&bytes)?;
		tmp.as_file().sync_data()?;
		tmp.persist(self.path_for(key)).map_err(|err| StoreError::Io(err.error))?;
		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	struct Key(u32);

	impl StoreKey for Key {
		fn storage_name(&self) -> String {
			format!("key-{}", self.0)
		}
	}

	#[test]
	fn memory_store_honours_expected_checksum() {
		let store = MemoryStore::<Key, Vec<String>>::new();
		let c1 = Checksum::from_raw(1);
		store.write(&Key(1), c1, &vec!["main".to_string()]).unwrap();

		assert_eq!(store.read(&Key(1), Some(c1)).unwrap(), Some((c1, vec!["main".to_string()])));
		assert_eq!(store.read(&Key(1), Some(Checksum::from_raw(2))).unwrap(), None);
		assert_eq!(store.read(&Key(1), None).unwrap().map(|(c, _)| c), Some(c1));
		assert_eq!(store.read(&Key(2), None).unwrap(), None);
	}

	#[test]
	fn file_store_persists_across_instances() {
		let dir = tempfile::tempdir().unwrap();
		let c = Checksum::of_str("v1");
		{
			let store = FileStore::<Key, Vec<String>>::open(dir.path()).unwrap();
			assert!(store.write(&Key(7), c, &vec!["alpha".into(), "beta".into()]).unwrap());
		}

		let reopened = FileStore::<Key, Vec<String>>::open(dir.path()).unwrap();
		let (stored, value) = reopened.read(&Key(7), None).unwrap().expect("persisted value");
		assert_eq!(stored, c);
		assert_eq!(value, vec!["alpha".to_string(), "beta".to_string()]);
		assert!(reopened.read(&Key(7), Some(Checksum::of_str("v2"))).unwrap().is_none());
		assert!(dir.path().join("key-7.bin").exists());
	}

	#[test]
	fn file_store_overwrites_and_reports_missing_as_none() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::<Key, u64>::open(dir.path().join("nested")).unwrap();
		assert!(store.read(&Key(1), None).unwrap().is_none());

		store.write(&Key(1), Checksum::from_raw(1), &10).unwrap();
		store.write(&Key(1), Checksum::from_raw(2), &20).unwrap();
		assert_eq!(store.read(&Key(1), None).unwrap(), Some((Checksum::from_raw(2), 20)));
	}

	#[test]
	fn corrupt_blob_is_a_decode_error() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::<Key, Vec<String>>::open(dir.path()).unwrap();
		std::fs::write(dir.path().join("key-3.bin"), [0xff, 0xff, 0xff]).unwrap();
		assert!(matches!(store.read(&Key(3), None), Err(StoreError::Decode(_))));
	}
}
