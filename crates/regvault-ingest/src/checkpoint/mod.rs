//! Durable key/value persistence of small JSON state blobs.
//!
//! The discovery driver stores its [`Checkpoint`](regvault_core::Checkpoint)
//! here. Writes overwrite atomically, so a crash leaves either the old or the
//! new value, never a torn one.

mod schema;
mod sqlite;

pub use sqlite::SqliteCheckpointStore;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Key/value store for serialized state.
pub trait CheckpointStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// Read and decode a JSON value.
pub fn load_json<T, S>(store: &S, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: CheckpointStore + ?Sized,
{
    store
        .get(key)?
        .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
        .transpose()
}

/// Encode and store a JSON value.
pub fn save_json<T, S>(store: &S, key: &str, value: &T) -> Result<()>
where
    T: Serialize,
    S: CheckpointStore + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    store.put(key, &raw)
}
