//! Filesystem-backed object store.
//!
//! Containers are directories and objects are files. Each object has a
//! `<name>.meta.json` sidecar with its metadata and a revision counter that
//! goes up on every update. Both files are written to a temporary name and
//! renamed into place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ContainerId, ObjectId, ObjectStore, ObjectWrite};
use crate::{Error, Result};

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    revision: u64,
    metadata: BTreeMap<String, String>,
}

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open a store, creating the root directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        tracing::info!(root = %root.display(), "Opened filesystem object store");
        Ok(Self { root })
    }

    /// Revision and metadata of an object.
    pub fn metadata(&self, object: &ObjectId) -> Result<(u64, BTreeMap<String, String>)> {
        let raw = std::fs::read(sidecar_path(Path::new(&object.0)))?;
        let sidecar: Sidecar = serde_json::from_slice(&raw)?;
        Ok((sidecar.revision, sidecar.metadata))
    }

    fn container_path(&self, parent: Option<&ContainerId>) -> PathBuf {
        match parent {
            Some(id) => PathBuf::from(&id.0),
            None => self.root.clone(),
        }
    }
}

/// Reject names that would escape their directory.
fn checked(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::Storage(format!("invalid object store name: {name:?}")));
    }
    Ok(name)
}

fn sidecar_path(object: &Path) -> PathBuf {
    let mut name = object.as_os_str().to_os_string();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn write_object(path: &Path, write: &ObjectWrite, revision: u64) -> Result<()> {
    let sidecar = Sidecar {
        revision,
        metadata: write.metadata.clone(),
    };
    write_atomic(path, &write.data).await?;
    write_atomic(&sidecar_path(path), &serde_json::to_vec_pretty(&sidecar)?).await
}

impl ObjectStore for FsObjectStore {
    async fn list_containers(&self, parent: Option<&ContainerId>) -> Result<Vec<(String, ContainerId)>> {
        let dir = self.container_path(parent);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut containers = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let id = ContainerId(entry.path().to_string_lossy().into_owned());
            containers.push((name, id));
        }

        containers.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(containers)
    }

    async fn create_container(&self, parent: Option<&ContainerId>, name: &str) -> Result<ContainerId> {
        let path = self.container_path(parent).join(checked(name)?);
        tokio::fs::create_dir_all(&path).await?;
        Ok(ContainerId(path.to_string_lossy().into_owned()))
    }

    async fn find_object(&self, container: &ContainerId, name: &str) -> Result<Option<ObjectId>> {
        let path = Path::new(&container.0).join(checked(name)?);
        if tokio::fs::try_exists(&path).await? {
            Ok(Some(ObjectId(path.to_string_lossy().into_owned())))
        } else {
            Ok(None)
        }
    }

    async fn create_object(&self, container: &ContainerId, write: &ObjectWrite) -> Result<ObjectId> {
        let path = Path::new(&container.0).join(checked(&write.name)?);
        write_object(&path, write, 1).await?;
        Ok(ObjectId(path.to_string_lossy().into_owned()))
    }

    async fn update_object(&self, object: &ObjectId, write: &ObjectWrite) -> Result<()> {
        let path = Path::new(&object.0);
        let previous = match tokio::fs::read(sidecar_path(path)).await {
            Ok(raw) => serde_json::from_slice::<Sidecar>(&raw)?.revision,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        write_object(path, write, previous + 1).await
    }
}
