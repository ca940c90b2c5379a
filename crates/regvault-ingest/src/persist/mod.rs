//! Idempotent persistence of content items into object storage.
//!
//! Layout in the store:
//!
//! ```text
//! <root container>/
//!   <documentId>/
//!     <documentId>-reference
//!     <documentId>-document
//!     <documentId>-attachment.0-0
//!     ...
//! ```
//!
//! Containers are resolved list-then-create and memoized. Objects are looked
//! up by name and updated in place when present, so replaying an item leaves
//! one object. The lookup and the write are separate calls; concurrent
//! writers of the same name race and the last one wins.
//!
//! A backend failure loses the item that triggered it. The failure is logged
//! with enough detail to replay by hand, the container cache is dropped, and
//! the persister carries on until its restart budget runs out.

mod fs;

pub use fs::FsObjectStore;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use bytes::Bytes;
use metrics::counter;
use regvault_core::{ContentItem, sanitize_filename};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Result;
use crate::supervisor::{RestartBudget, RestartPolicy};

/// Backend handle of a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

/// Backend handle of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(pub String);

/// Contents and metadata of one object write.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectWrite {
    pub name: String,
    pub data: Bytes,
    pub metadata: BTreeMap<String, String>,
}

/// Minimal hierarchical object storage.
pub trait ObjectStore: Send + Sync + 'static {
    /// Children of `parent` (or of the store root) as `(name, id)` pairs.
    fn list_containers(
        &self,
        parent: Option<&ContainerId>,
    ) -> impl Future<Output = Result<Vec<(String, ContainerId)>>> + Send;

    fn create_container(
        &self,
        parent: Option<&ContainerId>,
        name: &str,
    ) -> impl Future<Output = Result<ContainerId>> + Send;

    /// Look up an object by name.
    fn find_object(
        &self,
        container: &ContainerId,
        name: &str,
    ) -> impl Future<Output = Result<Option<ObjectId>>> + Send;

    fn create_object(
        &self,
        container: &ContainerId,
        write: &ObjectWrite,
    ) -> impl Future<Output = Result<ObjectId>> + Send;

    /// Replace the contents and metadata of an existing object.
    fn update_object(
        &self,
        object: &ObjectId,
        write: &ObjectWrite,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Configuration for the persister.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Name of the top-level container holding one container per document.
    pub root_container: String,
    pub restart_policy: RestartPolicy,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            root_container: "regulations".to_string(),
            restart_policy: RestartPolicy::default(),
        }
    }
}

/// Result of persisting one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Created,
    Updated,
}

/// Writes content items into an [`ObjectStore`].
pub struct Persister<S: ObjectStore> {
    config: PersistConfig,
    store: S,
    root: Option<ContainerId>,
    containers: HashMap<String, ContainerId>,
    budget: RestartBudget,
}

impl<S: ObjectStore> Persister<S> {
    pub fn new(config: PersistConfig, store: S) -> Self {
        let budget = RestartBudget::new("persister", config.restart_policy);
        Self {
            config,
            store,
            root: None,
            containers: HashMap::new(),
            budget,
        }
    }

    /// Spawn the persister on `items`. The task ends when the channel closes.
    pub fn spawn(self, items: mpsc::Receiver<ContentItem>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(items))
    }

    /// Persist items until the channel closes.
    ///
    /// Returns an error only once the restart budget is exhausted.
    pub async fn run(mut self, mut items: mpsc::Receiver<ContentItem>) -> Result<()> {
        let mut written = 0u64;

        while let Some(item) = items.recv().await {
            match self.persist(&item).await {
                Ok(kind) => {
                    written += 1;
                    let op = match kind {
                        WriteKind::Created => "create",
                        WriteKind::Updated => "update",
                    };
                    counter!("persist_objects_written_total", "op" => op).increment(1);
                    tracing::debug!(
                        document_id = %item.document_id,
                        tag = %item.tag,
                        op,
                        "Persisted content item"
                    );
                }
                Err(e) => {
                    counter!("persist_failures_total").increment(1);
                    tracing::error!(
                        document_id = %item.document_id,
                        tag = %item.tag,
                        url = item.source_url.as_deref().unwrap_or_default(),
                        error = %e,
                        "Failed to persist content item, item lost"
                    );
                    self.budget.try_restart()?;
                    self.reset();
                }
            }
        }

        tracing::info!(written, "Persister stopped");
        Ok(())
    }

    /// Create or update the object for one item.
    pub async fn persist(&mut self, item: &ContentItem) -> Result<WriteKind> {
        let container = self.document_container(&item.document_id).await?;
        let write = object_write(item);

        match self.store.find_object(&container, &write.name).await? {
            Some(object) => {
                self.store.update_object(&object, &write).await?;
                Ok(WriteKind::Updated)
            }
            None => {
                self.store.create_object(&container, &write).await?;
                Ok(WriteKind::Created)
            }
        }
    }

    /// Forget every memoized container.
    fn reset(&mut self) {
        self.root = None;
        self.containers.clear();
    }

    async fn document_container(&mut self, document_id: &str) -> Result<ContainerId> {
        if let Some(id) = self.containers.get(document_id) {
            return Ok(id.clone());
        }

        let root = match &self.root {
            Some(root) => root.clone(),
            None => {
                let name = self.config.root_container.clone();
                let root = self.resolve(None, &name).await?;
                self.root = Some(root.clone());
                root
            }
        };

        let id = self.resolve(Some(&root), document_id).await?;
        self.containers.insert(document_id.to_string(), id.clone());
        Ok(id)
    }

    async fn resolve(&self, parent: Option<&ContainerId>, name: &str) -> Result<ContainerId> {
        let existing = self.store.list_containers(parent).await?;
        if let Some((_, id)) = existing.into_iter().find(|(n, _)| n == name) {
            return Ok(id);
        }

        let id = self.store.create_container(parent, name).await?;
        counter!("persist_containers_created_total").increment(1);
        tracing::debug!(container = name, "Created container");
        Ok(id)
    }
}

/// Object name for an item: `<documentId>-<tag>`.
pub fn object_name(item: &ContentItem) -> String {
    format!("{}-{}", item.document_id, item.tag)
}

fn object_write(item: &ContentItem) -> ObjectWrite {
    let mut metadata = BTreeMap::new();
    metadata.insert("document_id".to_string(), item.document_id.clone());
    metadata.insert("tag".to_string(), item.tag.to_string());
    metadata.insert(
        "content_type".to_string(),
        item.content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    );
    if let Some(filename) = &item.original_filename {
        metadata.insert("original_filename".to_string(), sanitize_filename(filename));
    }
    if let Some(url) = &item.source_url {
        metadata.insert("source_url".to_string(), url.clone());
    }
    metadata.insert("retrieved_at".to_string(), item.retrieved_at.to_rfc3339());

    ObjectWrite {
        name: object_name(item),
        data: item.data.clone(),
        metadata,
    }
}
