//! In-crate fakes shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use regvault_core::DocumentReference;
use serde_json::json;

use crate::gateway::{ListQuery, Transport, TransportError, UpstreamRequest, UpstreamResponse};
use crate::index::{BulkItemResult, CreateIndexOutcome, IndexDocument, IndexSettings, SearchBackend};
use crate::persist::{ContainerId, ObjectId, ObjectStore, ObjectWrite};
use crate::{Error, Result};

type Script = dyn Fn(&UpstreamRequest) -> std::result::Result<UpstreamResponse, TransportError>
    + Send
    + Sync;

/// Transport that answers from a closure and records every request.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Script>,
    requests: Arc<Mutex<Vec<UpstreamRequest>>>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&UpstreamRequest) -> std::result::Result<UpstreamResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Arc::new(script),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().clone()
    }

    /// Listing queries seen so far, in order.
    pub fn list_queries(&self) -> Vec<ListQuery> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                UpstreamRequest::ListDocuments(q) => Some(q.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &UpstreamRequest,
    ) -> std::result::Result<UpstreamResponse, TransportError> {
        self.requests.lock().push(request.clone());
        (self.script)(request)
    }
}

/// A fake corpus of `total` documents named `DOC-2017-<n>`, served in
/// posted-date order.
pub fn corpus_page(total: u64, query: &ListQuery) -> UpstreamResponse {
    let documents: Vec<serde_json::Value> = (query.page_offset..total)
        .take(query.results_per_page as usize)
        .map(|n| json!({"documentId": format!("DOC-2017-{n:05}"), "title": format!("Document {n}")}))
        .collect();
    UpstreamResponse::new(
        200,
        serde_json::to_vec(&json!({"documents": documents, "totalNumRecords": total}))
            .unwrap_or_default(),
    )
}

/// Document ids a corpus page contains.
pub fn corpus_ids(offset: u64, count: u64) -> Vec<String> {
    (offset..offset + count)
        .map(|n| format!("DOC-2017-{n:05}"))
        .collect()
}

pub fn reference_ids(references: &[DocumentReference]) -> Vec<String> {
    references.iter().map(|r| r.document_id.clone()).collect()
}

// =============================================================================
// Object store
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub container: ContainerId,
    pub name: String,
    pub data: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub revision: u64,
}

#[derive(Default)]
struct MemoryStoreState {
    containers: Vec<(Option<ContainerId>, String, ContainerId)>,
    objects: Vec<StoredObject>,
}

/// In-memory object store with call counters and failure injection.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<MemoryStoreState>>,
    pub container_lists: Arc<AtomicUsize>,
    pub container_creates: Arc<AtomicUsize>,
    fail_writes_for: Arc<Mutex<Option<String>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write for `document_id` fail.
    pub fn fail_writes_for(&self, document_id: &str) {
        *self.fail_writes_for.lock() = Some(document_id.to_string());
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.state.lock().objects.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .iter()
            .map(|(_, name, _)| name.clone())
            .collect()
    }

    fn check_failure(&self, name: &str) -> Result<()> {
        if let Some(doc) = self.fail_writes_for.lock().as_deref()
            && name.starts_with(doc)
        {
            return Err(Error::Storage(format!("injected failure for {name}")));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    async fn list_containers(&self, parent: Option<&ContainerId>) -> Result<Vec<(String, ContainerId)>> {
        self.container_lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|(p, _, _)| p.as_ref() == parent)
            .map(|(_, name, id)| (name.clone(), id.clone()))
            .collect())
    }

    async fn create_container(&self, parent: Option<&ContainerId>, name: &str) -> Result<ContainerId> {
        self.container_creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let id = ContainerId(format!("c{}", state.containers.len()));
        state
            .containers
            .push((parent.cloned(), name.to_string(), id.clone()));
        Ok(id)
    }

    async fn find_object(&self, container: &ContainerId, name: &str) -> Result<Option<ObjectId>> {
        Ok(self
            .state
            .lock()
            .objects
            .iter()
            .position(|o| &o.container == container && o.name == name)
            .map(|i| ObjectId(i.to_string())))
    }

    async fn create_object(&self, container: &ContainerId, write: &ObjectWrite) -> Result<ObjectId> {
        self.check_failure(&write.name)?;
        let mut state = self.state.lock();
        state.objects.push(StoredObject {
            container: container.clone(),
            name: write.name.clone(),
            data: write.data.to_vec(),
            metadata: write.metadata.clone(),
            revision: 1,
        });
        Ok(ObjectId((state.objects.len() - 1).to_string()))
    }

    async fn update_object(&self, object: &ObjectId, write: &ObjectWrite) -> Result<()> {
        self.check_failure(&write.name)?;
        let index: usize = object
            .0
            .parse()
            .map_err(|_| Error::Storage(format!("bad object id {}", object.0)))?;
        let mut state = self.state.lock();
        let stored = state
            .objects
            .get_mut(index)
            .ok_or_else(|| Error::Storage(format!("no object {}", object.0)))?;
        stored.data = write.data.to_vec();
        stored.metadata = write.metadata.clone();
        stored.revision += 1;
        Ok(())
    }
}

// =============================================================================
// Search backend
// =============================================================================

#[derive(Default)]
struct MemorySearchState {
    indices: HashMap<String, IndexSettings>,
    documents: BTreeMap<(String, String), serde_json::Value>,
    create_calls: usize,
    bulk_calls: usize,
    failing_bulk_calls: usize,
}

/// In-memory search backend with failure injection.
#[derive(Clone, Default)]
pub struct MemorySearchBackend {
    state: Arc<Mutex<MemorySearchState>>,
}

impl MemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` bulk calls report an error for every document.
    pub fn fail_next_bulks(&self, n: usize) {
        self.state.lock().failing_bulk_calls = n;
    }

    /// Mark an index as already existing.
    pub fn preexisting_index(&self, name: &str) {
        self.state
            .lock()
            .indices
            .insert(name.to_string(), IndexSettings::default());
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().indices.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(index, id)` pairs currently stored.
    pub fn document_keys(&self) -> Vec<(String, String)> {
        self.state.lock().documents.keys().cloned().collect()
    }

    pub fn document(&self, index: &str, id: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .documents
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn bulk_calls(&self) -> usize {
        self.state.lock().bulk_calls
    }
}

impl SearchBackend for MemorySearchBackend {
    async fn create_index(&self, name: &str, settings: &IndexSettings) -> Result<CreateIndexOutcome> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if state.indices.contains_key(name) {
            return Ok(CreateIndexOutcome::AlreadyExists);
        }
        state.indices.insert(name.to_string(), settings.clone());
        Ok(CreateIndexOutcome::Created)
    }

    async fn bulk(&self, documents: &[IndexDocument]) -> Result<Vec<BulkItemResult>> {
        let mut state = self.state.lock();
        state.bulk_calls += 1;

        if state.failing_bulk_calls > 0 {
            state.failing_bulk_calls -= 1;
            return Ok(documents
                .iter()
                .map(|d| BulkItemResult {
                    id: d.id.clone(),
                    error: Some("es_rejected_execution_exception".to_string()),
                })
                .collect());
        }

        let mut results = Vec::with_capacity(documents.len());
        for document in documents {
            if !state.indices.contains_key(&document.index) {
                results.push(BulkItemResult {
                    id: document.id.clone(),
                    error: Some(format!("index_not_found_exception: {}", document.index)),
                });
                continue;
            }
            state.documents.insert(
                (document.index.clone(), document.id.clone()),
                document.source.clone(),
            );
            results.push(BulkItemResult {
                id: document.id.clone(),
                error: None,
            });
        }
        Ok(results)
    }
}
