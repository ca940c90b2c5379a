//! In-progress set of `(documentId, tag)` pairs.

use std::collections::{HashMap, HashSet};

use metrics::gauge;
use parking_lot::Mutex;
use regvault_core::ContentTag;
use tokio::sync::watch;

/// Tracks which content items are still being fetched.
///
/// A document is complete once every tag registered for it has been
/// completed. The set being empty is the "batch complete" signal.
pub struct InProgress {
    documents: Mutex<HashMap<String, HashSet<ContentTag>>>,
    outstanding: watch::Sender<usize>,
}

impl Default for InProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl InProgress {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            documents: Mutex::new(HashMap::new()),
            outstanding,
        }
    }

    /// Add a pair. Returns `false` if it was already in progress.
    pub fn register(&self, document_id: &str, tag: ContentTag) -> bool {
        let inserted = self
            .documents
            .lock()
            .entry(document_id.to_string())
            .or_default()
            .insert(tag);
        if inserted {
            self.adjust(1);
        }
        inserted
    }

    /// Remove a pair. Returns `true` if that was the document's last one.
    pub fn complete(&self, document_id: &str, tag: ContentTag) -> bool {
        let (removed, finished) = {
            let mut documents = self.documents.lock();
            let Some(tags) = documents.get_mut(document_id) else {
                return false;
            };
            let removed = tags.remove(&tag);
            let finished = tags.is_empty();
            if finished {
                documents.remove(document_id);
            }
            (removed, finished)
        };

        if removed {
            self.adjust(-1);
        }
        removed && finished
    }

    /// Number of outstanding pairs.
    pub fn len(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once nothing is outstanding.
    pub async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn adjust(&self, delta: isize) {
        self.outstanding.send_modify(|n| {
            *n = n.saturating_add_signed(delta);
        });
        gauge!("download_in_progress").set(*self.outstanding.borrow() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_document_completes_with_last_tag() {
        let tracker = InProgress::new();
        assert!(tracker.register("doc-1", ContentTag::Document));
        assert!(tracker.register("doc-1", ContentTag::Download { format: 0 }));
        assert!(!tracker.register("doc-1", ContentTag::Document));
        assert_eq!(tracker.len(), 2);

        assert!(!tracker.complete("doc-1", ContentTag::Document));
        assert!(tracker.complete("doc-1", ContentTag::Download { format: 0 }));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_complete_unknown_pair() {
        let tracker = InProgress::new();
        assert!(!tracker.complete("doc-1", ContentTag::Document));
        tracker.register("doc-1", ContentTag::Document);
        assert!(!tracker.complete("doc-1", ContentTag::Reference));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let tracker = Arc::new(InProgress::new());
        tracker.wait_idle().await;

        tracker.register("doc-1", ContentTag::Document);
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.complete("doc-1", ContentTag::Document);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
