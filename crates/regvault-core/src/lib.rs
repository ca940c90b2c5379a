//! Core types and shared utilities for the regvault harvester.
//!
//! This crate provides:
//! - Upstream record types (document references, bodies, listing pages)
//! - Content items and their tags, the idempotency key for storage and search
//! - The resumable backfill [`Checkpoint`]
//! - Index partitioning by the year embedded in a document id
//! - Prometheus metrics helpers
//! - Shared error types

pub mod checkpoint;
pub mod content;
pub mod document;
mod error;
pub mod metrics;
pub mod partition;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Largest page the upstream listing API will return.
pub const MAX_PAGE_SIZE: u64 = 1000;

pub use checkpoint::Checkpoint;
pub use content::{
    ContentItem, ContentTag, filename_from_content_disposition, sanitize_filename,
};
pub use document::{Attachment, DocumentBody, DocumentReference, DocumentsPage, FileRequest};
pub use error::{Error, Result};
pub use partition::{index_name, partition_key};
