//! Upstream record types for the regulations.gov document API.
//!
//! Field names follow the upstream camelCase JSON. Unknown fields on a
//! listing entry are preserved verbatim in [`DocumentReference::attributes`]
//! so that the persisted `reference` item matches what the API returned.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content::ContentTag;
use crate::{Error, Result};

/// One entry of a listing page: the identity of a document plus whatever
/// other attributes the upstream attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    /// Upstream document identifier, e.g. `EPA-HQ-OAR-2017-0355-0001`.
    pub document_id: String,

    /// Docket the document belongs to, when the listing reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docket_id: Option<String>,

    /// Remaining upstream fields, untouched.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl DocumentReference {
    /// Create a reference with no extra attributes.
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            docket_id: None,
            attributes: Map::new(),
        }
    }
}

/// A page of the documents listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentsPage {
    /// Documents on this page. The API omits the field on empty pages.
    #[serde(default)]
    pub documents: Vec<DocumentReference>,

    /// Total number of records matching the query, across all pages.
    #[serde(default)]
    pub total_num_records: u64,
}

impl DocumentsPage {
    /// Parse a listing response body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Attachment descriptor inside a document body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Ordinal assigned by the upstream.
    #[serde(default)]
    pub attachment_order_number: u32,

    /// Download URLs, one per available format.
    #[serde(default)]
    pub file_formats: Vec<String>,
}

/// Full metadata for a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBody {
    /// Document this body belongs to.
    pub document_id: String,
    /// Attachment descriptors in upstream order.
    pub attachments: Vec<Attachment>,
    /// Primary file-format URLs of the document itself.
    pub file_formats: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyShape {
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    file_formats: Vec<String>,
}

/// A binary download derived from a document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub document_id: String,
    pub tag: ContentTag,
    pub url: String,
}

impl DocumentBody {
    /// Parse a document body response.
    pub fn from_slice(document_id: impl Into<String>, body: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(body)?;
        if !raw.is_object() {
            return Err(Error::InvalidField {
                field: "document",
                reason: "expected a JSON object".to_string(),
            });
        }
        let shape = BodyShape::deserialize(&raw)?;

        Ok(Self {
            document_id: document_id.into(),
            attachments: shape.attachments,
            file_formats: shape.file_formats,
        })
    }

    /// Every binary download this document implies, in a deterministic order:
    /// attachments by position and format index, then top-level formats.
    ///
    /// Tags depend only on the body, so re-fetching the same document yields
    /// the same tags.
    pub fn file_requests(&self) -> Vec<FileRequest> {
        let attachments = self.attachments.iter().flat_map(|attachment| {
            attachment
                .file_formats
                .iter()
                .enumerate()
                .map(|(format, url)| FileRequest {
                    document_id: self.document_id.clone(),
                    tag: ContentTag::Attachment {
                        ordinal: attachment.attachment_order_number,
                        format,
                    },
                    url: url.clone(),
                })
        });

        let downloads = self
            .file_formats
            .iter()
            .enumerate()
            .map(|(format, url)| FileRequest {
                document_id: self.document_id.clone(),
                tag: ContentTag::Download { format },
                url: url.clone(),
            });

        attachments.chain(downloads).collect()
    }
}
