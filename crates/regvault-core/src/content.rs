//! Content items: the unit that flows from the downloader to storage and
//! the search index.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Disambiguates the content items of a single document.
///
/// Together with the document id this is the idempotency key for storage
/// and indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ContentTag {
    /// The listing entry the document was discovered through.
    Reference,
    /// The full document body.
    Document,
    /// One format of one attachment: `attachment.<ordinal>-<format>`.
    Attachment { ordinal: u32, format: usize },
    /// One top-level format of the document: `download.<format>`.
    Download { format: usize },
}

impl fmt::Display for ContentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Document => write!(f, "document"),
            Self::Attachment { ordinal, format } => write!(f, "attachment.{ordinal}-{format}"),
            Self::Download { format } => write!(f, "download.{format}"),
        }
    }
}

impl FromStr for ContentTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidTag {
            tag: s.to_string(),
            reason: reason.to_string(),
        };

        match s {
            "reference" => return Ok(Self::Reference),
            "document" => return Ok(Self::Document),
            _ => {}
        }

        if let Some(rest) = s.strip_prefix("attachment.") {
            let (ordinal, format) = rest
                .split_once('-')
                .ok_or_else(|| invalid("missing format index"))?;
            return Ok(Self::Attachment {
                ordinal: ordinal.parse().map_err(|_| invalid("bad ordinal"))?,
                format: format.parse().map_err(|_| invalid("bad format index"))?,
            });
        }

        if let Some(format) = s.strip_prefix("download.") {
            return Ok(Self::Download {
                format: format.parse().map_err(|_| invalid("bad format index"))?,
            });
        }

        Err(invalid("unknown tag kind"))
    }
}

impl From<ContentTag> for String {
    fn from(tag: ContentTag) -> Self {
        tag.to_string()
    }
}

impl TryFrom<String> for ContentTag {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// One fetched unit of content tied to a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    pub document_id: String,
    pub tag: ContentTag,
    pub data: Bytes,
    /// Content type declared by the upstream, if any.
    pub content_type: Option<String>,
    /// Filename reported by the upstream, if any.
    pub original_filename: Option<String>,
    /// URL the content was fetched from.
    pub source_url: Option<String>,
    pub retrieved_at: DateTime<Utc>,
}

impl ContentItem {
    /// Build a JSON metadata item (`reference` or `document`).
    pub fn json<T: Serialize>(
        document_id: impl Into<String>,
        tag: ContentTag,
        value: &T,
        source_url: Option<String>,
    ) -> Result<Self> {
        let data = serde_json::to_vec(value)?;
        Ok(Self {
            document_id: document_id.into(),
            tag,
            data: Bytes::from(data),
            content_type: Some("application/json".to_string()),
            original_filename: Some(format!("{tag}.json")),
            source_url,
            retrieved_at: Utc::now(),
        })
    }

    /// Natural identity of the item, `<documentId>/<tag>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.document_id, self.tag)
    }
}

/// Replace every non-word character with `-` so the name is safe as a path
/// component on any backend.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

/// Extract the filename from a `Content-Disposition` header value.
///
/// Prefers the RFC 5987 `filename*` form when present.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;

    for part in header.split(';').map(str::trim) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if key == "filename*" {
            // charset'lang'percent-encoded
            let encoded = value.rsplit('\'').next().unwrap_or(value);
            if let Ok(decoded) = urlencoding::decode(encoded)
                && !decoded.is_empty()
            {
                return Some(decoded.into_owned());
            }
        } else if key == "filename" {
            let unquoted = value.trim_matches('"');
            if !unquoted.is_empty() {
                plain = Some(unquoted.to_string());
            }
        }
    }

    plain
}
