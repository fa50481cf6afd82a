//! Core data models that flow through the ingestion and search pipeline.
//!
//! ```text
//! CloudFile ──download──▶ LocalFile ──load──▶ RagDocument ──chunk──▶ RagDocument*
//!                                                                       │embed
//! RagSearchResult ◀──search── sink ◀──store── RagVector ◀──────────────┘
//! ```
//!
//! `CloudFile`, `RagDocument`, and `RagVector` are serialized verbatim into
//! queue job payloads, so their serde shape is part of the wire contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Free-form metadata attached to files, documents, and vectors.
pub type Metadata = Map<String, Value>;

/// Metadata key mirroring a chunk's content, for display-only retrieval.
pub const METADATA_TEXT_KEY: &str = "text";

/// Metadata key holding an RFC 3339 timestamp; authoritative for delta runs.
pub const METADATA_LAST_MODIFIED: &str = "last_modified";

/// Metadata key linking a stored vector back to its originating file.
pub const METADATA_FILE_ENTRY_ID: &str = "_file_entry_id";

/// A remote object discovered by a source connector.
///
/// `id` is a stable content-addressable key (for object stores, the object
/// key), so re-running extraction over an unchanged source yields the same
/// ids and upserts stay idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudFile {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

impl CloudFile {
    /// Parse `metadata.last_modified` as an RFC 3339 timestamp.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(METADATA_LAST_MODIFIED)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// A downloaded, on-disk representation of a [`CloudFile`].
///
/// When created by `SourceConnector::download` the file owns its temp
/// directory: dropping the `LocalFile` removes the directory and everything
/// in it, on every exit path including failures mid-processing.
#[derive(Debug)]
pub struct LocalFile {
    pub id: String,
    pub file_path: PathBuf,
    pub metadata: Metadata,
    pub file_type: String,
    /// Temp directory guard. `None` for caller-managed paths.
    _scope: Option<TempDir>,
}

impl LocalFile {
    /// Wrap a downloaded file together with the temp directory that holds it.
    pub fn scoped(
        id: String,
        file_path: PathBuf,
        metadata: Metadata,
        file_type: String,
        scope: TempDir,
    ) -> Self {
        Self {
            id,
            file_path,
            metadata,
            file_type,
            _scope: Some(scope),
        }
    }

    /// Wrap an existing path without taking ownership of its lifetime.
    pub fn unmanaged(id: String, file_path: PathBuf, metadata: Metadata) -> Self {
        let file_type = file_extension(&file_path);
        Self {
            id,
            file_path,
            metadata,
            file_type,
            _scope: None,
        }
    }
}

/// A unit of text: a loaded document, or a chunk of one.
///
/// Chunk ids are `<parent_id>_<n>`; chunk metadata carries the parent's
/// metadata plus the content mirrored under [`METADATA_TEXT_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagDocument {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RagDocument {
    pub fn new(id: impl Into<String>, content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata,
        }
    }
}

/// An embedded chunk, ready for upsert. `id` equals the chunk's id and the
/// vector length equals the embedder's declared dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagVector {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A document returned from the sink's search or scan operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSearchResult {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

/// Aggregate information about a sink index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SinkInfo {
    pub number_vectors_stored: u64,
}

/// Lowercased file extension, or `"unknown"` when there is none.
pub fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}
