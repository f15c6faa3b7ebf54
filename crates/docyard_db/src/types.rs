//! Documents, attachments and the metadata vocabulary shared by every
//! pipeline stage.

use chrono::{DateTime, SecondsFormat, Utc};
use docyard_ids::DocumentId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

// ============================================================================
// Metadata vocabulary
// ============================================================================

/// Per-tag claim timestamps: `metadata.fetched.<tag>`
pub const FETCHED_METADATA_TAG: &str = "fetched";
/// Per-tag progress timestamps: `metadata.touched.<tag>`
pub const TOUCHED_METADATA_TAG: &str = "touched";
/// `{date, stage}` set while a stage holds the document outside the pipeline
pub const PENDING_METADATA_FLAG: &str = "pending";
/// `true` while attachments of a new document are still being written
pub const COMMITTING_METADATA_FLAG: &str = "committing";
pub const DATE_METADATA_SUBKEY: &str = "date";
pub const STAGE_METADATA_SUBKEY: &str = "stage";

/// Placeholder written over content dropped during archival.
pub const REMOVED_CONTENT_PLACEHOLDER: &str = "<Removed>";

/// Timestamp format used inside stored metadata.
pub(crate) fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn stamp_value(stage: &str) -> Value {
    let mut stamp = Map::new();
    stamp.insert(DATE_METADATA_SUBKEY.to_string(), Value::String(timestamp_now()));
    stamp.insert(STAGE_METADATA_SUBKEY.to_string(), Value::String(stage.to_string()));
    Value::Object(stamp)
}

/// How a document left the active store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionKind {
    Processed,
    Discarded,
    Failed,
}

impl CompletionKind {
    pub const ALL: [CompletionKind; 3] = [Self::Processed, Self::Discarded, Self::Failed];

    /// Metadata key holding the completion stamp.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Discarded => "discarded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processed" => Some(Self::Processed),
            "discarded" => Some(Self::Discarded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{date, stage}` pair used by the pending flag and completion flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStamp {
    pub date: DateTime<Utc>,
    pub stage: String,
}

/// One entry of a document's error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentError {
    pub stage: String,
    pub error: String,
}

// ============================================================================
// Document
// ============================================================================

/// A pipeline document.
///
/// Content and metadata writes are tracked so that [`crate::DocumentDb::update`]
/// only sends the fields this copy changed. A content field holding
/// `Value::Null` is removed from the stored record rather than stored as null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    id: Option<DocumentId>,
    contents: Map<String, Value>,
    metadata: Map<String, Value>,
    action: Option<String>,
    errors: Vec<DocumentError>,
    touched_contents: BTreeSet<String>,
    touched_metadata: BTreeSet<String>,
    action_touched: bool,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_stored(
        id: DocumentId,
        contents: Map<String, Value>,
        metadata: Map<String, Value>,
        action: Option<String>,
        errors: Vec<DocumentError>,
    ) -> Self {
        Self {
            id: Some(id),
            contents,
            metadata,
            action,
            errors,
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<DocumentId> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: DocumentId) {
        self.id = Some(id);
    }

    // ------------------------------------------------------------------
    // Contents
    // ------------------------------------------------------------------

    pub fn contents(&self) -> &Map<String, Value> {
        &self.contents
    }

    pub fn content_field(&self, name: &str) -> Option<&Value> {
        self.contents.get(name).filter(|v| !v.is_null())
    }

    pub fn has_content_field(&self, name: &str) -> bool {
        self.content_field(name).is_some()
    }

    /// Set a content field. `Value::Null` marks the field for removal.
    pub fn put_content_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.touched_contents.insert(name.clone());
        self.contents.insert(name, value.into());
    }

    /// Mark a content field for removal on the next update.
    pub fn remove_content_field(&mut self, name: impl Into<String>) {
        self.put_content_field(name, Value::Null);
    }

    /// Names of the content fields holding a value, in natural order.
    pub fn content_fields(&self) -> impl Iterator<Item = &str> {
        self.contents
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.as_str())
    }

    pub fn touched_contents(&self) -> &BTreeSet<String> {
        &self.touched_contents
    }

    pub(crate) fn null_content_fields(&self) -> Vec<String> {
        self.contents
            .iter()
            .filter(|(_, v)| v.is_null())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn strip_null_contents(&mut self) {
        self.contents.retain(|_, v| !v.is_null());
    }

    /// Content field with the longest text rendering. Ties go to the field
    /// that comes first in natural order.
    pub fn largest_content_field(&self) -> Option<&str> {
        let mut largest: Option<(&str, usize)> = None;
        for (name, value) in self.contents.iter().filter(|(_, v)| !v.is_null()) {
            let size = text_length(value);
            match largest {
                Some((_, best)) if best >= size => {}
                _ => largest = Some((name.as_str(), size)),
            }
        }
        largest.map(|(name, _)| name)
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn metadata_field(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name)
    }

    pub fn put_metadata_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.touched_metadata.insert(name.clone());
        self.metadata.insert(name, value.into());
    }

    pub fn touched_metadata(&self) -> &BTreeSet<String> {
        &self.touched_metadata
    }

    /// When `tag` claimed this document.
    pub fn fetched_at(&self, tag: &str) -> Option<DateTime<Utc>> {
        self.nested_timestamp(FETCHED_METADATA_TAG, tag)
    }

    /// When `tag` last reported progress on this document.
    pub fn touched_at(&self, tag: &str) -> Option<DateTime<Utc>> {
        self.nested_timestamp(TOUCHED_METADATA_TAG, tag)
    }

    pub fn pending(&self) -> Option<StageStamp> {
        self.stage_stamp(PENDING_METADATA_FLAG)
    }

    pub fn is_committing(&self) -> bool {
        self.metadata
            .get(COMMITTING_METADATA_FLAG)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The completion flag, if this document has been archived.
    pub fn completion(&self) -> Option<(CompletionKind, StageStamp)> {
        CompletionKind::ALL
            .iter()
            .find_map(|kind| self.stage_stamp(kind.as_str()).map(|stamp| (*kind, stamp)))
    }

    pub(crate) fn stamp_completion(&mut self, kind: CompletionKind, stage: &str) {
        self.metadata
            .insert(kind.as_str().to_string(), stamp_value(stage));
    }

    fn nested_timestamp(&self, group: &str, tag: &str) -> Option<DateTime<Utc>> {
        let raw = self.metadata.get(group)?.get(tag)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn stage_stamp(&self, key: &str) -> Option<StageStamp> {
        self.metadata
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    // ------------------------------------------------------------------
    // Action and errors
    // ------------------------------------------------------------------

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn set_action(&mut self, action: impl Into<String>) {
        self.action = Some(action.into());
        self.action_touched = true;
    }

    pub fn is_action_touched(&self) -> bool {
        self.action_touched
    }

    pub fn errors(&self) -> &[DocumentError] {
        &self.errors
    }

    pub fn add_error(&mut self, stage: impl Into<String>, error: impl Into<String>) {
        self.errors.push(DocumentError {
            stage: stage.into(),
            error: error.into(),
        });
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    /// Forget which fields were written; called once they are persisted.
    pub(crate) fn mark_clean(&mut self) {
        self.touched_contents.clear();
        self.touched_metadata.clear();
        self.action_touched = false;
    }

    /// Fill in everything this copy does not know from the stored `snapshot`.
    ///
    /// Values held here win. Metadata objects are merged key by key so stamps
    /// written by other workers survive; content values are replaced whole.
    pub(crate) fn merge_over(&mut self, snapshot: Document) {
        for (name, value) in snapshot.contents {
            self.contents.entry(name).or_insert(value);
        }
        for (name, value) in snapshot.metadata {
            match self.metadata.get_mut(&name) {
                Some(mine) => fill_missing(mine, value),
                None => {
                    self.metadata.insert(name, value);
                }
            }
        }
        if self.action.is_none() {
            self.action = snapshot.action;
        }
        if self.errors.is_empty() {
            self.errors = snapshot.errors;
        }
        if self.id.is_none() {
            self.id = snapshot.id;
        }
    }

    /// Persisted shape: `{_id, contents, metadata, action, errors}`.
    pub fn to_json(&self) -> Value {
        let mut record = Map::new();
        if let Some(id) = self.id {
            record.insert("_id".to_string(), id.to_json_value());
        }
        let contents: Map<String, Value> = self
            .contents
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        record.insert("contents".to_string(), Value::Object(contents));
        record.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        if let Some(action) = &self.action {
            record.insert("action".to_string(), Value::String(action.clone()));
        }
        if !self.errors.is_empty() {
            record.insert(
                "errors".to_string(),
                serde_json::to_value(&self.errors).unwrap_or(Value::Null),
            );
        }
        Value::Object(record)
    }
}

fn fill_missing(mine: &mut Value, theirs: Value) {
    if let (Value::Object(mine), Value::Object(theirs)) = (mine, theirs) {
        for (key, value) in theirs {
            match mine.get_mut(&key) {
                Some(existing) => fill_missing(existing, value),
                None => {
                    mine.insert(key, value);
                }
            }
        }
    }
}

fn text_length(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

// ============================================================================
// Attachments
// ============================================================================

/// A named binary attachment of a document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentFile {
    /// Owning document. Set by the store when written together with a new document.
    pub document_id: Option<DocumentId>,
    pub file_name: String,
    pub data: Vec<u8>,
    /// Stage that produced the attachment
    pub stage: Option<String>,
    /// Set by the store when the attachment is written
    pub upload_date: Option<DateTime<Utc>>,
    pub mimetype: Option<String>,
    pub encoding: Option<String>,
}

impl DocumentFile {
    pub fn new(file_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            document_id: None,
            file_name: file_name.into(),
            data: data.into(),
            stage: None,
            upload_date: None,
            mimetype: None,
            encoding: None,
        }
    }

    pub fn for_document(mut self, id: DocumentId) -> Self {
        self.document_id = Some(id);
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Read the attachment bytes as a stream.
    pub fn reader(&self) -> std::io::Cursor<&[u8]> {
        std::io::Cursor::new(self.data.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_largest_field_prefers_first_on_tie() {
        let mut doc = Document::new();
        doc.put_content_field("beta", "abcd");
        doc.put_content_field("alpha", "wxyz");
        doc.put_content_field("gamma", 12);
        assert_eq!(doc.largest_content_field(), Some("alpha"));

        doc.put_content_field("gamma", json!([1, 2, 3, 4, 5]));
        assert_eq!(doc.largest_content_field(), Some("gamma"));
    }

    #[test]
    fn test_largest_field_ignores_removed_fields() {
        let mut doc = Document::new();
        assert_eq!(doc.largest_content_field(), None);
        doc.put_content_field("short", "a");
        doc.remove_content_field("long");
        assert_eq!(doc.largest_content_field(), Some("short"));
    }

    #[test]
    fn test_merge_over_keeps_local_values_and_remote_stamps() {
        let id = DocumentId::from_parts(1, 2, 3);
        let mut remote_meta = Map::new();
        remote_meta.insert(
            TOUCHED_METADATA_TAG.to_string(),
            json!({"parse": "2026-01-01T00:00:00.000Z", "index": "2026-01-01T00:00:01.000Z"}),
        );
        let mut remote_contents = Map::new();
        remote_contents.insert("title".to_string(), json!("remote"));
        remote_contents.insert("body".to_string(), json!("kept"));
        let snapshot = Document::from_stored(id, remote_contents, remote_meta, None, Vec::new());

        let mut local = Document::from_stored(id, Map::new(), Map::new(), None, Vec::new());
        local.put_content_field("title", "local");
        local.put_metadata_field(TOUCHED_METADATA_TAG, json!({"parse": "2026-02-01T00:00:00.000Z"}));
        local.merge_over(snapshot);

        assert_eq!(local.content_field("title"), Some(&json!("local")));
        assert_eq!(local.content_field("body"), Some(&json!("kept")));
        let touched = local.metadata_field(TOUCHED_METADATA_TAG).unwrap();
        assert_eq!(touched["parse"], json!("2026-02-01T00:00:00.000Z"));
        assert_eq!(touched["index"], json!("2026-01-01T00:00:01.000Z"));
    }

    #[test]
    fn test_completion_reads_stamp() {
        let mut doc = Document::new();
        assert!(doc.completion().is_none());
        doc.stamp_completion(CompletionKind::Discarded, "dedup");
        let (kind, stamp) = doc.completion().unwrap();
        assert_eq!(kind, CompletionKind::Discarded);
        assert_eq!(stamp.stage, "dedup");
    }

    #[test]
    fn test_to_json_omits_null_contents() {
        let mut doc = Document::new();
        doc.put_content_field("kept", 1);
        doc.remove_content_field("gone");
        let record = doc.to_json();
        assert_eq!(record["contents"], json!({"kept": 1}));
        assert!(record.get("_id").is_none());
    }
}
