//! Manifest Store: small JSON documents replaced atomically.
//!
//! Two kinds of documents go through here:
//!
//! - per-version manifests, written once via [`ManifestStore::replace`]
//! - the aggregate run status, updated incrementally via
//!   [`ManifestStore::write`], which deep-merges a partial update into the
//!   current content and stamps `updated_at`
//!
//! Both paths serialize into a temporary file in the destination directory
//! and rename it over the target, so readers never see a truncated document.

use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::clock::{iso, Clock};
use crate::error::{IoContext, Result, StorageError};

pub type Document = Map<String, Value>;

pub struct ManifestStore {
    clock: Arc<dyn Clock>,
}

impl ManifestStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Load a document; an absent file reads as an empty map
    pub fn read(&self, path: &Path) -> Result<Document> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::serialization(format!(
                "{} holds a JSON {} instead of an object",
                path.display(),
                json_type(&other)
            ))),
        }
    }

    /// Deep-merge `update` into the stored document and replace it atomically.
    ///
    /// Nested objects merge key by key; any other value overwrites. Returns
    /// the document as written.
    pub fn write(&self, path: &Path, update: Value) -> Result<Document> {
        let Value::Object(update) = update else {
            return Err(StorageError::serialization(format!(
                "partial update for {} must be a JSON object",
                path.display()
            )));
        };

        let mut doc = self.read(path)?;
        deep_merge(&mut doc, update);
        doc.insert(
            "updated_at".to_string(),
            Value::String(iso(self.clock.now())),
        );

        write_json_atomic(path, &doc)?;
        Ok(doc)
    }

    /// Replace the whole document without merging
    pub fn replace<T: Serialize + ?Sized>(&self, path: &Path, doc: &T) -> Result<()> {
        write_json_atomic(path, doc)
    }
}

/// Recursively merge `updates` into `target`
pub fn deep_merge(target: &mut Document, updates: Document) {
    for (key, value) in updates {
        let Value::Object(nested) = value else {
            target.insert(key, value);
            continue;
        };
        if let Some(Value::Object(existing)) = target.get_mut(&key) {
            deep_merge(existing, nested);
            continue;
        }
        target.insert(key, Value::Object(nested));
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, doc: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(doc)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).at(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".json")
        .tempfile_in(dir)
        .at(dir)?;
    tmp.write_all(bytes).at(tmp.path())?;
    tmp.as_file().sync_all().at(tmp.path())?;
    tmp.persist(path).map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
