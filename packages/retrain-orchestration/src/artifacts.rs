//! Per-version manifests and the statistics derived from a dataset.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Manifest of one dataset version (`manifest.json`, `latest_manifest.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub version: String,
    pub generated_at: String,
    pub file: PathBuf,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positive_labels: Option<u64>,
    #[serde(default)]
    pub source: Vec<PathBuf>,
    #[serde(default)]
    pub header: Vec<String>,
    pub current_link: PathBuf,
}

/// Manifest of one checkpoint version (`latest_model.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: String,
    pub saved_at: String,
    pub file: PathBuf,
    /// File name the training step produced
    pub source: String,
    pub current_link: PathBuf,
}

/// Counts read from a delimited interactions file.
///
/// Columns are matched by the name before any `:type` suffix, so both
/// `user_id` and `user_id:token` are recognised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetStats {
    pub rows: usize,
    pub users: Option<usize>,
    pub items: Option<usize>,
    pub positive_labels: Option<u64>,
    pub header: Vec<String>,
}

impl DatasetStats {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            OrchestratorError::publish(format!("cannot open {}: {}", path.display(), e))
        })?;
        let mut lines = BufReader::new(file).lines();

        let Some(header_line) = lines.next().transpose()? else {
            return Err(OrchestratorError::publish(format!(
                "{} is empty",
                path.display()
            )));
        };
        let delimiter = if header_line.contains('\t') { '\t' } else { ',' };
        let header: Vec<String> = header_line
            .trim_end_matches('\r')
            .split(delimiter)
            .map(str::to_string)
            .collect();

        let column = |name: &str| {
            header
                .iter()
                .position(|h| h.split(':').next().unwrap_or("") == name)
        };
        let user_col = column("user_id");
        let item_col = column("item_id");
        let label_col = column("label");

        let mut users = HashSet::new();
        let mut items = HashSet::new();
        let mut positives = 0u64;
        let mut rows = 0usize;

        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows += 1;
            let fields: Vec<&str> = line.trim_end_matches('\r').split(delimiter).collect();
            if let Some(value) = user_col.and_then(|i| fields.get(i)) {
                users.insert(value.to_string());
            }
            if let Some(value) = item_col.and_then(|i| fields.get(i)) {
                items.insert(value.to_string());
            }
            if let Some(value) = label_col.and_then(|i| fields.get(i)) {
                if value.trim().parse::<f64>().map_or(false, |v| v > 0.0) {
                    positives += 1;
                }
            }
        }

        Ok(Self {
            rows,
            users: user_col.map(|_| users.len()),
            items: item_col.map(|_| items.len()),
            positive_labels: label_col.map(|_| positives),
            header,
        })
    }
}
