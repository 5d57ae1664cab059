//! Version Store: immutable, timestamp-named outputs under one root.
//!
//! A version is either a directory (datasets) or a single file
//! (checkpoints). Names come from the UTC time at second precision,
//! `%Y%m%d-%H%M%S`, with `-01`, `-02`, ... appended when the name is taken.
//! The name is claimed with an exclusive create, so two writers can never
//! end up sharing a version.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{IoContext, Result, StorageError};

pub const VERSION_NAME_FORMAT: &str = "%Y%m%d-%H%M%S";

const MAX_SUFFIX: u32 = 999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionKind {
    Directory,
    /// Single file; the extension (without dot) is kept on the version name
    File { extension: Option<String> },
}

impl VersionKind {
    pub fn file_with_extension_of(path: &Path) -> Self {
        VersionKind::File {
            extension: path
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned()),
        }
    }
}

/// A freshly claimed, still empty version
#[derive(Debug, Clone)]
pub struct VersionHandle {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Existing version as seen by listing/pruning
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub is_dir: bool,
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

pub struct VersionStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl VersionStore {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Claim a new uniquely named version under the root.
    ///
    /// The caller fills the returned path completely before publishing it.
    pub fn create_version(&self, kind: &VersionKind) -> Result<VersionHandle> {
        std::fs::create_dir_all(&self.root).at(&self.root)?;

        let created_at = self.clock.now();
        let base = created_at.format(VERSION_NAME_FORMAT).to_string();

        for attempt in 0..=MAX_SUFFIX {
            let stem = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{:02}", base, attempt)
            };
            let name = match kind {
                VersionKind::File {
                    extension: Some(ext),
                } => format!("{}.{}", stem, ext),
                _ => stem,
            };
            let path = self.root.join(&name);

            let claimed = match kind {
                VersionKind::Directory => std::fs::create_dir(&path),
                VersionKind::File { .. } => std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map(drop),
            };

            match claimed {
                Ok(()) => {
                    return Ok(VersionHandle {
                        name,
                        path,
                        created_at,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StorageError::io(&path, e)),
            }
        }

        Err(StorageError::version_conflict(&self.root, &base))
    }

    /// All versions, newest modification time first
    pub fn list(&self) -> Result<Vec<VersionEntry>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.root, e)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.at(&self.root)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Temp files and other hidden entries are not versions
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path).at(&path)?;
            versions.push(VersionEntry {
                name,
                modified: meta.modified().at(&path)?,
                is_dir: meta.is_dir(),
                path,
            });
        }

        versions.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(versions)
    }

    /// Keep the `keep` most recently modified versions and delete the rest.
    ///
    /// Individual deletion failures are logged and reported, never raised.
    /// `keep == 0` disables retention.
    pub fn prune(&self, keep: usize) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        if keep == 0 {
            return Ok(report);
        }

        let mut versions = self.list()?.into_iter();
        report.kept = versions.by_ref().take(keep).map(|v| v.path).collect();

        for obsolete in versions {
            let removed = if obsolete.is_dir {
                std::fs::remove_dir_all(&obsolete.path)
            } else {
                std::fs::remove_file(&obsolete.path)
            };
            match removed {
                Ok(()) => {
                    info!("Removed old version: {}", obsolete.path.display());
                    report.removed.push(obsolete.path);
                }
                Err(e) => {
                    warn!("Unable to remove {}: {}", obsolete.path.display(), e);
                    report.failed.push((obsolete.path, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}
