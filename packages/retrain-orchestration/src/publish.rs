//! Turning step output into published versions.
//!
//! Order per artifact family: claim version, write every file, write the
//! per-version manifest, swap the pointer, write the latest manifest, prune.
//! A version that fails before its pointer swap is removed again so that
//! only complete versions are ever left behind.

use crate::artifacts::{CheckpointManifest, DatasetManifest, DatasetStats};
use crate::config::{CheckpointConfig, DatasetConfig};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use retrain_storage::{
    iso, open_pointer, Clock, ManifestStore, Pointer, PointerKind, VersionHandle, VersionKind,
    VersionStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

/// Name of the manifest written inside each dataset version
pub const DATASET_MANIFEST_NAME: &str = "manifest.json";

pub struct ArtifactPublisher {
    dataset: DatasetConfig,
    checkpoint: CheckpointConfig,
    dataset_versions: VersionStore,
    checkpoint_versions: VersionStore,
    dataset_pointer: Box<dyn Pointer>,
    dataset_file_links: Vec<Box<dyn Pointer>>,
    checkpoint_pointer: Box<dyn Pointer>,
    manifests: Arc<ManifestStore>,
}

impl ArtifactPublisher {
    pub fn new(
        dataset: DatasetConfig,
        checkpoint: CheckpointConfig,
        pointer_kind: PointerKind,
        manifests: Arc<ManifestStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dataset_versions: VersionStore::new(&dataset.versions_dir, clock.clone()),
            checkpoint_versions: VersionStore::new(&checkpoint.versions_dir, clock.clone()),
            dataset_pointer: open_pointer(pointer_kind, &dataset.current),
            dataset_file_links: dataset
                .file_links
                .iter()
                .map(|link| open_pointer(pointer_kind, link))
                .collect(),
            checkpoint_pointer: open_pointer(pointer_kind, &checkpoint.current),
            dataset,
            checkpoint,
            manifests,
        }
    }

    pub fn dataset_pointer(&self) -> &dyn Pointer {
        self.dataset_pointer.as_ref()
    }

    pub fn checkpoint_pointer(&self) -> &dyn Pointer {
        self.checkpoint_pointer.as_ref()
    }

    /// Empty the staging directory so only the next conversion's output is published
    pub fn reset_staging(&self) -> Result<()> {
        let staging = &self.dataset.staging_dir;
        match std::fs::remove_dir_all(staging) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(OrchestratorError::publish(format!(
                    "cannot clear staging directory {}: {}",
                    staging.display(),
                    e
                )))
            }
        }
        std::fs::create_dir_all(staging)?;
        Ok(())
    }

    /// Snapshot the staging directory as a new dataset version and publish it
    pub fn publish_dataset(&self, keep_versions: usize) -> Result<DatasetManifest> {
        let staged = self.dataset.staging_dir.join(&self.dataset.interactions_file);
        if !staged.is_file() {
            return Err(OrchestratorError::publish(format!(
                "conversion step produced no {}",
                staged.display()
            )));
        }

        let version = self
            .dataset_versions
            .create_version(&VersionKind::Directory)?;
        let manifest = match self.fill_dataset_version(&version) {
            Ok(manifest) => manifest,
            Err(e) => {
                discard(&version.path);
                return Err(e);
            }
        };

        self.dataset_pointer.publish(&version.path)?;
        for link in &self.dataset_file_links {
            link.publish(&manifest.file)?;
        }
        self.manifests
            .replace(&self.dataset.latest_manifest, &manifest)?;
        info!(
            "Published dataset {} ({} rows) -> {}",
            manifest.version,
            manifest.rows,
            self.dataset.current.display()
        );

        self.dataset_versions.prune(keep_versions)?;
        Ok(manifest)
    }

    fn fill_dataset_version(&self, version: &VersionHandle) -> Result<DatasetManifest> {
        copy_dir_contents(&self.dataset.staging_dir, &version.path)?;

        let file = version.path.join(&self.dataset.interactions_file);
        let stats = DatasetStats::from_file(&file)?;

        let manifest = DatasetManifest {
            version: version.name.clone(),
            generated_at: iso(version.created_at),
            file,
            rows: stats.rows,
            users: stats.users,
            items: stats.items,
            positive_labels: stats.positive_labels,
            source: self
                .dataset
                .sources
                .iter()
                .filter(|p| p.exists())
                .cloned()
                .collect(),
            header: stats.header,
            current_link: self.dataset.current.clone(),
        };
        self.manifests
            .replace(&version.path.join(DATASET_MANIFEST_NAME), &manifest)?;
        Ok(manifest)
    }

    /// Newest training output matching the checkpoint prefix and extension
    pub fn latest_checkpoint(&self) -> Result<PathBuf> {
        let dir = &self.checkpoint.training_output_dir;
        let entries = std::fs::read_dir(dir).map_err(|e| {
            OrchestratorError::publish(format!("No checkpoints found in {}: {}", dir.display(), e))
        })?;

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries {
            let path = entry?.path();
            if !self.is_checkpoint(&path) {
                continue;
            }
            let modified = std::fs::metadata(&path)?.modified()?;
            let is_newer = newest.as_ref().map_or(true, |(best, best_path)| {
                (modified, &path) > (*best, best_path)
            });
            if is_newer {
                newest = Some((modified, path));
            }
        }

        newest.map(|(_, path)| path).ok_or_else(|| {
            OrchestratorError::publish(format!("No checkpoints found in {}", dir.display()))
        })
    }

    fn is_checkpoint(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        path.is_file()
            && name.starts_with(&self.checkpoint.file_prefix)
            && path
                .extension()
                .map_or(false, |ext| ext == self.checkpoint.file_extension.as_str())
    }

    /// Copy `source` into a new checkpoint version and publish it
    pub fn publish_checkpoint(
        &self,
        source: &Path,
        keep_versions: usize,
    ) -> Result<CheckpointManifest> {
        let version = self
            .checkpoint_versions
            .create_version(&VersionKind::file_with_extension_of(source))?;

        let saved_at = match copy_checkpoint(source, &version.path) {
            Ok(saved_at) => saved_at,
            Err(e) => {
                discard(&version.path);
                return Err(e);
            }
        };

        self.checkpoint_pointer.publish(&version.path)?;

        let manifest = CheckpointManifest {
            version: Path::new(&version.name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| version.name.clone()),
            saved_at: iso(saved_at),
            file: version.path.clone(),
            source: source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            current_link: self.checkpoint.current.clone(),
        };
        self.manifests
            .replace(&self.checkpoint.latest_manifest, &manifest)?;
        info!(
            "Published checkpoint {} -> {}",
            source.display(),
            version.path.display()
        );

        self.checkpoint_versions.prune(keep_versions)?;
        Ok(manifest)
    }
}

/// Copy the checkpoint and fsync it; returns the copy's modification time
fn copy_checkpoint(source: &Path, dest: &Path) -> Result<DateTime<Utc>> {
    std::fs::copy(source, dest).map_err(|e| {
        OrchestratorError::publish(format!(
            "cannot copy {} to {}: {}",
            source.display(),
            dest.display(),
            e
        ))
    })?;
    let file = std::fs::File::open(dest)?;
    file.sync_all()?;
    Ok(DateTime::<Utc>::from(file.metadata()?.modified()?))
}

/// Recursive copy of regular files; hidden entries are skipped
fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let src = entry.path();
        let dest = to.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
            copy_dir_contents(&src, &dest)?;
        } else if file_type.is_file() {
            std::fs::copy(&src, &dest)?;
        }
    }
    Ok(())
}

fn discard(path: &Path) {
    let removed = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = removed {
        warn!("Unable to remove incomplete version {}: {}", path.display(), e);
    }
}
