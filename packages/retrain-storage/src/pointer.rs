//! "current" pointers: one indirection naming exactly one published version.
//!
//! A pointer is only ever replaced, never edited in place: the new
//! indirection is written next to the final path and renamed over it, so a
//! reader sees either the previous version or the new one.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{IoContext, Result, StorageError};
use crate::manifest::write_atomic;

pub trait Pointer: Send + Sync {
    /// Location of the indirection itself
    fn path(&self) -> &Path;

    /// Version the pointer currently names, `None` if never published
    fn resolve(&self) -> Result<Option<PathBuf>>;

    /// Atomically repoint to `target`, which must already be fully written
    fn publish(&self, target: &Path) -> Result<()>;
}

/// How a pointer is materialised on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerKind {
    /// Relative symbolic link
    Symlink,
    /// Small text file holding the relative target path
    File,
}

impl Default for PointerKind {
    fn default() -> Self {
        if cfg!(unix) {
            PointerKind::Symlink
        } else {
            PointerKind::File
        }
    }
}

pub fn open_pointer(kind: PointerKind, path: impl Into<PathBuf>) -> Box<dyn Pointer> {
    match kind {
        PointerKind::Symlink => Box::new(SymlinkPointer::new(path)),
        PointerKind::File => Box::new(FilePointer::new(path)),
    }
}

#[derive(Debug, Clone)]
pub struct SymlinkPointer {
    link: PathBuf,
}

impl SymlinkPointer {
    pub fn new(link: impl Into<PathBuf>) -> Self {
        Self { link: link.into() }
    }

    fn temp_link(&self) -> PathBuf {
        let name = self
            .link
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "current".to_string());
        parent_of(&self.link).join(format!(".{}.tmp", name))
    }
}

impl Pointer for SymlinkPointer {
    fn path(&self) -> &Path {
        &self.link
    }

    fn resolve(&self) -> Result<Option<PathBuf>> {
        let meta = match std::fs::symlink_metadata(&self.link) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&self.link, e)),
        };

        // Pre-versioning layouts kept a real directory/file at the pointer path
        if !meta.file_type().is_symlink() {
            return Ok(Some(self.link.clone()));
        }

        let raw = std::fs::read_link(&self.link).at(&self.link)?;
        let target = parent_of(&self.link).join(raw);
        ensure_exists(&self.link, target).map(Some)
    }

    #[cfg(unix)]
    fn publish(&self, target: &Path) -> Result<()> {
        let parent = parent_of(&self.link);
        std::fs::create_dir_all(&parent).at(&parent)?;

        let tmp = self.temp_link();
        remove_entry_if_present(&tmp)?;
        remove_plain_directory(&self.link)?;

        let relative = relative_target(target, &parent)?;
        std::os::unix::fs::symlink(&relative, &tmp).at(&tmp)?;
        std::fs::rename(&tmp, &self.link).at(&self.link)?;

        debug!("Pointer {} -> {}", self.link.display(), relative.display());
        Ok(())
    }

    #[cfg(not(unix))]
    fn publish(&self, _target: &Path) -> Result<()> {
        Err(StorageError::pointer(
            "symlink pointers are only supported on unix; use the file pointer kind",
        ))
    }
}

#[derive(Debug, Clone)]
pub struct FilePointer {
    file: PathBuf,
}

impl FilePointer {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }
}

impl Pointer for FilePointer {
    fn path(&self) -> &Path {
        &self.file
    }

    fn resolve(&self) -> Result<Option<PathBuf>> {
        let text = match std::fs::read_to_string(&self.file) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&self.file, e)),
        };
        let rel = text.trim();
        if rel.is_empty() {
            return Err(StorageError::pointer(format!(
                "pointer file {} is empty",
                self.file.display()
            )));
        }
        ensure_exists(&self.file, parent_of(&self.file).join(rel)).map(Some)
    }

    fn publish(&self, target: &Path) -> Result<()> {
        let parent = parent_of(&self.file);
        std::fs::create_dir_all(&parent).at(&parent)?;
        remove_plain_directory(&self.file)?;

        let relative = relative_target(target, &parent)?;
        let mut contents = relative.to_string_lossy().into_owned();
        contents.push('\n');
        write_atomic(&self.file, contents.as_bytes())?;

        debug!("Pointer {} -> {}", self.file.display(), relative.display());
        Ok(())
    }
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn ensure_exists(pointer: &Path, target: PathBuf) -> Result<PathBuf> {
    if target.exists() {
        Ok(target)
    } else {
        Err(StorageError::pointer(format!(
            "pointer {} names missing target {}",
            pointer.display(),
            target.display()
        )))
    }
}

fn remove_entry_if_present(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path).at(path),
        Ok(_) => std::fs::remove_file(path).at(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// A rename cannot replace a non-empty directory
fn remove_plain_directory(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path).at(path),
        _ => Ok(()),
    }
}

/// Path of `target` relative to `base`, both canonicalised
fn relative_target(target: &Path, base: &Path) -> Result<PathBuf> {
    let target = target.canonicalize().at(target)?;
    let base = base.canonicalize().at(base)?;

    let target_parts: Vec<Component<'_>> = target.components().collect();
    let base_parts: Vec<Component<'_>> = base.components().collect();
    let common = target_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    // Different roots (e.g. drive letters): keep the absolute path
    if common == 0 {
        return Ok(target);
    }

    let mut relative = PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part.as_os_str());
    }
    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(root: &Path, name: &str, body: &str) -> PathBuf {
        let dir = root.join("versions").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ecommerce.inter"), body).unwrap();
        dir
    }

    #[test]
    fn test_relative_target_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = version(dir.path(), "v1", "x");
        let base = dir.path().join("links");
        std::fs::create_dir_all(&base).unwrap();

        let rel = relative_target(&target, &base).unwrap();
        assert_eq!(rel, PathBuf::from("../versions/v1"));
    }

    #[test]
    fn test_unpublished_pointer_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        for kind in [PointerKind::Symlink, PointerKind::File] {
            let pointer = open_pointer(kind, dir.path().join(format!("current-{:?}", kind)));
            assert!(pointer.resolve().unwrap().is_none());
        }
    }

    #[test]
    fn test_file_pointer_publish_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = version(dir.path(), "v1", "first");
        let v2 = version(dir.path(), "v2", "second");
        let pointer = FilePointer::new(dir.path().join("current"));

        pointer.publish(&v1).unwrap();
        let resolved = pointer.resolve().unwrap().unwrap();
        assert_eq!(
            std::fs::read_to_string(resolved.join("ecommerce.inter")).unwrap(),
            "first"
        );

        pointer.publish(&v2).unwrap();
        let resolved = pointer.resolve().unwrap().unwrap();
        assert_eq!(
            std::fs::read_to_string(resolved.join("ecommerce.inter")).unwrap(),
            "second"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_pointer_is_relative() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = version(dir.path(), "v1", "first");
        let pointer = SymlinkPointer::new(dir.path().join("current"));

        pointer.publish(&v1).unwrap();

        let raw = std::fs::read_link(dir.path().join("current")).unwrap();
        assert_eq!(raw, PathBuf::from("versions/v1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_pointer_replaces_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("current");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join("old.inter"), "legacy").unwrap();
        let v1 = version(dir.path(), "v1", "first");

        let pointer = SymlinkPointer::new(&legacy);
        assert_eq!(pointer.resolve().unwrap(), Some(legacy.clone()));

        pointer.publish(&v1).unwrap();
        assert!(std::fs::symlink_metadata(&legacy)
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("versions/gone", dir.path().join("current")).unwrap();

        let pointer = SymlinkPointer::new(dir.path().join("current"));
        assert!(pointer.resolve().is_err());
    }
}
