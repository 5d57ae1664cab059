//! retrain-storage - filesystem substrate for the retraining pipeline
//!
//! ## Components
//!
//! - [`ManifestStore`]: atomic JSON documents with deep-merge updates
//! - [`VersionStore`]: immutable, timestamp-named versions with retention
//! - [`Pointer`]: the "current" indirection, swapped by atomic rename
//! - [`LockManager`]: cross-process mutex with staleness reclaim
//! - [`Clock`]: injectable time source so waits are testable
//!
//! Every replacement on disk is write-temp-then-rename; there is no shared
//! in-memory state across processes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use retrain_storage::{open_pointer, PointerKind, VersionKind, VersionStore};
//!
//! let versions = VersionStore::new("recommender/dataset/versions", clock.clone());
//! let v = versions.create_version(&VersionKind::Directory)?;
//! // ... write every file of the version ...
//! open_pointer(PointerKind::Symlink, "recommender/dataset/current").publish(&v.path)?;
//! versions.prune(6)?;
//! ```

pub mod clock;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod pointer;
pub mod version;

pub use clock::{iso, Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, Result, StorageError};
pub use lock::{LockConfig, LockGuard, LockManager, LockWait};
pub use manifest::{deep_merge, Document, ManifestStore};
pub use pointer::{open_pointer, FilePointer, Pointer, PointerKind, SymlinkPointer};
pub use version::{PruneReport, VersionEntry, VersionHandle, VersionKind, VersionStore};
