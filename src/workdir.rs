//! Work-directory lifecycle.
//!
//! A caller-supplied `--workdir` is used as-is and preserved on exit; an
//! auto-generated one lives under the system temp directory with a uuid
//! suffix and is removed when the build finishes. Concurrent runs are
//! isolated by the uniqueness of the generated path; no filesystem lock is
//! taken.

use crate::error::BuildError;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const UNPACK_DIR: &str = "unpack";
pub const ROOTFS_DIR: &str = "rootfs";
pub const VOLUMES_DIR: &str = "volumes";

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    preserve: bool,
}

/// Fixed-name working areas under the work directory, created by the
/// `make_temporary_directories` stage.
#[derive(Debug, Clone, Default)]
pub struct TempDirs {
    pub unpack: PathBuf,
    pub rootfs: PathBuf,
    pub volumes: PathBuf,
}

impl WorkDir {
    /// Resolve the work directory for a fresh run. Caller-supplied paths
    /// are created and marked preserve-on-exit; otherwise a fresh
    /// `ubuntu-image-<uuid>` tree is created under the system temp
    /// directory and marked delete-on-exit.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, BuildError> {
        match explicit {
            Some(path) => {
                fs::create_dir_all(path).map_err(|e| {
                    BuildError::Resource(format!(
                        "creating work directory '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                let root = fs::canonicalize(path).map_err(|e| {
                    BuildError::Resource(format!(
                        "resolving work directory '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(WorkDir {
                    root,
                    preserve: true,
                })
            }
            None => {
                let root =
                    std::env::temp_dir().join(format!("ubuntu-image-{}", Uuid::new_v4()));
                fs::create_dir_all(&root).map_err(|e| {
                    BuildError::Resource(format!(
                        "creating work directory '{}': {}",
                        root.display(),
                        e
                    ))
                })?;
                Ok(WorkDir {
                    root,
                    preserve: false,
                })
            }
        }
    }

    /// Open an existing directory for `--resume` without creating anything.
    /// Resumed directories are always caller-supplied, hence preserved.
    pub fn open_existing(path: &Path) -> Self {
        WorkDir {
            root: path.to_path_buf(),
            preserve: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn preserved(&self) -> bool {
        self.preserve
    }

    pub fn temp_dirs(&self) -> TempDirs {
        TempDirs {
            unpack: self.root.join(UNPACK_DIR),
            rootfs: self.root.join(ROOTFS_DIR),
            volumes: self.root.join(VOLUMES_DIR),
        }
    }

    /// Remove the tree iff it is marked delete-on-exit. Removal failure is
    /// a warning, never an error.
    pub fn cleanup(&self) {
        if self.preserve || !self.root.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            eprintln!(
                "WARNING: failed to remove work directory '{}': {}",
                self.root.display(),
                e
            );
        }
    }
}
