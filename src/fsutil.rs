//! Filesystem helpers shared by the checkpoint store and stage bodies.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Mirror a directory tree into `dst`, creating it if needed.
///
/// Symlinks are recreated rather than followed; rootfs and gadget trees
/// carry links that must survive the move between staging areas intact.
/// Walk order guarantees a directory is created before its contents, so
/// files never need their parents conjured individually.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src).with_context(|| {
            format!(
                "resolving '{}' inside '{}'",
                entry.path().display(),
                src.display()
            )
        })?;
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating directory '{}'", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("recreating symlink '{}'", target.display()))?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying '{}'", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Total size in bytes of all regular files under `root`. Symlinks are not
/// followed. A missing root counts as zero.
pub fn dir_size(root: &Path) -> Result<u64> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry =
            entry.with_context(|| format!("walking directory '{}'", root.display()))?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Swap `src` into place over `dst`.
///
/// Checkpoint scratch files are written as siblings of the canonical
/// record, so the rename is atomic on every platform this crate targets;
/// there is deliberately no cross-filesystem fallback.
pub fn replace_file(src: &Path, dst: &Path) -> Result<()> {
    fs::rename(src, dst)
        .with_context(|| format!("renaming '{}' over '{}'", src.display(), dst.display()))
}
