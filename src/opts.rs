//! User-visible options, persisted verbatim in the checkpoint.
//!
//! Both structs are captured at the original launch and become the sole
//! source of truth on `--resume`; values passed on a resumed command line
//! are ignored.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options shared by both image flavours.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonOpts {
    /// Print each stage name to stdout as it begins.
    pub debug: bool,
    /// Explicit work directory; preserved on exit when set.
    pub workdir: Option<PathBuf>,
    /// Where final artifacts land. Defaults to the work directory.
    pub output_dir: Option<PathBuf>,
    /// Default snap channel for preseeded snaps.
    pub channel: Option<String>,
    /// Extra snaps to preseed, `name` or `name=channel`.
    pub snaps: Vec<String>,
    /// cloud-init user-data file to seed into the image.
    pub cloud_init: Option<PathBuf>,
    /// File copied into the image as `.disk/info`.
    pub disk_info: Option<PathBuf>,
    /// Per-volume size overrides (`--image-size` grammar).
    pub image_size: Option<String>,
    /// Deprecated alias for `image_size`, same grammar.
    pub size: Option<String>,
}

impl CommonOpts {
    /// Effective `--image-size` value; the modern spelling wins over the
    /// legacy alias when both are set.
    pub fn effective_image_size(&self) -> Option<&str> {
        self.image_size.as_deref().or(self.size.as_deref())
    }
}

/// Options that control traversal of the state machine itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOpts {
    /// Stop before running the named stage.
    pub until: Option<String>,
    /// Stop after running the named stage.
    pub thru: Option<String>,
    /// Reload the checkpoint from the work directory and continue.
    pub resume: bool,
}
