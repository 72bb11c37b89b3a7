//! Durable executor state.
//!
//! The checkpoint is written after every successful stage with a
//! temp-then-rename so readers outside the process see either the previous
//! or the new complete record, never a torn one. A successfully read
//! checkpoint is the sole source of truth on `--resume`.

use crate::error::BuildError;
use crate::fsutil;
use crate::opts::{CommonOpts, MachineOpts};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Name of the checkpoint record inside the work directory.
pub const METADATA_FILENAME: &str = "ubuntu-image.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Zero-based index of the next stage to run.
    pub current_step: usize,
    /// The full stage list as planned at the original launch.
    pub state_list: Vec<String>,
    pub common_flags: CommonOpts,
    pub machine_flags: MachineOpts,
    /// Flavour-specific record; the planner owns its schema.
    #[serde(default)]
    pub flavour: serde_json::Value,
}

impl Checkpoint {
    /// Load the checkpoint from `work_dir`. Any missing file, parse error
    /// or inconsistent record is a metadata read error.
    pub fn read(work_dir: &Path) -> Result<Self, BuildError> {
        let path = work_dir.join(METADATA_FILENAME);
        let read_error =
            |cause: String| BuildError::CheckpointIo(format!("metadata read error: {cause}"));

        let bytes = fs::read(&path)
            .map_err(|e| read_error(format!("{}: {}", path.display(), e)))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| read_error(format!("{}: {}", path.display(), e)))?;

        if checkpoint.current_step > checkpoint.state_list.len() {
            return Err(read_error(format!(
                "{}: step {} is past the end of the {}-stage plan",
                path.display(),
                checkpoint.current_step,
                checkpoint.state_list.len()
            )));
        }
        Ok(checkpoint)
    }

    /// Persist the checkpoint into `work_dir`, atomically replacing any
    /// previous record. The scratch file is a uniquely-named sibling so
    /// the final rename never crosses a filesystem boundary.
    pub fn write(&self, work_dir: &Path) -> Result<(), BuildError> {
        let path = work_dir.join(METADATA_FILENAME);
        let scratch =
            work_dir.join(format!("{METADATA_FILENAME}.{}.partial", Uuid::new_v4()));

        let result: anyhow::Result<()> = (|| {
            let bytes = serde_json::to_vec_pretty(self)?;
            fs::write(&scratch, bytes)?;
            fsutil::replace_file(&scratch, &path)?;
            Ok(())
        })();

        result.map_err(|e| {
            BuildError::CheckpointIo(format!(
                "checkpoint write failed: {}: {}",
                path.display(),
                e
            ))
        })
    }
}
