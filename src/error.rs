//! Error taxonomy for the build pipeline.
//!
//! Stage bodies use `anyhow` internally; everything that crosses the public
//! boundary is folded into [`BuildError`]. The executor never recovers from
//! any of these — every failure aborts the run at the current stage, and the
//! checkpoint keeps pointing at the last stage that completed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Mutually exclusive flags, unknown stage names, malformed options.
    #[error("{0}")]
    Flag(String),

    /// The image definition failed schema validation or a cross-field rule.
    #[error("{0}")]
    Schema(String),

    /// Reading or writing the checkpoint metadata failed.
    #[error("{0}")]
    CheckpointIo(String),

    /// A stage handler failed. The checkpoint was not advanced, so a
    /// `--resume` reruns the failing stage.
    #[error("stage {stage} failed: {cause}")]
    Stage {
        stage: String,
        cause: anyhow::Error,
    },

    /// The work directory could not be created.
    #[error("{0}")]
    Resource(String),

    /// The default-filler met a declared default outside its closed registry.
    #[error("unsupported default for field {field}")]
    UnsupportedDefault { field: String },
}

pub type Result<T> = std::result::Result<T, BuildError>;
