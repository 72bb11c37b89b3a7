//! Checkpointed state-machine engine for building bootable Ubuntu disk
//! images.
//!
//! A build is a sequence of named stages (prepare sources, compose a root
//! filesystem, lay out partitions, write filesystem images, assemble the
//! final disk, emit manifests) driven over a single mutable build context.
//! Two flavours share the spine:
//!
//! - **Snap** ([`snap::SnapMachine`]) — driven by a model assertion;
//!   `snap prepare-image` does the seeding.
//! - **Classic** ([`classic::ClassicMachine`]) — driven by a YAML image
//!   definition validated against an embedded JSON schema; the definition
//!   selects gadget, rootfs and customisation stages.
//!
//! Every stage boundary is durable: traversal state is checkpointed into
//! the work directory after each successful stage, so runs can stop at a
//! named stage (`--until`/`--thru`), survive failures, and restart with
//! `--resume` exactly where they left off.
//!
//! ```rust,ignore
//! use ubuntu_image::snap::{SnapArgs, SnapMachine, SnapOpts};
//! use ubuntu_image::{CommonOpts, MachineOpts};
//!
//! let mut machine = SnapMachine::new(
//!     CommonOpts { workdir: Some("/tmp/build".into()), ..Default::default() },
//!     MachineOpts { thru: Some("populate_rootfs_contents".into()), ..Default::default() },
//!     SnapArgs { model_assertion: "pc-amd64.model".into() },
//!     SnapOpts::default(),
//! );
//! machine.setup()?;
//! machine.run()?;
//! machine.teardown()?;
//! ```
//!
//! The engine itself never executes subprocesses, touches block devices or
//! validates image content; stage bodies call external tooling through the
//! [`exec::CmdRunner`] seam, and the CLI front end lives outside this
//! crate.

pub mod checkpoint;
pub mod classic;
pub mod defaults;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod gadget;
pub mod machine;
pub mod opts;
pub mod snap;
pub mod workdir;

pub use error::BuildError;
pub use machine::{CancelToken, Machine, Stage, StateMachine};
pub use opts::{CommonOpts, MachineOpts};
