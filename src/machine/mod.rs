//! The checkpointed state-machine executor.
//!
//! A build is an ordered list of named stages driven over a single mutable
//! [`StateMachine`] context. Traversal state is persisted to the work
//! directory after every successful stage, so a run can stop at any stage
//! boundary (`--until`/`--thru`, a failure, or cancellation) and restart
//! exactly where it left off with `--resume`.
//!
//! Stages run strictly sequentially; every effect of stage `k`
//! happens-before stage `k+1`, and checkpoint writes happen after the
//! stage they record. The executor itself spawns no subprocesses and
//! imposes no timeouts — a stage blocks as long as its own work does.

pub mod catalog;
pub mod states;

use crate::checkpoint::Checkpoint;
use crate::error::BuildError;
use crate::exec::CmdRunner;
use crate::gadget::{parse_size, GadgetInfo};
use crate::opts::{CommonOpts, MachineOpts};
use crate::workdir::{TempDirs, WorkDir};
use anyhow::{anyhow, bail, Context};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An atomic named unit of work. Names are unique within a plan and their
/// order of appearance defines execution order.
pub struct Stage<M> {
    pub name: &'static str,
    pub run: fn(&mut M) -> anyhow::Result<()>,
}

impl<M> Clone for Stage<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for Stage<M> {}

/// Cooperative cancellation. The executor polls the token between stages
/// only; a cancelled run writes the checkpoint at the most recent
/// successful stage and returns success.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The mutable build context shared by every stage of a run.
///
/// The executor exclusively owns this for the duration of a run; stage
/// handlers borrow it only while their own call is active.
#[derive(Debug, Default)]
pub struct StateMachine {
    pub common: CommonOpts,
    pub opts: MachineOpts,
    /// Zero-based index of the next stage to run.
    pub current_step: usize,
    /// The full stage list as planned at the original launch.
    pub state_names: Vec<String>,
    pub workdir: Option<WorkDir>,
    pub temp_dirs: TempDirs,
    pub gadget: Option<GadgetInfo>,
    /// Effective per-volume image sizes in bytes.
    pub image_sizes: BTreeMap<String, u64>,
    /// Computed rootfs content size in bytes.
    pub rootfs_size: u64,
    /// True for UC20+ style images whose boot partition carries the seed.
    pub is_seeded: bool,
    pub runner: CmdRunner,
    cancel: CancelToken,
}

impl StateMachine {
    pub fn new(common: CommonOpts, opts: MachineOpts) -> Self {
        StateMachine {
            common,
            opts,
            ..StateMachine::default()
        }
    }

    /// Token callers use to request cancellation between stages.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn require_workdir(&self) -> anyhow::Result<&WorkDir> {
        self.workdir
            .as_ref()
            .ok_or_else(|| anyhow!("work directory is not resolved"))
    }

    pub(crate) fn require_gadget(&self) -> anyhow::Result<&GadgetInfo> {
        self.gadget
            .as_ref()
            .ok_or_else(|| anyhow!("gadget.yaml has not been loaded"))
    }

    /// Directory where final artifacts land, created on demand.
    pub(crate) fn output_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = match &self.common.output_dir {
            Some(dir) => dir.clone(),
            None => self.require_workdir()?.root().to_path_buf(),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory '{}'", dir.display()))?;
        Ok(dir)
    }

    /// Apply the `--image-size` grammar against the loaded gadget.
    ///
    /// A single bare size applies to every volume. Otherwise each
    /// comma-separated token is `<name>:<size>` or `<index>:<size>` with
    /// indices resolving in gadget declaration order; the two syntaxes mix
    /// freely.
    pub fn parse_image_sizes(&mut self) -> anyhow::Result<()> {
        let Some(raw) = self.common.effective_image_size() else {
            return Ok(());
        };
        let gadget = self.require_gadget()?;
        let mut sizes = BTreeMap::new();

        if !raw.contains(':') {
            let size = parse_size(raw)?;
            for (name, _) in &gadget.volumes {
                sizes.insert(name.clone(), size);
            }
        } else {
            for token in raw.split(',') {
                let pieces: Vec<&str> = token.split(':').collect();
                if pieces.len() != 2 {
                    bail!("invalid size token '{token}' in --image-size");
                }
                let size = parse_size(pieces[1])?;
                let key = pieces[0];
                let name = if key.chars().all(|c| c.is_ascii_digit()) {
                    let index: usize =
                        key.parse().map_err(|_| anyhow!("invalid size token '{token}'"))?;
                    gadget
                        .volumes
                        .get(index)
                        .map(|(name, _)| name.clone())
                        .ok_or_else(|| anyhow!("unknown volume index {index} in --image-size"))?
                } else {
                    if gadget.volume(key).is_none() {
                        bail!("unknown volume '{key}' in --image-size");
                    }
                    key.to_string()
                };
                sizes.insert(name, size);
            }
        }

        self.image_sizes = sizes;
        Ok(())
    }

    /// Record the computed content size for a volume. A caller-specified
    /// size smaller than the content is raised to the computed size — the
    /// build never produces an undersized image, and that is not an error.
    pub fn handle_content_size(&mut self, name: &str, computed: u64) {
        let entry = self.image_sizes.entry(name.to_string()).or_insert(0);
        if *entry < computed {
            *entry = computed;
        }
    }
}

/// A flavour of the build pipeline. The type is the flavour: it carries
/// the flavour's arguments, its stage catalogue, and the planner that
/// turns its inputs into an ordered state list.
pub trait Machine: Sized {
    fn core(&mut self) -> &mut StateMachine;
    fn core_ref(&self) -> &StateMachine;

    /// The full universe of stages this flavour knows.
    fn catalogue() -> Vec<Stage<Self>>;

    /// Plan a fresh run: validate flavour inputs and emit the ordered
    /// state list. Planning never executes stages.
    fn plan(&mut self) -> Result<Vec<String>, BuildError>;

    /// Flavour-specific record persisted inside the checkpoint.
    fn save_context(&self) -> Result<serde_json::Value, BuildError>;

    /// Restore the flavour record read back from a checkpoint.
    fn load_context(&mut self, context: serde_json::Value) -> Result<(), BuildError>;

    /// Flavour-specific teardown work; best-effort.
    fn cleanup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub(crate) fn validate_input(core: &StateMachine) -> Result<(), BuildError> {
    if core.opts.until.is_some() && core.opts.thru.is_some() {
        return Err(BuildError::Flag(
            "cannot specify both --until and --thru".to_string(),
        ));
    }
    if core.opts.resume && core.common.workdir.is_none() {
        return Err(BuildError::Flag(
            "must specify a work directory (--workdir) when using --resume".to_string(),
        ));
    }
    Ok(())
}

/// Validate inputs and construct the plan (fresh run) or reload the
/// checkpoint (`--resume`). Nothing is persisted until a stage has run, so
/// a failed setup leaves no state behind.
pub fn setup<M: Machine>(machine: &mut M) -> Result<(), BuildError> {
    validate_input(machine.core_ref())?;

    if machine.core_ref().opts.resume {
        let Some(dir) = machine.core_ref().common.workdir.clone() else {
            return Err(BuildError::Flag(
                "must specify a work directory (--workdir) when using --resume".to_string(),
            ));
        };
        let checkpoint = Checkpoint::read(&dir)?;
        catalog::resolve_all::<M>(&checkpoint.state_list)?;

        let workdir = WorkDir::open_existing(&dir);
        let core = machine.core();
        core.common = checkpoint.common_flags;
        core.common.workdir = Some(dir);
        core.opts = checkpoint.machine_flags;
        core.opts.resume = true;
        core.current_step = checkpoint.current_step;
        core.state_names = checkpoint.state_list;
        core.temp_dirs = workdir.temp_dirs();
        core.workdir = Some(workdir);
        machine.load_context(checkpoint.flavour)?;
    } else {
        let names = machine.plan()?;
        for flag in [&machine.core_ref().opts.until, &machine.core_ref().opts.thru] {
            if let Some(name) = flag {
                if !names.contains(name) {
                    return Err(BuildError::Flag(format!("unknown stage: {name}")));
                }
            }
        }
        catalog::resolve_all::<M>(&names)?;

        let workdir = WorkDir::resolve(machine.core_ref().common.workdir.as_deref())?;
        let core = machine.core();
        core.current_step = 0;
        core.state_names = names;
        core.temp_dirs = workdir.temp_dirs();
        core.workdir = Some(workdir);
    }

    Ok(())
}

/// Execute the planned stages from the current coordinate.
///
/// `--thru` stops after running the named stage. `--until` is evaluated
/// against the *next* stage once the current one completes, so the stage
/// at the starting coordinate always executes: an `--until` naming the
/// first planned stage never fires, and a resume that stopped on an
/// `--until` boundary runs the boundary stage first and continues to the
/// end. Both boundaries persist the checkpoint. A stage failure leaves the
/// checkpoint at the failed stage and is returned as
/// [`BuildError::Stage`]; the executor never retries.
pub fn run<M: Machine>(machine: &mut M) -> Result<(), BuildError> {
    let names = machine.core_ref().state_names.clone();
    let stages = catalog::resolve_all::<M>(&names)?;

    let mut index = machine.core_ref().current_step;
    while index < stages.len() {
        let stage = stages[index];
        if machine.core_ref().cancel.is_cancelled() {
            write_metadata(machine)?;
            return Ok(());
        }
        if machine.core_ref().common.debug {
            println!("{}", stage.name);
        }

        (stage.run)(machine).map_err(|cause| BuildError::Stage {
            stage: stage.name.to_string(),
            cause,
        })?;
        machine.core().current_step = index + 1;

        if stage.name != catalog::FINISH {
            write_metadata(machine)?;
        }

        let boundary = {
            let opts = &machine.core_ref().opts;
            opts.thru.as_deref() == Some(stage.name)
                || stages
                    .get(index + 1)
                    .is_some_and(|next| opts.until.as_deref() == Some(next.name))
        };
        if boundary {
            return Ok(());
        }
        index += 1;
    }

    Ok(())
}

/// Flavour cleanup, then removal of the work directory when it is marked
/// delete-on-exit. Every step is attempted; removal failures are warnings.
pub fn teardown<M: Machine>(machine: &mut M) -> Result<(), BuildError> {
    let cleanup_result = machine.cleanup();
    if let Some(workdir) = &machine.core_ref().workdir {
        workdir.cleanup();
    }
    cleanup_result.map_err(|e| BuildError::Resource(format!("teardown: {e}")))
}

/// Persist the executor's durable state. Aborts the run on failure:
/// continuing with a stale coordinate would be unsafe.
pub(crate) fn write_metadata<M: Machine>(machine: &mut M) -> Result<(), BuildError> {
    let flavour = machine.save_context()?;
    let core = machine.core_ref();
    let workdir = core.workdir.as_ref().ok_or_else(|| {
        BuildError::CheckpointIo("checkpoint write failed: work directory not resolved".to_string())
    })?;
    let checkpoint = Checkpoint {
        current_step: core.current_step,
        state_list: core.state_names.clone(),
        common_flags: core.common.clone(),
        machine_flags: core.opts.clone(),
        flavour,
    };
    checkpoint.write(workdir.root())
}
