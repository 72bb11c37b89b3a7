//! Snap-flavour builds: model-assertion driven Ubuntu Core images.
//!
//! The heavy lifting (snap resolution, seeding, gadget unpacking) is
//! delegated to `snap prepare-image`; this module plans the fixed snap
//! spine, drives the tool through the command seam, and arranges the
//! prepared trees into the common partition staging areas.

use crate::error::BuildError;
use crate::fsutil;
use crate::machine::{self, catalog, states, Machine, Stage, StateMachine};
use crate::opts::{CommonOpts, MachineOpts};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapArgs {
    pub model_assertion: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapOpts {
    /// Disable console-conf on first boot (UC16/UC18 only).
    pub disable_console_conf: bool,
    /// Mark the image as a factory image via the seed's boot flags.
    pub factory_image: bool,
}

pub struct SnapMachine {
    pub core: StateMachine,
    pub args: SnapArgs,
    pub opts: SnapOpts,
}

/// Flavour record persisted inside the checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct SnapContext {
    model_assertion: PathBuf,
    opts: SnapOpts,
    is_seeded: bool,
}

impl SnapMachine {
    pub fn new(
        common: CommonOpts,
        machine_opts: MachineOpts,
        args: SnapArgs,
        opts: SnapOpts,
    ) -> Self {
        SnapMachine {
            core: StateMachine::new(common, machine_opts),
            args,
            opts,
        }
    }

    pub fn setup(&mut self) -> Result<(), BuildError> {
        machine::setup(self)
    }

    pub fn run(&mut self) -> Result<(), BuildError> {
        machine::run(self)
    }

    pub fn teardown(&mut self) -> Result<(), BuildError> {
        machine::teardown(self)
    }
}

impl Machine for SnapMachine {
    fn core(&mut self) -> &mut StateMachine {
        &mut self.core
    }

    fn core_ref(&self) -> &StateMachine {
        &self.core
    }

    fn catalogue() -> Vec<Stage<Self>> {
        vec![
            Stage {
                name: catalog::MAKE_TEMPORARY_DIRECTORIES,
                run: states::make_temporary_directories::<SnapMachine>,
            },
            Stage {
                name: catalog::PREPARE_IMAGE,
                run: prepare_image,
            },
            Stage {
                name: catalog::LOAD_GADGET_YAML,
                run: states::load_gadget_yaml::<SnapMachine>,
            },
            Stage {
                name: catalog::POPULATE_ROOTFS_CONTENTS,
                run: populate_rootfs_contents,
            },
            Stage {
                name: catalog::GENERATE_DISK_INFO,
                run: states::generate_disk_info::<SnapMachine>,
            },
            Stage {
                name: catalog::CALCULATE_ROOTFS_SIZE,
                run: states::calculate_rootfs_size::<SnapMachine>,
            },
            Stage {
                name: catalog::PREPOPULATE_BOOTFS_CONTENTS,
                run: states::prepopulate_bootfs_contents::<SnapMachine>,
            },
            Stage {
                name: catalog::POPULATE_BOOTFS_CONTENTS,
                run: states::populate_bootfs_contents::<SnapMachine>,
            },
            Stage {
                name: catalog::POPULATE_PREPARE_PARTITIONS,
                run: states::populate_prepare_partitions::<SnapMachine>,
            },
            Stage {
                name: catalog::MAKE_DISK,
                run: states::make_disk::<SnapMachine>,
            },
            Stage {
                name: catalog::GENERATE_MANIFEST,
                run: generate_manifest,
            },
            Stage {
                name: catalog::FINISH,
                run: states::finish::<SnapMachine>,
            },
        ]
    }

    fn plan(&mut self) -> Result<Vec<String>, BuildError> {
        let path = &self.args.model_assertion;
        let text = fs::read_to_string(path).map_err(|e| {
            BuildError::Flag(format!(
                "model assertion '{}' is not readable: {}",
                path.display(),
                e
            ))
        })?;

        let seeded = model_is_uc20(&text);
        if seeded && self.opts.disable_console_conf {
            return Err(BuildError::Flag(
                "--disable-console-conf is not supported with UC20+ models".to_string(),
            ));
        }
        self.core.is_seeded = seeded;

        Ok(Self::catalogue()
            .iter()
            .map(|stage| stage.name.to_string())
            .collect())
    }

    fn save_context(&self) -> Result<serde_json::Value, BuildError> {
        serde_json::to_value(SnapContext {
            model_assertion: self.args.model_assertion.clone(),
            opts: self.opts.clone(),
            is_seeded: self.core.is_seeded,
        })
        .map_err(|e| BuildError::CheckpointIo(format!("checkpoint write failed: {e}")))
    }

    fn load_context(&mut self, context: serde_json::Value) -> Result<(), BuildError> {
        let context: SnapContext = serde_json::from_value(context)
            .map_err(|e| BuildError::CheckpointIo(format!("metadata read error: {e}")))?;
        self.args.model_assertion = context.model_assertion;
        self.opts = context.opts;
        self.core.is_seeded = context.is_seeded;
        Ok(())
    }
}

/// A model assertion for UC20 or later names a core20+ base, and such
/// models always declare a grade. Those images carry their seed on the
/// boot partition instead of a writable system-data tree.
fn model_is_uc20(assertion: &str) -> bool {
    for line in assertion.lines() {
        let line = line.trim();
        if let Some(base) = line.strip_prefix("base:") {
            let base = base.trim();
            if base
                .strip_prefix("core")
                .and_then(|v| v.parse::<u32>().ok())
                .is_some_and(|v| v >= 20)
            {
                return true;
            }
        }
        if line.starts_with("grade:") {
            return true;
        }
    }
    false
}

/// Drive `snap prepare-image` to resolve, download and seed the model's
/// snaps into the unpack area.
fn prepare_image(machine: &mut SnapMachine) -> Result<()> {
    let unpack = machine.core.temp_dirs.unpack.clone();

    let mut cmd = Command::new("snap");
    cmd.arg("prepare-image");
    if let Some(channel) = &machine.core.common.channel {
        cmd.arg("--channel").arg(channel);
    }
    for snap in &machine.core.common.snaps {
        cmd.arg("--snap").arg(snap);
    }
    if machine.opts.disable_console_conf {
        // UC16/18 only; plan() rejects the flag for seeded models
        let customize = unpack.join("customize.json");
        fs::write(&customize, b"{\"console-conf\": \"disabled\"}\n")
            .with_context(|| format!("writing '{}'", customize.display()))?;
        cmd.arg("--customize").arg(&customize);
    }
    cmd.arg(&machine.args.model_assertion).arg(&unpack);

    machine
        .core
        .runner
        .run(&mut cmd)
        .context("preparing snap image")?;

    if machine.opts.factory_image && machine.core.is_seeded {
        set_factory_boot_flag(&unpack)?;
    }
    Ok(())
}

/// Flag the seed so first boot comes up in factory mode.
fn set_factory_boot_flag(unpack: &Path) -> Result<()> {
    let grubenv = unpack.join("system-seed/EFI/ubuntu/grubenv");
    if let Some(parent) = grubenv.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = if grubenv.is_file() {
        fs::read_to_string(&grubenv)
            .with_context(|| format!("reading '{}'", grubenv.display()))?
    } else {
        String::from("# GRUB Environment Block\n")
    };
    if !contents.contains("snapd_boot_flags=factory") {
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str("snapd_boot_flags=factory\n");
    }
    fs::write(&grubenv, contents)
        .with_context(|| format!("writing '{}'", grubenv.display()))?;
    Ok(())
}

/// Arrange the prepared trees into the rootfs staging area. Seeded images
/// boot from the seed partition, so the seed tree is the "rootfs" that
/// later lands on it; classic-style core18 images get the prepared image
/// tree under `system-data` on the writable partition.
fn populate_rootfs_contents(machine: &mut SnapMachine) -> Result<()> {
    let dirs = machine.core.temp_dirs.clone();

    if machine.core.is_seeded {
        let seed = dirs.unpack.join("system-seed");
        fsutil::copy_tree(&seed, &dirs.rootfs)
            .context("copying prepared seed into rootfs staging")?;
        return Ok(());
    }

    let image = dirs.unpack.join("image");
    if let Some(user_data) = &machine.core.common.cloud_init {
        let seed_dir = image.join("var/lib/cloud/seed/nocloud-net");
        fs::create_dir_all(&seed_dir)
            .with_context(|| format!("creating cloud-init seed dir '{}'", seed_dir.display()))?;
        fs::copy(user_data, seed_dir.join("user-data"))
            .with_context(|| format!("copying cloud-init user-data '{}'", user_data.display()))?;
        fs::write(seed_dir.join("meta-data"), b"instance-id: nocloud-static\n")
            .context("writing cloud-init meta-data")?;
    }
    fsutil::copy_tree(&image, &dirs.rootfs.join("system-data"))
        .context("copying prepared image into rootfs staging")?;
    Ok(())
}

/// Emit content manifests listing the snaps that ship in the image.
/// Seeded images get `seed.manifest`; classic-style images additionally
/// split installed snaps into `snaps.manifest`.
fn generate_manifest(machine: &mut SnapMachine) -> Result<()> {
    let rootfs = machine.core.temp_dirs.rootfs.clone();
    let output_dir = machine.core.output_dir()?;

    if machine.core.is_seeded {
        write_snap_manifest(&rootfs.join("snaps"), &output_dir.join("seed.manifest"))?;
    } else {
        write_snap_manifest(
            &rootfs.join("system-data/var/lib/snapd/snaps"),
            &output_dir.join("snaps.manifest"),
        )?;
        write_snap_manifest(
            &rootfs.join("system-data/var/lib/snapd/seed/snaps"),
            &output_dir.join("seed.manifest"),
        )?;
    }
    Ok(())
}

/// One `name revision` line per `<name>_<revision>.snap` file.
fn write_snap_manifest(snaps_dir: &Path, manifest: &Path) -> Result<()> {
    let mut lines = Vec::new();
    if snaps_dir.is_dir() {
        for entry in fs::read_dir(snaps_dir)
            .with_context(|| format!("reading snaps directory '{}'", snaps_dir.display()))?
        {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".snap") else {
                continue;
            };
            if let Some((snap, revision)) = stem.split_once('_') {
                lines.push(format!("{snap} {revision}"));
            }
        }
    }
    lines.sort();
    let mut contents = lines.join("\n");
    contents.push('\n');
    fs::write(manifest, contents)
        .with_context(|| format!("creating manifest file '{}'", manifest.display()))?;
    Ok(())
}
