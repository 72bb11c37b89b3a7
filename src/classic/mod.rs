//! Classic-flavour builds: image-definition driven Ubuntu images.
//!
//! The image definition selects how the gadget tree and the root
//! filesystem are produced and which customisation stages run; the planner
//! stitches those choices into the common spine. Package installation,
//! live-build and snap preseeding are driven through the command seam.

pub mod definition;

use crate::error::BuildError;
use crate::fsutil;
use crate::machine::{self, catalog, states, Machine, Stage, StateMachine};
use crate::opts::{CommonOpts, MachineOpts};
use anyhow::{anyhow, bail, Context, Result};
use definition::{parse_image_definition, ImageDefinition};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassicArgs {
    pub image_definition: PathBuf,
}

pub struct ClassicMachine {
    pub core: StateMachine,
    pub args: ClassicArgs,
    pub definition: Option<ImageDefinition>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClassicContext {
    image_definition: PathBuf,
    definition: ImageDefinition,
}

impl ClassicMachine {
    pub fn new(common: CommonOpts, machine_opts: MachineOpts, args: ClassicArgs) -> Self {
        ClassicMachine {
            core: StateMachine::new(common, machine_opts),
            args,
            definition: None,
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

    fn definition(&self) -> Result<&ImageDefinition> {
        self.definition
            .as_ref()
            .ok_or_else(|| anyhow!("image definition has not been parsed"))
    }
}

impl Machine for ClassicMachine {
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
                run: states::make_temporary_directories::<ClassicMachine>,
            },
            Stage {
                name: catalog::PREPARE_GADGET_TREE,
                run: prepare_gadget_tree,
            },
            Stage {
                name: catalog::BUILD_GADGET_TREE,
                run: build_gadget_tree,
            },
            Stage {
                name: catalog::LOAD_GADGET_YAML,
                run: states::load_gadget_yaml::<ClassicMachine>,
            },
            Stage {
                name: catalog::EXTRACT_ROOTFS_TAR,
                run: extract_rootfs_tar,
            },
            Stage {
                name: catalog::BUILD_ROOTFS_FROM_SEED,
                run: build_rootfs_from_seed,
            },
            Stage {
                name: catalog::BUILD_ROOTFS_FROM_TASKS,
                run: build_rootfs_from_tasks,
            },
            Stage {
                name: catalog::CUSTOMIZE_CLOUD_INIT,
                run: customize_cloud_init,
            },
            Stage {
                name: catalog::CONFIGURE_EXTRA_PPAS,
                run: configure_extra_ppas,
            },
            Stage {
                name: catalog::INSTALL_EXTRA_PACKAGES,
                run: install_extra_packages,
            },
            Stage {
                name: catalog::INSTALL_EXTRA_SNAPS,
                run: install_extra_snaps,
            },
            Stage {
                name: catalog::PERFORM_MANUAL_CUSTOMIZATION,
                run: perform_manual_customization,
            },
            Stage {
                name: catalog::GENERATE_DISK_INFO,
                run: states::generate_disk_info::<ClassicMachine>,
            },
            Stage {
                name: catalog::CALCULATE_ROOTFS_SIZE,
                run: states::calculate_rootfs_size::<ClassicMachine>,
            },
            Stage {
                name: catalog::PREPOPULATE_BOOTFS_CONTENTS,
                run: states::prepopulate_bootfs_contents::<ClassicMachine>,
            },
            Stage {
                name: catalog::POPULATE_BOOTFS_CONTENTS,
                run: states::populate_bootfs_contents::<ClassicMachine>,
            },
            Stage {
                name: catalog::POPULATE_PREPARE_PARTITIONS,
                run: states::populate_prepare_partitions::<ClassicMachine>,
            },
            Stage {
                name: catalog::MAKE_DISK,
                run: states::make_disk::<ClassicMachine>,
            },
            Stage {
                name: catalog::GENERATE_MANIFEST,
                run: generate_manifest,
            },
            Stage {
                name: catalog::FINISH,
                run: states::finish::<ClassicMachine>,
            },
        ]
    }

    fn plan(&mut self) -> Result<Vec<String>, BuildError> {
        let definition = parse_image_definition(&self.args.image_definition)?;
        let states = calculate_states(&definition);
        self.definition = Some(definition);
        Ok(states)
    }

    fn save_context(&self) -> Result<serde_json::Value, BuildError> {
        let definition = self.definition.clone().ok_or_else(|| {
            BuildError::CheckpointIo(
                "checkpoint write failed: image definition not parsed".to_string(),
            )
        })?;
        serde_json::to_value(ClassicContext {
            image_definition: self.args.image_definition.clone(),
            definition,
        })
        .map_err(|e| BuildError::CheckpointIo(format!("checkpoint write failed: {e}")))
    }

    fn load_context(&mut self, context: serde_json::Value) -> Result<(), BuildError> {
        let context: ClassicContext = serde_json::from_value(context)
            .map_err(|e| BuildError::CheckpointIo(format!("metadata read error: {e}")))?;
        self.args.image_definition = context.image_definition;
        self.definition = Some(context.definition);
        Ok(())
    }
}

/// Turn a parsed image definition into the ordered state list: a gadget
/// stage, exactly one rootfs stage, one stage per non-empty customisation
/// block, all stitched into the common spine. Deterministic for a given
/// definition.
pub(crate) fn calculate_states(definition: &ImageDefinition) -> Vec<String> {
    let mut states: Vec<&str> = vec![catalog::MAKE_TEMPORARY_DIRECTORIES];

    let build_gadget = definition
        .gadget
        .as_ref()
        .map(|g| g.gadget_type == "git")
        .unwrap_or(false);
    states.push(if build_gadget {
        catalog::BUILD_GADGET_TREE
    } else {
        catalog::PREPARE_GADGET_TREE
    });
    states.push(catalog::LOAD_GADGET_YAML);

    if definition.rootfs.seed.is_some() {
        states.push(catalog::BUILD_ROOTFS_FROM_SEED);
    } else if definition.rootfs.tasks.is_some() {
        states.push(catalog::BUILD_ROOTFS_FROM_TASKS);
    } else {
        states.push(catalog::EXTRACT_ROOTFS_TAR);
    }

    if let Some(customization) = &definition.customization {
        if customization.cloud_init.is_some() {
            states.push(catalog::CUSTOMIZE_CLOUD_INIT);
        }
        if !customization.extra_ppas.is_empty() {
            states.push(catalog::CONFIGURE_EXTRA_PPAS);
        }
        if !customization.extra_packages.is_empty() {
            states.push(catalog::INSTALL_EXTRA_PACKAGES);
        }
        if !customization.extra_snaps.is_empty() {
            states.push(catalog::INSTALL_EXTRA_SNAPS);
        }
        if customization.manual.is_some() {
            states.push(catalog::PERFORM_MANUAL_CUSTOMIZATION);
        }
    }

    states.extend_from_slice(catalog::COMMON_SUFFIX);
    states.into_iter().map(str::to_string).collect()
}

/// Resolve a gadget/tar location that may be spelled as a `file://` URI.
fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// Copy a prebuilt gadget tree into the unpack area.
fn prepare_gadget_tree(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let gadget = definition
        .gadget
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no gadget section"))?;
    let source = local_path(
        gadget
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("gadget url is required for {} gadgets", gadget.gadget_type))?,
    );
    if !source.is_dir() {
        bail!("gadget tree '{}' does not exist", source.display());
    }
    let dest = machine.core.temp_dirs.unpack.join("gadget");
    fsutil::copy_tree(&source, &dest)
        .with_context(|| format!("copying gadget tree '{}'", source.display()))
}

/// Clone the gadget source and build it with make.
fn build_gadget_tree(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let gadget = definition
        .gadget
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no gadget section"))?;
    let url = gadget
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("gadget url is required for git gadgets"))?;

    let scratch = machine.core.temp_dirs.unpack.join("gadget-src");
    let mut clone = Command::new("git");
    clone
        .arg("clone")
        .args(["--depth", "1", "--branch", &gadget.branch])
        .arg(url)
        .arg(&scratch);
    machine
        .core
        .runner
        .run(&mut clone)
        .with_context(|| format!("cloning gadget '{url}'"))?;

    let mut make = Command::new("make");
    make.current_dir(&scratch)
        .env("ARCH", &definition.architecture)
        .env("SERIES", &definition.series);
    machine
        .core
        .runner
        .run(&mut make)
        .context("building gadget tree")?;

    // gadget makefiles install into install/; some build in-tree
    let built = if scratch.join("install").is_dir() {
        scratch.join("install")
    } else {
        scratch.clone()
    };
    fsutil::copy_tree(&built, &machine.core.temp_dirs.unpack.join("gadget"))
        .context("copying built gadget tree")
}

/// Unpack a prebuilt root filesystem archive.
fn extract_rootfs_tar(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let tar_source = definition
        .rootfs
        .tar
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no rootfs tar section"))?;
    let path = local_path(&tar_source.url);
    let rootfs = machine.core.temp_dirs.rootfs.clone();

    let file = File::open(&path)
        .with_context(|| format!("opening rootfs tar '{}'", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "zst") {
        let decoder = zstd::stream::Decoder::new(file)?;
        tar::Archive::new(decoder)
            .unpack(&rootfs)
            .with_context(|| format!("unpacking rootfs tar '{}'", path.display()))?;
    } else {
        tar::Archive::new(file)
            .unpack(&rootfs)
            .with_context(|| format!("unpacking rootfs tar '{}'", path.display()))?;
    }
    normalize_fstab(&rootfs)
}

/// Bootstrap the root filesystem and install the seed's package sets.
fn build_rootfs_from_seed(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let seed = definition
        .rootfs
        .seed
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no rootfs seed section"))?;
    let rootfs = machine.core.temp_dirs.rootfs.clone();
    let runner = machine.core.runner;

    let mut debootstrap = Command::new("debootstrap");
    debootstrap
        .arg(format!(
            "--components={}",
            definition.rootfs.components.join(",")
        ))
        .arg(&definition.series)
        .arg(&rootfs);
    runner
        .run(&mut debootstrap)
        .with_context(|| format!("bootstrapping series '{}'", definition.series))?;

    let mut update = Command::new("chroot");
    update.arg(&rootfs).args(["apt-get", "update"]);
    runner.run(&mut update).context("updating apt indices")?;

    let mut install = Command::new("chroot");
    install
        .arg(&rootfs)
        .args(["apt-get", "install", "--assume-yes"]);
    for name in &seed.names {
        install.arg(name);
    }
    runner
        .run(&mut install)
        .context("installing seeded package sets")?;

    normalize_fstab(&rootfs)
}

/// Drive live-build for task-based rootfs construction.
fn build_rootfs_from_tasks(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let tasks = definition
        .rootfs
        .tasks
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no rootfs tasks section"))?;
    let unpack = machine.core.temp_dirs.unpack.clone();
    let rootfs = machine.core.temp_dirs.rootfs.clone();
    let runner = machine.core.runner;

    let mut config = Command::new("lb");
    config
        .current_dir(&unpack)
        .arg("config")
        .env("SUITE", &definition.series)
        .env("ARCH", &definition.architecture);
    runner.run(&mut config).context("configuring live-build")?;

    let mut build = Command::new("lb");
    build
        .current_dir(&unpack)
        .arg("build")
        .env("LB_TASKS", tasks.names.join(","));
    runner.run(&mut build).context("running live-build")?;

    let chroot = unpack.join("chroot");
    if !chroot.is_dir() {
        bail!("live-build produced no chroot under '{}'", unpack.display());
    }
    fsutil::copy_tree(&chroot, &rootfs).context("copying live-build chroot")?;
    normalize_fstab(&rootfs)
}

/// Place the definition's cloud-init documents into the rootfs seed.
fn customize_cloud_init(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let cloud_init = definition
        .customization
        .as_ref()
        .and_then(|c| c.cloud_init.as_ref())
        .ok_or_else(|| anyhow!("image definition has no cloud_init customization"))?;

    let seed_dir = machine
        .core
        .temp_dirs
        .rootfs
        .join("var/lib/cloud/seed/nocloud");
    fs::create_dir_all(&seed_dir)
        .with_context(|| format!("creating cloud-init seed dir '{}'", seed_dir.display()))?;

    if let Some(user_data) = &cloud_init.user_data {
        fs::write(seed_dir.join("user-data"), user_data)
            .context("writing cloud-init user-data")?;
    }
    let meta_data = cloud_init
        .meta_data
        .clone()
        .unwrap_or_else(|| "instance-id: nocloud-static\n".to_string());
    fs::write(seed_dir.join("meta-data"), meta_data).context("writing cloud-init meta-data")?;
    Ok(())
}

fn ppa_sources_list(rootfs: &Path, ppa_name: &str) -> PathBuf {
    rootfs
        .join("etc/apt/sources.list.d")
        .join(format!("{}.list", ppa_name.replace('/', "-")))
}

/// Write one sources.list entry per PPA and import its signing key.
fn configure_extra_ppas(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let customization = definition
        .customization
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no customization section"))?;
    let rootfs = machine.core.temp_dirs.rootfs.clone();
    let runner = machine.core.runner;

    for ppa in &customization.extra_ppas {
        let list = ppa_sources_list(&rootfs, &ppa.name);
        if let Some(parent) = list.parent() {
            fs::create_dir_all(parent)?;
        }
        let auth = ppa
            .auth
            .as_deref()
            .map(|auth| format!("{auth}@"))
            .unwrap_or_default();
        let host = if ppa.auth.is_some() {
            "private-ppa.launchpadcontent.net"
        } else {
            "ppa.launchpadcontent.net"
        };
        let entry = format!(
            "deb https://{auth}{host}/{} {} main\n",
            ppa.name, definition.series
        );
        fs::write(&list, entry)
            .with_context(|| format!("writing PPA sources list '{}'", list.display()))?;

        let mut import = Command::new("chroot");
        import.arg(&rootfs).args([
            "apt-key",
            "adv",
            "--keyserver",
            "keyserver.ubuntu.com",
            "--recv-keys",
            &ppa.fingerprint,
        ]);
        runner
            .run(&mut import)
            .with_context(|| format!("importing signing key for PPA '{}'", ppa.name))?;
    }

    let mut update = Command::new("chroot");
    update.arg(&rootfs).args(["apt-get", "update"]);
    runner.run(&mut update).context("updating apt indices")?;
    Ok(())
}

/// Install the definition's extra packages, then drop PPAs that should not
/// stay enabled in the shipped image.
fn install_extra_packages(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let customization = definition
        .customization
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no customization section"))?;
    let rootfs = machine.core.temp_dirs.rootfs.clone();
    let runner = machine.core.runner;

    let mut install = Command::new("chroot");
    install
        .arg(&rootfs)
        .args(["apt-get", "install", "--assume-yes"]);
    for package in &customization.extra_packages {
        install.arg(&package.name);
    }
    runner
        .run(&mut install)
        .context("installing extra packages")?;

    for ppa in &customization.extra_ppas {
        if ppa.keep_enabled == Some(false) {
            let list = ppa_sources_list(&rootfs, &ppa.name);
            if list.is_file() {
                fs::remove_file(&list).with_context(|| {
                    format!("removing disabled PPA sources list '{}'", list.display())
                })?;
            }
        }
    }
    Ok(())
}

/// Preseed the definition's extra snaps into the root filesystem.
fn install_extra_snaps(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let customization = definition
        .customization
        .as_ref()
        .ok_or_else(|| anyhow!("image definition has no customization section"))?;
    let rootfs = machine.core.temp_dirs.rootfs.clone();

    let mut cmd = Command::new("snap");
    cmd.arg("prepare-image")
        .arg("--classic")
        .arg("--arch")
        .arg(&definition.architecture);
    for snap in &customization.extra_snaps {
        cmd.arg("--snap").arg(format!("{}={}", snap.name, snap.channel));
    }
    for snap in &machine.core.common.snaps {
        cmd.arg("--snap").arg(snap);
    }
    cmd.arg(&rootfs);
    machine
        .core
        .runner
        .run(&mut cmd)
        .context("preseeding extra snaps")?;
    Ok(())
}

/// Apply the manual customisation block: file copies, touches, and
/// scripts executed inside the chroot.
fn perform_manual_customization(machine: &mut ClassicMachine) -> Result<()> {
    let definition = machine.definition()?.clone();
    let manual = definition
        .customization
        .as_ref()
        .and_then(|c| c.manual.as_ref())
        .ok_or_else(|| anyhow!("image definition has no manual customization"))?;
    let rootfs = machine.core.temp_dirs.rootfs.clone();
    let runner = machine.core.runner;

    for copy in &manual.copy_file {
        let dest = rootfs.join(copy.destination.trim_start_matches('/'));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&copy.source, &dest)
            .with_context(|| format!("copying '{}' into the rootfs", copy.source))?;
    }
    for touch in &manual.touch_file {
        let path = rootfs.join(touch.path.trim_start_matches('/'));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("touching '{}'", path.display()))?;
    }
    for execute in &manual.execute {
        let mut cmd = Command::new("chroot");
        cmd.arg(&rootfs).arg(&execute.path);
        runner
            .run(&mut cmd)
            .with_context(|| format!("executing customization script '{}'", execute.path))?;
    }
    Ok(())
}

/// List every installed package into `filesystem.manifest`.
fn generate_manifest(machine: &mut ClassicMachine) -> Result<()> {
    let rootfs = machine.core.temp_dirs.rootfs.clone();
    let output_dir = machine.core.output_dir()?;

    let mut query = Command::new("chroot");
    query.arg(&rootfs).args([
        "dpkg-query",
        "-W",
        "--showformat=${Package} ${Version}\n",
    ]);
    let output = machine
        .core
        .runner
        .run(&mut query)
        .context("listing installed packages")?;

    let manifest = output_dir.join("filesystem.manifest");
    let mut file = File::create(&manifest)
        .with_context(|| format!("creating manifest file '{}'", manifest.display()))?;
    file.write_all(&output.stdout)
        .with_context(|| format!("writing manifest file '{}'", manifest.display()))?;
    Ok(())
}

/// Make sure the image boots from the writable partition label, replacing
/// whatever root entry the rootfs source shipped.
fn normalize_fstab(rootfs: &Path) -> Result<()> {
    let fstab = rootfs.join("etc/fstab");
    let root_entry = "LABEL=writable   /    ext4   defaults    0 0\n";

    let mut lines: Vec<String> = Vec::new();
    if fstab.is_file() {
        for line in fs::read_to_string(&fstab)?.lines() {
            let mut fields = line.split_whitespace();
            let is_root_mount = fields.nth(1) == Some("/");
            if !is_root_mount {
                lines.push(line.to_string());
            }
        }
    } else if let Some(parent) = fstab.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut contents = String::from(root_entry);
    for line in lines {
        contents.push_str(&line);
        contents.push('\n');
    }
    fs::write(&fstab, contents)
        .with_context(|| format!("writing fstab '{}'", fstab.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{testing, CmdRunner};
    use crate::workdir::WorkDir;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use tempfile::TempDir;

    fn definition_from(contents: &str) -> ImageDefinition {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("def.yaml");
        fs::write(&path, contents).unwrap();
        parse_image_definition(&path).unwrap()
    }

    fn machine_for(tmp: &TempDir, definition_yaml: &str) -> ClassicMachine {
        let def_path = tmp.path().join("image_definition.yaml");
        fs::write(&def_path, definition_yaml).unwrap();
        let mut machine = ClassicMachine::new(
            CommonOpts {
                workdir: Some(tmp.path().join("work")),
                ..CommonOpts::default()
            },
            MachineOpts::default(),
            ClassicArgs {
                image_definition: def_path,
            },
        );
        machine.core.runner = CmdRunner::with(testing::ok_exec);
        machine
    }

    fn resolve_workdir(machine: &mut ClassicMachine) {
        let workdir = WorkDir::resolve(machine.core.common.workdir.as_deref()).unwrap();
        machine.core.temp_dirs = workdir.temp_dirs();
        machine.core.workdir = Some(workdir);
        states::make_temporary_directories(machine).unwrap();
    }

    const SEED_DEFINITION: &str = r#"
name: ubuntu-server
architecture: amd64
series: jammy
class: preinstalled
gadget:
  type: prebuilt
  url: file:///nonexistent/gadget
rootfs:
  seed:
    urls: [https://ubuntu-archive-team.ubuntu.com/seeds/]
    names: [server]
"#;

    #[test]
    fn calculate_states_selects_gadget_stage() {
        let git = definition_from(
            &SEED_DEFINITION
                .replace("type: prebuilt", "type: git")
                .replace("file:///nonexistent/gadget", "https://example.com/g.git"),
        );
        let states = calculate_states(&git);
        assert!(states.contains(&"build_gadget_tree".to_string()));
        assert!(!states.contains(&"prepare_gadget_tree".to_string()));

        let prebuilt = definition_from(SEED_DEFINITION);
        let states = calculate_states(&prebuilt);
        assert!(states.contains(&"prepare_gadget_tree".to_string()));
        assert!(!states.contains(&"build_gadget_tree".to_string()));
    }

    #[test]
    fn calculate_states_selects_exactly_one_rootfs_stage() {
        let cases = [
            (
                SEED_DEFINITION.to_string(),
                "build_rootfs_from_seed",
            ),
            (
                SEED_DEFINITION.replace(
                    "  seed:\n    urls: [https://ubuntu-archive-team.ubuntu.com/seeds/]\n    names: [server]",
                    "  tasks:\n    names: [server]",
                ),
                "build_rootfs_from_tasks",
            ),
            (
                SEED_DEFINITION.replace(
                    "  seed:\n    urls: [https://ubuntu-archive-team.ubuntu.com/seeds/]\n    names: [server]",
                    "  tar:\n    url: /srv/rootfs.tar",
                ),
                "extract_rootfs_tar",
            ),
        ];
        let all_rootfs_stages = [
            "build_rootfs_from_seed",
            "build_rootfs_from_tasks",
            "extract_rootfs_tar",
        ];
        for (yaml, expected) in cases {
            let states = calculate_states(&definition_from(&yaml));
            for stage in all_rootfs_stages {
                assert_eq!(
                    states.contains(&stage.to_string()),
                    stage == expected,
                    "{expected}: {states:?}"
                );
            }
        }
    }

    #[test]
    fn calculate_states_adds_present_customizations_in_order() {
        let yaml = format!(
            "{SEED_DEFINITION}customization:\n  cloud_init:\n    user_data: \"#cloud-config\"\n  extra_ppas:\n    - name: example/ppa\n      fingerprint: DEADBEEF\n  extra_packages:\n    - name: hello\n  extra_snaps:\n    - name: hello\n  manual:\n    touch_file:\n      - path: /etc/marker\n"
        );
        let states = calculate_states(&definition_from(&yaml));
        let expected = [
            "customize_cloud_init",
            "configure_extra_ppas",
            "install_extra_packages",
            "install_extra_snaps",
            "perform_manual_customization",
        ];
        let positions: Vec<usize> = expected
            .iter()
            .map(|stage| states.iter().position(|s| s == stage).expect(stage))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "customisations must keep catalogue order");

        // absent blocks contribute no stages
        let bare = calculate_states(&definition_from(SEED_DEFINITION));
        for stage in expected {
            assert!(!bare.contains(&stage.to_string()), "{stage}");
        }
    }

    #[test]
    fn plan_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let mut machine = machine_for(&tmp, SEED_DEFINITION);
        let first = machine.plan().unwrap();
        let second = machine.plan().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn prepare_gadget_tree_copies_the_tree() {
        let tmp = TempDir::new().unwrap();
        let gadget_src = tmp.path().join("gadget-tree");
        fs::create_dir_all(gadget_src.join("meta")).unwrap();
        fs::write(gadget_src.join("meta/gadget.yaml"), b"volumes: {pc: {}}\n").unwrap();

        let yaml = SEED_DEFINITION.replace(
            "file:///nonexistent/gadget",
            &format!("file://{}", gadget_src.display()),
        );
        let mut machine = machine_for(&tmp, yaml.as_str());
        machine.setup().unwrap();
        resolve_workdir(&mut machine);

        prepare_gadget_tree(&mut machine).unwrap();
        assert!(machine
            .core
            .temp_dirs
            .unpack
            .join("gadget/meta/gadget.yaml")
            .is_file());
    }

    #[test]
    fn extract_rootfs_tar_unpacks_and_fixes_fstab() {
        let tmp = TempDir::new().unwrap();

        // build a small rootfs tar with a bogus fstab
        let staging = tmp.path().join("staging");
        fs::create_dir_all(staging.join("etc")).unwrap();
        fs::write(
            staging.join("etc/fstab"),
            b"/dev/sda1  /      ext4 defaults 0 1\n/dev/sda2  /home  ext4 defaults 0 2\n",
        )
        .unwrap();
        let tar_path = tmp.path().join("rootfs.tar");
        let tar_file = File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(tar_file);
        builder.append_dir_all(".", &staging).unwrap();
        builder.finish().unwrap();

        let yaml = SEED_DEFINITION.replace(
            "  seed:\n    urls: [https://ubuntu-archive-team.ubuntu.com/seeds/]\n    names: [server]",
            &format!("  tar:\n    url: {}", tar_path.display()),
        );
        let mut machine = machine_for(&tmp, yaml.as_str());
        machine.setup().unwrap();
        resolve_workdir(&mut machine);

        extract_rootfs_tar(&mut machine).unwrap();

        let fstab =
            fs::read_to_string(machine.core.temp_dirs.rootfs.join("etc/fstab")).unwrap();
        assert!(fstab.contains("LABEL=writable"), "{fstab}");
        assert!(!fstab.contains("/dev/sda1"), "{fstab}");
        assert!(fstab.contains("/dev/sda2"), "{fstab}");
    }

    #[test]
    fn cloud_init_customization_writes_seed_files() {
        let tmp = TempDir::new().unwrap();
        let yaml = format!(
            "{SEED_DEFINITION}customization:\n  cloud_init:\n    user_data: \"#cloud-config\\nhostname: custom\\n\"\n"
        );
        let mut machine = machine_for(&tmp, yaml.as_str());
        machine.setup().unwrap();
        resolve_workdir(&mut machine);

        customize_cloud_init(&mut machine).unwrap();

        let seed_dir = machine.core.temp_dirs.rootfs.join("var/lib/cloud/seed/nocloud");
        let user_data = fs::read_to_string(seed_dir.join("user-data")).unwrap();
        assert!(user_data.contains("hostname: custom"));
        assert!(seed_dir.join("meta-data").is_file());
    }

    #[test]
    fn disabled_ppas_are_dropped_after_package_install() {
        let tmp = TempDir::new().unwrap();
        let yaml = format!(
            "{SEED_DEFINITION}customization:\n  extra_ppas:\n    - name: example/keep\n      fingerprint: DEADBEEF\n    - name: example/drop\n      fingerprint: CAFEF00D\n      keep_enabled: false\n  extra_packages:\n    - name: hello\n"
        );
        let mut machine = machine_for(&tmp, yaml.as_str());
        machine.setup().unwrap();
        resolve_workdir(&mut machine);

        configure_extra_ppas(&mut machine).unwrap();
        let rootfs = machine.core.temp_dirs.rootfs.clone();
        assert!(ppa_sources_list(&rootfs, "example/keep").is_file());
        assert!(ppa_sources_list(&rootfs, "example/drop").is_file());

        install_extra_packages(&mut machine).unwrap();
        assert!(ppa_sources_list(&rootfs, "example/keep").is_file());
        assert!(!ppa_sources_list(&rootfs, "example/drop").exists());
    }

    #[test]
    fn manual_customization_copies_and_touches() {
        let tmp = TempDir::new().unwrap();
        let payload = tmp.path().join("motd");
        fs::write(&payload, b"welcome\n").unwrap();
        let yaml = format!(
            "{SEED_DEFINITION}customization:\n  manual:\n    copy_file:\n      - source: {}\n        destination: /etc/motd\n    touch_file:\n      - path: /etc/cloud/cloud-init.disabled\n",
            payload.display()
        );
        let mut machine = machine_for(&tmp, yaml.as_str());
        machine.setup().unwrap();
        resolve_workdir(&mut machine);

        perform_manual_customization(&mut machine).unwrap();

        let rootfs = machine.core.temp_dirs.rootfs.clone();
        assert_eq!(fs::read(rootfs.join("etc/motd")).unwrap(), b"welcome\n");
        assert!(rootfs.join("etc/cloud/cloud-init.disabled").is_file());
    }

    fn dpkg_query_exec(_cmd: &mut Command) -> io::Result<Output> {
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: b"foo 1.2\nbar 1.4-1ubuntu4.1\nlibbaz 0.1.3ubuntu2\n".to_vec(),
            stderr: Vec::new(),
        })
    }

    #[test]
    fn package_manifest_captures_dpkg_output() {
        let tmp = TempDir::new().unwrap();
        let mut machine = machine_for(&tmp, SEED_DEFINITION);
        machine.core.runner = CmdRunner::with(dpkg_query_exec);
        machine.core.common.output_dir = Some(tmp.path().join("output"));
        machine.setup().unwrap();
        resolve_workdir(&mut machine);

        generate_manifest(&mut machine).unwrap();

        let manifest =
            fs::read_to_string(tmp.path().join("output/filesystem.manifest")).unwrap();
        for pkg in ["foo 1.2", "bar 1.4-1ubuntu4.1", "libbaz 0.1.3ubuntu2"] {
            assert!(manifest.contains(pkg), "{manifest}");
        }
    }

    #[test]
    fn context_roundtrip_restores_the_definition() {
        let tmp = TempDir::new().unwrap();
        let mut machine = machine_for(&tmp, SEED_DEFINITION);
        machine.setup().unwrap();

        let saved = machine.save_context().unwrap();
        let mut restored = machine_for(&tmp, SEED_DEFINITION);
        restored.load_context(saved).unwrap();
        let definition = restored.definition.unwrap();
        assert_eq!(definition.name, "ubuntu-server");
        assert_eq!(definition.rootfs.archive, "ubuntu");
    }
}
