//! Stage bodies shared by both flavours: the common spine from temporary
//! directory creation through disk assembly and finish.
//!
//! Handlers are generic over the flavour machine; each flavour's catalogue
//! instantiates them alongside its own stages.

use crate::fsutil;
use crate::gadget::{parse_size, SIZE_MIB};
use crate::machine::Machine;
use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const SECTOR_SIZE: u64 = 512;

/// Create the work directory's fixed-name children.
pub(crate) fn make_temporary_directories<M: Machine>(machine: &mut M) -> Result<()> {
    let dirs = machine.core_ref().require_workdir()?.temp_dirs();
    for dir in [&dirs.unpack, &dirs.rootfs, &dirs.volumes] {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating temporary directory '{}'", dir.display()))?;
    }
    machine.core().temp_dirs = dirs;
    Ok(())
}

/// Parse the gadget descriptor out of the unpacked gadget tree, create one
/// working area per volume, and apply the `--image-size` grammar.
pub(crate) fn load_gadget_yaml<M: Machine>(machine: &mut M) -> Result<()> {
    let path = machine
        .core_ref()
        .temp_dirs
        .unpack
        .join("gadget")
        .join("meta")
        .join("gadget.yaml");
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading gadget.yaml '{}'", path.display()))?;
    let gadget = crate::gadget::GadgetInfo::parse(&text)?;

    let volumes_dir = machine.core_ref().temp_dirs.volumes.clone();
    for (name, _) in &gadget.volumes {
        fs::create_dir_all(volumes_dir.join(name))
            .with_context(|| format!("creating volume working area for '{name}'"))?;
    }

    let seeded = gadget.has_system_seed();
    let core = machine.core();
    core.is_seeded |= seeded;
    core.gadget = Some(gadget);
    core.parse_image_sizes()?;
    Ok(())
}

/// Copy the `--disk-info` file into the image as `.disk/info`.
pub(crate) fn generate_disk_info<M: Machine>(machine: &mut M) -> Result<()> {
    let core = machine.core_ref();
    if let Some(info) = &core.common.disk_info {
        let disk_dir = core.temp_dirs.rootfs.join(".disk");
        fs::create_dir_all(&disk_dir)
            .with_context(|| format!("creating '{}'", disk_dir.display()))?;
        fs::copy(info, disk_dir.join("info"))
            .with_context(|| format!("copying disk info '{}'", info.display()))?;
    }
    Ok(())
}

pub(crate) fn calculate_rootfs_size<M: Machine>(machine: &mut M) -> Result<()> {
    let rootfs = machine.core_ref().temp_dirs.rootfs.clone();
    let size = fsutil::dir_size(&rootfs)?;
    machine.core().rootfs_size = size;
    Ok(())
}

/// Create the per-partition staging skeleton under `volumes/`.
pub(crate) fn prepopulate_bootfs_contents<M: Machine>(machine: &mut M) -> Result<()> {
    let core = machine.core_ref();
    let gadget = core.require_gadget()?;
    for (name, volume) in &gadget.volumes {
        for (index, structure) in volume.structure.iter().enumerate() {
            if structure.is_raw() {
                continue;
            }
            let part_dir = core.temp_dirs.volumes.join(name).join(format!("part{index}"));
            fs::create_dir_all(&part_dir)
                .with_context(|| format!("creating '{}'", part_dir.display()))?;
        }
    }
    Ok(())
}

/// Copy gadget content entries into their partition staging areas.
pub(crate) fn populate_bootfs_contents<M: Machine>(machine: &mut M) -> Result<()> {
    let core = machine.core_ref();
    let gadget = core.require_gadget()?;
    let gadget_dir = core.temp_dirs.unpack.join("gadget");

    for (name, volume) in &gadget.volumes {
        for (index, structure) in volume.structure.iter().enumerate() {
            if structure.is_raw() {
                continue;
            }
            let part_dir = core.temp_dirs.volumes.join(name).join(format!("part{index}"));
            for content in &structure.content {
                let (Some(source), Some(target)) = (&content.source, &content.target) else {
                    continue;
                };
                let src = gadget_dir.join(source.trim_end_matches('/'));
                let dst = part_dir.join(target.trim_start_matches('/'));
                if source.ends_with('/') {
                    fsutil::copy_tree(&src, &dst)?;
                } else {
                    if let Some(parent) = dst.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(&src, &dst).with_context(|| {
                        format!("copying gadget content '{}'", src.display())
                    })?;
                }
            }
        }
    }
    Ok(())
}

/// Build one filesystem image per partition-bearing structure, populated
/// from its staging area (or from the rootfs for the data/seed partition),
/// and record each volume's total content size.
pub(crate) fn populate_prepare_partitions<M: Machine>(machine: &mut M) -> Result<()> {
    let core = machine.core_ref();
    let gadget = core.require_gadget()?.clone();
    let volumes_dir = core.temp_dirs.volumes.clone();
    let rootfs_dir = core.temp_dirs.rootfs.clone();
    let rootfs_size = core.rootfs_size;
    let runner = core.runner;

    let mut totals: Vec<(String, u64)> = Vec::new();
    for (vol_name, volume) in &gadget.volumes {
        // leading gap for the partition table
        let mut total = SIZE_MIB;
        for (index, structure) in volume.structure.iter().enumerate() {
            if structure.is_raw() {
                total += structure.size_bytes()?;
                continue;
            }

            let holds_rootfs = matches!(
                structure.role.as_deref(),
                Some("system-data") | Some("system-seed")
            );
            let content_root = if holds_rootfs {
                rootfs_dir.clone()
            } else {
                volumes_dir.join(vol_name).join(format!("part{index}"))
            };
            let content_size = if holds_rootfs {
                rootfs_size
            } else {
                fsutil::dir_size(&content_root)?
            };
            let size = round_up_mib(structure.size_bytes()?.max(content_size).max(SIZE_MIB));

            let image = volumes_dir.join(vol_name).join(format!("part{index}.img"));
            let file = File::create(&image)
                .with_context(|| format!("creating partition image '{}'", image.display()))?;
            file.set_len(size)?;

            let label = structure
                .filesystem_label
                .as_deref()
                .or(if structure.role.as_deref() == Some("system-data") {
                    Some("writable")
                } else {
                    None
                })
                .or(structure.name.as_deref())
                .unwrap_or("ubuntu");

            match structure.filesystem.as_deref() {
                Some("ext4") => {
                    let mut cmd = Command::new("mkfs.ext4");
                    cmd.args(["-q", "-L", label, "-d"])
                        .arg(&content_root)
                        .arg(&image);
                    runner.run(&mut cmd).with_context(|| {
                        format!("formatting '{}' as ext4", image.display())
                    })?;
                }
                Some("vfat") => {
                    let mut cmd = Command::new("mkfs.vfat");
                    cmd.args(["-n", label]).arg(&image);
                    runner.run(&mut cmd).with_context(|| {
                        format!("formatting '{}' as vfat", image.display())
                    })?;
                    let entries: Vec<PathBuf> = if content_root.is_dir() {
                        fs::read_dir(&content_root)?
                            .collect::<io::Result<Vec<_>>>()?
                            .into_iter()
                            .map(|e| e.path())
                            .collect()
                    } else {
                        Vec::new()
                    };
                    if !entries.is_empty() {
                        let mut mcopy = Command::new("mcopy");
                        mcopy.arg("-s").arg("-i").arg(&image);
                        for entry in entries {
                            mcopy.arg(entry);
                        }
                        mcopy.arg("::/");
                        runner.run(&mut mcopy).with_context(|| {
                            format!("populating vfat image '{}'", image.display())
                        })?;
                    }
                }
                Some(other) => bail!(
                    "unsupported filesystem '{other}' on volume '{vol_name}' structure {index}"
                ),
                None => {}
            }
            total += size;
        }
        totals.push((vol_name.clone(), total));
    }

    let core = machine.core();
    for (name, total) in totals {
        core.handle_content_size(&name, total);
    }
    Ok(())
}

struct PartitionPlan {
    image: PathBuf,
    offset: u64,
    size: u64,
    table_type: &'static str,
}

/// Assemble one raw disk image per volume: partition table via sfdisk,
/// partition payloads and raw gadget blobs spliced in with plain file I/O.
pub(crate) fn make_disk<M: Machine>(machine: &mut M) -> Result<()> {
    let core = machine.core_ref();
    let gadget = core.require_gadget()?.clone();
    let volumes_dir = core.temp_dirs.volumes.clone();
    let gadget_dir = core.temp_dirs.unpack.join("gadget");
    let output_dir = core.output_dir()?;
    let image_sizes = core.image_sizes.clone();
    let runner = core.runner;

    for (vol_name, volume) in &gadget.volumes {
        let mut parts: Vec<PartitionPlan> = Vec::new();
        let mut raw_blobs: Vec<(PathBuf, u64)> = Vec::new();
        let mut cursor = SIZE_MIB;
        let is_mbr = volume.partition_schema() == "mbr";

        for (index, structure) in volume.structure.iter().enumerate() {
            if structure.is_raw() {
                for content in &structure.content {
                    if let Some(image) = &content.image {
                        let offset = match &content.offset {
                            Some(offset) => parse_size(offset)?,
                            None => structure.offset_bytes()?.unwrap_or(0),
                        };
                        raw_blobs.push((gadget_dir.join(image), offset));
                    }
                }
                continue;
            }

            let image = volumes_dir.join(vol_name).join(format!("part{index}.img"));
            if !image.is_file() {
                bail!(
                    "partition image '{}' is missing; populate_prepare_partitions must run first",
                    image.display()
                );
            }
            let size = fs::metadata(&image)?.len();
            let offset = structure.offset_bytes()?.unwrap_or(cursor);
            let boot_partition = matches!(
                structure.role.as_deref(),
                Some("system-boot") | Some("system-seed")
            ) || structure.filesystem.as_deref() == Some("vfat");
            let table_type = match (is_mbr, boot_partition) {
                (true, true) => "ef",
                (true, false) => "83",
                (false, true) => "U",
                (false, false) => "L",
            };
            parts.push(PartitionPlan {
                image,
                offset,
                size,
                table_type,
            });
            cursor = round_up_mib(offset + size);
        }

        let min_size = cursor + SIZE_MIB;
        let declared = image_sizes.get(vol_name).copied().unwrap_or(0);
        let disk_size = round_up_mib(declared.max(min_size));

        let disk_path = output_dir.join(format!("{vol_name}.img"));
        let disk_file = File::create(&disk_path)
            .with_context(|| format!("creating disk image '{}'", disk_path.display()))?;
        disk_file.set_len(disk_size)?;
        drop(disk_file);

        // partition table; sfdisk spells the MBR scheme "dos"
        let table_label = if is_mbr { "dos" } else { "gpt" };
        let mut script = format!("label: {table_label}\n");
        for part in &parts {
            script.push_str(&format!(
                "start={}, size={}, type={}\n",
                part.offset / SECTOR_SIZE,
                part.size / SECTOR_SIZE,
                part.table_type
            ));
        }
        let script_path = volumes_dir.join(vol_name).join("sfdisk.script");
        fs::write(&script_path, &script)
            .with_context(|| format!("writing '{}'", script_path.display()))?;
        let mut sfdisk = Command::new("sfdisk");
        sfdisk
            .arg(&disk_path)
            .stdin(Stdio::from(File::open(&script_path)?));
        runner.run(&mut sfdisk).with_context(|| {
            format!("writing partition table for volume '{vol_name}'")
        })?;

        // partition payloads and raw bootcode blobs
        let mut disk = OpenOptions::new().write(true).open(&disk_path)?;
        for part in &parts {
            splice(&mut disk, &part.image, part.offset)?;
        }
        for (blob, offset) in &raw_blobs {
            if blob.is_file() {
                splice(&mut disk, blob, *offset)?;
            }
        }
    }
    Ok(())
}

/// Final bookkeeping: persist the completed coordinate while the tree still
/// exists, then remove the work directory unless it is preserved.
pub(crate) fn finish<M: Machine>(machine: &mut M) -> Result<()> {
    let total = machine.core_ref().state_names.len();
    machine.core().current_step = total;

    let preserved = machine
        .core_ref()
        .workdir
        .as_ref()
        .map(|w| w.preserved())
        .unwrap_or(false);
    if preserved {
        crate::machine::write_metadata(machine)?;
    }
    if let Some(workdir) = &machine.core_ref().workdir {
        workdir.cleanup();
    }
    Ok(())
}

fn round_up_mib(bytes: u64) -> u64 {
    (bytes + SIZE_MIB - 1) / SIZE_MIB * SIZE_MIB
}

fn splice(disk: &mut File, image: &Path, offset: u64) -> Result<()> {
    let mut source = File::open(image)
        .with_context(|| format!("opening partition payload '{}'", image.display()))?;
    disk.seek(SeekFrom::Start(offset))?;
    io::copy(&mut source, disk)
        .with_context(|| format!("splicing '{}' at offset {}", image.display(), offset))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::exec::{testing, CmdRunner};
    use crate::gadget::GadgetInfo;
    use crate::machine::{Stage, StateMachine};
    use crate::workdir::WorkDir;
    use std::io::Read;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const PC_GADGET: &str = r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - name: mbr
        role: mbr
        size: 440
        content:
          - image: pc-boot.img
      - name: ubuntu-boot
        role: system-boot
        filesystem: vfat
        size: 2M
      - name: ubuntu-data
        role: system-data
        filesystem: ext4
        size: 4M
"#;

    const MBR_GADGET: &str = r#"
volumes:
  pi:
    schema: mbr
    structure:
      - name: boot
        role: system-boot
        filesystem: vfat
        size: 1M
      - name: writable
        role: system-data
        filesystem: ext4
        size: 2M
"#;

    /// Stage bodies only need the core context, so the stub flavour is as
    /// small as the trait allows.
    struct DiskMachine {
        core: StateMachine,
    }

    impl Machine for DiskMachine {
        fn core(&mut self) -> &mut StateMachine {
            &mut self.core
        }

        fn core_ref(&self) -> &StateMachine {
            &self.core
        }

        fn catalogue() -> Vec<Stage<Self>> {
            Vec::new()
        }

        fn plan(&mut self) -> std::result::Result<Vec<String>, BuildError> {
            Ok(Vec::new())
        }

        fn save_context(&self) -> std::result::Result<serde_json::Value, BuildError> {
            Ok(serde_json::Value::Null)
        }

        fn load_context(
            &mut self,
            _context: serde_json::Value,
        ) -> std::result::Result<(), BuildError> {
            Ok(())
        }
    }

    fn disk_machine(tmp: &TempDir, gadget_yaml: &str) -> DiskMachine {
        let workdir = WorkDir::resolve(Some(tmp.path().join("work").as_path())).unwrap();
        let mut machine = DiskMachine {
            core: StateMachine::default(),
        };
        machine.core.runner = CmdRunner::with(testing::ok_exec);
        machine.core.temp_dirs = workdir.temp_dirs();
        machine.core.workdir = Some(workdir);
        make_temporary_directories(&mut machine).unwrap();

        let gadget = GadgetInfo::parse(gadget_yaml).unwrap();
        for (name, _) in &gadget.volumes {
            fs::create_dir_all(machine.core.temp_dirs.volumes.join(name)).unwrap();
        }
        machine.core.gadget = Some(gadget);
        machine
    }

    static RECORDED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn recording_exec(cmd: &mut Command) -> io::Result<Output> {
        let mut line = cmd.get_program().to_string_lossy().into_owned();
        for arg in cmd.get_args() {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        RECORDED.lock().unwrap().push(line);
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    #[test]
    fn sizes_round_up_to_whole_mebibytes() {
        assert_eq!(round_up_mib(0), 0);
        assert_eq!(round_up_mib(1), SIZE_MIB);
        assert_eq!(round_up_mib(SIZE_MIB), SIZE_MIB);
        assert_eq!(round_up_mib(SIZE_MIB + 1), 2 * SIZE_MIB);
        assert_eq!(round_up_mib(3 * SIZE_MIB - 1), 3 * SIZE_MIB);
    }

    #[test]
    fn partition_images_are_sized_formatted_and_totalled() {
        let tmp = TempDir::new().unwrap();
        let mut machine = disk_machine(&tmp, PC_GADGET);
        machine.core.runner = CmdRunner::with(recording_exec);
        machine.core.rootfs_size = 3 * SIZE_MIB;
        RECORDED.lock().unwrap().clear();

        prepopulate_bootfs_contents(&mut machine).unwrap();
        // stage some boot content so the vfat image gets populated
        let boot_dir = machine.core.temp_dirs.volumes.join("pc/part1");
        fs::write(boot_dir.join("grubenv"), b"# GRUB Environment Block\n").unwrap();

        populate_prepare_partitions(&mut machine).unwrap();

        let volumes = machine.core.temp_dirs.volumes.clone();
        // raw structures carry no filesystem image
        assert!(!volumes.join("pc/part0.img").exists());
        // filesystem structures are sized to their declared size when the
        // content fits
        assert_eq!(
            fs::metadata(volumes.join("pc/part1.img")).unwrap().len(),
            2 * SIZE_MIB
        );
        assert_eq!(
            fs::metadata(volumes.join("pc/part2.img")).unwrap().len(),
            4 * SIZE_MIB
        );

        let commands = RECORDED.lock().unwrap().clone();
        assert!(
            commands
                .iter()
                .any(|c| c.starts_with("mkfs.vfat") && c.contains("-n ubuntu-boot")),
            "{commands:?}"
        );
        assert!(
            commands
                .iter()
                .any(|c| c.starts_with("mcopy") && c.contains("grubenv")),
            "{commands:?}"
        );
        // the data partition takes the writable label and is built from
        // the rootfs staging tree
        assert!(
            commands.iter().any(|c| c.starts_with("mkfs.ext4")
                && c.contains("-L writable")
                && c.contains("rootfs")),
            "{commands:?}"
        );

        // volume total: table gap + raw bootcode + both filesystem images
        assert_eq!(
            machine.core.image_sizes["pc"],
            SIZE_MIB + 440 + 2 * SIZE_MIB + 4 * SIZE_MIB
        );
    }

    #[test]
    fn the_data_partition_grows_to_hold_the_rootfs() {
        let tmp = TempDir::new().unwrap();
        let mut machine = disk_machine(&tmp, PC_GADGET);
        machine.core.rootfs_size = 9 * SIZE_MIB + 1;

        prepopulate_bootfs_contents(&mut machine).unwrap();
        populate_prepare_partitions(&mut machine).unwrap();

        // declared 4M loses to the computed rootfs size, rounded up
        let image = machine.core.temp_dirs.volumes.join("pc/part2.img");
        assert_eq!(fs::metadata(&image).unwrap().len(), 10 * SIZE_MIB);
    }

    #[test]
    fn make_disk_lays_out_the_volume_image() {
        let tmp = TempDir::new().unwrap();
        let mut machine = disk_machine(&tmp, PC_GADGET);
        machine.core.common.output_dir = Some(tmp.path().join("out"));

        let pc_dir = machine.core.temp_dirs.volumes.join("pc");
        fs::write(pc_dir.join("part1.img"), vec![0xB0u8; 2 * SIZE_MIB as usize]).unwrap();
        fs::write(pc_dir.join("part2.img"), vec![0xDAu8; 4 * SIZE_MIB as usize]).unwrap();
        let gadget_dir = machine.core.temp_dirs.unpack.join("gadget");
        fs::create_dir_all(&gadget_dir).unwrap();
        fs::write(gadget_dir.join("pc-boot.img"), vec![0xAAu8; 440]).unwrap();

        make_disk(&mut machine).unwrap();

        // both partitions end at 7MiB; one mebibyte of slack follows
        let disk_path = tmp.path().join("out/pc.img");
        assert_eq!(fs::metadata(&disk_path).unwrap().len(), 8 * SIZE_MIB);

        let script = fs::read_to_string(pc_dir.join("sfdisk.script")).unwrap();
        assert!(script.starts_with("label: gpt\n"), "{script}");
        assert!(script.contains("start=2048, size=4096, type=U"), "{script}");
        assert!(script.contains("start=6144, size=8192, type=L"), "{script}");

        let mut disk = File::open(&disk_path).unwrap();
        let mut buffer = [0u8; 8];
        // raw bootcode splices at its declared offset, after the table run
        disk.read_exact(&mut buffer).unwrap();
        assert_eq!(buffer, [0xAA; 8]);
        // first partition payload at the 1MiB boundary
        disk.seek(SeekFrom::Start(SIZE_MIB)).unwrap();
        disk.read_exact(&mut buffer).unwrap();
        assert_eq!(buffer, [0xB0; 8]);
        // second payload follows at the next mebibyte-aligned offset
        disk.seek(SeekFrom::Start(3 * SIZE_MIB)).unwrap();
        disk.read_exact(&mut buffer).unwrap();
        assert_eq!(buffer, [0xDA; 8]);
    }

    #[test]
    fn mbr_volumes_use_the_dos_label_and_hex_types() {
        let tmp = TempDir::new().unwrap();
        let mut machine = disk_machine(&tmp, MBR_GADGET);
        machine.core.common.output_dir = Some(tmp.path().join("out"));

        let pi_dir = machine.core.temp_dirs.volumes.join("pi");
        fs::write(pi_dir.join("part0.img"), vec![0u8; SIZE_MIB as usize]).unwrap();
        fs::write(pi_dir.join("part1.img"), vec![0u8; 2 * SIZE_MIB as usize]).unwrap();

        make_disk(&mut machine).unwrap();

        let script = fs::read_to_string(pi_dir.join("sfdisk.script")).unwrap();
        assert!(script.starts_with("label: dos\n"), "{script}");
        assert!(script.contains("type=ef"), "{script}");
        assert!(script.contains("type=83"), "{script}");
    }

    #[test]
    fn a_requested_volume_size_grows_the_disk() {
        let tmp = TempDir::new().unwrap();
        let mut machine = disk_machine(&tmp, MBR_GADGET);
        machine.core.common.output_dir = Some(tmp.path().join("out"));
        machine.core.image_sizes.insert("pi".to_string(), 16 * SIZE_MIB);

        let pi_dir = machine.core.temp_dirs.volumes.join("pi");
        fs::write(pi_dir.join("part0.img"), vec![0u8; SIZE_MIB as usize]).unwrap();
        fs::write(pi_dir.join("part1.img"), vec![0u8; 2 * SIZE_MIB as usize]).unwrap();

        make_disk(&mut machine).unwrap();

        let disk_path = tmp.path().join("out/pi.img");
        assert_eq!(fs::metadata(&disk_path).unwrap().len(), 16 * SIZE_MIB);
    }

    #[test]
    fn make_disk_requires_prepared_partition_images() {
        let tmp = TempDir::new().unwrap();
        let mut machine = disk_machine(&tmp, MBR_GADGET);

        let err = make_disk(&mut machine).unwrap_err().to_string();
        assert!(err.contains("populate_prepare_partitions"), "{err}");
    }
}
