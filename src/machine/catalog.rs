//! Stage names and catalogue resolution.
//!
//! Stage names are stable across releases; they are the resume coordinate
//! persisted in the checkpoint. Planners select and order entries from a
//! flavour's catalogue — they never invent names at runtime, and any name
//! reaching the executor that the catalogue cannot resolve is an unknown
//! stage.

use crate::error::BuildError;
use crate::machine::{Machine, Stage};

pub const MAKE_TEMPORARY_DIRECTORIES: &str = "make_temporary_directories";
pub const PREPARE_IMAGE: &str = "prepare_image";
pub const PREPARE_GADGET_TREE: &str = "prepare_gadget_tree";
pub const BUILD_GADGET_TREE: &str = "build_gadget_tree";
pub const LOAD_GADGET_YAML: &str = "load_gadget_yaml";
pub const POPULATE_ROOTFS_CONTENTS: &str = "populate_rootfs_contents";
pub const EXTRACT_ROOTFS_TAR: &str = "extract_rootfs_tar";
pub const BUILD_ROOTFS_FROM_SEED: &str = "build_rootfs_from_seed";
pub const BUILD_ROOTFS_FROM_TASKS: &str = "build_rootfs_from_tasks";
pub const CUSTOMIZE_CLOUD_INIT: &str = "customize_cloud_init";
pub const CONFIGURE_EXTRA_PPAS: &str = "configure_extra_ppas";
pub const INSTALL_EXTRA_PACKAGES: &str = "install_extra_packages";
pub const INSTALL_EXTRA_SNAPS: &str = "install_extra_snaps";
pub const PERFORM_MANUAL_CUSTOMIZATION: &str = "perform_manual_customization";
pub const GENERATE_DISK_INFO: &str = "generate_disk_info";
pub const CALCULATE_ROOTFS_SIZE: &str = "calculate_rootfs_size";
pub const PREPOPULATE_BOOTFS_CONTENTS: &str = "prepopulate_bootfs_contents";
pub const POPULATE_BOOTFS_CONTENTS: &str = "populate_bootfs_contents";
pub const POPULATE_PREPARE_PARTITIONS: &str = "populate_prepare_partitions";
pub const MAKE_DISK: &str = "make_disk";
pub const GENERATE_MANIFEST: &str = "generate_manifest";
pub const FINISH: &str = "finish";

/// The tail of the spine shared by both flavours, from disk-info emission
/// through the implicit finish.
pub const COMMON_SUFFIX: &[&str] = &[
    GENERATE_DISK_INFO,
    CALCULATE_ROOTFS_SIZE,
    PREPOPULATE_BOOTFS_CONTENTS,
    POPULATE_BOOTFS_CONTENTS,
    POPULATE_PREPARE_PARTITIONS,
    MAKE_DISK,
    GENERATE_MANIFEST,
    FINISH,
];

/// Look up a single stage by name in the flavour's catalogue.
pub fn resolve<M: Machine>(name: &str) -> Option<Stage<M>> {
    M::catalogue().into_iter().find(|stage| stage.name == name)
}

/// Resolve every name or fail with the first unknown one.
pub fn resolve_all<M: Machine>(names: &[String]) -> Result<Vec<Stage<M>>, BuildError> {
    names
        .iter()
        .map(|name| {
            resolve::<M>(name)
                .ok_or_else(|| BuildError::Flag(format!("unknown stage: {name}")))
        })
        .collect()
}
