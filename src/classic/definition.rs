//! The classic image definition: parse, schema-validate, cross-field
//! rules, defaults.
//!
//! The YAML document is validated against an embedded draft-07 JSON schema
//! before it is read into the typed model, so shape errors surface as
//! schema diagnostics rather than deserialization noise. Rules the schema
//! cannot express (exactly one rootfs source, git gadgets need a URL) are
//! enforced here afterwards, followed by declarative defaulting.

use crate::defaults::{set_defaults, DefaultEntry, FillDefaults};
use crate::error::BuildError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const IMAGE_DEFINITION_SCHEMA: &str = include_str!("image_definition.schema.json");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDefinition {
    pub name: String,
    pub display_name: Option<String>,
    pub revision: Option<i64>,
    pub architecture: String,
    pub series: String,
    /// `preinstalled` or `cloud`; schema-enforced.
    pub class: String,
    pub gadget: Option<Gadget>,
    pub rootfs: Rootfs,
    pub customization: Option<Customization>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Gadget {
    /// `git`, `directory` or `prebuilt`.
    #[serde(rename = "type")]
    pub gadget_type: String,
    /// Repository URL for git gadgets, local tree for the other kinds.
    pub url: Option<String>,
    pub branch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rootfs {
    pub archive: String,
    pub pocket: String,
    pub components: Vec<String>,
    pub seed: Option<Seed>,
    pub tasks: Option<Tasks>,
    pub tar: Option<Tar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub urls: Vec<String>,
    pub names: Vec<String>,
    pub branch: String,
    pub vcs: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tasks {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tar {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Customization {
    pub cloud_init: Option<CloudInit>,
    pub extra_ppas: Vec<Ppa>,
    pub extra_packages: Vec<Package>,
    pub extra_snaps: Vec<ExtraSnap>,
    pub manual: Option<Manual>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInit {
    /// Inline cloud-init user-data document.
    pub user_data: Option<String>,
    pub meta_data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ppa {
    /// `owner/archive` form, e.g. `canonical-foundations/ubuntu-image`.
    pub name: String,
    pub fingerprint: String,
    /// `user:password` for private archives.
    pub auth: Option<String>,
    /// Whether the archive stays enabled in the shipped image. Optional
    /// boolean so an explicit `false` survives the `true` default.
    pub keep_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Package {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraSnap {
    pub name: String,
    pub channel: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manual {
    pub copy_file: Vec<CopyFile>,
    pub touch_file: Vec<TouchFile>,
    pub execute: Vec<Execute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyFile {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TouchFile {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Execute {
    pub path: String,
}

/// Parse and fully validate an image definition document.
pub fn parse_image_definition(path: &Path) -> Result<ImageDefinition, BuildError> {
    let text = fs::read_to_string(path).map_err(|e| {
        BuildError::Schema(format!(
            "reading image definition '{}': {}",
            path.display(),
            e
        ))
    })?;
    let raw: serde_yml::Value = serde_yml::from_str(&text).map_err(|e| {
        BuildError::Schema(format!(
            "parsing image definition '{}': {}",
            path.display(),
            e
        ))
    })?;
    let instance = serde_json::to_value(&raw).map_err(|e| {
        BuildError::Schema(format!(
            "converting image definition '{}': {}",
            path.display(),
            e
        ))
    })?;

    validate_schema(&instance)?;

    let mut definition: ImageDefinition = serde_json::from_value(instance).map_err(|e| {
        BuildError::Schema(format!("image definition does not match the expected shape: {e}"))
    })?;
    validate_cross_field(&definition)?;
    set_defaults(&mut definition)?;
    Ok(definition)
}

fn validate_schema(instance: &serde_json::Value) -> Result<(), BuildError> {
    let schema: serde_json::Value = serde_json::from_str(IMAGE_DEFINITION_SCHEMA)
        .map_err(|e| BuildError::Schema(format!("embedded image definition schema: {e}")))?;
    let compiled = jsonschema::JSONSchema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .should_validate_formats(true)
        .compile(&schema)
        .map_err(|e| BuildError::Schema(format!("embedded image definition schema: {e}")))?;

    if let Err(errors) = compiled.validate(instance) {
        let details: Vec<String> = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path}: {error}")
                }
            })
            .collect();
        return Err(BuildError::Schema(format!(
            "image definition failed schema validation: {}",
            details.join("; ")
        )));
    }
    Ok(())
}

/// Rules the schema cannot express.
fn validate_cross_field(definition: &ImageDefinition) -> Result<(), BuildError> {
    let sources = [
        definition.rootfs.seed.is_some(),
        definition.rootfs.tasks.is_some(),
        definition.rootfs.tar.is_some(),
    ];
    if sources.iter().filter(|present| **present).count() != 1 {
        return Err(BuildError::Schema(
            "rootfs must declare one and only one of seed, tasks, or tar".to_string(),
        ));
    }

    if let Some(gadget) = &definition.gadget {
        if gadget.gadget_type == "git" && gadget.url.as_deref().unwrap_or("").is_empty() {
            return Err(BuildError::Schema(
                "when gadget type is git, a gadget url must be provided".to_string(),
            ));
        }
    }
    Ok(())
}

impl FillDefaults for ImageDefinition {
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>> {
        Vec::new()
    }

    fn children(&mut self) -> Vec<&mut dyn FillDefaults> {
        let mut children: Vec<&mut dyn FillDefaults> = vec![&mut self.rootfs];
        if let Some(gadget) = &mut self.gadget {
            children.push(gadget);
        }
        if let Some(customization) = &mut self.customization {
            children.push(customization);
        }
        children
    }
}

impl FillDefaults for Gadget {
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>> {
        vec![DefaultEntry {
            field: "gadget.branch",
            value: "main",
            slot: &mut self.branch,
        }]
    }
}

impl FillDefaults for Rootfs {
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>> {
        vec![
            DefaultEntry {
                field: "rootfs.archive",
                value: "ubuntu",
                slot: &mut self.archive,
            },
            DefaultEntry {
                field: "rootfs.pocket",
                value: "release",
                slot: &mut self.pocket,
            },
            DefaultEntry {
                field: "rootfs.components",
                value: "main,restricted",
                slot: &mut self.components,
            },
        ]
    }

    fn children(&mut self) -> Vec<&mut dyn FillDefaults> {
        let mut children: Vec<&mut dyn FillDefaults> = Vec::new();
        if let Some(seed) = &mut self.seed {
            children.push(seed);
        }
        children
    }
}

impl FillDefaults for Seed {
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>> {
        vec![
            DefaultEntry {
                field: "seed.branch",
                value: "main",
                slot: &mut self.branch,
            },
            DefaultEntry {
                field: "seed.vcs",
                value: "true",
                slot: &mut self.vcs,
            },
        ]
    }
}

impl FillDefaults for Customization {
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>> {
        Vec::new()
    }

    fn children(&mut self) -> Vec<&mut dyn FillDefaults> {
        let mut children: Vec<&mut dyn FillDefaults> = Vec::new();
        for ppa in &mut self.extra_ppas {
            children.push(ppa);
        }
        for snap in &mut self.extra_snaps {
            children.push(snap);
        }
        children
    }
}

impl FillDefaults for Ppa {
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>> {
        vec![DefaultEntry {
            field: "extra_ppas.keep_enabled",
            value: "true",
            slot: &mut self.keep_enabled,
        }]
    }
}

impl FillDefaults for ExtraSnap {
    fn defaults(&mut self) -> Vec<DefaultEntry<'_>> {
        vec![DefaultEntry {
            field: "extra_snaps.channel",
            value: "stable",
            slot: &mut self.channel,
        }]
    }
}
