//! gadget.yaml model and size arithmetic.
//!
//! The gadget tree is produced by an earlier stage (extracted by snap
//! preseeding or copied/built from an image definition); this module only
//! parses its `meta/gadget.yaml` descriptor. Volume declaration order is
//! preserved because the `--image-size` grammar addresses volumes by
//! position as well as by name.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Deserializer};

/// gadget.yaml scalars such as `size` and `type` are commonly written as
/// bare YAML integers (e.g. `size: 440`, `type: 83`); accept either an
/// integer or a string and normalize to a string.
fn deserialize_scalar_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(i64),
    }

    let opt = Option::<StringOrInt>::deserialize(deserializer)?;
    Ok(opt.map(|v| match v {
        StringOrInt::String(s) => s,
        StringOrInt::Int(i) => i.to_string(),
    }))
}

pub const SIZE_KIB: u64 = 1 << 10;
pub const SIZE_MIB: u64 = 1 << 20;
pub const SIZE_GIB: u64 = 1 << 30;
pub const SIZE_TIB: u64 = 1 << 40;

#[derive(Debug, Clone, Default)]
pub struct GadgetInfo {
    /// Volumes in declaration order.
    pub volumes: Vec<(String, Volume)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub bootloader: Option<String>,
    #[serde(default)]
    pub structure: Vec<VolumeStructure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeStructure {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "deserialize_scalar_as_string")]
    pub part_type: Option<String>,
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default, rename = "filesystem-label")]
    pub filesystem_label: Option<String>,
    #[serde(default, deserialize_with = "deserialize_scalar_as_string")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "deserialize_scalar_as_string")]
    pub offset: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentEntry {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub offset: Option<String>,
}

impl GadgetInfo {
    /// Parse a gadget.yaml document. The volume map is read through an
    /// order-preserving mapping so positional references stay stable.
    pub fn parse(yaml: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct RawGadget {
            volumes: serde_yml::Mapping,
        }

        let raw: RawGadget =
            serde_yml::from_str(yaml).context("parsing gadget.yaml")?;
        if raw.volumes.is_empty() {
            bail!("gadget.yaml declares no volumes");
        }

        let mut volumes = Vec::with_capacity(raw.volumes.len());
        for (key, value) in raw.volumes {
            let name = key
                .as_str()
                .ok_or_else(|| anyhow!("gadget.yaml volume names must be strings"))?
                .to_string();
            let volume: Volume = serde_yml::from_value(value)
                .with_context(|| format!("parsing gadget.yaml volume '{name}'"))?;
            volumes.push((name, volume));
        }
        Ok(GadgetInfo { volumes })
    }

    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// True when any volume carries a system-seed structure (UC20+ layout).
    pub fn has_system_seed(&self) -> bool {
        self.volumes.iter().any(|(_, v)| {
            v.structure
                .iter()
                .any(|s| s.role.as_deref() == Some("system-seed"))
        })
    }
}

impl Volume {
    /// Partition table schema; gadget.yaml defaults to GPT.
    pub fn partition_schema(&self) -> &str {
        self.schema.as_deref().unwrap_or("gpt")
    }
}

impl VolumeStructure {
    pub fn size_bytes(&self) -> Result<u64> {
        match &self.size {
            Some(size) => parse_size(size),
            None => Ok(0),
        }
    }

    pub fn offset_bytes(&self) -> Result<Option<u64>> {
        match &self.offset {
            Some(offset) => parse_size(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Raw structures (role `mbr`, or typeless bootcode blobs) carry no
    /// filesystem and are spliced into the disk verbatim.
    pub fn is_raw(&self) -> bool {
        self.role.as_deref() == Some("mbr") || self.filesystem.is_none()
    }
}

/// Parse a size literal: a bare integer is bytes, `B`/`K`/`M`/`G`/`T`
/// suffixes are binary multiples. Anything else is an invalid size.
pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    if digits.is_empty() {
        bail!("invalid size '{raw}'");
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid size '{raw}'"))?;
    let multiplier = match suffix {
        "" | "B" => 1,
        "K" => SIZE_KIB,
        "M" => SIZE_MIB,
        "G" => SIZE_GIB,
        "T" => SIZE_TIB,
        _ => bail!("invalid size '{raw}'"),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("invalid size '{raw}': overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI_VOLUME_YAML: &str = r#"
volumes:
  first:
    schema: mbr
    structure:
      - name: root
        type: 83
        filesystem: ext4
        size: 8M
  second:
    schema: gpt
    structure:
      - name: esp
        role: system-boot
        filesystem: vfat
        size: 4M
  third:
    structure:
      - name: data
        role: system-data
        filesystem: ext4
        size: 16M
  fourth:
    structure:
      - name: extra
        filesystem: ext4
        size: 1M
"#;

    #[test]
    fn parse_size_accepts_binary_suffixes() {
        assert_eq!(parse_size("123").unwrap(), 123);
        assert_eq!(parse_size("123B").unwrap(), 123);
        assert_eq!(parse_size("2K").unwrap(), 2 * SIZE_KIB);
        assert_eq!(parse_size("512M").unwrap(), 512 * SIZE_MIB);
        assert_eq!(parse_size("4G").unwrap(), 4 * SIZE_GIB);
        assert_eq!(parse_size("1T").unwrap(), SIZE_TIB);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        for bad in ["", "4test", "G", "1.5G", "4 G", "-1G"] {
            let err = parse_size(bad).unwrap_err().to_string();
            assert!(err.contains("invalid size"), "{bad}: {err}");
        }
    }

    #[test]
    fn volumes_keep_declaration_order() {
        let gadget = GadgetInfo::parse(MULTI_VOLUME_YAML).unwrap();
        let names: Vec<&str> = gadget.volumes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn structures_parse_sizes_and_roles() {
        let gadget = GadgetInfo::parse(MULTI_VOLUME_YAML).unwrap();
        let first = gadget.volume("first").unwrap();
        assert_eq!(first.partition_schema(), "mbr");
        assert_eq!(first.structure[0].size_bytes().unwrap(), 8 * SIZE_MIB);

        let second = gadget.volume("second").unwrap();
        assert_eq!(second.partition_schema(), "gpt");
        assert_eq!(second.structure[0].role.as_deref(), Some("system-boot"));
        assert!(!gadget.has_system_seed());
    }

    #[test]
    fn seed_role_is_detected() {
        let yaml = r#"
volumes:
  pc:
    structure:
      - name: ubuntu-seed
        role: system-seed
        filesystem: vfat
        size: 1G
"#;
        let gadget = GadgetInfo::parse(yaml).unwrap();
        assert!(gadget.has_system_seed());
    }

    #[test]
    fn empty_volume_map_is_rejected() {
        let err = GadgetInfo::parse("volumes: {}\n").unwrap_err().to_string();
        assert!(err.contains("no volumes"), "{err}");
    }
}
