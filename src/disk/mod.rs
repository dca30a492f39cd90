//! Raw disk image composition.
//!
//! A disk is built in four steps, each a plain tool call:
//!
//! 1. allocate a sparse file of the requested size,
//! 2. write a GPT label with `parted`,
//! 3. create partitions (1-based index = position) with `parted`/`sfdisk`,
//! 4. attach a loop device with partition scanning and format each
//!    partition's filesystem.
//!
//! The loop device is owned by a [`LoopDevice`] guard and is detached on every
//! exit path.

pub mod loopdev;
pub mod partitions;

pub use loopdev::LoopDevice;
pub use partitions::{
    create_image, create_partitions, format_filesystems, mkfs_command, write_label,
};

use serde::Deserialize;

use crate::error::BuildError;
use crate::schema::{Field, FieldType};

/// Partition table type. Only GPT is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskLabel {
    Gpt,
}

impl DiskLabel {
    pub fn parse(label: &str) -> Result<Self, BuildError> {
        match label.trim().to_ascii_lowercase().as_str() {
            "gpt" => Ok(DiskLabel::Gpt),
            other => Err(BuildError::config(format!(
                "disk label '{}' is not supported (expected 'gpt')",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskLabel::Gpt => "gpt",
        }
    }
}

/// `image:` block of the `image` stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    /// File name, relative to the workspace.
    pub name: String,
    /// Byte count with optional K/M/G/T suffix.
    pub size: String,
    #[serde(default = "default_label")]
    pub label: String,
}

fn default_label() -> String {
    DiskLabel::Gpt.as_str().to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    pub name: String,
    /// Passed to `parted mkpart` as-is (e.g. `1MiB`, `100%`).
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub flags: Vec<String>,
    /// GPT type GUID or `sfdisk` alias.
    #[serde(default, rename = "type")]
    pub part_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemSpec {
    /// `vfat` or anything `mkfs -t` accepts.
    pub fs: String,
    pub label: String,
    pub name: String,
}

pub const IMAGE_FIELDS: &[Field] = &[
    Field::required("name", FieldType::String),
    Field::required("size", FieldType::String),
    Field::optional("label", FieldType::String),
];

pub const PARTITION_FIELDS: &[Field] = &[
    Field::required("name", FieldType::String),
    Field::required("start", FieldType::String),
    Field::required("end", FieldType::String),
    Field::optional("flags", FieldType::StringList),
    Field::optional("type", FieldType::String),
];

pub const FILESYSTEM_FIELDS: &[Field] = &[
    Field::required("fs", FieldType::String),
    Field::required("label", FieldType::String),
    Field::required("name", FieldType::String),
];

/// Parse a size such as `512`, `4K`, `100MiB`, `2G` or `1GB` into bytes.
///
/// Units follow `truncate -s`: `K`, `M`, `G`, `T` and their `iB` forms are
/// powers of 1024, while `KB`, `MB`, `GB` and `TB` are powers of 1000.
pub fn parse_size(raw: &str) -> Result<u64, BuildError> {
    let invalid = || BuildError::config(format!("invalid size '{}'", raw));

    let s = raw.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(invalid());
    }
    let value: u64 = s[..digits_end].parse().map_err(|_| invalid())?;

    let unit = s[digits_end..].trim().to_ascii_uppercase();
    let (prefix, base) = if let Some(p) = unit.strip_suffix("IB") {
        (p, 1024u64)
    } else if let Some(p) = unit.strip_suffix('B') {
        (p, 1000u64)
    } else {
        (unit.as_str(), 1024u64)
    };
    let exponent = match prefix {
        "" if unit.is_empty() => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        _ => return Err(invalid()),
    };

    base.checked_pow(exponent)
        .and_then(|factor| value.checked_mul(factor))
        .ok_or_else(invalid)
}
