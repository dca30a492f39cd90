//! Build manifest model.
//!
//! A manifest is a YAML document:
//!
//! ```yaml
//! name: demo
//! architecture: amd64
//! version: "1.0"
//! schemaVersion: 1
//! stages:
//!   - stage: bootstrap
//!     options:
//!       suite: bookworm
//!       target: rootfs.tar.gz
//! ```
//!
//! Any value may be replaced by `!include other.yaml`, resolved relative to
//! the manifest's directory.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::BuildError;

/// Manifest schema revision this engine understands.
pub const SUPPORTED_SCHEMA_VERSION: i64 = 1;

/// Target architecture of the built artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    pub const ALL: &'static [Architecture] = &[Architecture::Amd64, Architecture::Arm64];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "amd64" => Ok(Architecture::Amd64),
            "arm64" => Ok(Architecture::Arm64),
            other => Err(BuildError::config(format!(
                "architecture '{}' is not supported; expected one of: {}",
                other,
                Architecture::ALL
                    .iter()
                    .map(|a| a.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// One stage invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    /// Registry lookup key.
    pub stage: String,
    /// Optional label for logs.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "empty_options")]
    pub options: Value,
}

fn empty_options() -> Value {
    Value::Mapping(Mapping::new())
}

impl StageSpec {
    pub fn new(stage: impl Into<String>, options: Value) -> Self {
        Self {
            stage: stage.into(),
            name: None,
            options,
        }
    }

    /// Label used in logs: the explicit name, else the kind.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.stage)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    name: Option<String>,
    architecture: Option<String>,
    version: Option<Value>,
    #[serde(rename = "schemaVersion")]
    schema_version: Option<i64>,
    stages: Option<Vec<StageSpec>>,
}

/// Validated build description.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub architecture: Architecture,
    pub version: String,
    pub schema_version: i64,
    pub stages: Vec<StageSpec>,
    /// Directory the manifest was loaded from; copied into the workspace.
    pub source_dir: Option<PathBuf>,
}

impl Manifest {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        tracing::info!("Loading manifest: {}", path.display());
        if !path.is_file() {
            return Err(BuildError::config(format!(
                "Failed to load manifest: {} does not exist",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)
            .map_err(|e| BuildError::io_at("reading manifest", path, e))?;
        let source_dir = path
            .parent()
            .map(|p| {
                if p.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    p.to_path_buf()
                }
            })
            .unwrap_or_else(|| PathBuf::from("."));

        let canonical = fs::canonicalize(path)
            .map_err(|e| BuildError::io_at("resolving manifest", path, e))?;
        let mut manifest = Self::parse_in(&text, Some(&source_dir), vec![canonical])?;
        manifest.source_dir = Some(source_dir);
        Ok(manifest)
    }

    /// Parse and validate manifest text. `include_dir` anchors `!include`.
    pub fn parse(text: &str, include_dir: Option<&Path>) -> Result<Self, BuildError> {
        Self::parse_in(text, include_dir, Vec::new())
    }

    fn parse_in(
        text: &str,
        include_dir: Option<&Path>,
        mut chain: Vec<PathBuf>,
    ) -> Result<Self, BuildError> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| BuildError::config(format!("Unable to parse manifest: {}", e)))?;
        let value = resolve_includes(value, include_dir, &mut chain)?;
        let raw: RawManifest = serde_yaml::from_value(value)
            .map_err(|e| BuildError::config(format!("Invalid manifest: {}", e)))?;
        Self::validate(raw)
    }

    fn validate(raw: RawManifest) -> Result<Self, BuildError> {
        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| BuildError::config("Manifest name is not specified."))?;

        let architecture: Architecture = raw
            .architecture
            .ok_or_else(|| BuildError::config("Manifest architecture is not specified."))?
            .parse()?;

        let version = match raw.version {
            None | Some(Value::Null) => {
                return Err(BuildError::config("Manifest version is not specified."))
            }
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(BuildError::config(format!(
                    "Manifest version must be a string, got {:?}",
                    other
                )))
            }
        };

        let schema_version = raw
            .schema_version
            .ok_or_else(|| BuildError::config("Schema version is not specified."))?;

        let manifest = Self {
            name,
            architecture,
            version,
            schema_version,
            stages: raw.stages.unwrap_or_default(),
            source_dir: None,
        };
        manifest.verify()?;
        Ok(manifest)
    }

    /// Re-check the invariants `parse` enforces. Manifests built in code
    /// go through this before a pipeline touches the filesystem.
    pub fn verify(&self) -> Result<(), BuildError> {
        validate_name(&self.name)?;
        if self.version.trim().is_empty() {
            return Err(BuildError::config("Manifest version is not specified."));
        }
        if self.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(BuildError::config(format!(
                "schemaVersion {} is not supported (expected {})",
                self.schema_version, SUPPORTED_SCHEMA_VERSION
            )));
        }
        if self.stages.is_empty() {
            return Err(BuildError::config(
                "No stages found, please check the manifest.",
            ));
        }
        if let Some(spec) = self.stages.iter().find(|s| s.stage.trim().is_empty()) {
            return Err(BuildError::config(format!(
                "stage entry '{}' has an empty kind",
                spec.label()
            )));
        }
        Ok(())
    }
}

/// The name becomes a directory under the workspace base, so it must be a
/// single normal path component.
fn validate_name(name: &str) -> Result<(), BuildError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(BuildError::config(format!(
            "Manifest name '{}' must be a single path component",
            name
        ))),
    }
}

/// Replace `!include` tags with the parsed contents of the named file.
///
/// `chain` holds the canonical paths of the files currently being included,
/// outermost first; a file that includes one of them is a cycle.
fn resolve_includes(
    value: Value,
    include_dir: Option<&Path>,
    chain: &mut Vec<PathBuf>,
) -> Result<Value, BuildError> {
    match value {
        Value::Tagged(tagged) if tagged.tag == "include" => {
            let Value::String(file) = tagged.value else {
                return Err(BuildError::config("!include expects a file name"));
            };
            let base = include_dir.unwrap_or_else(|| Path::new("."));
            let path = base.join(&file);
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml || !path.is_file() {
                return Err(BuildError::config(format!(
                    "!include target is not a YAML file: {}",
                    path.display()
                )));
            }
            let canonical = fs::canonicalize(&path)
                .map_err(|e| BuildError::io_at("resolving include", &path, e))?;
            if chain.contains(&canonical) {
                let cycle = chain
                    .iter()
                    .chain(std::iter::once(&canonical))
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(BuildError::config(format!("!include cycle: {}", cycle)));
            }

            let text = fs::read_to_string(&path)
                .map_err(|e| BuildError::io_at("reading include", &path, e))?;
            let included: Value = serde_yaml::from_str(&text).map_err(|e| {
                BuildError::config(format!("Unable to parse {}: {}", path.display(), e))
            })?;
            chain.push(canonical);
            let resolved = resolve_includes(included, path.parent(), chain);
            chain.pop();
            resolved
        }
        Value::Mapping(map) => {
            let mut out = Mapping::new();
            for (k, v) in map {
                out.insert(k, resolve_includes(v, include_dir, chain)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(seq) => seq
            .into_iter()
            .map(|v| resolve_includes(v, include_dir, chain))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        other => Ok(other),
    }
}
