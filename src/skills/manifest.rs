use super::{io_err, SkillError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "skill.yaml";

/// Pre-merge filesystem operations, executed against the project tree before
/// any add or modify lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    Delete { path: String },
    Rename { from: String, to: String },
    Move { from: String, to: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageAdditions {
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillManifest {
    pub skill: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Relative paths copied from `<dir>/add/` into the project.
    #[serde(default)]
    pub adds: Vec<String>,
    /// Relative paths three-way merged from `<dir>/modify/` into the project.
    #[serde(default)]
    pub modifies: Vec<String>,
    #[serde(default)]
    pub packages: PackageAdditions,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub post_apply: Vec<String>,
    #[serde(default)]
    pub file_ops: Vec<FileOp>,
}

impl SkillManifest {
    pub fn load(skill_dir: &Path) -> Result<Self, SkillError> {
        let path = skill_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
        serde_yaml::from_str(&raw).map_err(|source| SkillError::Manifest {
            path: path.display().to_string(),
            source,
        })
    }
}
