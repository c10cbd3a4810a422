use super::{io_err, SkillError};
use crate::shared::fs_atomic::atomic_write_file;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".coreclaw";
pub const ENGINE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedSkill {
    pub name: String,
    pub version: String,
    pub applied_at: String,
    /// Relative path -> hex sha256 of the file as written by the apply.
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub added_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub added_env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillState {
    pub engine_version: u32,
    #[serde(default)]
    pub applied: Vec<AppliedSkill>,
    #[serde(default)]
    pub custom_modifications: Vec<String>,
}

impl Default for SkillState {
    fn default() -> Self {
        Self {
            engine_version: ENGINE_VERSION,
            applied: Vec::new(),
            custom_modifications: Vec::new(),
        }
    }
}

impl SkillState {
    pub fn is_applied(&self, name: &str) -> bool {
        self.applied.iter().any(|skill| skill.name == name)
    }

    pub fn find_applied(&self, name: &str) -> Option<&AppliedSkill> {
        self.applied.iter().find(|skill| skill.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub path: String,
    /// false when the file did not exist pre-operation; rollback removes it.
    pub existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub files: Vec<BackupEntry>,
    pub created_at: String,
}

/// Filesystem layout of the per-project skill state.
#[derive(Debug, Clone)]
pub struct SkillPaths {
    pub project_root: PathBuf,
}

impl SkillPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    pub fn base_dir(&self) -> PathBuf {
        self.state_dir().join("base")
    }

    pub fn base_file(&self, rel: &str) -> PathBuf {
        self.base_dir().join(rel)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir().join("backup")
    }

    pub fn backup_manifest(&self) -> PathBuf {
        self.backup_dir().join("_manifest.json")
    }

    pub fn project_file(&self, rel: &str) -> PathBuf {
        self.project_root.join(rel)
    }
}

pub fn load_state(paths: &SkillPaths) -> Result<SkillState, SkillError> {
    let path = paths.state_file();
    if !path.exists() {
        return Ok(SkillState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
    serde_json::from_str(&raw).map_err(|source| SkillError::State {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_state(paths: &SkillPaths, state: &SkillState) -> Result<(), SkillError> {
    let path = paths.state_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| io_err(parent, source))?;
    }
    let body = serde_json::to_vec_pretty(state).map_err(|source| SkillError::State {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &body).map_err(|source| io_err(&path, source))
}

/// Copy every listed project file into `backup/` and write the manifest.
/// Missing files are recorded so rollback can delete what the operation adds.
pub fn create_backup(paths: &SkillPaths, rel_paths: &[String]) -> Result<(), SkillError> {
    clear_backup(paths)?;
    let backup_dir = paths.backup_dir();
    fs::create_dir_all(&backup_dir).map_err(|source| io_err(&backup_dir, source))?;

    let mut entries = Vec::new();
    for rel in rel_paths {
        let source = paths.project_file(rel);
        let existed = source.is_file();
        if existed {
            let dest = backup_dir.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::copy(&source, &dest).map_err(|e| io_err(&source, e))?;
        }
        entries.push(BackupEntry {
            path: rel.clone(),
            existed,
        });
    }

    let manifest = BackupManifest {
        files: entries,
        created_at: crate::shared::ids::now_iso(),
    };
    let body = serde_json::to_vec_pretty(&manifest).map_err(|source| SkillError::State {
        path: paths.backup_manifest().display().to_string(),
        source,
    })?;
    atomic_write_file(&paths.backup_manifest(), &body)
        .map_err(|source| io_err(&paths.backup_manifest(), source))
}

/// Put every file in the backup manifest back the way it was. Files that did
/// not exist pre-operation are deleted and their empty parents pruned.
pub fn restore_backup(paths: &SkillPaths) -> Result<(), SkillError> {
    let manifest_path = paths.backup_manifest();
    if !manifest_path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(&manifest_path).map_err(|e| io_err(&manifest_path, e))?;
    let manifest: BackupManifest =
        serde_json::from_str(&raw).map_err(|source| SkillError::State {
            path: manifest_path.display().to_string(),
            source,
        })?;

    for entry in &manifest.files {
        let target = paths.project_file(&entry.path);
        if entry.existed {
            let saved = paths.backup_dir().join(&entry.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::copy(&saved, &target).map_err(|e| io_err(&saved, e))?;
        } else if target.exists() {
            fs::remove_file(&target).map_err(|e| io_err(&target, e))?;
            prune_empty_parents(&paths.project_root, &target);
        }
    }
    Ok(())
}

pub fn clear_backup(paths: &SkillPaths) -> Result<(), SkillError> {
    let dir = paths.backup_dir();
    if dir.exists() {
        fs::remove_dir_all(&dir).map_err(|source| io_err(&dir, source))?;
    }
    Ok(())
}

/// Remove now-empty ancestors of `removed`, stopping at (and excluding) root.
pub fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut cursor = removed.parent();
    while let Some(dir) = cursor {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        let is_empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty || fs::remove_dir(dir).is_err() {
            break;
        }
        cursor = dir.parent();
    }
}

pub fn file_sha256(path: &Path) -> Result<String, SkillError> {
    let body = fs::read(path).map_err(|source| io_err(path, source))?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn state_round_trips_through_disk() {
        let tmp = tempdir().expect("tempdir");
        let paths = SkillPaths::new(tmp.path());
        assert_eq!(load_state(&paths).expect("default"), SkillState::default());

        let mut state = SkillState::default();
        state.applied.push(AppliedSkill {
            name: "mail-signatures".to_string(),
            version: "1.0.0".to_string(),
            applied_at: "2026-01-01T00:00:00Z".to_string(),
            file_hashes: BTreeMap::from([(
                "templates/signature.txt".to_string(),
                "abc123".to_string(),
            )]),
            added_dependencies: BTreeMap::new(),
            added_env: vec!["SIGNATURE_NAME".to_string()],
        });
        save_state(&paths, &state).expect("save");

        let loaded = load_state(&paths).expect("load");
        assert_eq!(loaded, state);
        assert!(loaded.is_applied("mail-signatures"));
        assert!(!loaded.is_applied("other"));
    }

    #[test]
    fn backup_and_restore_round_trip_existing_and_new_files() {
        let tmp = tempdir().expect("tempdir");
        let paths = SkillPaths::new(tmp.path());
        fs::create_dir_all(tmp.path().join("config")).expect("dir");
        fs::write(tmp.path().join("config/app.json"), "original").expect("seed");

        create_backup(
            &paths,
            &[
                "config/app.json".to_string(),
                "templates/new.txt".to_string(),
            ],
        )
        .expect("backup");

        // Simulate an apply touching both files.
        fs::write(tmp.path().join("config/app.json"), "mutated").expect("mutate");
        fs::create_dir_all(tmp.path().join("templates")).expect("dir");
        fs::write(tmp.path().join("templates/new.txt"), "added").expect("add");

        restore_backup(&paths).expect("restore");
        assert_eq!(
            fs::read_to_string(tmp.path().join("config/app.json")).expect("read"),
            "original"
        );
        assert!(!tmp.path().join("templates/new.txt").exists());
        assert!(!tmp.path().join("templates").exists());
    }

    #[test]
    fn prune_stops_at_the_project_root() {
        let tmp = tempdir().expect("tempdir");
        let nested = tmp.path().join("a/b/c");
        fs::create_dir_all(&nested).expect("dirs");
        let file = nested.join("file.txt");
        fs::write(&file, "x").expect("write");
        fs::remove_file(&file).expect("remove");

        prune_empty_parents(tmp.path(), &file);
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("f.txt");
        fs::write(&path, "abc").expect("write");
        assert_eq!(
            file_sha256(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
