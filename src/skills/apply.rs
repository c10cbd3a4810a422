use super::manifest::{FileOp, SkillManifest};
use super::merge::merge_three_way;
use super::state::{
    clear_backup, create_backup, file_sha256, load_state, restore_backup, save_state,
    AppliedSkill, SkillPaths, SkillState,
};
use super::{io_err, SkillError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Project manifest the skill's declared dependencies merge into.
    pub package_file: String,
    /// File new env-variable names are appended to.
    pub env_example_file: String,
    /// Run after dependencies were added; None skips installation.
    pub install_command: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            package_file: "package.json".to_string(),
            env_example_file: ".env.example".to_string(),
            install_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub skill: String,
    pub version: String,
    /// false when merge conflicts were written; the apply is still recorded.
    pub success: bool,
    pub merge_conflicts: Vec<String>,
    pub message: String,
}

/// Applies, merges and uninstalls extension packs against one project root.
/// Must be driven serially per root: backup and base trees are a single slot.
pub struct SkillEngine {
    paths: SkillPaths,
    config: EngineConfig,
}

impl SkillEngine {
    pub fn new(project_root: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self {
            paths: SkillPaths::new(project_root),
            config,
        }
    }

    pub fn paths(&self) -> &SkillPaths {
        &self.paths
    }

    pub(crate) fn package_file_name(&self) -> &str {
        &self.config.package_file
    }

    pub fn state(&self) -> Result<SkillState, SkillError> {
        load_state(&self.paths)
    }

    /// Atomic from the caller's perspective: afterwards the project matches
    /// either the pre-apply tree (on error, via backup restore) or the
    /// post-apply tree.
    pub fn apply(&self, skill_dir: &Path) -> Result<ApplyOutcome, SkillError> {
        let manifest = SkillManifest::load(skill_dir)?;
        let mut state = load_state(&self.paths)?;
        preflight(&manifest, &state)?;

        let touched = self.touched_files(&manifest);
        create_backup(&self.paths, &touched)?;

        match self.apply_steps(skill_dir, &manifest, &mut state) {
            Ok(outcome) => {
                clear_backup(&self.paths)?;
                Ok(outcome)
            }
            Err(err) => {
                let _ = restore_backup(&self.paths);
                let _ = clear_backup(&self.paths);
                Err(err)
            }
        }
    }

    fn touched_files(&self, manifest: &SkillManifest) -> Vec<String> {
        let mut touched: Vec<String> = Vec::new();
        touched.extend(manifest.adds.iter().cloned());
        touched.extend(manifest.modifies.iter().cloned());
        for op in &manifest.file_ops {
            match op {
                FileOp::Delete { path } => touched.push(path.clone()),
                FileOp::Rename { from, to } | FileOp::Move { from, to } => {
                    touched.push(from.clone());
                    touched.push(to.clone());
                }
            }
        }
        if !manifest.packages.dependencies.is_empty() {
            touched.push(self.config.package_file.clone());
        }
        if !manifest.packages.env.is_empty() {
            touched.push(self.config.env_example_file.clone());
        }
        touched.sort();
        touched.dedup();
        touched
    }

    fn apply_steps(
        &self,
        skill_dir: &Path,
        manifest: &SkillManifest,
        state: &mut SkillState,
    ) -> Result<ApplyOutcome, SkillError> {
        self.run_file_ops(&manifest.file_ops)?;

        for rel in &manifest.adds {
            let source = skill_dir.join("add").join(rel);
            if !source.is_file() {
                return Err(SkillError::MissingAddSource {
                    path: source.display().to_string(),
                });
            }
            let dest = self.paths.project_file(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::copy(&source, &dest).map_err(|e| io_err(&source, e))?;
        }

        let mut merge_conflicts = Vec::new();
        // Pre-apply content for files first modified by this skill; persisted
        // into base/ only after every modify was written.
        let mut pending_base: Vec<(String, String)> = Vec::new();
        for rel in &manifest.modifies {
            let source = skill_dir.join("modify").join(rel);
            let skill_text = fs::read_to_string(&source).map_err(|_| {
                SkillError::MissingModifySource {
                    path: source.display().to_string(),
                }
            })?;

            let target = self.paths.project_file(rel);
            let current_text = match fs::read_to_string(&target) {
                Ok(text) => Some(text),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                Err(err) => return Err(io_err(&target, err)),
            };

            let merged = match &current_text {
                // No project file at all: the skill content wins outright.
                None => skill_text.clone(),
                Some(current) => {
                    let base_path = self.paths.base_file(rel);
                    let base_text = if base_path.is_file() {
                        fs::read_to_string(&base_path).map_err(|e| io_err(&base_path, e))?
                    } else {
                        pending_base.push((rel.clone(), current.clone()));
                        current.clone()
                    };
                    let outcome = merge_three_way(&base_text, current, &skill_text);
                    if outcome.conflicts {
                        merge_conflicts.push(rel.clone());
                    }
                    outcome.content
                }
            };

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::write(&target, merged).map_err(|e| io_err(&target, e))?;
        }
        for (rel, content) in pending_base {
            let base_path = self.paths.base_file(&rel);
            if let Some(parent) = base_path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::write(&base_path, content).map_err(|e| io_err(&base_path, e))?;
        }

        let added_dependencies = self.merge_package_dependencies(manifest)?;
        let added_env = self.append_env_names(manifest)?;

        if !added_dependencies.is_empty() {
            if let Some(install) = &self.config.install_command {
                self.run_command(install)?;
            }
        }
        for command in &manifest.post_apply {
            self.run_command(command)?;
        }
        if let Some(test) = &manifest.test {
            self.run_command(test)?;
        }

        let mut file_hashes = BTreeMap::new();
        for rel in manifest.adds.iter().chain(manifest.modifies.iter()) {
            file_hashes.insert(rel.clone(), file_sha256(&self.paths.project_file(rel))?);
        }

        state.applied.push(AppliedSkill {
            name: manifest.skill.clone(),
            version: manifest.version.clone(),
            applied_at: crate::shared::ids::now_iso(),
            file_hashes,
            added_dependencies,
            added_env,
        });
        save_state(&self.paths, state)?;

        let success = merge_conflicts.is_empty();
        let message = if success {
            format!("applied {} {}", manifest.skill, manifest.version)
        } else {
            format!(
                "applied {} {} with merge conflicts in: {}",
                manifest.skill,
                manifest.version,
                merge_conflicts.join(", ")
            )
        };
        Ok(ApplyOutcome {
            skill: manifest.skill.clone(),
            version: manifest.version.clone(),
            success,
            merge_conflicts,
            message,
        })
    }

    fn run_file_ops(&self, ops: &[FileOp]) -> Result<(), SkillError> {
        for op in ops {
            match op {
                FileOp::Delete { path } => {
                    let target = self.paths.project_file(path);
                    if target.is_file() {
                        fs::remove_file(&target).map_err(|e| io_err(&target, e))?;
                    }
                }
                FileOp::Rename { from, to } | FileOp::Move { from, to } => {
                    let source = self.paths.project_file(from);
                    let dest = self.paths.project_file(to);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                    }
                    fs::rename(&source, &dest).map_err(|e| io_err(&source, e))?;
                }
            }
        }
        Ok(())
    }

    /// Returns the dependencies newly added to the package file.
    fn merge_package_dependencies(
        &self,
        manifest: &SkillManifest,
    ) -> Result<BTreeMap<String, String>, SkillError> {
        if manifest.packages.dependencies.is_empty() {
            return Ok(BTreeMap::new());
        }
        let path = self.paths.project_file(&self.config.package_file);
        let mut root: serde_json::Value = if path.is_file() {
            let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            serde_json::from_str(&raw).map_err(|source| SkillError::State {
                path: path.display().to_string(),
                source,
            })?
        } else {
            serde_json::json!({})
        };

        let mut added = BTreeMap::new();
        {
            let Some(object) = root.as_object_mut() else {
                return Err(SkillError::Preflight(format!(
                    "{} is not a JSON object",
                    self.config.package_file
                )));
            };
            let deps = object
                .entry("dependencies")
                .or_insert_with(|| serde_json::json!({}));
            let Some(deps) = deps.as_object_mut() else {
                return Err(SkillError::Preflight(format!(
                    "{} dependencies is not an object",
                    self.config.package_file
                )));
            };
            for (name, version) in &manifest.packages.dependencies {
                if !deps.contains_key(name) {
                    deps.insert(name.clone(), serde_json::Value::from(version.clone()));
                    added.insert(name.clone(), version.clone());
                }
            }
        }

        let body = serde_json::to_string_pretty(&root).map_err(|source| SkillError::State {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(&path, body).map_err(|e| io_err(&path, e))?;
        Ok(added)
    }

    /// Appends env names not already present; returns what was appended.
    fn append_env_names(&self, manifest: &SkillManifest) -> Result<Vec<String>, SkillError> {
        if manifest.packages.env.is_empty() {
            return Ok(Vec::new());
        }
        let path = self.paths.project_file(&self.config.env_example_file);
        let mut body = if path.is_file() {
            fs::read_to_string(&path).map_err(|e| io_err(&path, e))?
        } else {
            String::new()
        };

        let mut added = Vec::new();
        for name in &manifest.packages.env {
            let already = body
                .lines()
                .any(|line| line.trim_start().starts_with(&format!("{name}=")));
            if already {
                continue;
            }
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&format!("{name}=\n"));
            added.push(name.clone());
        }
        fs::write(&path, body).map_err(|e| io_err(&path, e))?;
        Ok(added)
    }

    pub(crate) fn run_command(&self, command: &str) -> Result<(), SkillError> {
        let status = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.paths.project_root)
            .status()
            .map_err(|e| io_err(&self.paths.project_root, e))?;
        if !status.success() {
            return Err(SkillError::CommandFailed {
                command: command.to_string(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

fn preflight(manifest: &SkillManifest, state: &SkillState) -> Result<(), SkillError> {
    let mut problems = Vec::new();
    if state.is_applied(&manifest.skill) {
        problems.push(format!("skill `{}` is already applied", manifest.skill));
    }
    for dependency in &manifest.depends {
        if !state.is_applied(dependency) {
            problems.push(format!("missing dependency `{dependency}`"));
        }
    }
    for conflict in &manifest.conflicts {
        if state.is_applied(conflict) {
            problems.push(format!("conflicts with applied skill `{conflict}`"));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(SkillError::Preflight(problems.join("; ")))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::super::manifest::MANIFEST_FILE;
    use std::fs;
    use std::path::Path;

    /// Lay out a skill directory: manifest plus add/ and modify/ sources.
    pub(crate) fn write_skill(
        dir: &Path,
        manifest_yaml: &str,
        adds: &[(&str, &str)],
        modifies: &[(&str, &str)],
    ) {
        fs::create_dir_all(dir).expect("skill dir");
        fs::write(dir.join(MANIFEST_FILE), manifest_yaml).expect("manifest");
        for (rel, body) in adds {
            let path = dir.join("add").join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("add dir");
            fs::write(path, body).expect("add source");
        }
        for (rel, body) in modifies {
            let path = dir.join("modify").join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("modify dir");
            fs::write(path, body).expect("modify source");
        }
    }
}
