use super::apply::SkillEngine;
use super::state::{
    clear_backup, create_backup, load_state, prune_empty_parents, restore_backup, save_state,
    AppliedSkill,
};
use super::{io_err, SkillError};
use std::fs;

impl SkillEngine {
    /// Reverse an applied skill: restore base snapshots where they exist,
    /// delete files the skill introduced (pruning now-empty directories),
    /// drop the dependencies it added, and remove its record. Any error
    /// restores the pre-uninstall backup.
    pub fn uninstall(&self, name: &str) -> Result<(), SkillError> {
        let mut state = load_state(self.paths())?;
        let applied = state
            .find_applied(name)
            .cloned()
            .ok_or_else(|| SkillError::NotApplied {
                name: name.to_string(),
            })?;

        let mut touched: Vec<String> = applied.file_hashes.keys().cloned().collect();
        if !applied.added_dependencies.is_empty() {
            touched.push(self.package_file_name().to_string());
        }
        create_backup(self.paths(), &touched)?;

        let result = self.uninstall_steps(&applied, &mut state);
        match result {
            Ok(()) => {
                clear_backup(self.paths())?;
                Ok(())
            }
            Err(err) => {
                let _ = restore_backup(self.paths());
                let _ = clear_backup(self.paths());
                Err(err)
            }
        }
    }

    fn uninstall_steps(
        &self,
        applied: &AppliedSkill,
        state: &mut super::state::SkillState,
    ) -> Result<(), SkillError> {
        for rel in applied.file_hashes.keys() {
            let base = self.paths().base_file(rel);
            let target = self.paths().project_file(rel);
            if base.is_file() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
                fs::copy(&base, &target).map_err(|e| io_err(&base, e))?;
                fs::remove_file(&base).map_err(|e| io_err(&base, e))?;
                prune_empty_parents(&self.paths().base_dir(), &base);
            } else {
                if target.exists() {
                    fs::remove_file(&target).map_err(|e| io_err(&target, e))?;
                }
                prune_empty_parents(&self.paths().project_root, &target);
            }
        }

        if !applied.added_dependencies.is_empty() {
            self.remove_package_dependencies(&applied.added_dependencies)?;
        }

        state.applied.retain(|skill| skill.name != applied.name);
        save_state(self.paths(), state)?;
        Ok(())
    }

    fn remove_package_dependencies(
        &self,
        names: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), SkillError> {
        let path = self.paths().project_file(self.package_file_name());
        if !path.is_file() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let mut root: serde_json::Value =
            serde_json::from_str(&raw).map_err(|source| SkillError::State {
                path: path.display().to_string(),
                source,
            })?;
        if let Some(deps) = root
            .as_object_mut()
            .and_then(|object| object.get_mut("dependencies"))
            .and_then(|deps| deps.as_object_mut())
        {
            for name in names.keys() {
                deps.remove(name);
            }
        }
        let body = serde_json::to_string_pretty(&root).map_err(|source| SkillError::State {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(&path, body).map_err(|e| io_err(&path, e))
    }
}
