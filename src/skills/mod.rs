mod apply;
mod manifest;
mod merge;
mod state;
mod uninstall;

pub use apply::{ApplyOutcome, EngineConfig, SkillEngine};
pub use manifest::{FileOp, PackageAdditions, SkillManifest, MANIFEST_FILE};
pub use merge::{merge_three_way, MergeOutcome};
pub use state::{AppliedSkill, SkillPaths, SkillState, STATE_DIR};

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("skill io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid skill manifest {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid skill state {path}: {source}")]
    State {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("pre-flight failed: {0}")]
    Preflight(String),
    #[error("skill add source missing: {path}")]
    MissingAddSource { path: String },
    #[error("skill modify source missing: {path}")]
    MissingModifySource { path: String },
    #[error("skill command `{command}` exited with status {code}")]
    CommandFailed { command: String, code: i32 },
    #[error("skill `{name}` is not applied")]
    NotApplied { name: String },
}

pub(crate) fn io_err(path: &std::path::Path, source: std::io::Error) -> SkillError {
    SkillError::Io {
        path: path.display().to_string(),
        source,
    }
}
