use crate::store::StoreError;
use serde_json::Value;

pub mod chief;
pub mod context;
pub mod inbox;
pub mod learning;
pub mod quality;
pub mod triage;
pub mod workflow;

pub use chief::ChiefConductor;
pub use context::{ContextConductor, KnowledgeHit, KnowledgeSource};
pub use inbox::InboxConductor;
pub use learning::LearningConductor;
pub use quality::QualityConductor;
pub use workflow::WorkflowConductor;

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Approval(#[from] crate::approval::ApprovalError),
    #[error("event payload missing `{field}`")]
    MissingField { field: &'static str },
}

/// A named long-lived role reacting to bus events. `start` is idempotent;
/// `stop` unsubscribes every handler and halts any timers. Conductors never
/// call each other, they publish events.
pub trait Conductor: Send + Sync {
    fn name(&self) -> &'static str;
    fn start(&self) -> Result<(), ConductorError>;
    fn stop(&self);
}

pub(crate) fn payload_str<'a>(
    payload: &'a Value,
    field: &'static str,
) -> Result<&'a str, ConductorError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or(ConductorError::MissingField { field })
}
