use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(MessageDirection::Inbound),
            "outbound" => Some(MessageDirection::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    New,
    Processing,
    Handled,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::New => "new",
            MessageStatus::Processing => "processing",
            MessageStatus::Handled => "handled",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new" => Some(MessageStatus::New),
            "processing" => Some(MessageStatus::Processing),
            "handled" => Some(MessageStatus::Handled),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// new -> processing -> {handled|failed}; everything else is rejected.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (MessageStatus::New, MessageStatus::Processing)
                | (MessageStatus::Processing, MessageStatus::Handled)
                | (MessageStatus::Processing, MessageStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub channel: String,
    pub direction: MessageDirection,
    #[serde(default)]
    pub external_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub status: MessageStatus,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Primary queue sort key: urgent=0, high=1, normal=2, low=3.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "urgent" => Some(TaskPriority::Urgent),
            "high" => Some(TaskPriority::High),
            "normal" => Some(TaskPriority::Normal),
            "low" => Some(TaskPriority::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub source_channel: Option<String>,
    #[serde(default)]
    pub source_message_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub conductor_id: Option<String>,
    #[serde(default)]
    pub result: Option<AgentOutput>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutputStatus {
    Completed,
    Failed,
    Partial,
    Escalated,
}

impl AgentOutputStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentOutputStatus::Completed => "completed",
            AgentOutputStatus::Failed => "failed",
            AgentOutputStatus::Partial => "partial",
            AgentOutputStatus::Escalated => "escalated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Structured worker result, the shape every sentinel frame must decode to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub status: AgentOutputStatus,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    pub summary: String,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub outputs: Vec<OutputItem>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_priority() -> TaskPriority {
    TaskPriority::Normal
}

impl AgentOutput {
    pub fn failed(summary: impl Into<String>, error: Option<String>) -> Self {
        let summary = summary.into();
        let summary = if summary.trim().is_empty() {
            "worker produced no output".to_string()
        } else {
            summary
        };
        Self {
            status: AgentOutputStatus::Failed,
            priority: TaskPriority::Normal,
            summary,
            needs_review: true,
            outputs: Vec::new(),
            metadata: Map::new(),
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    PendingReview,
    Approved,
    Rejected,
    Sent,
    EditedAndSent,
    AutoApproved,
}

impl DraftStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DraftStatus::PendingReview => "pending_review",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Sent => "sent",
            DraftStatus::EditedAndSent => "edited_and_sent",
            DraftStatus::AutoApproved => "auto_approved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending_review" => Some(DraftStatus::PendingReview),
            "approved" => Some(DraftStatus::Approved),
            "rejected" => Some(DraftStatus::Rejected),
            "sent" => Some(DraftStatus::Sent),
            "edited_and_sent" => Some(DraftStatus::EditedAndSent),
            "auto_approved" => Some(DraftStatus::AutoApproved),
            _ => None,
        }
    }

    pub fn sets_reviewed_at(self) -> bool {
        matches!(
            self,
            DraftStatus::Approved | DraftStatus::Rejected | DraftStatus::EditedAndSent
        )
    }

    pub fn sets_sent_at(self) -> bool {
        matches!(
            self,
            DraftStatus::Sent | DraftStatus::EditedAndSent | DraftStatus::AutoApproved
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: String,
    pub task_id: String,
    #[serde(default)]
    pub source_message_id: Option<String>,
    pub channel: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub original_body: String,
    pub status: DraftStatus,
    pub priority: TaskPriority,
    #[serde(default)]
    pub conductor_notes: Option<String>,
    #[serde(default)]
    pub quality_score: Option<i64>,
    #[serde(default)]
    pub quality_notes: Option<String>,
    #[serde(default)]
    pub auto_approve_match: Option<String>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub reviewed_at: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub external_draft_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    MinorEdit,
    MajorRewrite,
    ToneChange,
    FactualFix,
    Rejection,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::MinorEdit => "minor_edit",
            ChangeType::MajorRewrite => "major_rewrite",
            ChangeType::ToneChange => "tone_change",
            ChangeType::FactualFix => "factual_fix",
            ChangeType::Rejection => "rejection",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "minor_edit" => Some(ChangeType::MinorEdit),
            "major_rewrite" => Some(ChangeType::MajorRewrite),
            "tone_change" => Some(ChangeType::ToneChange),
            "factual_fix" => Some(ChangeType::FactualFix),
            "rejection" => Some(ChangeType::Rejection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    pub id: String,
    pub draft_id: String,
    pub task_id: String,
    pub original_body: String,
    pub edited_body: String,
    #[serde(default)]
    pub edited_subject: Option<String>,
    pub change_type: ChangeType,
    #[serde(default)]
    pub feedback: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "starting" => Some(SessionStatus::Starting),
            "running" => Some(SessionStatus::Running),
            "stopped" => Some(SessionStatus::Stopped),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    #[serde(default)]
    pub container_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: String,
    #[serde(default)]
    pub stopped_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptMetrics {
    pub usage_count: u64,
    pub positive_rating: u64,
    pub negative_rating: u64,
    #[serde(default)]
    pub avg_duration_ms: Option<u64>,
    #[serde(default)]
    pub correction_rate: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptVersion {
    pub id: String,
    pub name: String,
    pub content: String,
    pub version: u32,
    pub active: bool,
    #[serde(default)]
    pub activated_at: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub metrics: Option<PromptMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub criteria: Map<String, Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub draft_id: Option<String>,
    pub rating: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: String,
}
