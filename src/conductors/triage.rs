use crate::domain::{Message, TaskPriority};
use serde_json::Value;

/// Outcome of classifying one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageDecision {
    pub category: String,
    pub priority: TaskPriority,
    pub agent_type: String,
    pub reason: String,
}

/// One rung of the ladder. Keywords match against the lower-cased subject and
/// body; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct TriageRule {
    pub category: &'static str,
    pub agent_type: &'static str,
    pub priority: TaskPriority,
    pub keywords: &'static [&'static str],
}

/// The rule list is data, not code, so it can be swapped at runtime without
/// touching the dispatcher. Keywords are deliberately language-tolerant
/// (English and German forms side by side).
pub fn default_rules() -> Vec<TriageRule> {
    vec![
        TriageRule {
            category: "urgent-email",
            agent_type: "urgent-email",
            priority: TaskPriority::Urgent,
            keywords: &["urgent:", "urgent", "asap", "dringend", "sofort", "notfall"],
        },
        TriageRule {
            category: "billing-email",
            agent_type: "billing-email",
            priority: TaskPriority::High,
            keywords: &[
                "invoice", "rechnung", "payment", "zahlung", "billing", "mahnung", "refund due",
            ],
        },
        TriageRule {
            category: "complaint-email",
            agent_type: "complaint-email",
            priority: TaskPriority::High,
            keywords: &[
                "complaint",
                "beschwerde",
                "refund",
                "erstattung",
                "unacceptable",
                "dissatisfied",
            ],
        },
        TriageRule {
            category: "scheduling-email",
            agent_type: "scheduling-email",
            priority: TaskPriority::Normal,
            keywords: &["meeting", "termin", "appointment", "schedule", "reschedule", "calendar"],
        },
    ]
}

/// Deterministic classification over channel, lower-cased subject, body and
/// metadata. Pure function of the message.
pub fn triage(message: &Message, rules: &[TriageRule]) -> TriageDecision {
    let subject = message.subject.clone().unwrap_or_default().to_lowercase();
    let body = message.body.to_lowercase();

    let priority_override = message
        .metadata
        .get("priority")
        .and_then(Value::as_str)
        .and_then(TaskPriority::parse);

    if is_mail_channel(&message.channel) {
        for rule in rules {
            for keyword in rule.keywords {
                let field = if subject.contains(keyword) {
                    Some("subject")
                } else if body.contains(keyword) {
                    Some("body")
                } else {
                    None
                };
                if let Some(field) = field {
                    return TriageDecision {
                        category: rule.category.to_string(),
                        priority: priority_override.unwrap_or(rule.priority),
                        agent_type: rule.agent_type.to_string(),
                        reason: format!("matched `{keyword}` in {field}"),
                    };
                }
            }
        }
        return TriageDecision {
            category: "general-email".to_string(),
            priority: priority_override.unwrap_or(TaskPriority::Normal),
            agent_type: "general-email".to_string(),
            reason: "no rule matched".to_string(),
        };
    }

    TriageDecision {
        category: format!("{}-message", message.channel),
        priority: priority_override.unwrap_or(TaskPriority::Normal),
        agent_type: format!("{}-message", message.channel),
        reason: format!("non-mail channel `{}`", message.channel),
    }
}

fn is_mail_channel(channel: &str) -> bool {
    matches!(channel, "email" | "mail")
}
