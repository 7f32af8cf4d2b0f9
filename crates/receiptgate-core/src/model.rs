use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle phase of a receipt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Accepted,
    Complete,
    Escalate,
}

/// Phases that close an obligation. Once any of these is committed for an
/// `obligation_id`, the obligation is never again reported as open.
pub const TERMINAL_PHASES: [Phase; 2] = [Phase::Complete, Phase::Escalate];

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Complete => "complete",
            Self::Escalate => "escalate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "complete" => Some(Self::Complete),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        TERMINAL_PHASES.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Report,
    Dataset,
    Binary,
    Text,
    Json,
    Image,
    Other,
}

impl ArtifactKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Dataset => "dataset",
            Self::Binary => "binary",
            Self::Text => "text",
            Self::Json => "json",
            Self::Image => "image",
            Self::Other => "other",
        }
    }
}

/// Opaque reference to an artifact held by the external artifact vault.
/// ReceiptGate stores the reference only, never the bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ArtifactKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// A client-submitted receipt candidate, before server fields are assigned.
///
/// Unknown top-level fields are rejected at deserialization; `None` fields are
/// omitted on serialization so the canonical form is stable regardless of
/// whether a client sent explicit nulls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReceiptDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    pub receipt_id: String,
    pub phase: Phase,
    pub obligation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by_receipt_id: Option<String>,
    pub created_by: String,
    pub recipient_ai: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_refs: Option<Vec<ArtifactRef>>,
    pub body: Value,
}

/// A committed ledger row. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub uuid: Uuid,
    pub tenant_id: String,
    pub receipt_id: String,
    pub canonical_hash: String,
    pub phase: Phase,
    pub obligation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by_receipt_id: Option<String>,
    pub created_by: String,
    pub recipient_ai: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_refs: Vec<ArtifactRef>,
    pub body: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of the append protocol: the committed row plus whether this call
/// observed an idempotent replay of an earlier identical submission.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubmitOutcome {
    pub receipt: Receipt,
    pub idempotent_replay: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        for phase in [Phase::Accepted, Phase::Complete, Phase::Escalate] {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::parse("cancel"), None);
    }

    #[test]
    fn terminal_phases_exclude_accepted() {
        assert!(!Phase::Accepted.is_terminal());
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Escalate.is_terminal());
    }

    #[test]
    fn draft_rejects_unknown_top_level_fields() {
        let raw = serde_json::json!({
            "receipt_id": "r-1",
            "phase": "accepted",
            "obligation_id": "o-1",
            "created_by": "svc:planner",
            "recipient_ai": "alice",
            "body": {},
            "surprise": true,
        });
        let parsed: Result<ReceiptDraft, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn draft_serialization_omits_absent_fields() {
        let draft = ReceiptDraft {
            uuid: None,
            receipt_id: "r-1".to_string(),
            phase: Phase::Accepted,
            obligation_id: "o-1".to_string(),
            task_id: None,
            caused_by_receipt_id: None,
            created_by: "svc:planner".to_string(),
            recipient_ai: "alice".to_string(),
            escalation_to: None,
            artifact_refs: None,
            body: serde_json::json!({}),
        };
        let value = serde_json::to_value(&draft).unwrap();
        let map = value.as_object().unwrap();
        assert!(!map.contains_key("task_id"));
        assert!(!map.contains_key("escalation_to"));
        assert!(!map.contains_key("uuid"));
    }
}
