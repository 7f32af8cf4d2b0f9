use serde::Serialize;
use serde_json::{json, Value};

use crate::model::Phase;

/// One failed validation rule, reported with the offending field so callers
/// can fix and resubmit.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub constraint: String,
    pub message: String,
}

impl FieldError {
    #[must_use]
    pub fn new(
        field: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            constraint: constraint.into(),
            message: message.into(),
        }
    }
}

/// Error taxonomy for the ledger. Each variant maps to a stable JSON-RPC
/// error code and an HTTP status hint; `data()` carries the machine-readable
/// kind plus structured context.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ReceiptGateError {
    #[error("receipt validation failed")]
    ValidationFailed { errors: Vec<FieldError> },

    #[error("receipt_id {receipt_id} collides with a different canonical hash")]
    ReceiptConflict {
        receipt_id: String,
        existing_hash: String,
        incoming_hash: String,
    },

    #[error("caused_by_receipt_id {caused_by_receipt_id} not found in obligation {obligation_id}")]
    ParentMissing {
        caused_by_receipt_id: String,
        obligation_id: String,
    },

    #[error("parent receipt {parent_receipt_id} is in phase {parent_phase:?}, not accepted")]
    ParentNotAcceptedPhase {
        parent_receipt_id: String,
        parent_phase: Phase,
    },

    #[error("obligation {obligation_id} is already terminated by {terminal_receipt_id}")]
    AlreadyTerminated {
        obligation_id: String,
        terminal_receipt_id: String,
        terminal_phase: Phase,
    },

    #[error("receipt not found")]
    NotFound,

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("operation deadline exceeded")]
    Timeout,

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReceiptGateError {
    /// Stable machine-readable kind, surfaced in JSON-RPC `error.data.kind`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ReceiptConflict { .. } => "receipt_conflict",
            Self::ParentMissing { .. } => "parent_missing",
            Self::ParentNotAcceptedPhase { .. } => "parent_not_accepted_phase",
            Self::AlreadyTerminated { .. } => "already_terminated",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Timeout => "timeout",
            Self::Backend(_) => "backend",
            Self::Internal(_) => "internal",
        }
    }

    /// Stable JSON-RPC error code for the kind.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::ValidationFailed { .. } => -32001,
            Self::ReceiptConflict { .. } => -32002,
            Self::ParentMissing { .. } => -32003,
            Self::ParentNotAcceptedPhase { .. } => -32004,
            Self::AlreadyTerminated { .. } => -32005,
            Self::NotFound => -32006,
            Self::Unauthorized => -32007,
            Self::Timeout => -32008,
            Self::Backend(_) => -32009,
            Self::Internal(_) => -32010,
        }
    }

    /// HTTP status the kind corresponds to on plain HTTP surfaces.
    #[must_use]
    pub fn http_hint(&self) -> u16 {
        match self {
            Self::ValidationFailed { .. } => 422,
            Self::ReceiptConflict { .. } | Self::AlreadyTerminated { .. } => 409,
            Self::ParentMissing { .. } | Self::ParentNotAcceptedPhase { .. } => 422,
            Self::NotFound => 404,
            Self::Unauthorized => 401,
            Self::Timeout => 504,
            Self::Backend(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// Structured error context for the JSON-RPC `error.data` field.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Self::ValidationFailed { errors } => json!({
                "kind": self.kind(),
                "errors": errors,
            }),
            Self::ReceiptConflict {
                receipt_id,
                existing_hash,
                incoming_hash,
            } => json!({
                "kind": self.kind(),
                "receipt_id": receipt_id,
                "existing_hash": existing_hash,
                "incoming_hash": incoming_hash,
            }),
            Self::ParentMissing {
                caused_by_receipt_id,
                obligation_id,
            } => json!({
                "kind": self.kind(),
                "caused_by_receipt_id": caused_by_receipt_id,
                "obligation_id": obligation_id,
            }),
            Self::ParentNotAcceptedPhase {
                parent_receipt_id,
                parent_phase,
            } => json!({
                "kind": self.kind(),
                "parent_receipt_id": parent_receipt_id,
                "parent_phase": parent_phase.as_str(),
            }),
            Self::AlreadyTerminated {
                obligation_id,
                terminal_receipt_id,
                terminal_phase,
            } => json!({
                "kind": self.kind(),
                "obligation_id": obligation_id,
                "terminal_receipt_id": terminal_receipt_id,
                "terminal_phase": terminal_phase.as_str(),
            }),
            _ => json!({ "kind": self.kind() }),
        }
    }

    #[must_use]
    pub fn single_validation(field: &str, constraint: &str, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            errors: vec![FieldError::new(field, constraint, message)],
        }
    }
}

impl From<serde_json::Error> for ReceiptGateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_distinct_code() {
        let errors = [
            ReceiptGateError::single_validation("phase", "enum", "bad phase"),
            ReceiptGateError::ReceiptConflict {
                receipt_id: "r".into(),
                existing_hash: "a".into(),
                incoming_hash: "b".into(),
            },
            ReceiptGateError::ParentMissing {
                caused_by_receipt_id: "p".into(),
                obligation_id: "o".into(),
            },
            ReceiptGateError::ParentNotAcceptedPhase {
                parent_receipt_id: "p".into(),
                parent_phase: Phase::Complete,
            },
            ReceiptGateError::AlreadyTerminated {
                obligation_id: "o".into(),
                terminal_receipt_id: "t".into(),
                terminal_phase: Phase::Escalate,
            },
            ReceiptGateError::NotFound,
            ReceiptGateError::Unauthorized,
            ReceiptGateError::Timeout,
            ReceiptGateError::Backend("db".into()),
            ReceiptGateError::Internal("bug".into()),
        ];
        let mut codes: Vec<i64> = errors.iter().map(ReceiptGateError::jsonrpc_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn conflict_data_carries_both_hashes() {
        let err = ReceiptGateError::ReceiptConflict {
            receipt_id: "r-1".into(),
            existing_hash: "aa".into(),
            incoming_hash: "bb".into(),
        };
        let data = err.data();
        assert_eq!(data["kind"], "receipt_conflict");
        assert_eq!(data["existing_hash"], "aa");
        assert_eq!(data["incoming_hash"], "bb");
        assert_eq!(err.http_hint(), 409);
    }
}
