use serde_json::Value;

use crate::canonical::canonical_hash;
use crate::error::{FieldError, ReceiptGateError};
use crate::model::{ArtifactKind, ArtifactRef, Phase, ReceiptDraft};

pub const ID_MAX_LEN: usize = 200;
pub const URI_MAX_LEN: usize = 2048;

/// A receipt candidate that passed schema validation, carrying its computed
/// idempotency key. Storage backends only accept this type.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedReceipt {
    pub draft: ReceiptDraft,
    pub canonical_hash: String,
}

/// Structural parse of an incoming receipt object. Unknown top-level fields
/// and type mismatches are rejected here; the phase enumeration gets its own
/// error so clients can tell a typo'd phase from a malformed envelope.
///
/// # Errors
/// Returns [`ReceiptGateError::ValidationFailed`].
pub fn parse_receipt(value: &Value) -> Result<ReceiptDraft, ReceiptGateError> {
    if let Some(phase) = value.get("phase") {
        let legal = phase
            .as_str()
            .is_some_and(|raw| Phase::parse(raw).is_some());
        if !legal {
            return Err(ReceiptGateError::single_validation(
                "phase",
                "enum",
                "phase must be one of accepted, complete, escalate",
            ));
        }
    }

    serde_json::from_value(value.clone()).map_err(|err| {
        ReceiptGateError::single_validation("receipt", "structure", err.to_string())
    })
}

/// Validates a receipt candidate against the v1 schema and computes its
/// canonical hash. Database-dependent checks (parent existence, terminality)
/// belong to the ledger, not here.
///
/// # Errors
/// Returns [`ReceiptGateError::ValidationFailed`] listing every violated
/// rule, or [`ReceiptGateError::Internal`] if hashing fails.
pub fn validate_receipt(
    draft: ReceiptDraft,
    body_max_bytes: usize,
) -> Result<ValidatedReceipt, ReceiptGateError> {
    let mut errors = Vec::new();

    check_body(&draft.body, body_max_bytes, &mut errors);
    check_phase_conditions(&draft, &mut errors);
    check_identifier("receipt_id", &draft.receipt_id, &mut errors);
    check_identifier("obligation_id", &draft.obligation_id, &mut errors);
    if let Some(task_id) = &draft.task_id {
        check_identifier("task_id", task_id, &mut errors);
    }
    check_principal("created_by", &draft.created_by, &mut errors);
    check_principal("recipient_ai", &draft.recipient_ai, &mut errors);
    if let Some(refs) = &draft.artifact_refs {
        check_artifact_refs(refs, &mut errors);
    }

    if !errors.is_empty() {
        return Err(ReceiptGateError::ValidationFailed { errors });
    }

    let canonical_hash = canonical_hash(&draft)?;
    Ok(ValidatedReceipt {
        draft,
        canonical_hash,
    })
}

fn check_body(body: &Value, body_max_bytes: usize, errors: &mut Vec<FieldError>) {
    if !body.is_object() {
        errors.push(FieldError::new(
            "body",
            "type",
            "body must be a JSON object",
        ));
        return;
    }
    let size = serde_json::to_vec(body).map_or(usize::MAX, |bytes| bytes.len());
    if size > body_max_bytes {
        errors.push(FieldError::new(
            "body",
            format!("max_size_{body_max_bytes}"),
            format!("body is {size} bytes, limit is {body_max_bytes}"),
        ));
    }
}

fn check_phase_conditions(draft: &ReceiptDraft, errors: &mut Vec<FieldError>) {
    match draft.phase {
        Phase::Accepted => {
            if draft.caused_by_receipt_id.is_some() {
                errors.push(FieldError::new(
                    "caused_by_receipt_id",
                    "forbidden_for_phase",
                    "accepted receipts open an obligation and cannot carry caused_by_receipt_id",
                ));
            }
            if draft.escalation_to.is_some() {
                errors.push(FieldError::new(
                    "escalation_to",
                    "forbidden_for_phase",
                    "escalation_to is only valid for phase=escalate",
                ));
            }
        }
        Phase::Complete => {
            require_cause(draft, errors);
            if draft.escalation_to.is_some() {
                errors.push(FieldError::new(
                    "escalation_to",
                    "forbidden_for_phase",
                    "escalation_to is only valid for phase=escalate",
                ));
            }
        }
        Phase::Escalate => {
            require_cause(draft, errors);
            match &draft.escalation_to {
                None => errors.push(FieldError::new(
                    "escalation_to",
                    "required_for_phase",
                    "escalation_to is required for phase=escalate",
                )),
                Some(target) => {
                    if target.trim().is_empty() {
                        errors.push(FieldError::new(
                            "escalation_to",
                            "non_empty",
                            "escalation_to must be non-empty",
                        ));
                    } else if *target != draft.recipient_ai {
                        errors.push(FieldError::new(
                            "recipient_ai",
                            "routing_invariant",
                            "recipient_ai must equal escalation_to for phase=escalate",
                        ));
                    }
                }
            }
        }
    }
}

fn require_cause(draft: &ReceiptDraft, errors: &mut Vec<FieldError>) {
    match &draft.caused_by_receipt_id {
        None => errors.push(FieldError::new(
            "caused_by_receipt_id",
            "required_for_phase",
            format!(
                "caused_by_receipt_id is required for phase={}",
                draft.phase.as_str()
            ),
        )),
        Some(cause) => {
            if *cause == draft.receipt_id {
                errors.push(FieldError::new(
                    "caused_by_receipt_id",
                    "self_reference",
                    "caused_by_receipt_id cannot equal receipt_id",
                ));
            }
            check_identifier("caused_by_receipt_id", cause, errors);
        }
    }
}

fn check_identifier(field: &str, value: &str, errors: &mut Vec<FieldError>) {
    if value.is_empty() {
        errors.push(FieldError::new(field, "non_empty", format!("{field} must be non-empty")));
        return;
    }
    if value.len() > ID_MAX_LEN {
        errors.push(FieldError::new(
            field,
            format!("max_length_{ID_MAX_LEN}"),
            format!("{field} exceeds {ID_MAX_LEN} characters"),
        ));
    }
    let legal = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '/'));
    if !legal {
        errors.push(FieldError::new(
            field,
            "charset",
            format!("{field} may only contain alphanumerics and :-_./"),
        ));
    }
}

fn check_principal(field: &str, value: &str, errors: &mut Vec<FieldError>) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "non_empty", format!("{field} must be non-empty")));
    } else if value.len() > ID_MAX_LEN {
        errors.push(FieldError::new(
            field,
            format!("max_length_{ID_MAX_LEN}"),
            format!("{field} exceeds {ID_MAX_LEN} characters"),
        ));
    }
}

fn check_artifact_refs(refs: &[ArtifactRef], errors: &mut Vec<FieldError>) {
    for (index, artifact) in refs.iter().enumerate() {
        let field = format!("artifact_refs[{index}]");
        if artifact.artifact_id.is_none() && artifact.uri.is_none() {
            errors.push(FieldError::new(
                field.clone(),
                "identifier_required",
                "artifact_ref requires artifact_id or uri",
            ));
        }
        if let Some(uri) = &artifact.uri {
            if uri.len() > URI_MAX_LEN {
                errors.push(FieldError::new(
                    format!("{field}.uri"),
                    format!("max_length_{URI_MAX_LEN}"),
                    format!("uri exceeds {URI_MAX_LEN} characters"),
                ));
            }
        }
        if matches!(
            artifact.kind,
            Some(ArtifactKind::Binary | ArtifactKind::Dataset)
        ) && artifact.digest.is_none()
        {
            errors.push(FieldError::new(
                format!("{field}.digest"),
                "digest_required",
                "artifact_ref.digest required for binary/dataset kinds",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BODY_MAX: usize = 262_144;

    fn base_draft(phase: Phase) -> ReceiptDraft {
        ReceiptDraft {
            uuid: None,
            receipt_id: "r-1".to_string(),
            phase,
            obligation_id: "o-1".to_string(),
            task_id: None,
            caused_by_receipt_id: None,
            created_by: "svc:planner".to_string(),
            recipient_ai: "alice".to_string(),
            escalation_to: None,
            artifact_refs: None,
            body: json!({"summary": "ok"}),
        }
    }

    fn constraints(err: &ReceiptGateError) -> Vec<String> {
        match err {
            ReceiptGateError::ValidationFailed { errors } => {
                errors.iter().map(|e| e.constraint.clone()).collect()
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn accepted_receipt_validates_and_hashes() {
        let validated = validate_receipt(base_draft(Phase::Accepted), BODY_MAX).unwrap();
        assert_eq!(validated.canonical_hash.len(), 64);
    }

    #[test]
    fn accepted_forbids_caused_by() {
        let mut draft = base_draft(Phase::Accepted);
        draft.caused_by_receipt_id = Some("r-0".to_string());
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"forbidden_for_phase".to_string()));
    }

    #[test]
    fn complete_requires_caused_by_and_forbids_escalation_to() {
        let err = validate_receipt(base_draft(Phase::Complete), BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"required_for_phase".to_string()));

        let mut draft = base_draft(Phase::Complete);
        draft.caused_by_receipt_id = Some("r-0".to_string());
        draft.escalation_to = Some("carol".to_string());
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"forbidden_for_phase".to_string()));
    }

    #[test]
    fn escalate_enforces_routing_invariant() {
        let mut draft = base_draft(Phase::Escalate);
        draft.caused_by_receipt_id = Some("r-0".to_string());
        draft.recipient_ai = "bob".to_string();
        draft.escalation_to = Some("carol".to_string());
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"routing_invariant".to_string()));
    }

    #[test]
    fn escalate_with_matching_target_passes() {
        let mut draft = base_draft(Phase::Escalate);
        draft.caused_by_receipt_id = Some("r-0".to_string());
        draft.recipient_ai = "carol".to_string();
        draft.escalation_to = Some("carol".to_string());
        assert!(validate_receipt(draft, BODY_MAX).is_ok());
    }

    #[test]
    fn self_referencing_cause_is_rejected() {
        let mut draft = base_draft(Phase::Complete);
        draft.caused_by_receipt_id = Some("r-1".to_string());
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"self_reference".to_string()));
    }

    #[test]
    fn identifier_charset_is_enforced() {
        let mut draft = base_draft(Phase::Accepted);
        draft.receipt_id = "r 1!".to_string();
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"charset".to_string()));

        let mut draft = base_draft(Phase::Accepted);
        draft.task_id = Some("tasks/T1.v2:main_run-7".to_string());
        assert!(validate_receipt(draft, BODY_MAX).is_ok());
    }

    #[test]
    fn oversized_body_is_rejected_with_size_constraint() {
        let mut draft = base_draft(Phase::Accepted);
        draft.body = json!({"blob": "x".repeat(128)});
        let err = validate_receipt(draft, 64).unwrap_err();
        assert!(constraints(&err).contains(&"max_size_64".to_string()));
    }

    #[test]
    fn non_object_body_is_rejected() {
        let mut draft = base_draft(Phase::Accepted);
        draft.body = json!("just a string");
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"type".to_string()));
    }

    #[test]
    fn artifact_ref_rules_match_kinds() {
        let mut draft = base_draft(Phase::Accepted);
        draft.artifact_refs = Some(vec![ArtifactRef {
            artifact_id: None,
            uri: None,
            digest: None,
            kind: None,
            mime: None,
            bytes: None,
        }]);
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"identifier_required".to_string()));

        let mut draft = base_draft(Phase::Accepted);
        draft.artifact_refs = Some(vec![ArtifactRef {
            artifact_id: Some("art-1".to_string()),
            uri: None,
            digest: None,
            kind: Some(ArtifactKind::Binary),
            mime: None,
            bytes: Some(12),
        }]);
        let err = validate_receipt(draft, BODY_MAX).unwrap_err();
        assert!(constraints(&err).contains(&"digest_required".to_string()));
    }

    #[test]
    fn parse_receipt_distinguishes_bad_phase_from_bad_structure() {
        let bad_phase = json!({
            "receipt_id": "r-1",
            "phase": "cancel",
            "obligation_id": "o-1",
            "created_by": "svc:planner",
            "recipient_ai": "alice",
            "body": {},
        });
        match parse_receipt(&bad_phase).unwrap_err() {
            ReceiptGateError::ValidationFailed { errors } => {
                assert_eq!(errors[0].constraint, "enum");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let bad_structure = json!({
            "receipt_id": "r-1",
            "phase": "accepted",
            "obligation_id": "o-1",
            "created_by": "svc:planner",
            "recipient_ai": "alice",
            "body": {},
            "extra_field": 1,
        });
        match parse_receipt(&bad_structure).unwrap_err() {
            ReceiptGateError::ValidationFailed { errors } => {
                assert_eq!(errors[0].constraint, "structure");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
