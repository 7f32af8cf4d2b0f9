use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ReceiptGateError;
use crate::model::ReceiptDraft;

/// Server-owned fields excluded from the hashed preimage so replays stay
/// idempotent across assignment of `uuid`, `created_at`, and `tenant_id`.
const EXCLUDED_FIELDS: [&str; 4] = ["canonical_hash", "uuid", "created_at", "tenant_id"];

/// Canonical byte form of a receipt: compact JSON with keys sorted
/// lexicographically at every object level and server-owned fields removed.
///
/// `serde_json`'s default `Map` keeps object keys in sorted order and
/// `to_vec` emits no insignificant whitespace and shortest round-trip
/// numbers, so normalizing through `Value` yields the canonical encoding.
///
/// # Errors
/// Returns [`ReceiptGateError::Internal`] if the draft cannot be serialized.
pub fn canonical_bytes(draft: &ReceiptDraft) -> Result<Vec<u8>, ReceiptGateError> {
    let mut value = serde_json::to_value(draft)?;
    if let Value::Object(map) = &mut value {
        for field in EXCLUDED_FIELDS {
            map.remove(field);
        }
    }
    Ok(serde_json::to_vec(&value)?)
}

/// The idempotency key: lowercase 64-char hex SHA-256 over
/// [`canonical_bytes`]. Two submissions with identical content always
/// produce identical hashes.
///
/// # Errors
/// Returns [`ReceiptGateError::Internal`] if serialization fails.
pub fn canonical_hash(draft: &ReceiptDraft) -> Result<String, ReceiptGateError> {
    let bytes = canonical_bytes(draft)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Phase;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn draft(body: serde_json::Value) -> ReceiptDraft {
        ReceiptDraft {
            uuid: None,
            receipt_id: "r-1".to_string(),
            phase: Phase::Accepted,
            obligation_id: "o-1".to_string(),
            task_id: Some("T1".to_string()),
            caused_by_receipt_id: None,
            created_by: "svc:planner".to_string(),
            recipient_ai: "alice".to_string(),
            escalation_to: None,
            artifact_refs: None,
            body,
        }
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let hash = canonical_hash(&draft(serde_json::json!({}))).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn key_order_in_body_does_not_change_hash() {
        let a = draft(serde_json::json!({"alpha": 1, "beta": {"x": true, "y": null}}));
        let b = draft(serde_json::json!({"beta": {"y": null, "x": true}, "alpha": 1}));
        assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn body_content_changes_hash() {
        let a = draft(serde_json::json!({"summary": "done"}));
        let b = draft(serde_json::json!({"summary": "done!"}));
        assert_ne!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn server_assigned_uuid_is_excluded_from_preimage() {
        let without = draft(serde_json::json!({}));
        let mut with = without.clone();
        with.uuid = Some(Uuid::new_v4());
        assert_eq!(
            canonical_hash(&without).unwrap(),
            canonical_hash(&with).unwrap()
        );
    }

    #[test]
    fn canonical_bytes_are_compact_and_sorted() {
        let bytes = canonical_bytes(&draft(serde_json::json!({"z": 1, "a": 2}))).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains(' '));
        let a_pos = text.find("\"a\":2").unwrap();
        let z_pos = text.find("\"z\":1").unwrap();
        assert!(a_pos < z_pos);
    }

    fn arb_json_leaf() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-z0-9 ]{0,12}".prop_map(serde_json::Value::from),
        ]
    }

    fn arb_json_body() -> impl Strategy<Value = serde_json::Value> {
        arb_json_leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|map| serde_json::Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        // canonicalize(parse(canonicalize(r))) == canonicalize(r)
        #[test]
        fn canonicalization_round_trips(body in arb_json_body()) {
            let first = canonical_bytes(&draft(body)).unwrap();
            let reparsed: serde_json::Value = serde_json::from_slice(&first).unwrap();
            let reparsed_draft: ReceiptDraft = serde_json::from_value(reparsed).unwrap();
            let second = canonical_bytes(&reparsed_draft).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn equal_content_means_equal_hash(body in arb_json_body()) {
            let a = draft(body.clone());
            let b = draft(body);
            prop_assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
        }
    }
}
