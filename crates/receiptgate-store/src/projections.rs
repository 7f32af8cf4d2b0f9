//! Offline builders for the auxiliary projections.
//!
//! Both projections are advisory caches over the canonical table: rebuilding
//! them is always safe, and no read path depends on their freshness for
//! correctness.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use receiptgate_core::ReceiptGateError;

use crate::{EmbeddingRecord, EmbeddingSource, ReceiptStore};

/// External embedding provider; ReceiptGate only stores the resulting
/// vectors, never calls a model inline with a tool request.
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embeds one preimage string.
    ///
    /// # Errors
    /// Provider-specific failures surface as [`ReceiptGateError::Backend`].
    fn embed(&self, text: &str) -> Result<Vec<f32>, ReceiptGateError>;
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct EmbeddingReport {
    pub scanned: usize,
    pub refreshed: usize,
    pub fresh: usize,
}

/// Deterministic embedding preimage: canonical JSON of the selected header
/// fields plus the body. Its SHA-256 is stored alongside the vector so stale
/// embeddings are detected by hash comparison, not timestamps.
#[must_use]
pub fn embedding_preimage(source: &EmbeddingSource) -> String {
    let value: Value = json!({
        "receipt_id": source.receipt_id,
        "obligation_id": source.obligation_id,
        "phase": source.phase.as_str(),
        "created_by": source.created_by,
        "recipient_ai": source.recipient_ai,
        "task_id": source.task_id,
        "body": source.body,
    });
    value.to_string()
}

#[must_use]
pub fn content_hash(preimage: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

/// Scans the ledger in batches and (re)builds embeddings whose stored
/// `content_hash` is missing or stale. Idempotent: a second run over an
/// unchanged ledger refreshes nothing.
///
/// # Errors
/// Propagates store and provider failures; rows already refreshed stay
/// refreshed.
pub async fn rebuild_embeddings(
    store: &dyn ReceiptStore,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<EmbeddingReport, ReceiptGateError> {
    let mut report = EmbeddingReport::default();
    let mut after: Option<String> = None;

    loop {
        let sources = store
            .embedding_sources(provider.model(), after.as_deref(), batch_size)
            .await?;
        if sources.is_empty() {
            break;
        }
        after = sources.last().map(|s| s.receipt_id.clone());

        for source in sources {
            report.scanned += 1;
            let preimage = embedding_preimage(&source);
            let hash = content_hash(&preimage);
            if source.existing_content_hash.as_deref() == Some(hash.as_str()) {
                report.fresh += 1;
                continue;
            }
            let vector = provider.embed(&preimage)?;
            store
                .upsert_embedding(&EmbeddingRecord {
                    receipt_id: source.receipt_id,
                    model: provider.model().to_string(),
                    dims: provider.dims(),
                    vector,
                    content_hash: hash,
                })
                .await?;
            report.refreshed += 1;
        }
    }

    info!(
        scanned = report.scanned,
        refreshed = report.refreshed,
        model = provider.model(),
        "embedding projection rebuilt"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use crate::StoreOptions;
    use receiptgate_core::{validate_receipt, Phase, ReceiptDraft};

    const BODY_MAX: usize = 262_144;

    fn must<T>(result: Result<T, ReceiptGateError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    /// Offline stand-in provider: hash-derived vectors, no network.
    struct FoldedHashProvider;

    impl EmbeddingProvider for FoldedHashProvider {
        fn model(&self) -> &str {
            "folded-sha256-v1"
        }

        fn dims(&self) -> usize {
            8
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, ReceiptGateError> {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            Ok(digest
                .chunks(4)
                .map(|chunk| f32::from(chunk[0]) / 255.0)
                .collect())
        }
    }

    fn accepted(receipt_id: &str, obligation_id: &str, cause: Option<&str>) -> ReceiptDraft {
        let phase = if cause.is_some() {
            Phase::Complete
        } else {
            Phase::Accepted
        };
        ReceiptDraft {
            uuid: None,
            receipt_id: receipt_id.to_string(),
            phase,
            obligation_id: obligation_id.to_string(),
            task_id: None,
            caused_by_receipt_id: cause.map(ToString::to_string),
            created_by: "svc:planner".to_string(),
            recipient_ai: "alice".to_string(),
            escalation_to: None,
            artifact_refs: None,
            body: serde_json::json!({"summary": receipt_id}),
        }
    }

    async fn full_store() -> SqliteStore {
        let store = must(SqliteStore::open(
            ":memory:",
            StoreOptions {
                enable_graph_layer: true,
                enable_semantic_layer: true,
                ..StoreOptions::default()
            },
        ));
        must(store.migrate().await);
        store
    }

    async fn seed_chain(store: &SqliteStore) {
        for draft in [
            accepted("r1", "o1", None),
            accepted("r2", "o1", Some("r1")),
            accepted("r3", "o2", None),
        ] {
            must(store.submit(must(validate_receipt(draft, BODY_MAX))).await);
        }
    }

    #[tokio::test]
    async fn edge_rebuild_matches_incremental_edges() {
        let store = full_store().await;
        seed_chain(&store).await;

        // Seed a stray edge, then prove rebuild equals truncate + rebuild.
        must(
            store
                .raw_execute(
                    "INSERT INTO receipt_edges (from_receipt_id, to_receipt_id, edge_type)
                     VALUES ('ghost', 'r1', 'caused_by')",
                )
                .await,
        );
        let count = must(store.rebuild_edges().await);
        assert_eq!(count, 1, "only r2 -> r1 is derivable from the canon");

        let children = must(store.children_of("r1").await);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].receipt_id, "r2");
    }

    #[tokio::test]
    async fn edge_rebuild_is_idempotent() {
        let store = full_store().await;
        seed_chain(&store).await;
        let first = must(store.rebuild_edges().await);
        let second = must(store.rebuild_edges().await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn embedding_builder_skips_fresh_rows() {
        let store = full_store().await;
        seed_chain(&store).await;
        let provider = FoldedHashProvider;

        let first = must(rebuild_embeddings(&store, &provider, 2).await);
        assert_eq!(first.scanned, 3);
        assert_eq!(first.refreshed, 3);
        assert_eq!(first.fresh, 0);

        let second = must(rebuild_embeddings(&store, &provider, 2).await);
        assert_eq!(second.scanned, 3);
        assert_eq!(second.refreshed, 0);
        assert_eq!(second.fresh, 3);
    }

    #[tokio::test]
    async fn stale_content_hash_triggers_refresh() {
        let store = full_store().await;
        seed_chain(&store).await;
        let provider = FoldedHashProvider;
        must(rebuild_embeddings(&store, &provider, 10).await);

        // Simulate a preimage-schema change by corrupting one stored hash.
        must(
            store
                .raw_execute(
                    "UPDATE receipt_embeddings SET content_hash = 'stale' \
                     WHERE receipt_id = 'r1'",
                )
                .await,
        );
        let report = must(rebuild_embeddings(&store, &provider, 10).await);
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.fresh, 2);
    }

    #[test]
    fn preimage_is_deterministic() {
        let source = EmbeddingSource {
            receipt_id: "r1".to_string(),
            obligation_id: "o1".to_string(),
            phase: Phase::Accepted,
            created_by: "svc:planner".to_string(),
            recipient_ai: "alice".to_string(),
            task_id: Some("T1".to_string()),
            body: serde_json::json!({"b": 2, "a": 1}),
            existing_content_hash: None,
        };
        assert_eq!(embedding_preimage(&source), embedding_preimage(&source));
        assert_eq!(content_hash("x").len(), 64);
    }
}
