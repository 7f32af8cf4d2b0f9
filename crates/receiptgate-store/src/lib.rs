//! Persistence layer for the ReceiptGate ledger.
//!
//! Two backends implement the same narrow [`ReceiptStore`] contract: an
//! embedded SQLite store for development and single-node deployments, and a
//! Postgres store for production. The query surface is intentionally small
//! (point selects, small range scans, one uniqueness constraint, one insert)
//! so both dialects stay in lockstep; backend-specific SQL is confined to the
//! numbered migration files.

pub mod chain;
pub mod cursor;
pub mod migrations;
pub mod postgres;
pub mod projections;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use receiptgate_core::{Phase, Receipt, ReceiptGateError, SubmitOutcome, ValidatedReceipt};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub use chain::{walk_chain, ChainDirection, ChainEntry, DEFAULT_CHAIN_DEPTH, MAX_CHAIN_DEPTH};
pub use cursor::Cursor;
pub use migrations::MigrationReport;
pub use postgres::PostgresStore;
pub use projections::{rebuild_embeddings, EmbeddingProvider, EmbeddingReport};
pub use sqlite::SqliteStore;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

/// Store-level configuration captured once at boot.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Tenant assigned to every row; v1 is single-tenant.
    pub tenant_id: String,
    /// Maintain the `receipt_edges` projection (and apply its migration).
    pub enable_graph_layer: bool,
    /// Apply the `receipt_embeddings` migration and allow the builder to run.
    pub enable_semantic_layer: bool,
    /// Upper bound for the Postgres connection pool.
    pub pool_max_connections: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            enable_graph_layer: false,
            enable_semantic_layer: false,
            pool_max_connections: 5,
        }
    }
}

/// Header-only search filter; axes combine with logical AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub recipient_ai: Option<String>,
    pub created_by: Option<String>,
    pub phase: Option<Phase>,
    pub obligation_id: Option<String>,
    pub task_id: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<time::OffsetDateTime>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<time::OffsetDateTime>,
    pub receipt_id_contains: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page {
    pub items: Vec<Receipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct RecipientCount {
    pub recipient_ai: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerStats {
    pub total_receipts: u64,
    pub by_phase: BTreeMap<String, u64>,
    pub top_recipients: Vec<RecipientCount>,
}

/// Header fields and body for one receipt, as input to the embedding
/// projection. `existing_content_hash` is the hash stored with the current
/// embedding row, if any, so the builder can skip fresh rows.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSource {
    pub receipt_id: String,
    pub obligation_id: String,
    pub phase: Phase,
    pub created_by: String,
    pub recipient_ai: String,
    pub task_id: Option<String>,
    pub body: Value,
    pub existing_content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub receipt_id: String,
    pub model: String,
    pub dims: usize,
    pub vector: Vec<f32>,
    pub content_hash: String,
}

/// The narrow persistence contract shared by both backends.
///
/// Every method runs in its own transaction: reads see a consistent snapshot
/// for the duration of one call, writes either commit fully or not at all.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Applies pending numbered migrations exactly once each.
    async fn migrate(&self) -> Result<MigrationReport, ReceiptGateError>;

    /// Cheap connectivity probe for health reporting.
    async fn ping(&self) -> Result<(), ReceiptGateError>;

    /// The append protocol: idempotent replay, conflict detection, parent and
    /// terminality checks, then a transactional insert.
    async fn submit(&self, candidate: ValidatedReceipt)
        -> Result<SubmitOutcome, ReceiptGateError>;

    async fn get_by_receipt_id(
        &self,
        receipt_id: &str,
    ) -> Result<Option<Receipt>, ReceiptGateError>;

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Receipt>, ReceiptGateError>;

    /// Receipts caused by `receipt_id`. Uses the edge projection when the
    /// graph layer is enabled, the canonical table otherwise.
    async fn children_of(&self, receipt_id: &str) -> Result<Vec<Receipt>, ReceiptGateError>;

    /// Receipts that `receipt_id` was caused by (zero or one in a healthy
    /// ledger; possibly more through a corrupted edge projection).
    async fn parents_of(&self, receipt_id: &str) -> Result<Vec<Receipt>, ReceiptGateError>;

    /// Open obligations for a recipient: the latest accepted receipt per
    /// obligation with no terminal receipt in the class.
    async fn list_inbox(
        &self,
        recipient_ai: &str,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, ReceiptGateError>;

    async fn list_task_receipts(
        &self,
        task_id: &str,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Receipt>, ReceiptGateError>;

    async fn search(
        &self,
        filter: &SearchFilter,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, ReceiptGateError>;

    async fn stats(&self) -> Result<LedgerStats, ReceiptGateError>;

    /// Truncate-and-rebuild of the `caused_by` edge projection. Returns the
    /// number of edges present after the rebuild.
    async fn rebuild_edges(&self) -> Result<u64, ReceiptGateError>;

    /// A page of embedding inputs ordered by `receipt_id`, starting after the
    /// given id.
    async fn embedding_sources(
        &self,
        model: &str,
        after_receipt_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EmbeddingSource>, ReceiptGateError>;

    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<(), ReceiptGateError>;
}

/// Opens the backend selected by the connection string: `sqlite:` URLs map to
/// the embedded store, `postgres:`/`postgresql:` to the networked one.
///
/// # Errors
/// Returns [`ReceiptGateError::Backend`] for unsupported schemes or
/// connection failures.
pub async fn open_store(
    database_url: &str,
    options: StoreOptions,
) -> Result<Arc<dyn ReceiptStore>, ReceiptGateError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let store = PostgresStore::connect(database_url, options).await?;
        return Ok(Arc::new(store));
    }
    if let Some(path) = sqlite_path(database_url) {
        let store = SqliteStore::open(path, options)?;
        return Ok(Arc::new(store));
    }
    Err(ReceiptGateError::Backend(format!(
        "unsupported database url scheme: {database_url}"
    )))
}

/// Extracts the filesystem path from a `sqlite:` URL. `sqlite::memory:` and
/// `sqlite://:memory:` select the in-memory database; `sqlite:///./x.db`
/// keeps its relative path.
#[must_use]
pub fn sqlite_path(database_url: &str) -> Option<&str> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    match rest {
        ":memory:" | "" => Some(":memory:"),
        path if path.starts_with("/./") || path.starts_with("/:memory:") => Some(&path[1..]),
        path => Some(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_urls_resolve_to_paths() {
        assert_eq!(sqlite_path("sqlite::memory:"), Some(":memory:"));
        assert_eq!(sqlite_path("sqlite://:memory:"), Some(":memory:"));
        assert_eq!(sqlite_path("sqlite:///./receiptgate.db"), Some("./receiptgate.db"));
        assert_eq!(sqlite_path("sqlite:///var/lib/rg.db"), Some("/var/lib/rg.db"));
        assert_eq!(sqlite_path("sqlite://./rg.db"), Some("./rg.db"));
        assert_eq!(sqlite_path("postgres://host/db"), None);
    }

    #[test]
    fn sort_order_parses_lowercase_only() {
        assert_eq!(SortOrder::parse("asc"), Some(SortOrder::Asc));
        assert_eq!(SortOrder::parse("desc"), Some(SortOrder::Desc));
        assert_eq!(SortOrder::parse("ASC"), None);
    }
}
