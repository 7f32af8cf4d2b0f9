//! Embedded SQLite backend.
//!
//! A single connection guarded by a mutex serves the whole process; every
//! trait method hops onto the blocking pool so ledger I/O never stalls the
//! async runtime. Writes run in IMMEDIATE transactions, which together with
//! the `(tenant_id, receipt_id)` unique index serialises concurrent
//! submissions of the same receipt.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use receiptgate_core::{
    format_db_timestamp, now_db_utc, now_utc, parse_db_timestamp, Phase, Receipt, ReceiptGateError,
    SubmitOutcome, ValidatedReceipt,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::info;
use uuid::Uuid;

use crate::cursor::{paginate, Cursor};
use crate::migrations::{plan, MigrationReport, SQLITE_MIGRATIONS};
use crate::{
    EmbeddingRecord, EmbeddingSource, LedgerStats, Page, ReceiptStore, RecipientCount,
    SearchFilter, SortOrder, StoreOptions, MAX_LIST_LIMIT,
};

const RECEIPT_COLUMNS: &str = "uuid, tenant_id, receipt_id, canonical_hash, phase, \
     obligation_id, task_id, caused_by_receipt_id, created_by, recipient_ai, escalation_to, \
     artifact_refs, body, created_at";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    options: StoreOptions,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`; `:memory:` is accepted.
    ///
    /// # Errors
    /// Returns [`ReceiptGateError::Backend`] when the file cannot be opened.
    pub fn open(path: &str, options: StoreOptions) -> Result<Self, ReceiptGateError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, ReceiptGateError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &StoreOptions) -> Result<T, ReceiptGateError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let options = self.options.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ReceiptGateError::Backend("connection lock poisoned".to_string()))?;
            op(&mut guard, &options)
        })
        .await
        .map_err(|err| ReceiptGateError::Internal(format!("blocking task failed: {err}")))?
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Test-only escape hatch for seeding projection tables directly.
    pub(crate) async fn raw_execute(&self, sql: &str) -> Result<(), ReceiptGateError> {
        let sql = sql.to_string();
        self.run(move |conn, _| conn.execute_batch(&sql).map_err(backend))
            .await
    }
}

#[async_trait]
impl ReceiptStore for SqliteStore {
    async fn migrate(&self) -> Result<MigrationReport, ReceiptGateError> {
        self.run(migrate_sync).await
    }

    async fn ping(&self) -> Result<(), ReceiptGateError> {
        self.run(|conn, _| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn submit(
        &self,
        candidate: ValidatedReceipt,
    ) -> Result<SubmitOutcome, ReceiptGateError> {
        self.run(move |conn, options| submit_sync(conn, options, &candidate))
            .await
    }

    async fn get_by_receipt_id(
        &self,
        receipt_id: &str,
    ) -> Result<Option<Receipt>, ReceiptGateError> {
        let receipt_id = receipt_id.to_string();
        self.run(move |conn, options| get_row(conn, &options.tenant_id, &receipt_id))
            .await
    }

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Receipt>, ReceiptGateError> {
        self.run(move |conn, _| {
            conn.query_row(
                &format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE uuid = ?1"),
                params![uuid.to_string()],
                parse_receipt_row,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn children_of(&self, receipt_id: &str) -> Result<Vec<Receipt>, ReceiptGateError> {
        let receipt_id = receipt_id.to_string();
        self.run(move |conn, options| children_sync(conn, options, &receipt_id))
            .await
    }

    async fn parents_of(&self, receipt_id: &str) -> Result<Vec<Receipt>, ReceiptGateError> {
        let receipt_id = receipt_id.to_string();
        self.run(move |conn, options| parents_sync(conn, options, &receipt_id))
            .await
    }

    async fn list_inbox(
        &self,
        recipient_ai: &str,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, ReceiptGateError> {
        let recipient_ai = recipient_ai.to_string();
        self.run(move |conn, options| inbox_sync(conn, options, &recipient_ai, limit, cursor))
            .await
    }

    async fn list_task_receipts(
        &self,
        task_id: &str,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Receipt>, ReceiptGateError> {
        let task_id = task_id.to_string();
        self.run(move |conn, options| list_task_sync(conn, options, &task_id, sort, limit))
            .await
    }

    async fn search(
        &self,
        filter: &SearchFilter,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, ReceiptGateError> {
        let filter = filter.clone();
        self.run(move |conn, options| search_sync(conn, options, &filter, limit, cursor))
            .await
    }

    async fn stats(&self) -> Result<LedgerStats, ReceiptGateError> {
        self.run(stats_sync).await
    }

    async fn rebuild_edges(&self) -> Result<u64, ReceiptGateError> {
        self.run(rebuild_edges_sync).await
    }

    async fn embedding_sources(
        &self,
        model: &str,
        after_receipt_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EmbeddingSource>, ReceiptGateError> {
        let model = model.to_string();
        let after = after_receipt_id.map(ToString::to_string);
        self.run(move |conn, options| {
            embedding_sources_sync(conn, options, &model, after.as_deref(), limit)
        })
        .await
    }

    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<(), ReceiptGateError> {
        let record = record.clone();
        self.run(move |conn, options| upsert_embedding_sync(conn, options, &record))
            .await
    }
}

fn backend(err: rusqlite::Error) -> ReceiptGateError {
    ReceiptGateError::Backend(format!("sqlite: {err}"))
}

fn row_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_receipt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Receipt> {
    let uuid_raw: String = row.get(0)?;
    let uuid = Uuid::parse_str(&uuid_raw)
        .map_err(|_| row_error(0, format!("invalid uuid: {uuid_raw}")))?;

    let phase_raw: String = row.get(4)?;
    let phase = Phase::parse(&phase_raw)
        .ok_or_else(|| row_error(4, format!("invalid phase: {phase_raw}")))?;

    let artifact_raw: Option<String> = row.get(11)?;
    let artifact_refs = match artifact_raw {
        Some(text) => serde_json::from_str(&text)
            .map_err(|err| row_error(11, format!("invalid artifact_refs: {err}")))?,
        None => Vec::new(),
    };

    let body_raw: String = row.get(12)?;
    let body = serde_json::from_str(&body_raw)
        .map_err(|err| row_error(12, format!("invalid body: {err}")))?;

    let created_raw: String = row.get(13)?;
    let created_at =
        parse_db_timestamp(&created_raw).map_err(|err| row_error(13, err.to_string()))?;

    Ok(Receipt {
        uuid,
        tenant_id: row.get(1)?,
        receipt_id: row.get(2)?,
        canonical_hash: row.get(3)?,
        phase,
        obligation_id: row.get(5)?,
        task_id: row.get(6)?,
        caused_by_receipt_id: row.get(7)?,
        created_by: row.get(8)?,
        recipient_ai: row.get(9)?,
        escalation_to: row.get(10)?,
        artifact_refs,
        body,
        created_at,
    })
}

fn collect_receipts(
    conn: &Connection,
    sql: &str,
    binds: &[SqlValue],
) -> Result<Vec<Receipt>, ReceiptGateError> {
    let mut stmt = conn.prepare(sql).map_err(backend)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), parse_receipt_row)
        .map_err(backend)?;
    let mut receipts = Vec::new();
    for row in rows {
        receipts.push(row.map_err(backend)?);
    }
    Ok(receipts)
}

fn get_row(
    conn: &Connection,
    tenant_id: &str,
    receipt_id: &str,
) -> Result<Option<Receipt>, ReceiptGateError> {
    conn.query_row(
        &format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE tenant_id = ?1 AND receipt_id = ?2"
        ),
        params![tenant_id, receipt_id],
        parse_receipt_row,
    )
    .optional()
    .map_err(backend)
}

fn terminal_for_obligation(
    conn: &Connection,
    tenant_id: &str,
    obligation_id: &str,
) -> Result<Option<(String, Phase)>, ReceiptGateError> {
    conn.query_row(
        "SELECT receipt_id, phase FROM receipts
         WHERE tenant_id = ?1 AND obligation_id = ?2 AND phase IN ('complete', 'escalate')
         ORDER BY created_at DESC LIMIT 1",
        params![tenant_id, obligation_id],
        |row| {
            let receipt_id: String = row.get(0)?;
            let phase_raw: String = row.get(1)?;
            let phase = Phase::parse(&phase_raw)
                .ok_or_else(|| row_error(1, format!("invalid phase: {phase_raw}")))?;
            Ok((receipt_id, phase))
        },
    )
    .optional()
    .map_err(backend)
}

fn migrate_sync(
    conn: &mut Connection,
    options: &StoreOptions,
) -> Result<MigrationReport, ReceiptGateError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .map_err(backend)?;

    let mut report = MigrationReport::default();
    for file in plan(&SQLITE_MIGRATIONS, options) {
        let applied: bool = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1",
                params![file.version],
                |_| Ok(true),
            )
            .optional()
            .map_err(backend)?
            .is_some();
        if applied {
            continue;
        }

        let tx = conn.transaction().map_err(backend)?;
        tx.execute_batch(file.sql).map_err(|err| {
            ReceiptGateError::Backend(format!("migration {} failed: {err}", file.name))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![file.version, file.name, format_db_timestamp(now_utc())?],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;

        info!(migration = file.name, "schema migration applied");
        report.applied.push(file.name.to_string());
    }
    Ok(report)
}

fn submit_sync(
    conn: &mut Connection,
    options: &StoreOptions,
    candidate: &ValidatedReceipt,
) -> Result<SubmitOutcome, ReceiptGateError> {
    let draft = &candidate.draft;
    let tenant_id = options.tenant_id.as_str();

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(backend)?;

    if let Some(existing) = get_row(&tx, tenant_id, &draft.receipt_id)? {
        if existing.canonical_hash == candidate.canonical_hash {
            return Ok(SubmitOutcome {
                receipt: existing,
                idempotent_replay: true,
            });
        }
        return Err(ReceiptGateError::ReceiptConflict {
            receipt_id: draft.receipt_id.clone(),
            existing_hash: existing.canonical_hash,
            incoming_hash: candidate.canonical_hash.clone(),
        });
    }

    if draft.phase.is_terminal() {
        let Some(cause) = draft.caused_by_receipt_id.as_deref() else {
            return Err(ReceiptGateError::Internal(
                "terminal receipt passed validation without caused_by_receipt_id".to_string(),
            ));
        };
        let parent = tx
            .query_row(
                &format!(
                    "SELECT {RECEIPT_COLUMNS} FROM receipts
                     WHERE tenant_id = ?1 AND receipt_id = ?2 AND obligation_id = ?3"
                ),
                params![tenant_id, cause, draft.obligation_id],
                parse_receipt_row,
            )
            .optional()
            .map_err(backend)?;
        match parent {
            None => {
                return Err(ReceiptGateError::ParentMissing {
                    caused_by_receipt_id: cause.to_string(),
                    obligation_id: draft.obligation_id.clone(),
                });
            }
            Some(parent) if parent.phase != Phase::Accepted => {
                return Err(ReceiptGateError::ParentNotAcceptedPhase {
                    parent_receipt_id: parent.receipt_id,
                    parent_phase: parent.phase,
                });
            }
            Some(_) => {}
        }
    }

    // Closed obligations never reopen and never terminate twice.
    if let Some((terminal_receipt_id, terminal_phase)) =
        terminal_for_obligation(&tx, tenant_id, &draft.obligation_id)?
    {
        return Err(ReceiptGateError::AlreadyTerminated {
            obligation_id: draft.obligation_id.clone(),
            terminal_receipt_id,
            terminal_phase,
        });
    }

    // Defense in depth: the validator enforces this, but the ledger is the
    // last writer before the row becomes immutable.
    if draft.phase == Phase::Escalate
        && draft.escalation_to.as_deref() != Some(draft.recipient_ai.as_str())
    {
        return Err(ReceiptGateError::single_validation(
            "recipient_ai",
            "routing_invariant",
            "recipient_ai must equal escalation_to for phase=escalate",
        ));
    }

    let receipt = Receipt {
        uuid: draft.uuid.unwrap_or_else(Uuid::new_v4),
        tenant_id: tenant_id.to_string(),
        receipt_id: draft.receipt_id.clone(),
        canonical_hash: candidate.canonical_hash.clone(),
        phase: draft.phase,
        obligation_id: draft.obligation_id.clone(),
        task_id: draft.task_id.clone(),
        caused_by_receipt_id: draft.caused_by_receipt_id.clone(),
        created_by: draft.created_by.clone(),
        recipient_ai: draft.recipient_ai.clone(),
        escalation_to: draft.escalation_to.clone(),
        artifact_refs: draft.artifact_refs.clone().unwrap_or_default(),
        body: draft.body.clone(),
        created_at: now_db_utc(),
    };

    let artifact_text = if receipt.artifact_refs.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&receipt.artifact_refs)?)
    };
    let body_text = serde_json::to_string(&receipt.body)?;
    let created_text = format_db_timestamp(receipt.created_at)?;

    let inserted = tx.execute(
        "INSERT INTO receipts (
            uuid, tenant_id, receipt_id, canonical_hash, phase, obligation_id, task_id,
            caused_by_receipt_id, created_by, recipient_ai, escalation_to, artifact_refs,
            body, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            receipt.uuid.to_string(),
            receipt.tenant_id,
            receipt.receipt_id,
            receipt.canonical_hash,
            receipt.phase.as_str(),
            receipt.obligation_id,
            receipt.task_id,
            receipt.caused_by_receipt_id,
            receipt.created_by,
            receipt.recipient_ai,
            receipt.escalation_to,
            artifact_text,
            body_text,
            created_text,
        ],
    );

    if let Err(err) = inserted {
        // A concurrent duplicate won the unique index; first writer wins and
        // everyone else observes the idempotent-replay or conflict path.
        if is_unique_violation(&err) {
            if let Some(existing) = get_row(&tx, tenant_id, &draft.receipt_id)? {
                if existing.canonical_hash == candidate.canonical_hash {
                    return Ok(SubmitOutcome {
                        receipt: existing,
                        idempotent_replay: true,
                    });
                }
                return Err(ReceiptGateError::ReceiptConflict {
                    receipt_id: draft.receipt_id.clone(),
                    existing_hash: existing.canonical_hash,
                    incoming_hash: candidate.canonical_hash.clone(),
                });
            }
        }
        return Err(backend(err));
    }

    if options.enable_graph_layer {
        if let Some(cause) = &receipt.caused_by_receipt_id {
            tx.execute(
                "INSERT OR IGNORE INTO receipt_edges (from_receipt_id, to_receipt_id, edge_type)
                 VALUES (?1, ?2, 'caused_by')",
                params![receipt.receipt_id, cause],
            )
            .map_err(backend)?;
        }
    }

    tx.commit().map_err(backend)?;

    info!(
        receipt_id = %receipt.receipt_id,
        obligation_id = %receipt.obligation_id,
        phase = receipt.phase.as_str(),
        recipient_ai = %receipt.recipient_ai,
        "receipt committed"
    );

    Ok(SubmitOutcome {
        receipt,
        idempotent_replay: false,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn children_sync(
    conn: &Connection,
    options: &StoreOptions,
    receipt_id: &str,
) -> Result<Vec<Receipt>, ReceiptGateError> {
    if options.enable_graph_layer {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             JOIN receipt_edges ON receipt_edges.from_receipt_id = receipts.receipt_id
             WHERE receipt_edges.edge_type = 'caused_by'
               AND receipt_edges.to_receipt_id = ?1
               AND receipts.tenant_id = ?2
             ORDER BY receipts.created_at ASC, receipts.receipt_id ASC"
        );
        return collect_receipts(
            conn,
            &sql,
            &[
                SqlValue::from(receipt_id.to_string()),
                SqlValue::from(options.tenant_id.clone()),
            ],
        );
    }
    let sql = format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts
         WHERE tenant_id = ?1 AND caused_by_receipt_id = ?2
         ORDER BY created_at ASC, receipt_id ASC"
    );
    collect_receipts(
        conn,
        &sql,
        &[
            SqlValue::from(options.tenant_id.clone()),
            SqlValue::from(receipt_id.to_string()),
        ],
    )
}

fn parents_sync(
    conn: &Connection,
    options: &StoreOptions,
    receipt_id: &str,
) -> Result<Vec<Receipt>, ReceiptGateError> {
    if options.enable_graph_layer {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             JOIN receipt_edges ON receipt_edges.to_receipt_id = receipts.receipt_id
             WHERE receipt_edges.edge_type = 'caused_by'
               AND receipt_edges.from_receipt_id = ?1
               AND receipts.tenant_id = ?2
             ORDER BY receipts.created_at ASC, receipts.receipt_id ASC"
        );
        return collect_receipts(
            conn,
            &sql,
            &[
                SqlValue::from(receipt_id.to_string()),
                SqlValue::from(options.tenant_id.clone()),
            ],
        );
    }
    let Some(receipt) = get_row(conn, &options.tenant_id, receipt_id)? else {
        return Ok(Vec::new());
    };
    let Some(cause) = receipt.caused_by_receipt_id else {
        return Ok(Vec::new());
    };
    Ok(get_row(conn, &options.tenant_id, &cause)?
        .into_iter()
        .collect())
}

fn inbox_sync(
    conn: &Connection,
    options: &StoreOptions,
    recipient_ai: &str,
    limit: usize,
    cursor: Option<Cursor>,
) -> Result<Page, ReceiptGateError> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let mut sql = format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts r
         WHERE r.tenant_id = ? AND r.recipient_ai = ? AND r.phase = 'accepted'
           AND NOT EXISTS (
             SELECT 1 FROM receipts t
             WHERE t.tenant_id = r.tenant_id
               AND t.obligation_id = r.obligation_id
               AND t.phase IN ('complete', 'escalate'))
           AND NOT EXISTS (
             SELECT 1 FROM receipts n
             WHERE n.tenant_id = r.tenant_id
               AND n.obligation_id = r.obligation_id
               AND n.phase = 'accepted'
               AND (n.created_at > r.created_at
                 OR (n.created_at = r.created_at AND n.receipt_id < r.receipt_id)))"
    );
    let mut binds: Vec<SqlValue> = vec![
        SqlValue::from(options.tenant_id.clone()),
        SqlValue::from(recipient_ai.to_string()),
    ];
    push_cursor_clause(&mut sql, &mut binds, cursor.as_ref(), "r.");
    sql.push_str(" ORDER BY r.created_at DESC, r.receipt_id ASC LIMIT ?");
    binds.push(SqlValue::from(limit as i64 + 1));

    let rows = collect_receipts(conn, &sql, &binds)?;
    paginate(rows, limit)
}

fn list_task_sync(
    conn: &Connection,
    options: &StoreOptions,
    task_id: &str,
    sort: SortOrder,
    limit: Option<usize>,
) -> Result<Vec<Receipt>, ReceiptGateError> {
    let order = sort.sql();
    let mut sql = format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts
         WHERE tenant_id = ?1 AND task_id = ?2
         ORDER BY created_at {order}, receipt_id {order}"
    );
    let mut binds: Vec<SqlValue> = vec![
        SqlValue::from(options.tenant_id.clone()),
        SqlValue::from(task_id.to_string()),
    ];
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        binds.push(SqlValue::from(limit.clamp(1, MAX_LIST_LIMIT) as i64));
    }
    collect_receipts(conn, &sql, &binds)
}

fn search_sync(
    conn: &Connection,
    options: &StoreOptions,
    filter: &SearchFilter,
    limit: usize,
    cursor: Option<Cursor>,
) -> Result<Page, ReceiptGateError> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let mut clauses: Vec<String> = vec!["tenant_id = ?".to_string()];
    let mut binds: Vec<SqlValue> = vec![SqlValue::from(options.tenant_id.clone())];

    let eq = |field: &str, value: &str, binds: &mut Vec<SqlValue>, clauses: &mut Vec<String>| {
        clauses.push(format!("{field} = ?"));
        binds.push(SqlValue::from(value.to_string()));
    };
    if let Some(value) = &filter.recipient_ai {
        eq("recipient_ai", value, &mut binds, &mut clauses);
    }
    if let Some(value) = &filter.created_by {
        eq("created_by", value, &mut binds, &mut clauses);
    }
    if let Some(phase) = filter.phase {
        eq("phase", phase.as_str(), &mut binds, &mut clauses);
    }
    if let Some(value) = &filter.obligation_id {
        eq("obligation_id", value, &mut binds, &mut clauses);
    }
    if let Some(value) = &filter.task_id {
        eq("task_id", value, &mut binds, &mut clauses);
    }
    if let Some(since) = filter.since {
        clauses.push("created_at >= ?".to_string());
        binds.push(SqlValue::from(format_db_timestamp(since)?));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at < ?".to_string());
        binds.push(SqlValue::from(format_db_timestamp(until)?));
    }
    if let Some(fragment) = &filter.receipt_id_contains {
        clauses.push("receipt_id LIKE ? ESCAPE '\\'".to_string());
        binds.push(SqlValue::from(format!("%{}%", escape_like(fragment))));
    }

    let mut sql = format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE {}",
        clauses.join(" AND ")
    );
    push_cursor_clause(&mut sql, &mut binds, cursor.as_ref(), "");
    sql.push_str(" ORDER BY created_at DESC, receipt_id ASC LIMIT ?");
    binds.push(SqlValue::from(limit as i64 + 1));

    let rows = collect_receipts(conn, &sql, &binds)?;
    paginate(rows, limit)
}

fn push_cursor_clause(
    sql: &mut String,
    binds: &mut Vec<SqlValue>,
    cursor: Option<&Cursor>,
    prefix: &str,
) {
    if let Some(cursor) = cursor {
        sql.push_str(&format!(
            " AND ({prefix}created_at < ? OR ({prefix}created_at = ? AND {prefix}receipt_id > ?))"
        ));
        binds.push(SqlValue::from(cursor.created_at.clone()));
        binds.push(SqlValue::from(cursor.created_at.clone()));
        binds.push(SqlValue::from(cursor.receipt_id.clone()));
    }
}

fn escape_like(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn stats_sync(conn: &mut Connection, options: &StoreOptions) -> Result<LedgerStats, ReceiptGateError> {
    let tenant_id = options.tenant_id.as_str();
    let total: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM receipts WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )
        .map_err(backend)?;

    let mut by_phase = std::collections::BTreeMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT phase, COUNT(*) FROM receipts WHERE tenant_id = ?1 GROUP BY phase",
        )
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![tenant_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(backend)?;
    for row in rows {
        let (phase, count) = row.map_err(backend)?;
        by_phase.insert(phase, count as u64);
    }

    let mut stmt = conn
        .prepare(
            "SELECT recipient_ai, COUNT(*) AS count FROM receipts
             WHERE tenant_id = ?1
             GROUP BY recipient_ai ORDER BY count DESC, recipient_ai ASC LIMIT 10",
        )
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![tenant_id], |row| {
            Ok(RecipientCount {
                recipient_ai: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })
        .map_err(backend)?;
    let mut top_recipients = Vec::new();
    for row in rows {
        top_recipients.push(row.map_err(backend)?);
    }

    Ok(LedgerStats {
        total_receipts: total as u64,
        by_phase,
        top_recipients,
    })
}

fn rebuild_edges_sync(
    conn: &mut Connection,
    options: &StoreOptions,
) -> Result<u64, ReceiptGateError> {
    if !options.enable_graph_layer {
        return Err(ReceiptGateError::Internal(
            "graph layer is disabled; enable RECEIPTGATE_ENABLE_GRAPH_LAYER first".to_string(),
        ));
    }
    let tx = conn.transaction().map_err(backend)?;
    tx.execute(
        "DELETE FROM receipt_edges WHERE edge_type = 'caused_by'",
        [],
    )
    .map_err(backend)?;
    tx.execute(
        "INSERT OR IGNORE INTO receipt_edges (from_receipt_id, to_receipt_id, edge_type)
         SELECT receipt_id, caused_by_receipt_id, 'caused_by'
         FROM receipts WHERE caused_by_receipt_id IS NOT NULL",
        [],
    )
    .map_err(backend)?;
    let count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM receipt_edges WHERE edge_type = 'caused_by'",
            [],
            |row| row.get(0),
        )
        .map_err(backend)?;
    tx.commit().map_err(backend)?;
    Ok(count as u64)
}

fn embedding_sources_sync(
    conn: &Connection,
    options: &StoreOptions,
    model: &str,
    after_receipt_id: Option<&str>,
    limit: usize,
) -> Result<Vec<EmbeddingSource>, ReceiptGateError> {
    if !options.enable_semantic_layer {
        return Err(ReceiptGateError::Internal(
            "semantic layer is disabled; enable RECEIPTGATE_ENABLE_SEMANTIC_LAYER first"
                .to_string(),
        ));
    }
    let mut sql = "SELECT r.receipt_id, r.obligation_id, r.phase, r.created_by, r.recipient_ai, \
         r.task_id, r.body, e.content_hash
         FROM receipts r
         LEFT JOIN receipt_embeddings e
           ON e.receipt_id = r.receipt_id AND e.model = ?
         WHERE r.tenant_id = ?"
        .to_string();
    let mut binds: Vec<SqlValue> = vec![
        SqlValue::from(model.to_string()),
        SqlValue::from(options.tenant_id.clone()),
    ];
    if let Some(after) = after_receipt_id {
        sql.push_str(" AND r.receipt_id > ?");
        binds.push(SqlValue::from(after.to_string()));
    }
    sql.push_str(" ORDER BY r.receipt_id ASC LIMIT ?");
    binds.push(SqlValue::from(limit.clamp(1, MAX_LIST_LIMIT) as i64));

    let mut stmt = conn.prepare(&sql).map_err(backend)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |row| {
            let phase_raw: String = row.get(2)?;
            let phase = Phase::parse(&phase_raw)
                .ok_or_else(|| row_error(2, format!("invalid phase: {phase_raw}")))?;
            let body_raw: String = row.get(6)?;
            let body = serde_json::from_str(&body_raw)
                .map_err(|err| row_error(6, format!("invalid body: {err}")))?;
            Ok(EmbeddingSource {
                receipt_id: row.get(0)?,
                obligation_id: row.get(1)?,
                phase,
                created_by: row.get(3)?,
                recipient_ai: row.get(4)?,
                task_id: row.get(5)?,
                body,
                existing_content_hash: row.get(7)?,
            })
        })
        .map_err(backend)?;

    let mut sources = Vec::new();
    for row in rows {
        sources.push(row.map_err(backend)?);
    }
    Ok(sources)
}

fn upsert_embedding_sync(
    conn: &Connection,
    options: &StoreOptions,
    record: &EmbeddingRecord,
) -> Result<(), ReceiptGateError> {
    if !options.enable_semantic_layer {
        return Err(ReceiptGateError::Internal(
            "semantic layer is disabled; enable RECEIPTGATE_ENABLE_SEMANTIC_LAYER first"
                .to_string(),
        ));
    }
    conn.execute(
        "INSERT INTO receipt_embeddings (receipt_id, model, dims, vector, content_hash, built_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(receipt_id, model) DO UPDATE SET
           dims = excluded.dims,
           vector = excluded.vector,
           content_hash = excluded.content_hash,
           built_at = excluded.built_at",
        params![
            record.receipt_id,
            record.model,
            record.dims as i64,
            serde_json::to_string(&record.vector)?,
            record.content_hash,
            format_db_timestamp(now_utc())?,
        ],
    )
    .map_err(backend)?;
    Ok(())
}
