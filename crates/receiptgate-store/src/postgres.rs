//! Networked Postgres backend.
//!
//! Mirrors the SQLite store behind the same [`ReceiptStore`] contract; the
//! SQL differs only in placeholder syntax and the append-only trigger
//! mechanics, which live in the migration files. Transient connection
//! failures on the read paths are retried once before surfacing as
//! [`ReceiptGateError::Backend`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use receiptgate_core::{
    format_db_timestamp, now_db_utc, now_utc, parse_db_timestamp, Phase, Receipt, ReceiptGateError,
    SubmitOutcome, ValidatedReceipt,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::cursor::{paginate, Cursor};
use crate::migrations::{plan, MigrationReport, POSTGRES_MIGRATIONS};
use crate::{
    EmbeddingRecord, EmbeddingSource, LedgerStats, Page, ReceiptStore, RecipientCount,
    SearchFilter, SortOrder, StoreOptions, MAX_LIST_LIMIT,
};

const RECEIPT_COLUMNS: &str = "uuid, tenant_id, receipt_id, canonical_hash, phase, \
     obligation_id, task_id, caused_by_receipt_id, created_by, recipient_ai, escalation_to, \
     artifact_refs, body, created_at";

pub struct PostgresStore {
    pool: PgPool,
    options: StoreOptions,
}

impl PostgresStore {
    /// Connects a bounded pool to the given `postgres://` URL.
    ///
    /// # Errors
    /// Returns [`ReceiptGateError::Backend`] on connection failure.
    pub async fn connect(
        database_url: &str,
        options: StoreOptions,
    ) -> Result<Self, ReceiptGateError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.pool_max_connections)
            .connect(database_url)
            .await
            .map_err(backend)?;
        Ok(Self { pool, options })
    }

    async fn fetch_receipts(
        &self,
        sql: &str,
        binds: &[String],
        limit: Option<i64>,
    ) -> Result<Vec<Receipt>, ReceiptGateError> {
        let run = || async {
            let mut query = sqlx::query(sql);
            for bind in binds {
                query = query.bind(bind);
            }
            if let Some(limit) = limit {
                query = query.bind(limit);
            }
            query.fetch_all(&self.pool).await
        };
        let rows = match run().await {
            Ok(rows) => rows,
            Err(err) if is_transient(&err) => run().await.map_err(backend)?,
            Err(err) => return Err(backend(err)),
        };
        rows.iter().map(parse_receipt_row).collect()
    }

    async fn run_migration_sql(
        conn: &mut sqlx::PgConnection,
        sql: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(sql).execute(conn).await?;
        Ok(())
    }

    async fn record_migration_applied(
        conn: &mut sqlx::PgConnection,
        version: i64,
        name: &str,
        applied_at: String,
    ) -> Result<(), ReceiptGateError> {
        sqlx::query(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES ($1, $2, $3)",
        )
        .bind(version)
        .bind(name)
        .bind(applied_at)
        .execute(conn)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn apply_migration_file(
        pool: PgPool,
        file: crate::migrations::MigrationFile,
    ) -> Result<(), ReceiptGateError> {
        let mut tx = pool.begin().await.map_err(backend)?;
        Self::run_migration_sql(&mut tx, file.sql)
            .await
            .map_err(|err| {
                ReceiptGateError::Backend(format!("migration {} failed: {err}", file.name))
            })?;
        Self::record_migration_applied(
            &mut tx,
            file.version,
            file.name,
            format_db_timestamp(now_utc())?,
        )
        .await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ReceiptStore for PostgresStore {
    async fn migrate(&self) -> Result<MigrationReport, ReceiptGateError> {
        let pool = self.pool.clone();
        let files: Vec<crate::migrations::MigrationFile> = plan(&POSTGRES_MIGRATIONS, &self.options)
            .into_iter()
            .copied()
            .collect();
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let mut report = MigrationReport::default();
        for file in files {
            let applied = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = $1")
                .bind(file.version)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            if applied.is_some() {
                continue;
            }

            Self::apply_migration_file(pool.clone(), file).await?;

            info!(migration = file.name, "schema migration applied");
            report.applied.push(file.name.to_string());
        }
        Ok(report)
    }

    async fn ping(&self) -> Result<(), ReceiptGateError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn submit(
        &self,
        candidate: ValidatedReceipt,
    ) -> Result<SubmitOutcome, ReceiptGateError> {
        let draft = &candidate.draft;
        let tenant_id = self.options.tenant_id.as_str();

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let existing = sqlx::query(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND receipt_id = $2"
        ))
        .bind(tenant_id)
        .bind(&draft.receipt_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        if let Some(row) = existing {
            let existing = parse_receipt_row(&row)?;
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
            let parent = sqlx::query(&format!(
                "SELECT {RECEIPT_COLUMNS} FROM receipts
                 WHERE tenant_id = $1 AND receipt_id = $2 AND obligation_id = $3"
            ))
            .bind(tenant_id)
            .bind(cause)
            .bind(&draft.obligation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
            match parent {
                None => {
                    return Err(ReceiptGateError::ParentMissing {
                        caused_by_receipt_id: cause.to_string(),
                        obligation_id: draft.obligation_id.clone(),
                    });
                }
                Some(row) => {
                    let parent = parse_receipt_row(&row)?;
                    if parent.phase != Phase::Accepted {
                        return Err(ReceiptGateError::ParentNotAcceptedPhase {
                            parent_receipt_id: parent.receipt_id,
                            parent_phase: parent.phase,
                        });
                    }
                }
            }
        }

        let terminal = sqlx::query(
            "SELECT receipt_id, phase FROM receipts
             WHERE tenant_id = $1 AND obligation_id = $2 AND phase IN ('complete', 'escalate')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(tenant_id)
        .bind(&draft.obligation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        if let Some(row) = terminal {
            let terminal_receipt_id: String = row.try_get("receipt_id").map_err(backend)?;
            let phase_raw: String = row.try_get("phase").map_err(backend)?;
            let terminal_phase = Phase::parse(&phase_raw).ok_or_else(|| {
                ReceiptGateError::Backend(format!("invalid stored phase: {phase_raw}"))
            })?;
            return Err(ReceiptGateError::AlreadyTerminated {
                obligation_id: draft.obligation_id.clone(),
                terminal_receipt_id,
                terminal_phase,
            });
        }

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

        let inserted = sqlx::query(
            "INSERT INTO receipts (
                uuid, tenant_id, receipt_id, canonical_hash, phase, obligation_id, task_id,
                caused_by_receipt_id, created_by, recipient_ai, escalation_to, artifact_refs,
                body, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(receipt.uuid.to_string())
        .bind(&receipt.tenant_id)
        .bind(&receipt.receipt_id)
        .bind(&receipt.canonical_hash)
        .bind(receipt.phase.as_str())
        .bind(&receipt.obligation_id)
        .bind(&receipt.task_id)
        .bind(&receipt.caused_by_receipt_id)
        .bind(&receipt.created_by)
        .bind(&receipt.recipient_ai)
        .bind(&receipt.escalation_to)
        .bind(&artifact_text)
        .bind(serde_json::to_string(&receipt.body)?)
        .bind(format_db_timestamp(receipt.created_at)?)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            // First writer wins on the unique index; losers observe replay or
            // conflict on re-read.
            if is_unique_violation(&err) {
                let row = sqlx::query(&format!(
                    "SELECT {RECEIPT_COLUMNS} FROM receipts \
                     WHERE tenant_id = $1 AND receipt_id = $2"
                ))
                .bind(tenant_id)
                .bind(&draft.receipt_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
                if let Some(row) = row {
                    let existing = parse_receipt_row(&row)?;
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

        if self.options.enable_graph_layer {
            if let Some(cause) = &receipt.caused_by_receipt_id {
                sqlx::query(
                    "INSERT INTO receipt_edges (from_receipt_id, to_receipt_id, edge_type)
                     VALUES ($1, $2, 'caused_by') ON CONFLICT DO NOTHING",
                )
                .bind(&receipt.receipt_id)
                .bind(cause)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            }
        }

        tx.commit().await.map_err(backend)?;

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

    async fn get_by_receipt_id(
        &self,
        receipt_id: &str,
    ) -> Result<Option<Receipt>, ReceiptGateError> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND receipt_id = $2"
        );
        let binds = vec![self.options.tenant_id.clone(), receipt_id.to_string()];
        Ok(self.fetch_receipts(&sql, &binds, None).await?.into_iter().next())
    }

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<Receipt>, ReceiptGateError> {
        let sql = format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE uuid = $1");
        let binds = vec![uuid.to_string()];
        Ok(self.fetch_receipts(&sql, &binds, None).await?.into_iter().next())
    }

    async fn children_of(&self, receipt_id: &str) -> Result<Vec<Receipt>, ReceiptGateError> {
        if self.options.enable_graph_layer {
            let sql = format!(
                "SELECT {RECEIPT_COLUMNS} FROM receipts
                 JOIN receipt_edges ON receipt_edges.from_receipt_id = receipts.receipt_id
                 WHERE receipt_edges.edge_type = 'caused_by'
                   AND receipt_edges.to_receipt_id = $1
                   AND receipts.tenant_id = $2
                 ORDER BY receipts.created_at ASC, receipts.receipt_id ASC"
            );
            let binds = vec![receipt_id.to_string(), self.options.tenant_id.clone()];
            return self.fetch_receipts(&sql, &binds, None).await;
        }
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             WHERE tenant_id = $1 AND caused_by_receipt_id = $2
             ORDER BY created_at ASC, receipt_id ASC"
        );
        let binds = vec![self.options.tenant_id.clone(), receipt_id.to_string()];
        self.fetch_receipts(&sql, &binds, None).await
    }

    async fn parents_of(&self, receipt_id: &str) -> Result<Vec<Receipt>, ReceiptGateError> {
        if self.options.enable_graph_layer {
            let sql = format!(
                "SELECT {RECEIPT_COLUMNS} FROM receipts
                 JOIN receipt_edges ON receipt_edges.to_receipt_id = receipts.receipt_id
                 WHERE receipt_edges.edge_type = 'caused_by'
                   AND receipt_edges.from_receipt_id = $1
                   AND receipts.tenant_id = $2
                 ORDER BY receipts.created_at ASC, receipts.receipt_id ASC"
            );
            let binds = vec![receipt_id.to_string(), self.options.tenant_id.clone()];
            return self.fetch_receipts(&sql, &binds, None).await;
        }
        let Some(receipt) = self.get_by_receipt_id(receipt_id).await? else {
            return Ok(Vec::new());
        };
        let Some(cause) = receipt.caused_by_receipt_id else {
            return Ok(Vec::new());
        };
        Ok(self.get_by_receipt_id(&cause).await?.into_iter().collect())
    }

    async fn list_inbox(
        &self,
        recipient_ai: &str,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, ReceiptGateError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let mut sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts r
             WHERE r.tenant_id = $1 AND r.recipient_ai = $2 AND r.phase = 'accepted'
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
        let mut binds = vec![self.options.tenant_id.clone(), recipient_ai.to_string()];
        if let Some(cursor) = cursor {
            sql.push_str(&format!(
                " AND (r.created_at < ${0} OR (r.created_at = ${0} AND r.receipt_id > ${1}))",
                binds.len() + 1,
                binds.len() + 2
            ));
            binds.push(cursor.created_at);
            binds.push(cursor.receipt_id);
        }
        sql.push_str(&format!(
            " ORDER BY r.created_at DESC, r.receipt_id ASC LIMIT ${}",
            binds.len() + 1
        ));
        let rows = self.fetch_receipts(&sql, &binds, Some(limit as i64 + 1)).await?;
        paginate(rows, limit)
    }

    async fn list_task_receipts(
        &self,
        task_id: &str,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Receipt>, ReceiptGateError> {
        let order = sort.sql();
        let mut sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             WHERE tenant_id = $1 AND task_id = $2
             ORDER BY created_at {order}, receipt_id {order}"
        );
        let binds = vec![self.options.tenant_id.clone(), task_id.to_string()];
        let limit = limit.map(|value| value.clamp(1, MAX_LIST_LIMIT) as i64);
        if limit.is_some() {
            sql.push_str(" LIMIT $3");
        }
        self.fetch_receipts(&sql, &binds, limit).await
    }

    async fn search(
        &self,
        filter: &SearchFilter,
        limit: usize,
        cursor: Option<Cursor>,
    ) -> Result<Page, ReceiptGateError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let mut clauses = vec!["tenant_id = $1".to_string()];
        let mut binds = vec![self.options.tenant_id.clone()];

        let push_eq = |column: &str, value: String, binds: &mut Vec<String>, clauses: &mut Vec<String>| {
            clauses.push(format!("{column} = ${}", binds.len() + 1));
            binds.push(value);
        };
        if let Some(value) = &filter.recipient_ai {
            push_eq("recipient_ai", value.clone(), &mut binds, &mut clauses);
        }
        if let Some(value) = &filter.created_by {
            push_eq("created_by", value.clone(), &mut binds, &mut clauses);
        }
        if let Some(phase) = filter.phase {
            push_eq("phase", phase.as_str().to_string(), &mut binds, &mut clauses);
        }
        if let Some(value) = &filter.obligation_id {
            push_eq("obligation_id", value.clone(), &mut binds, &mut clauses);
        }
        if let Some(value) = &filter.task_id {
            push_eq("task_id", value.clone(), &mut binds, &mut clauses);
        }
        if let Some(since) = filter.since {
            clauses.push(format!("created_at >= ${}", binds.len() + 1));
            binds.push(format_db_timestamp(since)?);
        }
        if let Some(until) = filter.until {
            clauses.push(format!("created_at < ${}", binds.len() + 1));
            binds.push(format_db_timestamp(until)?);
        }
        if let Some(fragment) = &filter.receipt_id_contains {
            clauses.push(format!(
                "receipt_id LIKE ${} ESCAPE '\\'",
                binds.len() + 1
            ));
            binds.push(format!("%{}%", escape_like(fragment)));
        }

        let mut sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE {}",
            clauses.join(" AND ")
        );
        if let Some(cursor) = cursor {
            sql.push_str(&format!(
                " AND (created_at < ${0} OR (created_at = ${0} AND receipt_id > ${1}))",
                binds.len() + 1,
                binds.len() + 2
            ));
            binds.push(cursor.created_at);
            binds.push(cursor.receipt_id);
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC, receipt_id ASC LIMIT ${}",
            binds.len() + 1
        ));
        let rows = self.fetch_receipts(&sql, &binds, Some(limit as i64 + 1)).await?;
        paginate(rows, limit)
    }

    async fn stats(&self) -> Result<LedgerStats, ReceiptGateError> {
        let tenant_id = self.options.tenant_id.as_str();
        let total: i64 = sqlx::query("SELECT COUNT(*) AS count FROM receipts WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?
            .try_get("count")
            .map_err(backend)?;

        let mut by_phase = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT phase, COUNT(*) AS count FROM receipts WHERE tenant_id = $1 GROUP BY phase",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        for row in rows {
            let phase: String = row.try_get("phase").map_err(backend)?;
            let count: i64 = row.try_get("count").map_err(backend)?;
            by_phase.insert(phase, count as u64);
        }

        let rows = sqlx::query(
            "SELECT recipient_ai, COUNT(*) AS count FROM receipts
             WHERE tenant_id = $1
             GROUP BY recipient_ai ORDER BY count DESC, recipient_ai ASC LIMIT 10",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut top_recipients = Vec::new();
        for row in rows {
            let recipient_ai: String = row.try_get("recipient_ai").map_err(backend)?;
            let count: i64 = row.try_get("count").map_err(backend)?;
            top_recipients.push(RecipientCount {
                recipient_ai,
                count: count as u64,
            });
        }

        Ok(LedgerStats {
            total_receipts: total as u64,
            by_phase,
            top_recipients,
        })
    }

    async fn rebuild_edges(&self) -> Result<u64, ReceiptGateError> {
        if !self.options.enable_graph_layer {
            return Err(ReceiptGateError::Internal(
                "graph layer is disabled; enable RECEIPTGATE_ENABLE_GRAPH_LAYER first".to_string(),
            ));
        }
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("DELETE FROM receipt_edges WHERE edge_type = 'caused_by'")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query(
            "INSERT INTO receipt_edges (from_receipt_id, to_receipt_id, edge_type)
             SELECT receipt_id, caused_by_receipt_id, 'caused_by'
             FROM receipts WHERE caused_by_receipt_id IS NOT NULL
             ON CONFLICT DO NOTHING",
        )
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM receipt_edges WHERE edge_type = 'caused_by'")
                .fetch_one(&mut *tx)
                .await
                .map_err(backend)?
                .try_get("count")
                .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(count as u64)
    }

    async fn embedding_sources(
        &self,
        model: &str,
        after_receipt_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EmbeddingSource>, ReceiptGateError> {
        if !self.options.enable_semantic_layer {
            return Err(ReceiptGateError::Internal(
                "semantic layer is disabled; enable RECEIPTGATE_ENABLE_SEMANTIC_LAYER first"
                    .to_string(),
            ));
        }
        let mut sql = "SELECT r.receipt_id, r.obligation_id, r.phase, r.created_by, \
             r.recipient_ai, r.task_id, r.body, e.content_hash
             FROM receipts r
             LEFT JOIN receipt_embeddings e
               ON e.receipt_id = r.receipt_id AND e.model = $1
             WHERE r.tenant_id = $2"
            .to_string();
        let mut binds = vec![model.to_string(), self.options.tenant_id.clone()];
        if let Some(after) = after_receipt_id {
            sql.push_str(&format!(" AND r.receipt_id > ${}", binds.len() + 1));
            binds.push(after.to_string());
        }
        sql.push_str(&format!(
            " ORDER BY r.receipt_id ASC LIMIT ${}",
            binds.len() + 1
        ));

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        query = query.bind(limit.clamp(1, MAX_LIST_LIMIT) as i64);
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;

        let mut sources = Vec::new();
        for row in rows {
            let phase_raw: String = row.try_get("phase").map_err(backend)?;
            let phase = Phase::parse(&phase_raw).ok_or_else(|| {
                ReceiptGateError::Backend(format!("invalid stored phase: {phase_raw}"))
            })?;
            let body_raw: String = row.try_get("body").map_err(backend)?;
            let body = serde_json::from_str(&body_raw)
                .map_err(|err| ReceiptGateError::Backend(format!("invalid stored body: {err}")))?;
            sources.push(EmbeddingSource {
                receipt_id: row.try_get("receipt_id").map_err(backend)?,
                obligation_id: row.try_get("obligation_id").map_err(backend)?,
                phase,
                created_by: row.try_get("created_by").map_err(backend)?,
                recipient_ai: row.try_get("recipient_ai").map_err(backend)?,
                task_id: row.try_get("task_id").map_err(backend)?,
                body,
                existing_content_hash: row.try_get("content_hash").map_err(backend)?,
            });
        }
        Ok(sources)
    }

    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<(), ReceiptGateError> {
        if !self.options.enable_semantic_layer {
            return Err(ReceiptGateError::Internal(
                "semantic layer is disabled; enable RECEIPTGATE_ENABLE_SEMANTIC_LAYER first"
                    .to_string(),
            ));
        }
        sqlx::query(
            "INSERT INTO receipt_embeddings (receipt_id, model, dims, vector, content_hash, built_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (receipt_id, model) DO UPDATE SET
               dims = EXCLUDED.dims,
               vector = EXCLUDED.vector,
               content_hash = EXCLUDED.content_hash,
               built_at = EXCLUDED.built_at",
        )
        .bind(&record.receipt_id)
        .bind(&record.model)
        .bind(record.dims as i64)
        .bind(serde_json::to_string(&record.vector)?)
        .bind(&record.content_hash)
        .bind(format_db_timestamp(now_utc())?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

fn backend(err: sqlx::Error) -> ReceiptGateError {
    ReceiptGateError::Backend(format!("postgres: {err}"))
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn escape_like(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn parse_receipt_row(row: &PgRow) -> Result<Receipt, ReceiptGateError> {
    let uuid_raw: String = row.try_get("uuid").map_err(backend)?;
    let uuid = Uuid::parse_str(&uuid_raw)
        .map_err(|_| ReceiptGateError::Backend(format!("invalid stored uuid: {uuid_raw}")))?;

    let phase_raw: String = row.try_get("phase").map_err(backend)?;
    let phase = Phase::parse(&phase_raw)
        .ok_or_else(|| ReceiptGateError::Backend(format!("invalid stored phase: {phase_raw}")))?;

    let artifact_raw: Option<String> = row.try_get("artifact_refs").map_err(backend)?;
    let artifact_refs = match artifact_raw {
        Some(text) => serde_json::from_str(&text).map_err(|err| {
            ReceiptGateError::Backend(format!("invalid stored artifact_refs: {err}"))
        })?,
        None => Vec::new(),
    };

    let body_raw: String = row.try_get("body").map_err(backend)?;
    let body = serde_json::from_str(&body_raw)
        .map_err(|err| ReceiptGateError::Backend(format!("invalid stored body: {err}")))?;

    let created_raw: String = row.try_get("created_at").map_err(backend)?;
    let created_at = parse_db_timestamp(&created_raw)?;

    Ok(Receipt {
        uuid,
        tenant_id: row.try_get("tenant_id").map_err(backend)?,
        receipt_id: row.try_get("receipt_id").map_err(backend)?,
        canonical_hash: row.try_get("canonical_hash").map_err(backend)?,
        phase,
        obligation_id: row.try_get("obligation_id").map_err(backend)?,
        task_id: row.try_get("task_id").map_err(backend)?,
        caused_by_receipt_id: row.try_get("caused_by_receipt_id").map_err(backend)?,
        created_by: row.try_get("created_by").map_err(backend)?,
        recipient_ai: row.try_get("recipient_ai").map_err(backend)?,
        escalation_to: row.try_get("escalation_to").map_err(backend)?,
        artifact_refs,
        body,
        created_at,
    })
}
