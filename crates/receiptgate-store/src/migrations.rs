use serde::Serialize;

use crate::StoreOptions;

/// One numbered schema file. Files apply in version order, each inside its
/// own transaction, and are recorded in the `schema_migrations` meta-table so
/// they run exactly once.
#[derive(Debug, Clone, Copy)]
pub struct MigrationFile {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const SQLITE_MIGRATIONS: [MigrationFile; 3] = [
    MigrationFile {
        version: 1,
        name: "001_receipts",
        sql: include_str!("../migrations/sqlite/001_receipts.sql"),
    },
    MigrationFile {
        version: 2,
        name: "002_receipt_edges",
        sql: include_str!("../migrations/sqlite/002_receipt_edges.sql"),
    },
    MigrationFile {
        version: 3,
        name: "003_receipt_embeddings",
        sql: include_str!("../migrations/sqlite/003_receipt_embeddings.sql"),
    },
];

pub const POSTGRES_MIGRATIONS: [MigrationFile; 3] = [
    MigrationFile {
        version: 1,
        name: "001_receipts",
        sql: include_str!("../migrations/postgres/001_receipts.sql"),
    },
    MigrationFile {
        version: 2,
        name: "002_receipt_edges",
        sql: include_str!("../migrations/postgres/002_receipt_edges.sql"),
    },
    MigrationFile {
        version: 3,
        name: "003_receipt_embeddings",
        sql: include_str!("../migrations/postgres/003_receipt_embeddings.sql"),
    },
];

/// Selects the files to apply for this deployment. The edge and embedding
/// schemas are skipped unless their layer is enabled.
#[must_use]
pub fn plan(
    files: &'static [MigrationFile],
    options: &StoreOptions,
) -> Vec<&'static MigrationFile> {
    files
        .iter()
        .filter(|file| match file.version {
            2 => options.enable_graph_layer,
            3 => options.enable_semantic_layer,
            _ => true,
        })
        .collect()
}

/// Outcome of one `migrate()` call: names of files applied this run.
/// Already-applied files are skipped silently, which makes the runner
/// idempotent.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub applied: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_monotonic_and_aligned_across_dialects() {
        for files in [&SQLITE_MIGRATIONS, &POSTGRES_MIGRATIONS] {
            for (index, file) in files.iter().enumerate() {
                assert_eq!(file.version, index as i64 + 1);
            }
        }
        for (sqlite, postgres) in SQLITE_MIGRATIONS.iter().zip(POSTGRES_MIGRATIONS.iter()) {
            assert_eq!(sqlite.name, postgres.name);
        }
    }

    #[test]
    fn plan_gates_optional_layers() {
        let base = StoreOptions::default();
        let versions: Vec<i64> = plan(&SQLITE_MIGRATIONS, &base)
            .iter()
            .map(|f| f.version)
            .collect();
        assert_eq!(versions, vec![1]);

        let full = StoreOptions {
            enable_graph_layer: true,
            enable_semantic_layer: true,
            ..StoreOptions::default()
        };
        let versions: Vec<i64> = plan(&SQLITE_MIGRATIONS, &full)
            .iter()
            .map(|f| f.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }
}
