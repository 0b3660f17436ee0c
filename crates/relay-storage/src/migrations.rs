//! Migration runner
//!
//! Applies the embedded `.sql` files in filename order, tracking the applied
//! set in `_migrations`. Stops on the first error; re-running after success
//! is a no-op.

use sqlx::PgPool;
use tracing::{info, instrument};

use crate::ledger::LedgerError;

/// Embedded schema files, in apply order.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_runs.sql", include_str!("../migrations/001_runs.sql")),
    (
        "002_scheduling.sql",
        include_str!("../migrations/002_scheduling.sql"),
    ),
    (
        "003_locks_dlq.sql",
        include_str!("../migrations/003_locks_dlq.sql"),
    ),
    (
        "004_progress.sql",
        include_str!("../migrations/004_progress.sql"),
    ),
    (
        "005_sources.sql",
        include_str!("../migrations/005_sources.sql"),
    ),
];

/// Apply pending migrations. Returns the filenames applied this call.
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<Vec<String>, LedgerError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            filename TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| LedgerError::Database(e.to_string()))?;

    let mut applied = Vec::new();

    for (filename, sql) in MIGRATIONS {
        let already: Option<(String,)> =
            sqlx::query_as("SELECT filename FROM _migrations WHERE filename = $1")
                .bind(filename)
                .fetch_optional(pool)
                .await
                .map_err(|e| LedgerError::Database(e.to_string()))?;

        if already.is_some() {
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        // Statements are separated by blank-line-delimited semicolons;
        // Postgres accepts the whole file as a batch via raw_sql.
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::Database(format!("migration {filename} failed: {e}")))?;

        sqlx::query("INSERT INTO _migrations (filename) VALUES ($1)")
            .bind(filename)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;

        info!(%filename, "applied migration");
        applied.push(filename.to_string());
    }

    Ok(applied)
}

/// Filenames the runner knows about, in order (for health/introspection).
pub fn known_migrations() -> Vec<&'static str> {
    MIGRATIONS.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_sorted_and_unique() {
        let names = known_migrations();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();

        assert_eq!(names, sorted, "migrations must be in filename order");
        assert_eq!(names.len(), MIGRATIONS.len());
    }

    #[test]
    fn test_migrations_cover_contract_tables() {
        let all_sql: String = MIGRATIONS.iter().map(|(_, sql)| *sql).collect();
        for table in [
            "core_runs",
            "core_events",
            "core_schedules",
            "core_schedule_runs",
            "core_schedule_locks",
            "core_concurrency_locks",
            "core_dead_letters",
            "core_watermarks",
            "core_backfill_plans",
            "core_sources",
            "core_source_fetches",
            "core_source_cache",
        ] {
            assert!(
                all_sql.contains(table),
                "missing table definition: {table}"
            );
        }
    }
}
