//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "messages",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                channel_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_name TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                referenced_external_id TEXT,
                referenced_content TEXT,
                created_at TEXT NOT NULL,
                is_processed INTEGER NOT NULL DEFAULT 0,
                processing_error TEXT,
                processed_at TEXT,
                is_relevant INTEGER,
                priority INTEGER,
                category TEXT,
                classification TEXT,
                inserted_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_channel_created
                ON messages(channel_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_processed ON messages(is_processed);
        "#,
    },
    Migration {
        version: 2,
        name: "pipeline_steps",
        sql: r#"
            CREATE TABLE IF NOT EXISTS pipeline_steps (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL DEFAULT 'null',
                output TEXT,
                processing_details TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_ms INTEGER,
                api_calls INTEGER NOT NULL DEFAULT 0,
                cost_units TEXT NOT NULL DEFAULT '0',
                UNIQUE(message_id, step_order)
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_steps_message
                ON pipeline_steps(message_id, step_order);
            CREATE INDEX IF NOT EXISTS idx_pipeline_steps_status ON pipeline_steps(status);
        "#,
    },
    Migration {
        version: 3,
        name: "channel_access",
        sql: r#"
            CREATE TABLE IF NOT EXISTS channel_access (
                channel_id TEXT PRIMARY KEY,
                accessible INTEGER NOT NULL DEFAULT 1,
                consecutive_permission_errors INTEGER NOT NULL DEFAULT 0,
                blacklisted_since TEXT,
                reason TEXT,
                last_checked_at TEXT
            );
        "#,
    },
];

/// Create the `_migrations` table if needed and apply pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
