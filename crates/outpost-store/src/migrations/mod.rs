//! Database migration runner.
//!
//! Migrations are listed in [`MIGRATIONS`] and applied in order on every
//! open. `PRAGMA user_version` records the last applied version so each runs
//! exactly once.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type MigrationFn = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// `(version, name, up)`; append new entries, never reorder.
const MIGRATIONS: &[(u32, &str, MigrationFn)] = &[(1, "v001_initial", v001_initial::up)];

/// Schema version after all migrations have run.
pub fn current_version() -> u32 {
    MIGRATIONS.last().map(|(v, _, _)| *v).unwrap_or(0)
}

/// Run all pending migrations against the open connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = current_version(),
        "checking database migrations"
    );

    for (version, name, up) in MIGRATIONS {
        if current >= *version {
            continue;
        }
        tracing::info!(migration = name, "applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
