//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`], the unlocked
//! [`FieldCodec`] and the markup parser used to derive the object graph.
//! Migrations are run before any other operation.
//!
//! The authoritative copy of everything in here can be re-fetched from the
//! server, so the connection runs with a relaxed journal (see
//! [`StoreConfig::journal_mode`]).

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::codec::FieldCodec;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::markup::{BraceMarkup, MarkupParser};
use crate::migrations;
use crate::models::FileSizeStats;

/// Who is logged in, and with what.
#[derive(Debug, Clone)]
pub struct Session {
    pub account_token: String,
    pub username: String,
    pub factor: outpost_shared::AuthFactor,
}

/// File-size statistics, recomputed lazily after any file write.
#[derive(Debug, Default)]
pub(crate) struct FileSizeCache {
    stats: Cell<Option<Option<FileSizeStats>>>,
}

impl FileSizeCache {
    pub(crate) fn get(&self) -> Option<Option<FileSizeStats>> {
        self.stats.get()
    }

    pub(crate) fn set(&self, stats: Option<FileSizeStats>) {
        self.stats.set(Some(stats));
    }

    pub(crate) fn invalidate(&self) {
        self.stats.set(None);
    }
}

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    pub(crate) conn: Connection,
    config: StoreConfig,
    pub(crate) codec: FieldCodec,
    pub(crate) session: Option<Session>,
    pub(crate) markup: Arc<dyn MarkupParser>,
    pub(crate) file_sizes: FileSizeCache,
}

impl Database {
    /// Open (or create) the application database.
    ///
    /// Without `data_dir` in the config the file is placed in the
    /// platform-appropriate data directory:
    /// - Linux:   `~/.local/share/outpost/outpost.db`
    /// - macOS:   `~/Library/Application Support/com.outpost.outpost/outpost.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\outpost\outpost\data\outpost.db`
    pub fn new(config: StoreConfig) -> Result<Self> {
        let data_dir = data_dir(&config)?;
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("outpost.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path, config)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)?;

        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            &config.journal_mode,
            |row| row.get(0),
        )?;
        conn.pragma_update(None, "synchronous", &config.synchronous)?;
        conn.busy_timeout(config.busy_timeout)?;

        tracing::debug!(journal_mode = %mode, "connection configured");

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            config,
            codec: FieldCodec::default(),
            session: None,
            markup: Arc::new(BraceMarkup),
            file_sizes: FileSizeCache::default(),
        })
    }

    /// Replace the markup parser used to extract references from bodies.
    pub fn with_markup(mut self, markup: Arc<dyn MarkupParser>) -> Self {
        self.markup = markup;
        self
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn codec(&self) -> &FieldCodec {
        &self.codec
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Read-only scope over the current connection.
    pub(crate) fn view(&self) -> Txn<'_> {
        Txn {
            conn: &self.conn,
            codec: &self.codec,
            markup: self.markup.as_ref(),
            file_sizes: &self.file_sizes,
        }
    }

    /// Run `f` inside an IMMEDIATE transaction. Nothing is committed if `f`
    /// returns an error.
    pub(crate) fn write<T>(&mut self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        let tx = begin_immediate(&mut self.conn)?;
        let out = f(&Txn {
            conn: &tx,
            codec: &self.codec,
            markup: self.markup.as_ref(),
            file_sizes: &self.file_sizes,
        })?;
        tx.commit()?;
        Ok(out)
    }
}

/// Everything a multi-table operation needs, borrowed for the length of one
/// transaction (or one read).
pub(crate) struct Txn<'a> {
    pub(crate) conn: &'a Connection,
    pub(crate) codec: &'a FieldCodec,
    pub(crate) markup: &'a dyn MarkupParser,
    pub(crate) file_sizes: &'a FileSizeCache,
}

/// Start a write transaction that takes the database write lock up front.
///
/// Anything that reads a current maximum before writing the next value goes
/// through here, so two handles can never reserve the same number.
fn begin_immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

fn data_dir(config: &StoreConfig) -> Result<PathBuf> {
    if let Some(dir) = &config.data_dir {
        return Ok(dir.clone());
    }
    let project_dirs =
        ProjectDirs::from("com", "outpost", "outpost").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path, StoreConfig::default()).expect("should open");
        assert!(db.path().is_some());
        assert!(db.session().is_none());
        assert!(!db.codec().is_unlocked());
    }

    #[test]
    fn new_uses_configured_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            data_dir: Some(dir.path().join("nested")),
            ..StoreConfig::default()
        };

        let db = Database::new(config).unwrap();
        let path = db.path().unwrap();
        assert!(path.ends_with("nested/outpost.db"));
    }

    #[test]
    fn failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_at(&dir.path().join("t.db"), StoreConfig::default()).unwrap();

        let res: Result<()> = db.write(|txn| {
            txn.conn.execute(
                "INSERT INTO keywords (token, word) VALUES ('DOC-1', 'w')",
                [],
            )?;
            Err(StoreError::Unsupported("abort".into()))
        });
        assert!(res.is_err());

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM keywords", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn journal_mode_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("j.db"), StoreConfig::default()).unwrap();
        let mode: String = db
            .conn()
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_uppercase(), "MEMORY");
    }
}
