//! Translations of mirrored objects.
//!
//! A translation records the master's `date_modified` at the time it was
//! made. Once the master moves past that point a reviewed translation is no
//! longer trustworthy; [`Database::reconcile_translations`] demotes it. The
//! pass runs after login and after every synchronization.

use outpost_shared::Token;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::codec::{format_timestamp, parse_timestamp, FieldPolicy};
use crate::database::{Database, Txn};
use crate::error::Result;
use crate::models::Translation;

const TRANSLATION_COLUMNS: &str = "token, language, title, translation, reviewed, date_modified";

struct TranslationRow {
    token: String,
    language: String,
    title: String,
    body: String,
    reviewed: bool,
    date_modified: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<TranslationRow> {
    Ok(TranslationRow {
        token: row.get(0)?,
        language: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        reviewed: row.get(4)?,
        date_modified: row.get(5)?,
    })
}

impl Txn<'_> {
    pub(crate) fn store_translation(&self, translation: &Translation) -> Result<()> {
        self.conn.execute(
            "INSERT INTO translation (token, language, title, translation, reviewed, date_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(token, language) DO UPDATE SET
                title         = excluded.title,
                translation   = excluded.translation,
                reviewed      = excluded.reviewed,
                date_modified = excluded.date_modified",
            params![
                translation.token.as_str(),
                translation.language,
                self.codec.write_str(&translation.title, FieldPolicy::Default)?,
                self.codec.write_str(&translation.body, FieldPolicy::Default)?,
                translation.reviewed,
                format_timestamp(translation.date_modified),
            ],
        )?;
        debug!(token = %translation.token, language = %translation.language, "translation stored");
        Ok(())
    }
}

impl Database {
    fn decode_translation(&self, row: TranslationRow) -> Result<Translation> {
        Ok(Translation {
            token: Token::new(row.token)?,
            language: row.language,
            title: self.codec.read_str(&row.title, FieldPolicy::Default)?,
            body: self.codec.read_str(&row.body, FieldPolicy::Default)?,
            reviewed: row.reviewed,
            date_modified: parse_timestamp(&row.date_modified)?,
        })
    }

    pub fn put_translation(&mut self, translation: &Translation) -> Result<()> {
        self.view().store_translation(translation)
    }

    pub fn get_translation(&self, token: &Token, language: &str) -> Result<Option<Translation>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TRANSLATION_COLUMNS} FROM translation WHERE token = ?1 AND language = ?2"
                ),
                params![token.as_str(), language],
                read_row,
            )
            .optional()?;
        row.map(|row| self.decode_translation(row)).transpose()
    }

    pub fn list_translations(&self, token: &Token) -> Result<Vec<Translation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TRANSLATION_COLUMNS} FROM translation WHERE token = ?1 ORDER BY language"
        ))?;
        let rows = stmt.query_map(params![token.as_str()], read_row)?;

        let mut translations = Vec::new();
        for row in rows {
            translations.push(self.decode_translation(row?)?);
        }
        Ok(translations)
    }

    pub fn mark_reviewed(&mut self, token: &Token, language: &str, reviewed: bool) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE translation SET reviewed = ?1 WHERE token = ?2 AND language = ?3",
            params![reviewed, token.as_str(), language],
        )?;
        Ok(affected > 0)
    }

    /// Demote reviewed translations whose master changed after they were
    /// made. Touches only unencrypted columns, so it runs without keys.
    pub fn reconcile_translations(&mut self) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT token, language, date_modified FROM translation WHERE reviewed = 1",
        )?;
        let reviewed = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut stale = Vec::new();
        for (token, language, snapshot) in reviewed {
            let Some(master) = self.date_modified_of(&Token::new(token.as_str())?)? else {
                continue;
            };
            let outdated = match parse_timestamp(&snapshot) {
                Ok(made) => master > made,
                Err(_) => {
                    warn!(%token, %language, "unreadable translation timestamp, demoting");
                    true
                }
            };
            if outdated {
                stale.push((token, language));
            }
        }

        for (token, language) in &stale {
            self.conn.execute(
                "UPDATE translation SET reviewed = 0 WHERE token = ?1 AND language = ?2",
                params![token, language],
            )?;
        }

        if !stale.is_empty() {
            info!(demoted = stale.len(), "stale translations demoted");
        }
        Ok(stale.len())
    }
}
