//! Reference rewriting when a placeholder becomes a server token.
//!
//! Every object that references the placeholder gets its body re-parsed and
//! the matching spans substituted, then is re-staged so the change is pushed
//! like any other local edit.

use outpost_shared::Token;
use rusqlite::params;
use tracing::{debug, info};

use crate::database::{Database, Txn};
use crate::error::Result;
use crate::markup::rewrite_references;

/// Move every `column = old` row of `table` to `new`, dropping rows that
/// would duplicate an existing edge.
fn move_column(txn: &Txn<'_>, table: &str, column: &str, old: &Token, new: &Token) -> Result<()> {
    txn.conn.execute(
        &format!("UPDATE OR IGNORE {table} SET {column} = ?1 WHERE {column} = ?2"),
        params![new.as_str(), old.as_str()],
    )?;
    txn.conn.execute(
        &format!("DELETE FROM {table} WHERE {column} = ?1"),
        params![old.as_str()],
    )?;
    Ok(())
}

impl Txn<'_> {
    pub(crate) fn rename_references(&self, old: &Token, new: &Token) -> Result<usize> {
        let mut rewritten = 0;

        for dependent in self.dependent_tokens(old)? {
            let Some(mut object) = self.resolve_object(&dependent)? else {
                continue;
            };
            let language = self
                .staged_snapshot(&dependent)?
                .and_then(|entry| entry.language);

            if let Some(body) = object.body().map(str::to_string) {
                let spans = self.markup.references(&body);
                let updated = rewrite_references(&body, &spans, old, new);
                if updated != body {
                    object.set_body(updated);
                    self.record_snapshot(object, None, language.as_deref())?;
                    rewritten += 1;
                    debug!(dependent = %dependent, old = %old, new = %new, "references rewritten");
                }
            }

            // edges that did not come from the body
            self.conn.execute(
                "UPDATE OR IGNORE object_relation SET linked_token = ?1
                 WHERE token = ?2 AND linked_token = ?3",
                params![new.as_str(), dependent.as_str(), old.as_str()],
            )?;
            self.conn.execute(
                "DELETE FROM object_relation WHERE token = ?1 AND linked_token = ?2",
                params![dependent.as_str(), old.as_str()],
            )?;
        }

        Ok(rewritten)
    }

    /// Replace `old` with `new` everywhere: references in bodies, graph
    /// edges, keyword entries, translations and the journal.
    pub(crate) fn promote_token(&self, old: &Token, new: &Token) -> Result<usize> {
        let rewritten = self.rename_references(old, new)?;

        move_column(self, "object_relation", "token", old, new)?;
        move_column(self, "object_hierarchy", "token", old, new)?;
        move_column(self, "object_hierarchy", "parent_token", old, new)?;
        move_column(self, "translation", "token", old, new)?;
        self.rename_keywords(old, new)?;
        self.retire_placeholder(old, new)?;

        info!(old = %old, new = %new, dependents = rewritten, "placeholder promoted");
        Ok(rewritten)
    }
}

impl Database {
    /// Rewrite references to `old` in every dependent body and re-stage the
    /// dependents. Returns how many bodies changed.
    pub fn rename_references(&mut self, old: &Token, new: &Token) -> Result<usize> {
        self.write(|txn| txn.rename_references(old, new))
    }

    /// Retire placeholder `old` in favour of server token `new`.
    pub fn promote_token(&mut self, old: &Token, new: &Token) -> Result<usize> {
        self.write(|txn| txn.promote_token(old, new))
    }
}
