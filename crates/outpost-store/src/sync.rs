//! Synchronization driver.
//!
//! Walks the unfrozen journal and pushes each entry through a
//! [`RemoteClient`]. The store never calls the network itself; this module
//! is the only place the two meet. A journal row is deleted only after the
//! server has acknowledged that entry, so stopping at any point (cancel,
//! crash, busy database) leaves a journal that can simply be pushed again.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use outpost_shared::Token;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::FieldPolicy;
use crate::database::{Database, Txn};
use crate::error::Result;
use crate::models::{Operation, StagedEntry, StagedObject, SyncState, Translation};
use crate::stage::keyword_text;

/// Server answer for one pushed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// Server token of the object; differs from the pushed token only for
    /// placeholders.
    pub token: Token,
    pub success: bool,
    /// Server-side reason when `success` is false.
    pub message: Option<String>,
}

#[derive(Error, Debug)]
#[error("remote error: {0}")]
pub struct RemoteError(pub String);

/// The remote API client, as seen by the sync driver.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Push one staged entry. `content` carries the payload of staged files
    /// and diagrams.
    async fn push(
        &self,
        entry: &StagedEntry,
        content: Option<Vec<u8>>,
    ) -> std::result::Result<PushResult, RemoteError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub done: usize,
    pub total: usize,
    pub current: Option<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub token: Token,
    pub operation: Operation,
    pub state: SyncState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcomes: Vec<EntryOutcome>,
    /// `(placeholder, server token)` for every promoted placeholder.
    pub promoted: Vec<(Token, Token)>,
    pub frozen: usize,
    /// Entries abandoned because the database was busy; retried next run.
    pub deferred: usize,
    pub cancelled: bool,
    pub translations_demoted: usize,
}

impl SyncReport {
    pub fn pushed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == SyncState::Ok)
            .count()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == SyncState::MergeConflict)
    }
}

/// Payload objects first so their server tokens are known before anything
/// referencing them goes out, then other new objects, edits, transactions.
fn push_order(entry: &StagedEntry) -> (u8, u8, Token, Operation) {
    let stage = match entry.operation {
        Operation::New => 0,
        Operation::Edit => 1,
        _ => 2,
    };
    let payload = u8::from(!entry.kind.has_payload());
    (stage, payload, entry.token.clone(), entry.operation)
}

impl Txn<'_> {
    /// Apply an acknowledged push: mirror the snapshot under its server
    /// token, then retire the journal row (promoting a placeholder).
    fn complete_push(&self, entry: &StagedEntry, server: &Token) -> Result<()> {
        // a localized edit of a mirrored object becomes its translation
        let master = match &entry.language {
            Some(_) => self.mirror_get(server)?,
            None => None,
        };

        if let (Some(language), Some(_), StagedObject::Object(object)) =
            (&entry.language, &master, &entry.object)
        {
            self.store_translation(&Translation {
                token: server.clone(),
                language: language.clone(),
                title: object.title().to_string(),
                body: object.body().unwrap_or_default().to_string(),
                reviewed: true,
                date_modified: object.date_modified(),
            })?;
        } else if let StagedObject::Object(object) = &entry.object {
            let mut mirrored = object.clone();
            mirrored.set_token(server.clone());
            // the reservation number gives way to the server's id
            if let Some(id) = server
                .as_str()
                .strip_prefix(entry.kind.prefix())
                .and_then(|id| id.parse::<i64>().ok())
            {
                mirrored.set_object_id(id);
            }
            self.mirror_put(&mirrored)?;

            if entry.kind.has_payload() {
                let raw: Option<Option<String>> = self
                    .conn
                    .query_row(
                        "SELECT content_data FROM stage WHERE token = ?1 AND operation = ?2",
                        params![entry.token.as_str(), entry.operation.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(raw) = raw.flatten() {
                    let bytes = self.codec.read_bytes(&raw, FieldPolicy::Default)?;
                    self.mirror_put_content(server, &bytes)?;
                }
            }
        }

        self.conn.execute(
            "DELETE FROM stage WHERE token = ?1 AND operation = ?2",
            params![entry.token.as_str(), entry.operation.to_string()],
        )?;

        // links and keywords follow the master again
        if let Some(master) = &master {
            if !self.has_staged_snapshot(server)? {
                self.link_object(server, master)?;
                self.replace_keywords(server, &keyword_text(master))?;
            }
        }

        if entry.token.is_placeholder() && &entry.token != server {
            self.promote_token(&entry.token, server)?;
        }
        Ok(())
    }
}

pub struct SyncEngine;

impl SyncEngine {
    /// Push one entry and apply the answer. `None` when the entry vanished,
    /// got frozen meanwhile, or was deferred on a busy database.
    async fn push_entry(
        db: &mut Database,
        client: &dyn RemoteClient,
        token: &Token,
        operation: Operation,
        renamed: &mut HashMap<Token, Token>,
        report: &mut SyncReport,
    ) -> Result<Option<EntryOutcome>> {
        let Some(entry) = db.view().staged_entry(token, operation)? else {
            return Ok(None);
        };
        if entry.frozen {
            return Ok(None);
        }

        let outcome = |state| EntryOutcome {
            token: token.clone(),
            operation,
            state,
        };

        if entry.merge_conflict {
            debug!(token = %token, "merge conflict, not pushed");
            return Ok(Some(outcome(SyncState::MergeConflict)));
        }

        let content = if operation.is_snapshot() && entry.kind.has_payload() {
            db.staged_content(token)?
        } else {
            None
        };

        let answer = match client.push(&entry, content).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(token = %token, error = %e, "push failed");
                return Ok(Some(outcome(SyncState::Error(e.to_string()))));
            }
        };
        if !answer.success {
            let message = answer
                .message
                .unwrap_or_else(|| "rejected by server".to_string());
            warn!(token = %token, %message, "push rejected");
            return Ok(Some(outcome(SyncState::Error(message))));
        }

        let server = answer.token;
        match db.write(|txn| txn.complete_push(&entry, &server)) {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(token = %token, "database busy, entry deferred");
                report.deferred += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        if token != &server {
            renamed.insert(token.clone(), server.clone());
            report.promoted.push((token.clone(), server));
        }
        Ok(Some(outcome(SyncState::Ok)))
    }

    /// Push every unfrozen journal entry.
    ///
    /// Cancellation is checked between entries. Entries re-staged during the
    /// run (dependents rewritten by a promotion) are picked up in a further
    /// pass; each `(token, operation)` is attempted at most once per run.
    pub async fn run(
        db: &mut Database,
        client: &dyn RemoteClient,
        cancel: &CancellationToken,
        progress: &watch::Sender<SyncProgress>,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut attempted: HashSet<(Token, Operation)> = HashSet::new();
        let mut renamed: HashMap<Token, Token> = HashMap::new();
        let mut done = 0;

        'passes: loop {
            let staged = db.list_staged()?;
            report.frozen = staged.iter().filter(|e| e.frozen).count();

            let mut pending: Vec<&StagedEntry> = staged
                .iter()
                .filter(|e| !e.frozen && !attempted.contains(&(e.token.clone(), e.operation)))
                .collect();
            if pending.is_empty() {
                break;
            }
            pending.sort_by_key(|e| push_order(e));
            let batch: Vec<(Token, Operation)> = pending
                .into_iter()
                .map(|e| (e.token.clone(), e.operation))
                .collect();

            progress.send_replace(SyncProgress {
                done,
                total: done + batch.len(),
                current: None,
            });

            for (token, operation) in batch {
                if cancel.is_cancelled() {
                    info!("synchronization cancelled");
                    report.cancelled = true;
                    break 'passes;
                }
                attempted.insert((token.clone(), operation));

                // earlier pushes may have promoted this entry's placeholder
                let token = renamed.get(&token).cloned().unwrap_or(token);
                attempted.insert((token.clone(), operation));

                progress.send_modify(|p| p.current = Some(token.clone()));
                let outcome =
                    Self::push_entry(db, client, &token, operation, &mut renamed, &mut report)
                        .await?;
                if let Some(outcome) = outcome {
                    report.outcomes.push(outcome);
                }
                done += 1;
                progress.send_modify(|p| p.done = done);
            }
        }

        match db.reconcile_translations() {
            Ok(n) => report.translations_demoted = n,
            Err(e) if e.is_transient() => warn!("database busy, translation pass skipped"),
            Err(e) => return Err(e),
        }

        progress.send_modify(|p| p.current = None);
        info!(
            pushed = report.pushed(),
            conflicts = report.conflicts().count(),
            promoted = report.promoted.len(),
            cancelled = report.cancelled,
            "synchronization finished"
        );
        Ok(report)
    }
}
