//! Staging journal: local edits waiting to be pushed.
//!
//! Edits never overwrite the mirrored copy. Each journal row is keyed by
//! `(token, operation)`: `new` and `edit` hold full snapshots, the remaining
//! operations hold single-field task transactions that never conflict with
//! one another.
//!
//! Placeholder tokens carry no kind prefix, so every row stores its kind
//! prefix sealed under a key derived from the token itself. The kind is
//! decoded once when the row is read.

use chrono::{DateTime, Utc};
use outpost_shared::constants::PLACEHOLDER_PREFIX;
use outpost_shared::{crypto, ContentKind, Token, TokenError};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use crate::codec::{format_timestamp, normalize_timestamp, parse_timestamp, FieldPolicy};
use crate::database::{Database, Txn};
use crate::error::{Result, StoreError};
use crate::markup::{tokens_of_kind, ReferenceKind};
use crate::models::{
    MirrorObject, Operation, StagedEntry, StagedObject, TaskChange, TaskTransaction,
};

const SEQUENCE_NAME: &str = "placeholder";

const STAGE_COLUMNS: &str =
    "token, token_prefix, object_id, operation, date_modified, header_data, frozen, language";

struct StageRow {
    token: String,
    token_prefix: String,
    object_id: Option<i64>,
    operation: String,
    date_modified: String,
    header_data: String,
    frozen: bool,
    language: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StageRow> {
    Ok(StageRow {
        token: row.get(0)?,
        token_prefix: row.get(1)?,
        object_id: row.get(2)?,
        operation: row.get(3)?,
        date_modified: row.get(4)?,
        header_data: row.get(5)?,
        frozen: row.get(6)?,
        language: row.get(7)?,
    })
}

/// One journal row about to be written.
struct RowWrite<'a> {
    token: &'a Token,
    kind: ContentKind,
    object_id: Option<i64>,
    operation: Operation,
    baseline: DateTime<Utc>,
    header: String,
    content: Option<&'a [u8]>,
    language: Option<&'a str>,
}

pub(crate) fn seal_prefix(token: &Token, kind: ContentKind) -> Result<String> {
    let key = crypto::derive_token_key(token.as_str());
    Ok(crypto::encrypt_to_text(&key, kind.prefix().as_bytes())?)
}

fn open_prefix(token: &Token, sealed: &str) -> Result<ContentKind> {
    let key = crypto::derive_token_key(token.as_str());
    let plain = crypto::decrypt_from_text(&key, sealed).map_err(|_| StoreError::NotAuthenticated)?;
    let prefix = String::from_utf8(plain).map_err(|_| StoreError::NotAuthenticated)?;
    ContentKind::from_prefix(&prefix).ok_or(StoreError::Token(TokenError::UnknownKind(prefix)))
}

pub(crate) fn attachments(object: Option<&MirrorObject>, txn: &Txn<'_>) -> Vec<Token> {
    object
        .and_then(MirrorObject::body)
        .map(|body| tokens_of_kind(&txn.markup.references(body), ReferenceKind::Attachment))
        .unwrap_or_default()
}

pub(crate) fn keyword_text(object: &MirrorObject) -> String {
    match object.body() {
        Some(body) => format!("{} {}", object.title(), body),
        None => object.title().to_string(),
    }
}

impl Txn<'_> {
    /// Next placeholder sequence number.
    ///
    /// Above every staged placeholder, every outstanding chunk reservation,
    /// every staged object reservation and every number handed out before, so
    /// a file reservation and a document placeholder can never collide and a
    /// promoted placeholder is never reissued.
    pub(crate) fn allocate_sequence(&self) -> Result<u64> {
        let max_placeholder: Option<String> = self.conn.query_row(
            "SELECT MAX(token) FROM stage WHERE token LIKE ?1",
            params![format!("{PLACEHOLDER_PREFIX}%")],
            |row| row.get(0),
        )?;
        let min_chunk: Option<i64> =
            self.conn
                .query_row("SELECT MIN(id) FROM file_chunk", [], |row| row.get(0))?;
        let min_object: Option<i64> =
            self.conn
                .query_row("SELECT MIN(object_id) FROM stage", [], |row| row.get(0))?;
        let high_water: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM sequence WHERE name = ?1",
                params![SEQUENCE_NAME],
                |row| row.get(0),
            )
            .optional()?;

        let reserved = |id: Option<i64>| id.filter(|v| *v < 0).map_or(0, i64::unsigned_abs);
        let current = [
            max_placeholder
                .and_then(|t| Token::new(t).ok())
                .and_then(|t| t.placeholder_seq())
                .unwrap_or(0),
            reserved(min_chunk),
            reserved(min_object),
            high_water.map_or(0, |v| v.max(0) as u64),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);

        let next = current + 1;
        self.conn.execute(
            "INSERT INTO sequence (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![SEQUENCE_NAME, next as i64],
        )?;
        Ok(next)
    }

    fn upsert_row(&self, row: RowWrite<'_>) -> Result<()> {
        let header = self.codec.write_str(&row.header, FieldPolicy::Default)?;
        let content = row
            .content
            .map(|bytes| self.codec.write_bytes(bytes, FieldPolicy::Default))
            .transpose()?;

        // baseline and frozen flag survive re-snapshots; so does the payload
        // unless a new one is supplied
        self.conn.execute(
            "INSERT INTO stage (token, token_prefix, object_id, operation, date_modified,
                                header_data, content_data, frozen, language)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
             ON CONFLICT(token, operation) DO UPDATE SET
                token_prefix = excluded.token_prefix,
                object_id    = excluded.object_id,
                header_data  = excluded.header_data,
                content_data = COALESCE(excluded.content_data, stage.content_data),
                language     = excluded.language",
            params![
                row.token.as_str(),
                seal_prefix(row.token, row.kind)?,
                row.object_id,
                row.operation.to_string(),
                format_timestamp(row.baseline),
                header,
                content,
                row.language,
            ],
        )?;

        debug!(token = %row.token, operation = %row.operation, "journal row written");
        Ok(())
    }

    fn decode_entry(&self, row: StageRow) -> Result<StagedEntry> {
        let token = Token::new(row.token)?;
        let kind = open_prefix(&token, &row.token_prefix)?;
        let operation: Operation = row.operation.parse()?;
        let baseline = parse_timestamp(&row.date_modified)?;
        let json = self.codec.read_str(&row.header_data, FieldPolicy::Default)?;

        let object = if operation.is_snapshot() {
            StagedObject::Object(MirrorObject::decode_header(kind, &json)?)
        } else {
            StagedObject::Transaction(serde_json::from_str(&json)?)
        };

        // only an edit of a server object can be overtaken by the server
        let merge_conflict = operation == Operation::Edit
            && !token.is_placeholder()
            && self
                .mirror_date_modified(&token)?
                .is_some_and(|current| current > baseline);

        Ok(StagedEntry {
            token,
            kind,
            object_id: row.object_id,
            operation,
            date_modified: baseline,
            object,
            frozen: row.frozen,
            language: row.language,
            merge_conflict,
        })
    }

    fn query_entries(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<StagedEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STAGE_COLUMNS} FROM stage {filter}"))?;
        let rows = stmt.query_map(args, read_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(self.decode_entry(row?)?);
        }
        entries.sort_by(|a, b| (&a.token, a.operation).cmp(&(&b.token, b.operation)));
        Ok(entries)
    }

    pub(crate) fn staged_entry(&self, token: &Token, operation: Operation) -> Result<Option<StagedEntry>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {STAGE_COLUMNS} FROM stage WHERE token = ?1 AND operation = ?2"),
                params![token.as_str(), operation.to_string()],
                read_row,
            )
            .optional()?;
        row.map(|row| self.decode_entry(row)).transpose()
    }

    pub(crate) fn staged_entries(&self, token: &Token) -> Result<Vec<StagedEntry>> {
        self.query_entries("WHERE token = ?1", &[&token.as_str()])
    }

    /// The `new` or `edit` snapshot for `token`.
    pub(crate) fn staged_snapshot(&self, token: &Token) -> Result<Option<StagedEntry>> {
        Ok(self
            .query_entries("WHERE token = ?1 AND operation IN ('new', 'edit')", &[&token.as_str()])?
            .into_iter()
            .next())
    }

    pub(crate) fn query_all_snapshots(&self) -> Result<Vec<StagedEntry>> {
        self.query_entries("WHERE operation IN ('new', 'edit')", &[])
    }

    /// The object as the user currently sees it: the staged snapshot if
    /// there is one, otherwise the mirrored copy.
    pub(crate) fn resolve_object(&self, token: &Token) -> Result<Option<MirrorObject>> {
        if let Some(entry) = self.staged_snapshot(token)? {
            return Ok(entry.object.into_object());
        }
        self.mirror_get(token)
    }

    /// Snapshot `object` under its token and bring the graph, the file
    /// reference flags and the keyword entries in line with its body.
    pub(crate) fn record_snapshot(
        &self,
        object: MirrorObject,
        content: Option<&[u8]>,
        language: Option<&str>,
    ) -> Result<StagedEntry> {
        let token = object.token().clone();
        let operation = if token.is_placeholder() {
            Operation::New
        } else {
            Operation::Edit
        };

        let previous = match self.staged_entry(&token, operation)? {
            Some(entry) => entry.object.into_object(),
            None if operation == Operation::Edit => self.mirror_get(&token)?,
            None => None,
        };

        self.upsert_row(RowWrite {
            token: &token,
            kind: object.kind(),
            object_id: object.object_id(),
            operation,
            baseline: normalize_timestamp(object.date_modified()),
            header: object.encode_header()?,
            content,
            language,
        })?;

        self.apply_body_links(&token, &object, previous.as_ref())?;
        self.replace_keywords(&token, &keyword_text(&object))?;

        self.staged_entry(&token, operation)?
            .ok_or_else(|| StoreError::MissingRow(token.to_string()))
    }

    /// Re-derive outgoing edges from the body and adjust file reference
    /// flags relative to `previous`.
    fn apply_body_links(
        &self,
        token: &Token,
        object: &MirrorObject,
        previous: Option<&MirrorObject>,
    ) -> Result<()> {
        self.link_object(token, object)?;

        let current = attachments(Some(object), self);
        for dropped in attachments(previous, self)
            .into_iter()
            .filter(|t| !current.contains(t))
        {
            self.set_file_referenced(&dropped, false)?;
        }
        for attached in &current {
            self.set_file_referenced(attached, true)?;
        }
        Ok(())
    }

    /// Flip the reference flag on a file, staged and mirrored alike.
    pub(crate) fn set_file_referenced(&self, token: &Token, referenced: bool) -> Result<()> {
        self.mirror_set_referenced(token, referenced)?;

        for entry in self.staged_entries(token)? {
            let StagedObject::Object(MirrorObject::File(mut file)) = entry.object else {
                continue;
            };
            if file.referenced == referenced {
                continue;
            }
            file.referenced = referenced;
            let header = self.codec.write_str(
                &MirrorObject::File(file).encode_header()?,
                FieldPolicy::Default,
            )?;
            self.conn.execute(
                "UPDATE stage SET header_data = ?1 WHERE token = ?2 AND operation = ?3",
                params![header, token.as_str(), entry.operation.to_string()],
            )?;
        }

        debug!(token = %token, referenced, "file reference flag set");
        Ok(())
    }

    pub(crate) fn create(&self, mut object: MirrorObject, content: Option<&[u8]>) -> Result<StagedEntry> {
        if content.is_some() && !object.kind().has_payload() {
            return Err(StoreError::Unsupported(format!(
                "{} objects carry no payload",
                object.kind()
            )));
        }

        if let (MirrorObject::File(file), Some(bytes)) = (&mut object, content) {
            file.size = bytes.len() as u64;
        }

        let seq = self.allocate_sequence()?;
        object.set_token(Token::placeholder(seq));
        if object.kind().has_payload() {
            object.set_object_id(-(seq as i64));
        }

        let entry = self.record_snapshot(object, content, None)?;
        info!(token = %entry.token, kind = %entry.kind, "object created offline");
        Ok(entry)
    }

    pub(crate) fn modify(&self, mut object: MirrorObject, language: Option<&str>) -> Result<StagedEntry> {
        if let MirrorObject::Task(task) = &mut object {
            let previous_body = match self.resolve_object(&task.token)? {
                Some(previous) => previous.body().map(str::to_string),
                None => None,
            };
            let before = previous_body
                .map(|body| tokens_of_kind(&self.markup.references(&body), ReferenceKind::Mention))
                .unwrap_or_default();
            let mentioned = tokens_of_kind(&self.markup.references(&task.body), ReferenceKind::Mention);

            for user in mentioned {
                if !before.contains(&user) && !task.subscribers.contains(&user) {
                    debug!(task = %task.token, user = %user, "subscribing mentioned user");
                    task.subscribers.push(user);
                }
            }
        }

        self.record_snapshot(object, None, language)
    }

    pub(crate) fn append_transaction(&self, transaction: TaskTransaction) -> Result<StagedEntry> {
        let token = transaction.task.clone();
        if let Some(kind) = token.kind().filter(|k| *k != ContentKind::Task) {
            return Err(StoreError::Unsupported(format!(
                "transactions apply to tasks, not {kind}"
            )));
        }

        let next_index = match &transaction.change {
            TaskChange::Project(_) | TaskChange::Subscriber(_) | TaskChange::Comment(_) => {
                let pattern = Operation::for_change(&transaction.change, 0)
                    .series_pattern()
                    .unwrap_or_default();
                let count: i64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM stage WHERE token = ?1 AND operation LIKE ?2",
                    params![token.as_str(), pattern],
                    |row| row.get(0),
                )?;
                count as u32 + 1
            }
            _ => 0,
        };
        let operation = Operation::for_change(&transaction.change, next_index);

        self.upsert_row(RowWrite {
            token: &token,
            kind: ContentKind::Task,
            object_id: None,
            operation,
            baseline: normalize_timestamp(transaction.date_modified),
            header: serde_json::to_string(&transaction)?,
            content: None,
            language: None,
        })?;

        self.staged_entry(&token, operation)?
            .ok_or_else(|| StoreError::MissingRow(token.to_string()))
    }

    pub(crate) fn remove(&self, token: &Token, operation: Operation) -> Result<bool> {
        let Some(entry) = self.staged_entry(token, operation)? else {
            return Ok(false);
        };

        self.conn.execute(
            "DELETE FROM stage WHERE token = ?1 AND operation = ?2",
            params![token.as_str(), operation.to_string()],
        )?;

        if entry.kind == ContentKind::File {
            debug!(token = %token, "staged file content removed");
            return Ok(true);
        }

        if operation.is_transaction() {
            self.renumber_series(token, operation)?;
            return Ok(true);
        }

        self.delete_keywords(token)?;
        self.detach_relations(token)?;

        // an abandoned edit falls back to the mirrored copy's links
        let restored = match operation {
            Operation::Edit => self.mirror_get(token)?,
            _ => None,
        };
        match &restored {
            Some(object) => {
                self.link_object(token, object)?;
                self.replace_keywords(token, &keyword_text(object))?;
            }
            None => {
                self.conn.execute(
                    "DELETE FROM object_hierarchy WHERE token = ?1",
                    params![token.as_str()],
                )?;
            }
        }

        let kept = attachments(restored.as_ref(), self);
        for dropped in attachments(entry.object.as_object(), self)
            .into_iter()
            .filter(|t| !kept.contains(t))
        {
            self.set_file_referenced(&dropped, false)?;
        }

        info!(token = %token, %operation, "staged edit removed");
        Ok(true)
    }

    /// Drop the journal rows of a promoted placeholder. Field transactions
    /// staged against it still apply to the object, so they move to `new`.
    pub(crate) fn retire_placeholder(&self, old: &Token, new: &Token) -> Result<()> {
        for entry in self.staged_entries(old)? {
            let StagedObject::Transaction(mut transaction) = entry.object else {
                continue;
            };
            transaction.task = new.clone();
            self.upsert_row(RowWrite {
                token: new,
                kind: ContentKind::Task,
                object_id: None,
                operation: entry.operation,
                baseline: entry.date_modified,
                header: serde_json::to_string(&transaction)?,
                content: None,
                language: None,
            })?;
            if entry.frozen {
                self.conn.execute(
                    "UPDATE stage SET frozen = 1 WHERE token = ?1 AND operation = ?2",
                    params![new.as_str(), entry.operation.to_string()],
                )?;
            }
        }

        self.conn
            .execute("DELETE FROM stage WHERE token = ?1", params![old.as_str()])?;
        Ok(())
    }

    /// Close the gap left by a removed series member: `project-3` becomes
    /// `project-2` once `project-2` is gone.
    fn renumber_series(&self, token: &Token, removed: Operation) -> Result<()> {
        let (Some(pattern), Some(gap)) = (removed.series_pattern(), removed.index()) else {
            return Ok(());
        };

        let mut stmt = self
            .conn
            .prepare("SELECT operation FROM stage WHERE token = ?1 AND operation LIKE ?2")?;
        let mut later: Vec<Operation> = stmt
            .query_map(params![token.as_str(), pattern], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .iter()
            .filter_map(|op| op.parse::<Operation>().ok())
            .filter(|op| op.index().is_some_and(|n| n > gap))
            .collect();
        // ascending, so every target slot is already free
        later.sort();

        for op in later {
            let n = op.index().unwrap_or(gap + 1);
            self.conn.execute(
                "UPDATE stage SET operation = ?1 WHERE token = ?2 AND operation = ?3",
                params![op.with_index(n - 1).to_string(), token.as_str(), op.to_string()],
            )?;
        }
        Ok(())
    }
}

impl Database {
    /// Stage a brand-new object under the next placeholder token.
    pub fn create(&mut self, object: MirrorObject) -> Result<StagedEntry> {
        self.write(|txn| txn.create(object, None))
    }

    /// Stage a new file or diagram together with its payload.
    pub fn create_with_content(&mut self, object: MirrorObject, content: &[u8]) -> Result<StagedEntry> {
        self.write(|txn| txn.create(object, Some(content)))
    }

    /// Stage an edit. Placeholders are re-snapshotted under `new`, server
    /// objects under `edit` with the first edit's baseline kept.
    pub fn modify(&mut self, object: MirrorObject) -> Result<StagedEntry> {
        self.write(|txn| txn.modify(object, None))
    }

    /// Stage an edit made in `language` rather than the master language.
    pub fn modify_localized(&mut self, object: MirrorObject, language: &str) -> Result<StagedEntry> {
        self.write(|txn| txn.modify(object, Some(language)))
    }

    pub fn append_transaction(&mut self, transaction: TaskTransaction) -> Result<StagedEntry> {
        self.write(|txn| txn.append_transaction(transaction))
    }

    /// Drop one journal row. `Ok(false)` if there was none.
    pub fn remove(&mut self, token: &Token, operation: Operation) -> Result<bool> {
        self.write(|txn| txn.remove(token, operation))
    }

    /// Include or exclude every row of `token` from the next push.
    pub fn freeze(&mut self, token: &Token, frozen: bool) -> Result<usize> {
        let affected = self.conn.execute(
            "UPDATE stage SET frozen = ?1 WHERE token = ?2",
            params![frozen, token.as_str()],
        )?;
        debug!(token = %token, frozen, rows = affected, "freeze toggled");
        Ok(affected)
    }

    pub fn is_frozen(&self, token: &Token) -> Result<bool> {
        let frozen: Option<bool> = self.conn.query_row(
            "SELECT MAX(frozen) FROM stage WHERE token = ?1",
            params![token.as_str()],
            |row| row.get(0),
        )?;
        Ok(frozen.unwrap_or(false))
    }

    /// The staged snapshot for `token`, with its merge-conflict flag.
    pub fn get_staged(&self, token: &Token) -> Result<Option<StagedEntry>> {
        self.view().staged_snapshot(token)
    }

    /// Every journal row for `token`, snapshot first.
    pub fn get_staged_entries(&self, token: &Token) -> Result<Vec<StagedEntry>> {
        self.view().staged_entries(token)
    }

    pub fn list_staged(&self) -> Result<Vec<StagedEntry>> {
        self.view().query_entries("", &[])
    }

    /// Decrypted payload of a staged file or diagram.
    pub fn staged_content(&self, token: &Token) -> Result<Option<Vec<u8>>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT content_data FROM stage
                 WHERE token = ?1 AND operation IN ('new', 'edit')",
                params![token.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.flatten()
            .map(|raw| self.codec.read_bytes(&raw, FieldPolicy::Default))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Duration;

    use super::*;
    use crate::models::{Document, SyncState, Task};
    use crate::test_support::{
        mirrored_document, open_logged_in, sample_document, sample_file, sample_task,
    };

    #[test]
    fn create_assigns_increasing_placeholders() {
        let (mut db, _dir) = open_logged_in();
        let a = db.create(sample_document("a", "")).unwrap();
        let b = db.create(sample_document("b", "")).unwrap();

        assert_eq!(a.token, Token::placeholder(1));
        assert_eq!(b.token, Token::placeholder(2));
        assert_eq!(a.operation, Operation::New);
        assert_eq!(a.kind, ContentKind::Document);
    }

    #[test]
    fn placeholders_skip_file_reservations() {
        let (mut db, _dir) = open_logged_in();
        let reserved = db.get_new_file_id().unwrap();
        assert_eq!(reserved, -1);

        let doc = db.create(sample_document("a", "")).unwrap();
        assert_eq!(doc.token, Token::placeholder(2));

        let file = db.create_with_content(sample_file("x.bin", "application/octet-stream"), b"xyz").unwrap();
        assert_eq!(file.token, Token::placeholder(3));
        assert_eq!(file.object_id, Some(-3));
        assert_eq!(db.staged_content(&file.token).unwrap().unwrap(), b"xyz");
    }

    #[test]
    fn placeholder_numbers_are_never_reused() {
        let (mut db, _dir) = open_logged_in();
        let a = db.create(sample_document("a", "")).unwrap();
        db.remove(&a.token, Operation::New).unwrap();

        let b = db.create(sample_document("b", "")).unwrap();
        assert_eq!(b.token, Token::placeholder(2));
    }

    #[test]
    fn concurrent_creates_never_collide() {
        let (db, _dir) = open_logged_in();
        let db = Arc::new(Mutex::new(db));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|j| {
                            let mut db = db.lock().unwrap();
                            if j % 3 == 0 {
                                Token::placeholder(db.get_new_file_id().unwrap().unsigned_abs())
                            } else {
                                db.create(sample_document(&format!("{i}-{j}"), ""))
                                    .unwrap()
                                    .token
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<Token> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn placeholders_are_unique_across_handles() {
        let (db, dir) = open_logged_in();
        let path = db.path().unwrap();
        drop(db);

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut db = crate::test_support::login_at(&path);
                    (0..5)
                        .map(|j| db.create(sample_document(&format!("{i}{j}"), "")).unwrap().token)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<Token> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 15);
        drop(dir);
    }

    #[test]
    fn staged_header_and_prefix_are_sealed() {
        let (mut db, _dir) = open_logged_in();
        let entry = db.create(sample_document("quarterly payroll", "")).unwrap();

        let (prefix, header): (String, String) = db
            .conn()
            .query_row(
                "SELECT token_prefix, header_data FROM stage WHERE token = ?1",
                [entry.token.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!(!prefix.contains("DOC-"));
        assert!(!header.contains("payroll"));
        assert_eq!(open_prefix(&entry.token, &prefix).unwrap(), ContentKind::Document);
    }

    #[test]
    fn placeholder_modify_resnapshots_under_new() {
        let (mut db, _dir) = open_logged_in();
        let entry = db.create(sample_document("draft", "")).unwrap();

        let mut object = entry.object.into_object().unwrap();
        if let MirrorObject::Document(doc) = &mut object {
            doc.title = "final".into();
        }
        let updated = db.modify(object).unwrap();

        assert_eq!(updated.operation, Operation::New);
        let rows = db.get_staged_entries(&entry.token).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].object.as_object().unwrap().title(), "final");
    }

    #[test]
    fn edit_keeps_first_baseline() {
        let (mut db, _dir) = open_logged_in();
        let mirrored = mirrored_document("DOC-1", "v1", "");
        db.put_object(&mirrored).unwrap();
        let t0 = mirrored.date_modified();

        let first = db.modify(mirrored.clone()).unwrap();
        assert_eq!(first.operation, Operation::Edit);
        assert_eq!(first.date_modified, t0);

        let mut later = mirrored.clone();
        if let MirrorObject::Document(doc) = &mut later {
            doc.title = "v2".into();
            doc.date_modified = t0 + Duration::hours(1);
        }
        let second = db.modify(later).unwrap();
        assert_eq!(second.date_modified, t0);
        assert_eq!(second.object.as_object().unwrap().title(), "v2");
    }

    #[test]
    fn conflict_only_when_server_is_strictly_newer() {
        let (mut db, _dir) = open_logged_in();
        let mirrored = mirrored_document("DOC-1", "v1", "");
        db.put_object(&mirrored).unwrap();
        let t0 = mirrored.date_modified();
        db.modify(mirrored.clone()).unwrap();

        let token = mirrored.token().clone();
        assert!(!db.get_staged(&token).unwrap().unwrap().merge_conflict);

        let mut same = mirrored.clone();
        if let MirrorObject::Document(doc) = &mut same {
            doc.title = "server".into();
        }
        db.put_object(&same).unwrap();
        let entry = db.get_staged(&token).unwrap().unwrap();
        assert!(!entry.merge_conflict);
        assert_eq!(entry.sync_state(), SyncState::Ok);

        let mut newer = same.clone();
        if let MirrorObject::Document(doc) = &mut newer {
            doc.date_modified = t0 + Duration::milliseconds(1);
        }
        db.put_object(&newer).unwrap();
        let entry = db.get_staged(&token).unwrap().unwrap();
        assert!(entry.merge_conflict);
        assert_eq!(entry.sync_state(), SyncState::MergeConflict);
    }

    #[test]
    fn transactions_never_conflict_and_renumber() {
        let (mut db, _dir) = open_logged_in();
        let task = Token::new("TASK-9").unwrap();
        let t0 = normalize_timestamp(Utc::now());
        let tx = |change| TaskTransaction {
            task: task.clone(),
            change,
            date_modified: t0,
        };

        for p in ["PROJ-a", "PROJ-b", "PROJ-c"] {
            db.append_transaction(tx(TaskChange::Project(Token::new(p).unwrap())))
                .unwrap();
        }
        let status = db
            .append_transaction(tx(TaskChange::Status("done".into())))
            .unwrap();
        assert_eq!(status.operation, Operation::Status);

        db.put_object(&MirrorObject::Task(Task {
            token: task.clone(),
            title: "t".into(),
            body: String::new(),
            status: "open".into(),
            owner: None,
            subscribers: vec![],
            projects: vec![],
            date_modified: t0 + Duration::days(1),
        }))
        .unwrap();

        let entries = db.get_staged_entries(&task).unwrap();
        assert_eq!(
            entries.iter().map(|e| e.operation).collect::<Vec<_>>(),
            vec![
                Operation::Status,
                Operation::Project(1),
                Operation::Project(2),
                Operation::Project(3)
            ]
        );
        assert!(entries.iter().all(|e| !e.merge_conflict));

        assert!(db.remove(&task, Operation::Project(2)).unwrap());
        let entries = db.get_staged_entries(&task).unwrap();
        let projects: Vec<_> = entries
            .iter()
            .filter_map(|e| match &e.object {
                StagedObject::Transaction(TaskTransaction {
                    change: TaskChange::Project(p),
                    ..
                }) => Some((e.operation, p.as_str().to_string())),
                _ => None,
            })
            .collect();
        assert_eq!(
            projects,
            vec![
                (Operation::Project(1), "PROJ-a".to_string()),
                (Operation::Project(2), "PROJ-c".to_string())
            ]
        );

        let next = db
            .append_transaction(tx(TaskChange::Project(Token::new("PROJ-d").unwrap())))
            .unwrap();
        assert_eq!(next.operation, Operation::Project(3));
    }

    #[test]
    fn every_offline_comment_is_kept() {
        let (mut db, _dir) = open_logged_in();
        let task = Token::new("TASK-1").unwrap();
        let comment = |text: &str| TaskTransaction {
            task: task.clone(),
            change: TaskChange::Comment(text.into()),
            date_modified: Utc::now(),
        };

        for text in ["first", "second", "third"] {
            db.append_transaction(comment(text)).unwrap();
        }
        let entries = db.get_staged_entries(&task).unwrap();
        assert_eq!(entries.len(), 3);

        assert!(db.remove(&task, Operation::Comment(1)).unwrap());
        let texts: Vec<_> = db
            .get_staged_entries(&task)
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.object {
                StagedObject::Transaction(TaskTransaction {
                    change: TaskChange::Comment(text),
                    ..
                }) => Some((e.operation, text)),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                (Operation::Comment(1), "second".to_string()),
                (Operation::Comment(2), "third".to_string())
            ]
        );
    }

    #[test]
    fn transactions_reject_non_task_tokens() {
        let (mut db, _dir) = open_logged_in();
        let res = db.append_transaction(TaskTransaction {
            task: Token::new("DOC-1").unwrap(),
            change: TaskChange::Comment("hi".into()),
            date_modified: Utc::now(),
        });
        assert!(matches!(res, Err(StoreError::Unsupported(_))));
    }

    #[test]
    fn task_edit_subscribes_new_mentions() {
        let (mut db, _dir) = open_logged_in();
        let mut task = sample_task("{{user:USER-ada}} please look");
        if let MirrorObject::Task(t) = &mut task {
            t.token = Token::new("TASK-1").unwrap();
            t.subscribers = vec![Token::new("USER-bob").unwrap()];
        }
        db.put_object(&task).unwrap();

        if let MirrorObject::Task(t) = &mut task {
            t.body = "{{user:USER-ada}} {{user:USER-bob}} {{user:USER-cy}} {{user:USER-cy}}".into();
        }
        let entry = db.modify(task).unwrap();

        let MirrorObject::Task(staged) = entry.object.into_object().unwrap() else {
            panic!("expected a task");
        };
        let subs: Vec<_> = staged.subscribers.iter().map(Token::as_str).collect();
        // ada was already mentioned before the edit, bob is subscribed
        assert_eq!(subs, vec!["USER-bob", "USER-cy"]);
    }

    #[test]
    fn links_follow_the_body() {
        let (mut db, _dir) = open_logged_in();
        let entry = db
            .create(sample_document("a", "{{link:DOC-1}} {{link:DOC-2}}"))
            .unwrap();
        assert_eq!(db.linked_tokens(&entry.token).unwrap().len(), 2);

        let mut object = entry.object.into_object().unwrap();
        object.set_body("{{link:DOC-2}}".into());
        db.modify(object).unwrap();

        let linked = db.linked_tokens(&entry.token).unwrap();
        assert_eq!(linked, vec![Token::new("DOC-2").unwrap()]);
    }

    #[test]
    fn remove_edit_restores_mirror_links() {
        let (mut db, _dir) = open_logged_in();
        let mirrored = mirrored_document("DOC-5", "m", "{{link:DOC-1}}");
        db.put_object(&mirrored).unwrap();
        db.assign_token(mirrored.token(), &Token::new("DOC-1").unwrap())
            .unwrap();

        let mut edited = mirrored.clone();
        edited.set_body("{{link:DOC-2}}".into());
        db.modify(edited).unwrap();
        assert_eq!(
            db.linked_tokens(mirrored.token()).unwrap(),
            vec![Token::new("DOC-2").unwrap()]
        );

        assert!(db.remove(mirrored.token(), Operation::Edit).unwrap());
        assert_eq!(
            db.linked_tokens(mirrored.token()).unwrap(),
            vec![Token::new("DOC-1").unwrap()]
        );
        assert!(!db.remove(mirrored.token(), Operation::Edit).unwrap());
    }

    #[test]
    fn remove_new_drops_keywords_and_edges() {
        let (mut db, _dir) = open_logged_in();
        let entry = db
            .create(sample_document("zeppelin", "{{link:DOC-1}}"))
            .unwrap();
        assert_eq!(db.find_by_keyword("zeppelin").unwrap(), vec![entry.token.clone()]);

        db.remove(&entry.token, Operation::New).unwrap();
        assert!(db.find_by_keyword("zeppelin").unwrap().is_empty());
        assert!(db.linked_tokens(&entry.token).unwrap().is_empty());
        assert!(db.get_staged(&entry.token).unwrap().is_none());
    }

    #[test]
    fn removing_a_file_keeps_its_graph() {
        let (mut db, _dir) = open_logged_in();
        let file = db
            .create_with_content(sample_file("a.txt", "text/plain"), b"a")
            .unwrap();
        db.descend_token_from(&Token::new("DOC-1").unwrap(), &file.token)
            .unwrap();

        db.remove(&file.token, Operation::New).unwrap();
        assert!(db.staged_content(&file.token).unwrap().is_none());
        assert_eq!(db.parent_tokens(&file.token).unwrap().len(), 1);
    }

    #[test]
    fn freeze_toggles_every_row() {
        let (mut db, _dir) = open_logged_in();
        let entry = db.create(sample_document("a", "")).unwrap();
        assert!(!db.is_frozen(&entry.token).unwrap());

        assert_eq!(db.freeze(&entry.token, true).unwrap(), 1);
        assert!(db.is_frozen(&entry.token).unwrap());
        assert!(db.get_staged(&entry.token).unwrap().unwrap().frozen);

        // re-snapshotting does not thaw
        db.modify(entry.object.into_object().unwrap()).unwrap();
        assert!(db.is_frozen(&entry.token).unwrap());

        db.freeze(&entry.token, false).unwrap();
        assert!(!db.is_frozen(&entry.token).unwrap());
        assert!(!db.is_frozen(&Token::new("DOC-404").unwrap()).unwrap());
    }

    #[test]
    fn localized_edit_records_language() {
        let (mut db, _dir) = open_logged_in();
        let mirrored = mirrored_document("DOC-3", "Hello", "");
        db.put_object(&mirrored).unwrap();

        let entry = db.modify_localized(mirrored, "de").unwrap();
        assert_eq!(entry.language.as_deref(), Some("de"));
        let all = db.list_staged().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn payload_only_for_payload_kinds() {
        let (mut db, _dir) = open_logged_in();
        let doc = MirrorObject::Document(Document {
            token: Token::placeholder(0),
            title: "x".into(),
            body: String::new(),
            parent: None,
            date_modified: Utc::now(),
        });
        assert!(matches!(
            db.create_with_content(doc, b"nope"),
            Err(StoreError::Unsupported(_))
        ));
    }
}
