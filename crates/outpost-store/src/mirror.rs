//! Mirrored authoritative copies, one table per content kind.
//!
//! Rows are written by the synchronization layer as they arrive from the
//! server and are never edited locally; local edits go to the staging
//! journal. `date_modified` stays unencrypted so conflict checks and the
//! translation reconciliation pass run without decrypting anything.

use chrono::{DateTime, Utc};
use outpost_shared::{ContentKind, Token};
use rusqlite::{params, OptionalExtension};

use crate::codec::{format_timestamp, parse_timestamp, FieldPolicy};
use crate::database::{Database, Txn};
use crate::error::{Result, StoreError};
use crate::models::{FileSizeStats, MirrorObject};
use crate::stage::{attachments, keyword_text};

impl Txn<'_> {
    pub(crate) fn mirror_put(&self, object: &MirrorObject) -> Result<()> {
        let kind = object.kind();
        let token = object.token();
        if token.kind() != Some(kind) {
            return Err(StoreError::Unsupported(format!(
                "{token} cannot be mirrored as a {kind}"
            )));
        }

        let header = self
            .codec
            .write_str(&object.encode_header()?, FieldPolicy::Default)?;
        let modified = format_timestamp(object.date_modified());

        match object {
            MirrorObject::File(file) => {
                self.conn.execute(
                    "INSERT INTO files (token, date_modified, header, size, referenced)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(token) DO UPDATE SET
                        date_modified = excluded.date_modified,
                        header        = excluded.header,
                        size          = excluded.size,
                        referenced    = excluded.referenced",
                    params![token.as_str(), modified, header, file.size as i64, file.referenced],
                )?;
                self.file_sizes.invalidate();
            }
            _ => {
                let sql = format!(
                    "INSERT INTO {table} (token, date_modified, header) VALUES (?1, ?2, ?3)
                     ON CONFLICT(token) DO UPDATE SET
                        date_modified = excluded.date_modified,
                        header        = excluded.header",
                    table = kind.table()
                );
                self.conn
                    .execute(&sql, params![token.as_str(), modified, header])?;
            }
        }

        if !self.has_staged_snapshot(token)? {
            self.link_object(token, object)?;
            self.replace_keywords(token, &keyword_text(object))?;
            for attached in attachments(Some(object), self) {
                self.set_file_referenced(&attached, true)?;
            }
        }

        tracing::debug!(token = %token, %kind, "mirrored object stored");
        Ok(())
    }

    pub(crate) fn mirror_put_content(&self, token: &Token, content: &[u8]) -> Result<()> {
        let kind = token.expect_kind()?;
        if !kind.has_payload() {
            return Err(StoreError::Unsupported(format!("{kind} objects carry no payload")));
        }

        let raw = self.codec.write_bytes(content, FieldPolicy::Default)?;
        let affected = match kind {
            ContentKind::File => self.conn.execute(
                "UPDATE files SET content = ?1, size = ?2 WHERE token = ?3",
                params![raw, content.len() as i64, token.as_str()],
            )?,
            _ => self.conn.execute(
                &format!("UPDATE {} SET content = ?1 WHERE token = ?2", kind.table()),
                params![raw, token.as_str()],
            )?,
        };
        if affected == 0 {
            return Err(StoreError::Unsupported(format!(
                "{token} must be mirrored before its content"
            )));
        }
        if kind == ContentKind::File {
            self.file_sizes.invalidate();
        }
        Ok(())
    }

    pub(crate) fn mirror_get(&self, token: &Token) -> Result<Option<MirrorObject>> {
        let Some(kind) = token.kind() else {
            return Ok(None);
        };

        let row: Option<(String, Option<bool>)> = match kind {
            ContentKind::File => self
                .conn
                .query_row(
                    "SELECT header, referenced FROM files WHERE token = ?1",
                    params![token.as_str()],
                    |row| Ok((row.get(0)?, Some(row.get(1)?))),
                )
                .optional()?,
            _ => self
                .conn
                .query_row(
                    &format!("SELECT header FROM {} WHERE token = ?1", kind.table()),
                    params![token.as_str()],
                    |row| Ok((row.get(0)?, None)),
                )
                .optional()?,
        };

        let Some((header, referenced)) = row else {
            return Ok(None);
        };
        let json = self.codec.read_str(&header, FieldPolicy::Default)?;
        let mut object = MirrorObject::decode_header(kind, &json)?;
        // the column is updated in place by unmarking, the header is not
        if let (MirrorObject::File(file), Some(referenced)) = (&mut object, referenced) {
            file.referenced = referenced;
        }
        Ok(Some(object))
    }

    pub(crate) fn mirror_date_modified(&self, token: &Token) -> Result<Option<DateTime<Utc>>> {
        let Some(kind) = token.kind() else {
            return Ok(None);
        };
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT date_modified FROM {} WHERE token = ?1",
                    kind.table()
                ),
                params![token.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(parse_timestamp).transpose()
    }

    pub(crate) fn mirror_delete(&self, token: &Token) -> Result<bool> {
        let Some(kind) = token.kind() else {
            return Ok(false);
        };
        let affected = self.conn.execute(
            &format!("DELETE FROM {} WHERE token = ?1", kind.table()),
            params![token.as_str()],
        )?;
        if kind == ContentKind::File && affected > 0 {
            self.file_sizes.invalidate();
        }
        Ok(affected > 0)
    }

    pub(crate) fn mirror_set_referenced(&self, token: &Token, referenced: bool) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE files SET referenced = ?1 WHERE token = ?2",
            params![referenced, token.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Mirrored files cleared as unreferenced.
    pub(crate) fn mirror_unreferenced_files(&self) -> Result<Vec<Token>> {
        let mut stmt = self
            .conn
            .prepare("SELECT token FROM files WHERE referenced = 0 ORDER BY token")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(Token::new(row?)?);
        }
        Ok(tokens)
    }
}

impl Database {
    /// Store (or replace) the authoritative copy of an object.
    pub fn put_object(&mut self, object: &MirrorObject) -> Result<()> {
        self.write(|txn| txn.mirror_put(object))
    }

    pub fn get_object(&self, token: &Token) -> Result<Option<MirrorObject>> {
        self.view().mirror_get(token)
    }

    /// Drop the authoritative copy and its payload.
    pub fn delete_object(&mut self, token: &Token) -> Result<bool> {
        self.write(|txn| {
            let deleted = txn.mirror_delete(token)?;
            if deleted && !txn.has_staged_snapshot(token)? {
                txn.detach_relations(token)?;
                txn.delete_keywords(token)?;
                txn.conn.execute(
                    "DELETE FROM object_hierarchy WHERE token = ?1",
                    params![token.as_str()],
                )?;
            }
            Ok(deleted)
        })
    }

    pub fn list_objects(&self, kind: ContentKind) -> Result<Vec<MirrorObject>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT token FROM {} ORDER BY token",
            kind.table()
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let view = self.view();
        let mut objects = Vec::new();
        for row in rows {
            if let Some(object) = view.mirror_get(&Token::new(row?)?)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Attach the binary payload to a mirrored file or diagram.
    pub fn put_object_content(&mut self, token: &Token, content: &[u8]) -> Result<()> {
        self.view().mirror_put_content(token, content)
    }

    pub fn object_content(&self, token: &Token) -> Result<Option<Vec<u8>>> {
        let Some(kind) = token.kind().filter(|k| k.has_payload()) else {
            return Ok(None);
        };
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                &format!("SELECT content FROM {} WHERE token = ?1", kind.table()),
                params![token.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.flatten()
            .map(|raw| self.codec.read_bytes(&raw, FieldPolicy::Default))
            .transpose()
    }

    /// Authoritative modification time. Readable while locked.
    pub fn date_modified_of(&self, token: &Token) -> Result<Option<DateTime<Utc>>> {
        self.view().mirror_date_modified(token)
    }

    /// Size statistics over mirrored files; `None` when there are none.
    pub fn file_size_stats(&self) -> Result<Option<FileSizeStats>> {
        if let Some(stats) = self.file_sizes.get() {
            return Ok(stats);
        }

        let mut stmt = self.conn.prepare("SELECT size FROM files ORDER BY size")?;
        let sizes = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let stats = (!sizes.is_empty()).then(|| FileSizeStats {
            count: sizes.len(),
            min: sizes[0] as u64,
            median: sizes[sizes.len() / 2] as u64,
            max: sizes[sizes.len() - 1] as u64,
        });
        self.file_sizes.set(stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use crate::test_support::{mirrored_file, open_logged_in, sample_document};

    #[test]
    fn put_get_and_list() {
        let (mut db, _dir) = open_logged_in();
        let mut doc = sample_document("Plan", "body text");
        doc.set_token(Token::new("DOC-1").unwrap());
        db.put_object(&doc).unwrap();

        assert_eq!(db.get_object(doc.token()).unwrap().as_ref(), Some(&doc));
        assert_eq!(db.list_objects(ContentKind::Document).unwrap().len(), 1);
        assert!(db.list_objects(ContentKind::Task).unwrap().is_empty());
        assert_eq!(db.date_modified_of(doc.token()).unwrap(), Some(doc.date_modified()));

        assert!(db.get_object(&Token::new("DOC-404").unwrap()).unwrap().is_none());
        assert!(db.get_object(&Token::placeholder(1)).unwrap().is_none());
    }

    #[test]
    fn header_is_encrypted_at_rest() {
        let (mut db, _dir) = open_logged_in();
        let doc = MirrorObject::Document(Document {
            token: Token::new("DOC-2").unwrap(),
            title: "payroll".into(),
            body: String::new(),
            parent: None,
            date_modified: crate::codec::normalize_timestamp(Utc::now()),
        });
        db.put_object(&doc).unwrap();

        let raw: String = db
            .conn()
            .query_row("SELECT header FROM documents", [], |r| r.get(0))
            .unwrap();
        assert!(!raw.contains("payroll"));
    }

    #[test]
    fn prefix_must_match_kind() {
        let (mut db, _dir) = open_logged_in();
        let mut doc = sample_document("x", "");
        doc.set_token(Token::new("TASK-1").unwrap());
        assert!(matches!(db.put_object(&doc), Err(StoreError::Unsupported(_))));
    }

    #[test]
    fn content_round_trip_and_size_cache() {
        let (mut db, _dir) = open_logged_in();
        assert_eq!(db.file_size_stats().unwrap(), None);

        for (id, len) in [("FILE-a", 10usize), ("FILE-b", 30), ("FILE-c", 20)] {
            let file = mirrored_file(id);
            db.put_object(&file).unwrap();
            db.put_object_content(file.token(), &vec![7u8; len]).unwrap();
        }

        let stats = db.file_size_stats().unwrap().unwrap();
        assert_eq!((stats.count, stats.min, stats.median, stats.max), (3, 10, 20, 30));

        let token = Token::new("FILE-b").unwrap();
        assert_eq!(db.object_content(&token).unwrap().unwrap().len(), 30);

        db.delete_object(&token).unwrap();
        let stats = db.file_size_stats().unwrap().unwrap();
        assert_eq!((stats.count, stats.max), (2, 20));
    }

    #[test]
    fn content_needs_payload_kind_and_row() {
        let (mut db, _dir) = open_logged_in();
        assert!(db
            .put_object_content(&Token::new("DOC-1").unwrap(), b"x")
            .is_err());
        assert!(db
            .put_object_content(&Token::new("FILE-missing").unwrap(), b"x")
            .is_err());
    }
}
