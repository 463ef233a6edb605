//! Object graph: reference edges and the parent/child hierarchy.
//!
//! `object_relation(token, linked_token)` reads "token references
//! linked_token"; `object_hierarchy(token, parent_token)` reads "token is
//! nested under parent_token". Both are deduplicated by primary key.

use outpost_shared::{ContentKind, Token};
use rusqlite::params;
use tracing::info;

use crate::database::{Database, Txn};
use crate::error::Result;
use crate::models::{MirrorObject, StagedObject};

impl Txn<'_> {
    pub(crate) fn assign_token(&self, token: &Token, linked: &Token) -> Result<bool> {
        if token == linked {
            return Ok(false);
        }
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO object_relation (token, linked_token) VALUES (?1, ?2)",
            params![token.as_str(), linked.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub(crate) fn descend_token_from(&self, parent: &Token, child: &Token) -> Result<bool> {
        if parent == child {
            return Ok(false);
        }
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO object_hierarchy (token, parent_token) VALUES (?1, ?2)",
            params![child.as_str(), parent.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Drop every outgoing reference edge of `token`.
    pub(crate) fn detach_relations(&self, token: &Token) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM object_relation WHERE token = ?1",
            params![token.as_str()],
        )?)
    }

    /// Replace the outgoing reference edges and the parent edge of `token`
    /// with the ones `object` carries.
    pub(crate) fn link_object(&self, token: &Token, object: &MirrorObject) -> Result<()> {
        self.detach_relations(token)?;
        if let Some(body) = object.body() {
            for span in self.markup.references(body) {
                self.assign_token(token, &span.token)?;
            }
        }
        if let MirrorObject::Document(doc) = object {
            self.conn.execute(
                "DELETE FROM object_hierarchy WHERE token = ?1",
                params![token.as_str()],
            )?;
            if let Some(parent) = &doc.parent {
                self.descend_token_from(parent, token)?;
            }
        }
        Ok(())
    }

    /// Whether a `new` or `edit` snapshot of `token` is staged; its edges
    /// then take precedence over the mirrored copy's.
    pub(crate) fn has_staged_snapshot(&self, token: &Token) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM stage WHERE token = ?1 AND operation IN ('new', 'edit'))",
            params![token.as_str()],
            |row| row.get(0),
        )?)
    }

    fn tokens(&self, sql: &str, token: &Token) -> Result<Vec<Token>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![token.as_str()], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(Token::new(row?)?);
        }
        Ok(out)
    }

    /// Tokens that `token` references.
    pub(crate) fn linked_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.tokens(
            "SELECT linked_token FROM object_relation WHERE token = ?1 ORDER BY linked_token",
            token,
        )
    }

    /// Tokens whose objects reference `token`.
    pub(crate) fn dependent_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.tokens(
            "SELECT token FROM object_relation WHERE linked_token = ?1 ORDER BY token",
            token,
        )
    }

    pub(crate) fn parent_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.tokens(
            "SELECT parent_token FROM object_hierarchy WHERE token = ?1 ORDER BY parent_token",
            token,
        )
    }

    pub(crate) fn child_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.tokens(
            "SELECT token FROM object_hierarchy WHERE parent_token = ?1 ORDER BY token",
            token,
        )
    }

    fn resolve_all(&self, tokens: Vec<Token>) -> Result<Vec<MirrorObject>> {
        let mut objects = Vec::with_capacity(tokens.len());
        for token in tokens {
            if let Some(object) = self.resolve_object(&token)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Files with the reference flag cleared, staged or mirrored.
    fn unreferenced_files(&self) -> Result<Vec<Token>> {
        let mut candidates = self.mirror_unreferenced_files()?;
        for entry in self.query_all_snapshots()? {
            if let StagedObject::Object(MirrorObject::File(file)) = &entry.object {
                if !file.referenced && !candidates.contains(&entry.token) {
                    candidates.push(entry.token.clone());
                }
            }
        }
        Ok(candidates)
    }

    pub(crate) fn cleanup_orphan_files(&self) -> Result<Vec<Token>> {
        let mut removed = Vec::new();
        for token in self.unreferenced_files()? {
            if !self.dependent_tokens(&token)?.is_empty() {
                continue;
            }

            self.conn.execute(
                "DELETE FROM stage WHERE token = ?1",
                params![token.as_str()],
            )?;
            if token.kind() == Some(ContentKind::File) {
                self.mirror_delete(&token)?;
            }
            self.conn.execute(
                "DELETE FROM object_hierarchy WHERE token = ?1 OR parent_token = ?1",
                params![token.as_str()],
            )?;
            self.detach_relations(&token)?;
            self.delete_keywords(&token)?;
            removed.push(token);
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "orphan files removed");
        }
        Ok(removed)
    }
}

impl Database {
    /// Record that `token` references `linked`.
    pub fn assign_token(&mut self, token: &Token, linked: &Token) -> Result<bool> {
        self.view().assign_token(token, linked)
    }

    /// Record that `child` is nested under `parent`.
    pub fn descend_token_from(&mut self, parent: &Token, child: &Token) -> Result<bool> {
        self.view().descend_token_from(parent, child)
    }

    pub fn detach_relations(&mut self, token: &Token) -> Result<usize> {
        self.view().detach_relations(token)
    }

    pub fn linked_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.view().linked_tokens(token)
    }

    pub fn dependent_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.view().dependent_tokens(token)
    }

    pub fn parent_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.view().parent_tokens(token)
    }

    pub fn child_tokens(&self, token: &Token) -> Result<Vec<Token>> {
        self.view().child_tokens(token)
    }

    /// Objects referencing `token`, staged edits taking precedence over the
    /// mirror.
    pub fn get_dependent_objects(&self, token: &Token) -> Result<Vec<MirrorObject>> {
        let view = self.view();
        view.resolve_all(view.dependent_tokens(token)?)
    }

    /// Objects `token` references.
    pub fn get_referenced_objects(&self, token: &Token) -> Result<Vec<MirrorObject>> {
        let view = self.view();
        view.resolve_all(view.linked_tokens(token)?)
    }

    pub fn get_child_objects(&self, token: &Token) -> Result<Vec<MirrorObject>> {
        let view = self.view();
        view.resolve_all(view.child_tokens(token)?)
    }

    /// Delete files that are flagged unreferenced and have no inbound
    /// reference edge, from both the journal and the mirror.
    pub fn cleanup_orphan_files(&mut self) -> Result<Vec<Token>> {
        self.write(|txn| txn.cleanup_orphan_files())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operation;
    use crate::test_support::{
        mirrored_document, mirrored_file, open_logged_in, sample_document, sample_file,
    };

    #[test]
    fn edges_are_deduplicated() {
        let (mut db, _dir) = open_logged_in();
        let a = Token::new("DOC-a").unwrap();
        let b = Token::new("DOC-b").unwrap();

        assert!(db.assign_token(&a, &b).unwrap());
        assert!(!db.assign_token(&a, &b).unwrap());
        assert!(!db.assign_token(&a, &a).unwrap());
        assert_eq!(db.dependent_tokens(&b).unwrap(), vec![a.clone()]);

        assert!(db.descend_token_from(&a, &b).unwrap());
        assert!(!db.descend_token_from(&a, &b).unwrap());
        assert_eq!(db.child_tokens(&a).unwrap(), vec![b.clone()]);
        assert_eq!(db.parent_tokens(&b).unwrap(), vec![a]);
    }

    #[test]
    fn staged_edits_win_over_mirror() {
        let (mut db, _dir) = open_logged_in();
        let target = mirrored_document("DOC-t", "target", "");
        let source = mirrored_document("DOC-s", "mirror title", "{{link:DOC-t}}");
        db.put_object(&target).unwrap();
        db.put_object(&source).unwrap();
        db.assign_token(source.token(), target.token()).unwrap();

        let mut edited = source.clone();
        if let MirrorObject::Document(doc) = &mut edited {
            doc.title = "staged title".into();
        }
        db.modify(edited).unwrap();

        let dependents = db.get_dependent_objects(target.token()).unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].title(), "staged title");

        let referenced = db.get_referenced_objects(source.token()).unwrap();
        assert_eq!(referenced[0].title(), "target");
    }

    #[test]
    fn placeholder_children_resolve_through_journal() {
        let (mut db, _dir) = open_logged_in();
        let parent = mirrored_document("DOC-p", "parent", "");
        db.put_object(&parent).unwrap();

        let mut child = sample_document("child", "");
        if let MirrorObject::Document(doc) = &mut child {
            doc.parent = Some(parent.token().clone());
        }
        let child = db.create(child).unwrap();

        let children = db.get_child_objects(parent.token()).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].token(), &child.token);
    }

    #[test]
    fn cascade_cleanup_after_last_reference_goes() {
        let (mut db, _dir) = open_logged_in();
        let file = db
            .create_with_content(sample_file("a.png", "image/png"), b"not really a png")
            .unwrap();

        let body = format!("see {{{{file:{}}}}}", file.token);
        let doc = db.create(sample_document("doc", &body)).unwrap();
        assert_eq!(db.dependent_tokens(&file.token).unwrap(), vec![doc.token.clone()]);

        // still referenced
        assert!(db.cleanup_orphan_files().unwrap().is_empty());

        db.remove(&doc.token, Operation::New).unwrap();
        let staged_file = db.get_staged(&file.token).unwrap().unwrap();
        let MirrorObject::File(f) = staged_file.object.into_object().unwrap() else {
            panic!("expected a file");
        };
        assert!(!f.referenced);

        assert_eq!(db.cleanup_orphan_files().unwrap(), vec![file.token.clone()]);
        assert!(db
            .list_staged()
            .unwrap()
            .iter()
            .all(|e| e.token != file.token));
    }

    #[test]
    fn cleanup_keeps_files_with_inbound_edges() {
        let (mut db, _dir) = open_logged_in();
        let file = mirrored_file("FILE-1");
        db.put_object(&file).unwrap();

        let a = db
            .create(sample_document("a", "{{file:FILE-1}}"))
            .unwrap();
        let b = db
            .create(sample_document("b", "{{file:FILE-1}}"))
            .unwrap();

        db.remove(&a.token, Operation::New).unwrap();
        assert!(db.cleanup_orphan_files().unwrap().is_empty());
        assert!(db.get_object(file.token()).unwrap().is_some());

        db.remove(&b.token, Operation::New).unwrap();
        assert_eq!(db.cleanup_orphan_files().unwrap(), vec![file.token().clone()]);
        assert!(db.get_object(file.token()).unwrap().is_none());
        assert!(db.file_size_stats().unwrap().is_none());
    }

    #[test]
    fn mirrored_attachment_survives_removed_draft() {
        let (mut db, _dir) = open_logged_in();
        let file = mirrored_file("FILE-1");
        db.put_object(&file).unwrap();
        db.put_object_content(file.token(), b"diagram bytes").unwrap();
        let doc = mirrored_document("DOC-1", "spec", "{{file:FILE-1}}");
        db.put_object(&doc).unwrap();
        assert_eq!(db.dependent_tokens(file.token()).unwrap(), vec![doc.token().clone()]);

        let draft = db
            .create(sample_document("draft", "{{file:FILE-1}}"))
            .unwrap();
        db.remove(&draft.token, Operation::New).unwrap();

        assert!(db.cleanup_orphan_files().unwrap().is_empty());
        assert!(db.get_object(file.token()).unwrap().is_some());
        assert_eq!(
            db.object_content(file.token()).unwrap().as_deref(),
            Some(&b"diagram bytes"[..])
        );

        // once the mirrored document goes, the file is an orphan again
        db.delete_object(doc.token()).unwrap();
        assert!(db.dependent_tokens(file.token()).unwrap().is_empty());
    }
}
