//! Per-token keyword entries.
//!
//! A stand-in for the external full-text indexer: just enough to look a word
//! up and to drop a token's entries when its staged edit goes away. Words are
//! stored as digests keyed by the public key.

use outpost_shared::{crypto, Token};
use rusqlite::params;

use crate::database::{Database, Txn};
use crate::error::{Result, StoreError};

const MIN_WORD_LEN: usize = 3;

fn words(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        .map(str::to_lowercase)
        .collect();
    out.sort();
    out.dedup();
    out
}

impl Txn<'_> {
    fn keyword_key(&self) -> Result<crypto::SymmetricKey> {
        self.codec
            .keys()
            .map(|k| k.public)
            .ok_or(StoreError::NotLoggedIn)
    }

    pub(crate) fn replace_keywords(&self, token: &Token, text: &str) -> Result<usize> {
        let key = self.keyword_key()?;
        self.delete_keywords(token)?;

        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR IGNORE INTO keywords (token, word) VALUES (?1, ?2)")?;
        let words = words(text);
        for word in &words {
            stmt.execute(params![token.as_str(), crypto::keyword_digest(&key, word)])?;
        }
        Ok(words.len())
    }

    pub(crate) fn delete_keywords(&self, token: &Token) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM keywords WHERE token = ?1", params![token.as_str()])?)
    }

    pub(crate) fn rename_keywords(&self, old: &Token, new: &Token) -> Result<()> {
        self.conn.execute(
            "UPDATE OR IGNORE keywords SET token = ?1 WHERE token = ?2",
            params![new.as_str(), old.as_str()],
        )?;
        self.delete_keywords(old)?;
        Ok(())
    }
}

impl Database {
    /// Tokens indexed under `word`.
    pub fn find_by_keyword(&self, word: &str) -> Result<Vec<Token>> {
        let key = self.view().keyword_key()?;
        let mut stmt = self
            .conn
            .prepare("SELECT token FROM keywords WHERE word = ?1 ORDER BY token")?;
        let rows = stmt.query_map(params![crypto::keyword_digest(&key, word)], |row| {
            row.get::<_, String>(0)
        })?;

        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(Token::new(row?)?);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_split_and_deduplicated() {
        assert_eq!(
            words("The plan, the PLAN; a b {{link:DOC-1}}"),
            vec!["doc", "link", "plan", "the"]
        );
    }
}
