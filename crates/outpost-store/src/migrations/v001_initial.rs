//! v001 -- Initial schema creation.
//!
//! Creates the account, staging, chunk, graph and translation tables plus one
//! mirror table per content kind.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Account (keys are never stored, only XOR masks)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS account (
    token        TEXT PRIMARY KEY NOT NULL,   -- login hash, unencrypted
    user_name    TEXT NOT NULL,               -- Default policy
    url          TEXT NOT NULL,               -- Default policy
    api          TEXT NOT NULL,               -- Private policy
    public_mask  TEXT NOT NULL,               -- hex
    private_mask TEXT,                        -- hex
    dpapi_mask1  TEXT,                        -- base64, sealed by the protector
    dpapi_mask2  TEXT,
    theme        TEXT NOT NULL DEFAULT '',
    parameters   TEXT NOT NULL                -- Default policy, JSON
);

-- ----------------------------------------------------------------
-- Staging journal
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS stage (
    token         TEXT NOT NULL,
    token_prefix  TEXT NOT NULL,              -- kind prefix sealed by the token
    object_id     INTEGER,                    -- negative reservation
    operation     TEXT NOT NULL,
    date_modified TEXT NOT NULL,              -- baseline, unencrypted
    header_data   TEXT NOT NULL,
    content_data  TEXT,
    frozen        INTEGER NOT NULL DEFAULT 0,
    language      TEXT,
    PRIMARY KEY (token, operation)
);

CREATE INDEX IF NOT EXISTS idx_stage_object_id ON stage(object_id);

-- ----------------------------------------------------------------
-- Placeholder high-water mark (sequence numbers are never reused)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sequence (
    name  TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Upload chunks (chunk = -1 marks an id reservation)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS file_chunk (
    id            INTEGER NOT NULL,
    chunk         INTEGER NOT NULL,
    total_chunks  INTEGER NOT NULL,
    date_modified TEXT NOT NULL,
    data          TEXT NOT NULL,
    PRIMARY KEY (id, chunk)
);

-- ----------------------------------------------------------------
-- Object graph
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS object_relation (
    token        TEXT NOT NULL,
    linked_token TEXT NOT NULL,
    PRIMARY KEY (token, linked_token)
);

CREATE INDEX IF NOT EXISTS idx_relation_linked ON object_relation(linked_token);

CREATE TABLE IF NOT EXISTS object_hierarchy (
    token        TEXT NOT NULL,
    parent_token TEXT NOT NULL,
    PRIMARY KEY (token, parent_token)
);

CREATE INDEX IF NOT EXISTS idx_hierarchy_parent ON object_hierarchy(parent_token);

-- ----------------------------------------------------------------
-- Translations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS translation (
    token         TEXT NOT NULL,
    language      TEXT NOT NULL,
    title         TEXT NOT NULL,
    translation   TEXT NOT NULL,
    reviewed      INTEGER NOT NULL DEFAULT 0,
    date_modified TEXT NOT NULL,
    PRIMARY KEY (token, language)
);

-- ----------------------------------------------------------------
-- Keyword index entries
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS keywords (
    token TEXT NOT NULL,
    word  TEXT NOT NULL,                      -- keyed digest, never the word
    PRIMARY KEY (token, word)
);

CREATE INDEX IF NOT EXISTS idx_keywords_word ON keywords(word);

-- ----------------------------------------------------------------
-- Mirrored authoritative copies
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS documents (
    token         TEXT PRIMARY KEY NOT NULL,
    date_modified TEXT NOT NULL,
    header        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    token         TEXT PRIMARY KEY NOT NULL,
    date_modified TEXT NOT NULL,
    header        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    token         TEXT PRIMARY KEY NOT NULL,
    date_modified TEXT NOT NULL,
    header        TEXT NOT NULL,
    content       TEXT,
    size          INTEGER NOT NULL DEFAULT 0,
    referenced    INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS diagrams (
    token         TEXT PRIMARY KEY NOT NULL,
    date_modified TEXT NOT NULL,
    header        TEXT NOT NULL,
    content       TEXT
);

CREATE TABLE IF NOT EXISTS users (
    token         TEXT PRIMARY KEY NOT NULL,
    date_modified TEXT NOT NULL,
    header        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    token         TEXT PRIMARY KEY NOT NULL,
    date_modified TEXT NOT NULL,
    header        TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
