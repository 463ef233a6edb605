//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer. Snapshots are stored as kind-specific JSON; the
//! kind itself travels separately (token prefix or the staged entry's sealed
//! prefix) and is decoded once at the boundary into [`MirrorObject`].

use chrono::{DateTime, Utc};
use outpost_shared::{ContentKind, Token};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// Mirrored objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub token: Token,
    pub title: String,
    /// Markup body; references other objects by token.
    pub body: String,
    /// Parent document, if nested.
    pub parent: Option<Token>,
    pub date_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub token: Token,
    pub title: String,
    pub body: String,
    pub status: String,
    pub owner: Option<Token>,
    /// Users notified about changes.
    pub subscribers: Vec<Token>,
    pub projects: Vec<Token>,
    pub date_modified: DateTime<Utc>,
}

/// File metadata. The payload lives in the content column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileObject {
    pub token: Token,
    /// Negative reservation number while the file is local only.
    pub object_id: i64,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Cleared when the last body attaching the file drops it; unreferenced
    /// files without inbound edges are removed by orphan cleanup.
    pub referenced: bool,
    pub date_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagram {
    pub token: Token,
    pub object_id: i64,
    pub title: String,
    pub date_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub token: Token,
    pub name: String,
    pub email: Option<String>,
    pub date_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub token: Token,
    pub name: String,
    pub date_modified: DateTime<Utc>,
}

/// Any mirrored object, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MirrorObject {
    Document(Document),
    Task(Task),
    File(FileObject),
    Diagram(Diagram),
    User(User),
    Project(Project),
}

impl MirrorObject {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Document(_) => ContentKind::Document,
            Self::Task(_) => ContentKind::Task,
            Self::File(_) => ContentKind::File,
            Self::Diagram(_) => ContentKind::Diagram,
            Self::User(_) => ContentKind::User,
            Self::Project(_) => ContentKind::Project,
        }
    }

    pub fn token(&self) -> &Token {
        match self {
            Self::Document(o) => &o.token,
            Self::Task(o) => &o.token,
            Self::File(o) => &o.token,
            Self::Diagram(o) => &o.token,
            Self::User(o) => &o.token,
            Self::Project(o) => &o.token,
        }
    }

    pub fn set_token(&mut self, token: Token) {
        match self {
            Self::Document(o) => o.token = token,
            Self::Task(o) => o.token = token,
            Self::File(o) => o.token = token,
            Self::Diagram(o) => o.token = token,
            Self::User(o) => o.token = token,
            Self::Project(o) => o.token = token,
        }
    }

    pub fn date_modified(&self) -> DateTime<Utc> {
        match self {
            Self::Document(o) => o.date_modified,
            Self::Task(o) => o.date_modified,
            Self::File(o) => o.date_modified,
            Self::Diagram(o) => o.date_modified,
            Self::User(o) => o.date_modified,
            Self::Project(o) => o.date_modified,
        }
    }

    /// Markup body, for kinds that have one.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Document(o) => Some(&o.body),
            Self::Task(o) => Some(&o.body),
            _ => None,
        }
    }

    pub fn set_body(&mut self, body: String) {
        match self {
            Self::Document(o) => o.body = body,
            Self::Task(o) => o.body = body,
            _ => {}
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Document(o) => &o.title,
            Self::Task(o) => &o.title,
            Self::File(o) => &o.name,
            Self::Diagram(o) => &o.title,
            Self::User(o) => &o.name,
            Self::Project(o) => &o.name,
        }
    }

    pub fn object_id(&self) -> Option<i64> {
        match self {
            Self::File(o) => Some(o.object_id),
            Self::Diagram(o) => Some(o.object_id),
            _ => None,
        }
    }

    pub fn set_object_id(&mut self, id: i64) {
        match self {
            Self::File(o) => o.object_id = id,
            Self::Diagram(o) => o.object_id = id,
            _ => {}
        }
    }

    /// Serialize without the kind tag.
    pub fn encode_header(&self) -> Result<String> {
        let json = match self {
            Self::Document(o) => serde_json::to_string(o)?,
            Self::Task(o) => serde_json::to_string(o)?,
            Self::File(o) => serde_json::to_string(o)?,
            Self::Diagram(o) => serde_json::to_string(o)?,
            Self::User(o) => serde_json::to_string(o)?,
            Self::Project(o) => serde_json::to_string(o)?,
        };
        Ok(json)
    }

    pub fn decode_header(kind: ContentKind, json: &str) -> Result<Self> {
        let object = match kind {
            ContentKind::Document => Self::Document(serde_json::from_str(json)?),
            ContentKind::Task => Self::Task(serde_json::from_str(json)?),
            ContentKind::File => Self::File(serde_json::from_str(json)?),
            ContentKind::Diagram => Self::Diagram(serde_json::from_str(json)?),
            ContentKind::User => Self::User(serde_json::from_str(json)?),
            ContentKind::Project => Self::Project(serde_json::from_str(json)?),
        };
        Ok(object)
    }
}

// ---------------------------------------------------------------------------
// Field-level transactions
// ---------------------------------------------------------------------------

/// A single-field change to a task. Transactions touch independent fields,
/// so they never conflict with each other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "field", content = "value", rename_all = "lowercase")]
pub enum TaskChange {
    Status(String),
    Owner(Token),
    Project(Token),
    Subscriber(Token),
    Comment(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTransaction {
    pub task: Token,
    pub change: TaskChange,
    pub date_modified: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Journal operation; together with the token it forms the primary key.
/// Ordered snapshots first, then transactions with series in index order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    New,
    Edit,
    Status,
    Owner,
    /// `project-<n>`, 1-based and kept contiguous per token.
    Project(u32),
    /// `subscriber-<n>`, 1-based and kept contiguous per token.
    Subscriber(u32),
    /// `comment-<n>`; every offline comment is its own row.
    Comment(u32),
}

impl Operation {
    pub fn is_transaction(self) -> bool {
        !matches!(self, Self::New | Self::Edit)
    }

    pub fn is_snapshot(self) -> bool {
        matches!(self, Self::New | Self::Edit)
    }

    /// Position within an indexed series.
    pub fn index(self) -> Option<u32> {
        match self {
            Self::Project(n) | Self::Subscriber(n) | Self::Comment(n) => Some(n),
            _ => None,
        }
    }

    /// Same operation with a different series index.
    pub fn with_index(self, n: u32) -> Self {
        match self {
            Self::Project(_) => Self::Project(n),
            Self::Subscriber(_) => Self::Subscriber(n),
            Self::Comment(_) => Self::Comment(n),
            other => other,
        }
    }

    /// SQL `LIKE` pattern matching every member of this operation's series.
    pub fn series_pattern(self) -> Option<&'static str> {
        match self {
            Self::Project(_) => Some("project-%"),
            Self::Subscriber(_) => Some("subscriber-%"),
            Self::Comment(_) => Some("comment-%"),
            _ => None,
        }
    }

    /// Operation tag for a transaction, given the next free series index.
    pub fn for_change(change: &TaskChange, next_index: u32) -> Self {
        match change {
            TaskChange::Status(_) => Self::Status,
            TaskChange::Owner(_) => Self::Owner,
            TaskChange::Project(_) => Self::Project(next_index),
            TaskChange::Subscriber(_) => Self::Subscriber(next_index),
            TaskChange::Comment(_) => Self::Comment(next_index),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Edit => f.write_str("edit"),
            Self::Status => f.write_str("status"),
            Self::Owner => f.write_str("owner"),
            Self::Project(n) => write!(f, "project-{n}"),
            Self::Subscriber(n) => write!(f, "subscriber-{n}"),
            Self::Comment(n) => write!(f, "comment-{n}"),
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = match s {
            "new" => Some(Self::New),
            "edit" => Some(Self::Edit),
            "status" => Some(Self::Status),
            "owner" => Some(Self::Owner),
            other => {
                let series = |prefix: &str| other.strip_prefix(prefix)?.parse::<u32>().ok();
                series("project-")
                    .map(Self::Project)
                    .or_else(|| series("subscriber-").map(Self::Subscriber))
                    .or_else(|| series("comment-").map(Self::Comment))
            }
        };
        parsed.ok_or_else(|| StoreError::Unsupported(format!("unknown operation '{s}'")))
    }
}

/// The snapshot recorded by a journal row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StagedObject {
    Object(MirrorObject),
    Transaction(TaskTransaction),
}

impl StagedObject {
    pub fn as_object(&self) -> Option<&MirrorObject> {
        match self {
            Self::Object(o) => Some(o),
            Self::Transaction(_) => None,
        }
    }

    pub fn into_object(self) -> Option<MirrorObject> {
        match self {
            Self::Object(o) => Some(o),
            Self::Transaction(_) => None,
        }
    }
}

/// A pending local edit, as listed for synchronization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagedEntry {
    pub token: Token,
    pub kind: ContentKind,
    pub object_id: Option<i64>,
    pub operation: Operation,
    /// Baseline: the authoritative `date_modified` the edit started from.
    pub date_modified: DateTime<Utc>,
    pub object: StagedObject,
    pub frozen: bool,
    /// `None` for the language-neutral master edit.
    pub language: Option<String>,
    pub merge_conflict: bool,
}

impl StagedEntry {
    pub fn sync_state(&self) -> SyncState {
        if self.merge_conflict {
            SyncState::MergeConflict
        } else {
            SyncState::Ok
        }
    }
}

/// Coarse per-entry outcome surfaced at the synchronization boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "detail")]
pub enum SyncState {
    Ok,
    MergeConflict,
    Error(String),
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::MergeConflict => f.write_str("MERGE-CONFLICT"),
            Self::Error(_) => f.write_str("ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Input for first-run account creation.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    pub url: String,
    pub api_credential: String,
    pub theme: String,
    pub parameters: serde_json::Value,
}

/// Decrypted, non-secret view of the logged-in account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountInfo {
    pub username: String,
    pub url: String,
    pub theme: String,
    pub parameters: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Translation {
    pub token: Token,
    pub language: String,
    pub title: String,
    pub body: String,
    pub reviewed: bool,
    /// Snapshot time of the master object this translation was made from.
    pub date_modified: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

/// One fragment of a chunked upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkUpload {
    /// Negative reservation number from [`crate::Database::get_new_file_id`].
    pub file_id: i64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Base64 fragment.
    pub data: String,
    pub file_name: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending { received: u32, total: u32 },
    /// This call completed the set and staged the file.
    Complete { token: Token },
    /// The set was already consumed by an earlier completion.
    AlreadyComplete { token: Token },
}

/// Cached file-size statistics over mirrored files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSizeStats {
    pub count: usize,
    pub min: u64,
    pub median: u64,
    pub max: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_tags_parse_back() {
        for op in [
            Operation::New,
            Operation::Edit,
            Operation::Status,
            Operation::Owner,
            Operation::Project(3),
            Operation::Subscriber(12),
            Operation::Comment(1),
        ] {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert!("project-x".parse::<Operation>().is_err());
        assert!("delete".parse::<Operation>().is_err());
        assert!("comment".parse::<Operation>().is_err());
    }

    #[test]
    fn header_is_decoded_by_kind() {
        let doc = MirrorObject::Document(Document {
            token: Token::placeholder(1),
            title: "Plan".into(),
            body: "body".into(),
            parent: None,
            date_modified: Utc::now(),
        });
        let json = doc.encode_header().unwrap();
        assert!(!json.contains("\"kind\""));
        assert_eq!(
            MirrorObject::decode_header(ContentKind::Document, &json).unwrap(),
            doc
        );
        assert!(MirrorObject::decode_header(ContentKind::File, &json).is_err());
    }

    #[test]
    fn sync_state_labels() {
        assert_eq!(SyncState::Ok.to_string(), "OK");
        assert_eq!(SyncState::MergeConflict.to_string(), "MERGE-CONFLICT");
        assert_eq!(SyncState::Error("boom".into()).to_string(), "ERROR");
    }
}
