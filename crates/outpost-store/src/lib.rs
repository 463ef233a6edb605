//! # outpost-store
//!
//! Encrypted offline store for a disconnected mirror of a collaboration
//! server. Authoritative copies of server objects are mirrored locally;
//! local edits are staged in a journal and pushed back by [`SyncEngine`].
//!
//! Every sensitive column is encrypted field by field under keys unlocked at
//! login (see [`vault`]). The crate exposes a synchronous [`Database`]
//! handle wrapping a `rusqlite::Connection`; only synchronization is async.

pub mod chunks;
pub mod codec;
pub mod config;
pub mod database;
pub mod keywords;
pub mod markup;
pub mod migrations;
pub mod mirror;
pub mod models;
pub mod protector;
pub mod relations;
pub mod rewrite;
pub mod stage;
pub mod sync;
pub mod translations;
pub mod vault;

mod error;

pub use codec::{FieldCodec, FieldPolicy};
pub use config::StoreConfig;
pub use database::{Database, Session};
pub use error::{Result, StoreError};
pub use markup::{BraceMarkup, MarkupParser, ReferenceKind, ReferenceSpan};
pub use models::*;
pub use protector::{DeviceKeyProtector, SecretProtector};
pub use sync::{
    EntryOutcome, PushResult, RemoteClient, RemoteError, SyncEngine, SyncProgress, SyncReport,
};
