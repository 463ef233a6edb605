//! # outpost-shared
//!
//! Types and primitives shared by every Outpost crate: token and content-kind
//! definitions, authentication factors, and the symmetric crypto used to
//! protect persisted fields.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{CryptoError, TokenError};
pub use types::{AuthFactor, ContentKind, Token};
