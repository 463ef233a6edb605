use serde::{Deserialize, Serialize};

use crate::constants::{PLACEHOLDER_DIGITS, PLACEHOLDER_PREFIX};
use crate::error::TokenError;

/// The kinds of content mirrored from the collaboration server.
///
/// Each kind owns a fixed token prefix; that prefix is the contract between
/// the store and its collaborators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Document,
    Task,
    File,
    Diagram,
    User,
    Project,
}

impl ContentKind {
    pub const ALL: [ContentKind; 6] = [
        ContentKind::Document,
        ContentKind::Task,
        ContentKind::File,
        ContentKind::Diagram,
        ContentKind::User,
        ContentKind::Project,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Document => "DOC-",
            Self::Task => "TASK-",
            Self::File => "FILE-",
            Self::Diagram => "DIAG-",
            Self::User => "USER-",
            Self::Project => "PROJ-",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }

    /// Mirror table holding authoritative copies of this kind.
    pub fn table(self) -> &'static str {
        match self {
            Self::Document => "documents",
            Self::Task => "tasks",
            Self::File => "files",
            Self::Diagram => "diagrams",
            Self::User => "users",
            Self::Project => "projects",
        }
    }

    /// Kinds whose objects carry a binary payload and a reserved object id.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::File | Self::Diagram)
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Document => "document",
            Self::Task => "task",
            Self::File => "file",
            Self::Diagram => "diagram",
            Self::User => "user",
            Self::Project => "project",
        };
        f.write_str(name)
    }
}

// Either a server-assigned `<PREFIX><id>` or a local `NEWTOKEN-<seq>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Result<Self, TokenError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(Self(value))
    }

    /// Placeholder for the given sequence number, zero-padded so that
    /// lexical and numeric ordering agree.
    pub fn placeholder(seq: u64) -> Self {
        Self(format!(
            "{PLACEHOLDER_PREFIX}{seq:0width$}",
            width = PLACEHOLDER_DIGITS
        ))
    }

    /// Server token for a kind and remote identifier.
    pub fn remote(kind: ContentKind, id: &str) -> Self {
        Self(format!("{}{}", kind.prefix(), id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn placeholder_seq(&self) -> Option<u64> {
        self.0.strip_prefix(PLACEHOLDER_PREFIX)?.parse().ok()
    }

    /// Content kind encoded in the prefix. Placeholders carry none.
    pub fn kind(&self) -> Option<ContentKind> {
        if self.is_placeholder() {
            return None;
        }
        ContentKind::ALL
            .into_iter()
            .find(|k| self.0.starts_with(k.prefix()))
    }

    pub fn expect_kind(&self) -> Result<ContentKind, TokenError> {
        self.kind()
            .ok_or_else(|| TokenError::UnknownKind(self.0.clone()))
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The class of secret used to unlock the stored keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuthFactor {
    /// No secret; degraded auto-logon mode. Unlocks the public key only.
    Public,
    /// Password-derived.
    Knowledge,
    /// OS-protected secret store.
    Ownership,
    /// Short-lived session factor; recovers keys like `Public`.
    Experience,
}

impl AuthFactor {
    /// Whether this factor can recover the private key.
    pub fn unlocks_private(self) -> bool {
        matches!(self, Self::Knowledge | Self::Ownership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_ordering_matches_numeric() {
        let nine = Token::placeholder(9);
        let ten = Token::placeholder(10);
        assert_eq!(nine.as_str(), "NEWTOKEN-0000000000000009");
        assert!(nine < ten);
        assert_eq!(ten.placeholder_seq(), Some(10));
    }

    #[test]
    fn test_kind_from_prefix() {
        let token = Token::remote(ContentKind::Task, "42");
        assert_eq!(token.as_str(), "TASK-42");
        assert_eq!(token.kind(), Some(ContentKind::Task));
        assert_eq!(Token::placeholder(1).kind(), None);
        assert!(Token::new("WHAT-1").unwrap().expect_kind().is_err());
    }

    #[test]
    fn test_empty_token_rejected() {
        assert_eq!(Token::new("  "), Err(TokenError::Empty));
    }

    #[test]
    fn test_factor_private_access() {
        assert!(AuthFactor::Knowledge.unlocks_private());
        assert!(AuthFactor::Ownership.unlocks_private());
        assert!(!AuthFactor::Public.unlocks_private());
        assert!(!AuthFactor::Experience.unlocks_private());
    }
}
