//! Field-level encryption.
//!
//! Every persisted value goes through a [`FieldCodec`] under a
//! [`FieldPolicy`]. Encrypted values are stored as base64 text of
//! `nonce || ciphertext`; unencrypted values are stored as plain text so they
//! stay queryable while the vault is locked.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDateTime, Utc};
use outpost_shared::constants::TIMESTAMP_FORMAT;
use outpost_shared::crypto::{self, SymmetricKey};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};

/// Declared sensitivity of a persisted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Lookup keys and tokens.
    Unencrypted,
    /// Public key; available under any unlock factor.
    Default,
    /// Private key; needs the knowledge or ownership factor.
    Private,
}

/// The unlocked key pair. Never persisted.
#[derive(Clone)]
pub struct KeySet {
    pub public: SymmetricKey,
    pub private: Option<SymmetricKey>,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("public", &"<redacted>")
            .field("private", &self.private.map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldCodec {
    keys: Option<KeySet>,
}

impl FieldCodec {
    pub fn new(keys: Option<KeySet>) -> Self {
        Self { keys }
    }

    pub fn is_unlocked(&self) -> bool {
        self.keys.is_some()
    }

    pub fn has_private(&self) -> bool {
        self.keys.as_ref().is_some_and(|k| k.private.is_some())
    }

    pub(crate) fn keys(&self) -> Option<&KeySet> {
        self.keys.as_ref()
    }

    pub(crate) fn set_keys(&mut self, keys: Option<KeySet>) {
        self.keys = keys;
    }

    fn key_for(&self, policy: FieldPolicy, writing: bool) -> Result<Option<&SymmetricKey>> {
        match policy {
            FieldPolicy::Unencrypted => Ok(None),
            FieldPolicy::Default => {
                let keys = self.keys.as_ref().ok_or(StoreError::NotLoggedIn)?;
                Ok(Some(&keys.public))
            }
            FieldPolicy::Private => {
                let keys = self.keys.as_ref().ok_or(StoreError::NotLoggedIn)?;
                match keys.private.as_ref() {
                    Some(key) => Ok(Some(key)),
                    // reading a private field without the key looks exactly
                    // like reading it with the wrong one
                    None if writing => Err(StoreError::PolicyUnavailable(
                        "private fields need the knowledge or ownership factor",
                    )),
                    None => Err(StoreError::NotAuthenticated),
                }
            }
        }
    }

    pub fn write_str(&self, value: &str, policy: FieldPolicy) -> Result<String> {
        match self.key_for(policy, true)? {
            None => Ok(value.to_string()),
            Some(key) => Ok(crypto::encrypt_to_text(key, value.as_bytes())?),
        }
    }

    pub fn read_str(&self, raw: &str, policy: FieldPolicy) -> Result<String> {
        match self.key_for(policy, false)? {
            None => Ok(raw.to_string()),
            Some(key) => {
                let plain =
                    crypto::decrypt_from_text(key, raw).map_err(|_| StoreError::NotAuthenticated)?;
                String::from_utf8(plain).map_err(|_| StoreError::NotAuthenticated)
            }
        }
    }

    /// Binary payloads are base64-encoded before encryption.
    pub fn write_bytes(&self, value: &[u8], policy: FieldPolicy) -> Result<String> {
        self.write_str(&STANDARD.encode(value), policy)
    }

    pub fn read_bytes(&self, raw: &str, policy: FieldPolicy) -> Result<Vec<u8>> {
        let text = self.read_str(raw, policy)?;
        STANDARD
            .decode(text)
            .map_err(|_| StoreError::NotAuthenticated)
    }

    pub fn write_i64(&self, value: i64, policy: FieldPolicy) -> Result<String> {
        self.write_str(&value.to_string(), policy)
    }

    pub fn read_i64(&self, raw: &str, policy: FieldPolicy) -> Result<i64> {
        self.read_str(raw, policy)?
            .parse()
            .map_err(|_| StoreError::NotAuthenticated)
    }

    pub fn write_timestamp(&self, value: DateTime<Utc>, policy: FieldPolicy) -> Result<String> {
        self.write_str(&format_timestamp(value), policy)
    }

    pub fn read_timestamp(&self, raw: &str, policy: FieldPolicy) -> Result<DateTime<Utc>> {
        let text = self.read_str(raw, policy)?;
        match policy {
            FieldPolicy::Unencrypted => parse_timestamp(&text),
            _ => parse_timestamp(&text).map_err(|_| StoreError::NotAuthenticated),
        }
    }

    pub fn write_json<T: Serialize>(&self, value: &T, policy: FieldPolicy) -> Result<String> {
        let json = serde_json::to_string(value)?;
        self.write_str(&json, policy)
    }

    pub fn read_json<T: DeserializeOwned>(&self, raw: &str, policy: FieldPolicy) -> Result<T> {
        let json = self.read_str(raw, policy)?;
        Ok(serde_json::from_str(&json)?)
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    Ok(NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)?.and_utc())
}

/// Truncate to the precision the timestamp format keeps.
pub fn normalize_timestamp(value: DateTime<Utc>) -> DateTime<Utc> {
    parse_timestamp(&format_timestamp(value)).unwrap_or(value)
}
