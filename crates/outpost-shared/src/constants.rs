/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Prefix of locally generated tokens for objects the server has not seen yet
pub const PLACEHOLDER_PREFIX: &str = "NEWTOKEN-";

/// Width of the zero-padded placeholder sequence number
pub const PLACEHOLDER_DIGITS: usize = 16;

/// Fixed text format for persisted timestamps (UTC, millisecond precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Default retention of incomplete upload chunks, in hours
pub const DEFAULT_CHUNK_RETENTION_HOURS: i64 = 24;

/// Maximum size of a single base64 upload fragment (4 MiB)
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_FACTOR_KEY: &str = "outpost-factor-key-v1";
pub const KDF_CONTEXT_TOKEN_PREFIX: &str = "outpost-token-prefix-v1";
pub const KDF_CONTEXT_LOGIN_HASH: &str = "outpost-login-hash-v1";
pub const KDF_CONTEXT_DEVICE_KEY: &str = "outpost-device-key-v1";
