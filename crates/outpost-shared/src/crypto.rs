use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{
    KDF_CONTEXT_FACTOR_KEY, KDF_CONTEXT_LOGIN_HASH, KDF_CONTEXT_TOKEN_PREFIX, NONCE_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt and wrap the result as base64 text, suitable for a TEXT column.
pub fn encrypt_to_text(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    encrypt(key, plaintext).map(|sealed| STANDARD.encode(sealed))
}

/// Inverse of [`encrypt_to_text`]. Malformed base64 is reported as a
/// decryption failure so callers cannot tell it apart from a wrong key.
pub fn decrypt_from_text(key: &SymmetricKey, text: &str) -> Result<Vec<u8>, CryptoError> {
    let sealed = STANDARD
        .decode(text)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    decrypt(key, &sealed)
}

pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(passphrase);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

/// Derive the factor value `D` that unmasks a stored key.
///
/// The username is normalized like [`login_hash`] and length-prefixed so
/// `("ab", "c")` and `("a", "bc")` never collide. An empty password yields the
/// public-factor value.
pub fn derive_factor_key(username: &str, password: &str) -> SymmetricKey {
    let username = username.trim().to_lowercase();
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_FACTOR_KEY);
    hasher.update(&(username.len() as u64).to_le_bytes());
    hasher.update(username.as_bytes());
    hasher.update(password.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Key used to seal a staged entry's kind prefix; seeded by the token itself.
pub fn derive_token_key(token: &str) -> SymmetricKey {
    derive_key_from_passphrase(token.as_bytes(), KDF_CONTEXT_TOKEN_PREFIX)
}

/// Unencrypted lookup key for an account row.
pub fn login_hash(username: &str) -> String {
    let key = derive_key_from_passphrase(
        username.trim().to_lowercase().as_bytes(),
        KDF_CONTEXT_LOGIN_HASH,
    );
    hex::encode(key)
}

/// Keyed digest of a search keyword, so the index never holds plaintext words.
pub fn keyword_digest(key: &SymmetricKey, word: &str) -> String {
    blake3::keyed_hash(key, word.to_lowercase().as_bytes())
        .to_hex()
        .to_string()
}

pub fn xor_mask(a: &SymmetricKey, b: &SymmetricKey) -> SymmetricKey {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

pub fn key_from_slice(bytes: &[u8]) -> Result<SymmetricKey, CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}
