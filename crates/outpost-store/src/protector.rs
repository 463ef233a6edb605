//! Ownership factor: sealing masks with a device-bound secret.
//!
//! [`SecretProtector`] stands in for the operating system's protected
//! secret store. [`DeviceKeyProtector`] is the portable implementation: a
//! random device key kept next to the database, readable only by the user.

use std::path::{Path, PathBuf};

use outpost_shared::constants::KDF_CONTEXT_DEVICE_KEY;
use outpost_shared::crypto::{self, SymmetricKey};

use crate::error::{Result, StoreError};

pub trait SecretProtector: Send + Sync {
    fn protect(&self, secret: &[u8]) -> Result<Vec<u8>>;

    /// Fails with [`StoreError::NotAuthenticated`] when the sealed value was
    /// produced on another device or has been tampered with.
    fn unprotect(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct DeviceKeyProtector {
    path: PathBuf,
    key: SymmetricKey,
}

impl std::fmt::Debug for DeviceKeyProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyProtector")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DeviceKeyProtector {
    /// Load the device key at `path`, creating it on first use.
    pub fn open(path: &Path) -> Result<Self> {
        let seed = match std::fs::read_to_string(path) {
            Ok(hex_seed) => hex::decode(hex_seed.trim())
                .map_err(|e| StoreError::Protector(format!("corrupt device key: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let seed = crypto::generate_symmetric_key();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                write_private(path, &hex::encode(seed))?;
                tracing::info!(path = %path.display(), "created device key");
                seed.to_vec()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            key: crypto::derive_key_from_passphrase(&seed, KDF_CONTEXT_DEVICE_KEY),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretProtector for DeviceKeyProtector {
    fn protect(&self, secret: &[u8]) -> Result<Vec<u8>> {
        Ok(crypto::encrypt(&self.key, secret)?)
    }

    fn unprotect(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        crypto::decrypt(&self.key, sealed).map_err(|_| StoreError::NotAuthenticated)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_round_trip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");

        let first = DeviceKeyProtector::open(&path).unwrap();
        let sealed = first.protect(b"mask bytes").unwrap();

        let reopened = DeviceKeyProtector::open(&path).unwrap();
        assert_eq!(reopened.unprotect(&sealed).unwrap(), b"mask bytes");
    }

    #[test]
    fn other_device_cannot_unseal() {
        let dir = tempfile::tempdir().unwrap();
        let a = DeviceKeyProtector::open(&dir.path().join("a.key")).unwrap();
        let b = DeviceKeyProtector::open(&dir.path().join("b.key")).unwrap();

        let sealed = a.protect(b"mask").unwrap();
        assert!(matches!(b.unprotect(&sealed), Err(StoreError::NotAuthenticated)));
    }
}
