//! Account vault: the key hierarchy behind every encrypted field.
//!
//! Two random keys protect the store: the public key (Default policy) and the
//! private key (Private policy). Neither is ever written to disk. The account
//! row only keeps XOR masks `M = D ^ K`, where `D` is derived from the unlock
//! factor, so rotating a credential rewrites a 32-byte mask instead of
//! re-encrypting the store.
//!
//! | mask          | unmasked with                       | recovers |
//! |---------------|-------------------------------------|----------|
//! | `public_mask` | `D(user, password)`                 | public   |
//! | `private_mask`| `D(user, password)`                 | private  |
//! | `dpapi_mask1` | protector, then `D(user, "")`       | public   |
//! | `dpapi_mask2` | protector, then `D(user, "")`       | private  |
//!
//! An account created with an empty password is an auto-logon account: there
//! `D(user, password) == D(user, "")`, so the Public and Experience factors
//! recover the public key. For any other account they derive the wrong key
//! and the login is rejected.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use outpost_shared::crypto::{self, SymmetricKey};
use outpost_shared::AuthFactor;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::codec::{FieldCodec, FieldPolicy, KeySet};
use crate::database::{Database, Session};
use crate::error::{Result, StoreError};
use crate::models::{AccountInfo, NewAccount};
use crate::protector::SecretProtector;

struct AccountRow {
    user_name: String,
    url: String,
    api: String,
    public_mask: String,
    private_mask: Option<String>,
    dpapi_mask1: Option<String>,
    dpapi_mask2: Option<String>,
    theme: String,
    parameters: String,
}

impl Database {
    /// Whether any account has been configured on this device.
    pub fn has_account(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM account", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// First-run setup: generate the key pair, store its masks and log in
    /// with the knowledge factor.
    pub fn create_account(
        &mut self,
        account: NewAccount,
        protector: Option<&dyn SecretProtector>,
    ) -> Result<AccountInfo> {
        let token = crypto::login_hash(&account.username);
        if load_account(&self.conn, &token)?.is_some() {
            return Err(StoreError::AccountExists);
        }

        let public = crypto::generate_symmetric_key();
        let private = crypto::generate_symmetric_key();
        let public_factor = crypto::derive_factor_key(&account.username, "");
        let knowledge = crypto::derive_factor_key(&account.username, &account.password);

        let public_mask = hex::encode(crypto::xor_mask(&knowledge, &public));
        let private_mask = hex::encode(crypto::xor_mask(&knowledge, &private));
        let (dpapi1, dpapi2) = match protector {
            Some(p) => {
                let (m1, m2) = seal_masks(p, &public_factor, &public, &private)?;
                (Some(m1), Some(m2))
            }
            None => (None, None),
        };

        let codec = FieldCodec::new(Some(KeySet {
            public,
            private: Some(private),
        }));

        self.conn.execute(
            "INSERT INTO account (token, user_name, url, api, public_mask, private_mask,
                                  dpapi_mask1, dpapi_mask2, theme, parameters)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                token,
                codec.write_str(&account.username, FieldPolicy::Default)?,
                codec.write_str(&account.url, FieldPolicy::Default)?,
                codec.write_str(&account.api_credential, FieldPolicy::Private)?,
                public_mask,
                private_mask,
                dpapi1,
                dpapi2,
                account.theme,
                codec.write_json(&account.parameters, FieldPolicy::Default)?,
            ],
        )?;

        info!(account = %&token[..8], ownership = protector.is_some(), "account created");

        self.codec = codec;
        self.session = Some(Session {
            account_token: token,
            username: account.username.clone(),
            factor: AuthFactor::Knowledge,
        });

        Ok(AccountInfo {
            username: account.username,
            url: account.url,
            theme: account.theme,
            parameters: account.parameters,
        })
    }

    /// Stored mask for the public key under `factor`. Never the key itself.
    pub fn public_xor_cipher(
        &self,
        username: &str,
        factor: AuthFactor,
        protector: Option<&dyn SecretProtector>,
    ) -> Result<Option<SymmetricKey>> {
        let Some(row) = load_account(&self.conn, &crypto::login_hash(username))? else {
            return Ok(None);
        };
        match factor {
            AuthFactor::Ownership => unseal_mask(row.dpapi_mask1.as_deref(), protector),
            _ => Ok(Some(decode_mask(&row.public_mask)?)),
        }
    }

    /// Stored mask for the private key under `factor`; `None` when the factor
    /// cannot reach the private key.
    pub fn private_xor_cipher(
        &self,
        username: &str,
        factor: AuthFactor,
        protector: Option<&dyn SecretProtector>,
    ) -> Result<Option<SymmetricKey>> {
        let Some(row) = load_account(&self.conn, &crypto::login_hash(username))? else {
            return Ok(None);
        };
        if !factor.unlocks_private() {
            return Ok(None);
        }
        match factor {
            AuthFactor::Ownership => unseal_mask(row.dpapi_mask2.as_deref(), protector),
            _ => row.private_mask.as_deref().map(decode_mask).transpose(),
        }
    }

    /// Recover the keys for `factor` and unlock the codec.
    ///
    /// `password` is ignored for every factor but `Knowledge`; Public and
    /// Experience only open auto-logon accounts. Afterwards the translation
    /// reconciliation pass runs.
    pub fn login(
        &mut self,
        username: &str,
        password: &str,
        factor: AuthFactor,
        protector: Option<&dyn SecretProtector>,
    ) -> Result<AccountInfo> {
        if !self.has_account()? {
            return Err(StoreError::NoUserConfigured);
        }
        if factor == AuthFactor::Ownership && protector.is_none() {
            return Err(StoreError::Protector(
                "ownership factor needs a secret protector".to_string(),
            ));
        }

        let derived = match factor {
            AuthFactor::Knowledge => crypto::derive_factor_key(username, password),
            _ => crypto::derive_factor_key(username, ""),
        };
        let public_mask = self
            .public_xor_cipher(username, factor, protector)?
            .ok_or(StoreError::NotAuthenticated)?;
        let public = crypto::xor_mask(&derived, &public_mask);

        let private = if factor.unlocks_private() {
            let mask = self
                .private_xor_cipher(username, factor, protector)?
                .ok_or(StoreError::NotAuthenticated)?;
            Some(crypto::xor_mask(&derived, &mask))
        } else {
            None
        };

        let token = crypto::login_hash(username);
        let codec = FieldCodec::new(Some(KeySet { public, private }));
        let info = match verify_keys(&self.conn, &codec, &token, username) {
            Ok(info) => info,
            Err(e) => {
                warn!(?factor, "login rejected");
                self.logout();
                return Err(e);
            }
        };

        self.codec = codec;
        self.session = Some(Session {
            account_token: token,
            username: info.username.clone(),
            factor,
        });
        info!(?factor, "logged in");

        let demoted = self.reconcile_translations()?;
        if demoted > 0 {
            info!(demoted, "translations demoted after login");
        }

        Ok(info)
    }

    /// Forget the unlocked keys.
    pub fn logout(&mut self) {
        self.codec.set_keys(None);
        if self.session.take().is_some() {
            info!("logged out");
        }
    }

    /// Rotate the password by rewriting `public_mask` and `private_mask`. No
    /// field is re-encrypted.
    pub fn change_password(&mut self, old_password: &str, new_password: &str) -> Result<()> {
        let session = self.session.clone().ok_or(StoreError::NotLoggedIn)?;
        let private = self.private_key()?;
        let public = self
            .codec
            .keys()
            .map(|k| k.public)
            .ok_or(StoreError::NotLoggedIn)?;

        let row = load_account(&self.conn, &session.account_token)?
            .ok_or(StoreError::NoUserConfigured)?;
        let stored = row
            .private_mask
            .as_deref()
            .map(decode_mask)
            .transpose()?
            .ok_or(StoreError::NotAuthenticated)?;
        let old = crypto::derive_factor_key(&session.username, old_password);
        if crypto::xor_mask(&old, &stored) != private {
            return Err(StoreError::NotAuthenticated);
        }

        let new = crypto::derive_factor_key(&session.username, new_password);
        self.conn.execute(
            "UPDATE account SET public_mask = ?1, private_mask = ?2 WHERE token = ?3",
            params![
                hex::encode(crypto::xor_mask(&new, &public)),
                hex::encode(crypto::xor_mask(&new, &private)),
                session.account_token
            ],
        )?;

        info!("password mask rotated");
        Ok(())
    }

    /// Seal both keys' masks with `protector` so the ownership factor can
    /// unlock without a password.
    pub fn enroll_ownership(&mut self, protector: &dyn SecretProtector) -> Result<()> {
        let session = self.session.clone().ok_or(StoreError::NotLoggedIn)?;
        let private = self.private_key()?;
        let public = self
            .codec
            .keys()
            .map(|k| k.public)
            .ok_or(StoreError::NotLoggedIn)?;

        let public_factor = crypto::derive_factor_key(&session.username, "");
        let (m1, m2) = seal_masks(protector, &public_factor, &public, &private)?;
        self.conn.execute(
            "UPDATE account SET dpapi_mask1 = ?1, dpapi_mask2 = ?2 WHERE token = ?3",
            params![m1, m2, session.account_token],
        )?;

        info!("ownership factor enrolled");
        Ok(())
    }

    pub fn revoke_ownership(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(StoreError::NotLoggedIn)?;
        self.conn.execute(
            "UPDATE account SET dpapi_mask1 = NULL, dpapi_mask2 = NULL WHERE token = ?1",
            params![session.account_token],
        )?;
        info!("ownership factor revoked");
        Ok(())
    }

    pub fn account_info(&self) -> Result<AccountInfo> {
        let session = self.session.as_ref().ok_or(StoreError::NotLoggedIn)?;
        let row = load_account(&self.conn, &session.account_token)?
            .ok_or(StoreError::NoUserConfigured)?;
        decode_info(&self.codec, &row)
    }

    /// The remote API credential. Needs the private key.
    pub fn api_credential(&self) -> Result<String> {
        let session = self.session.as_ref().ok_or(StoreError::NotLoggedIn)?;
        let row = load_account(&self.conn, &session.account_token)?
            .ok_or(StoreError::NoUserConfigured)?;
        self.codec.read_str(&row.api, FieldPolicy::Private)
    }

    /// Update the non-secret account settings; `None` keeps the current value.
    pub fn update_account_settings(
        &mut self,
        url: Option<&str>,
        theme: Option<&str>,
        parameters: Option<&serde_json::Value>,
    ) -> Result<AccountInfo> {
        let session = self.session.as_ref().ok_or(StoreError::NotLoggedIn)?;
        let token = session.account_token.clone();

        if let Some(url) = url {
            let raw = self.codec.write_str(url, FieldPolicy::Default)?;
            self.conn
                .execute("UPDATE account SET url = ?1 WHERE token = ?2", params![raw, token])?;
        }
        if let Some(theme) = theme {
            self.conn
                .execute("UPDATE account SET theme = ?1 WHERE token = ?2", params![theme, token])?;
        }
        if let Some(parameters) = parameters {
            let raw = self.codec.write_json(parameters, FieldPolicy::Default)?;
            self.conn.execute(
                "UPDATE account SET parameters = ?1 WHERE token = ?2",
                params![raw, token],
            )?;
        }

        self.account_info()
    }

    fn private_key(&self) -> Result<SymmetricKey> {
        self.codec
            .keys()
            .and_then(|k| k.private)
            .ok_or(StoreError::PolicyUnavailable(
                "changing credentials needs the knowledge or ownership factor",
            ))
    }
}

fn load_account(conn: &Connection, token: &str) -> Result<Option<AccountRow>> {
    let row = conn
        .query_row(
            "SELECT user_name, url, api, public_mask, private_mask, dpapi_mask1, dpapi_mask2,
                    theme, parameters
             FROM account WHERE token = ?1",
            params![token],
            |row| {
                Ok(AccountRow {
                    user_name: row.get(0)?,
                    url: row.get(1)?,
                    api: row.get(2)?,
                    public_mask: row.get(3)?,
                    private_mask: row.get(4)?,
                    dpapi_mask1: row.get(5)?,
                    dpapi_mask2: row.get(6)?,
                    theme: row.get(7)?,
                    parameters: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn decode_mask(hex_mask: &str) -> Result<SymmetricKey> {
    let bytes = hex::decode(hex_mask).map_err(|_| StoreError::NotAuthenticated)?;
    crypto::key_from_slice(&bytes).map_err(|_| StoreError::NotAuthenticated)
}

fn seal_masks(
    protector: &dyn SecretProtector,
    public_factor: &SymmetricKey,
    public: &SymmetricKey,
    private: &SymmetricKey,
) -> Result<(String, String)> {
    let m1 = protector.protect(&crypto::xor_mask(public_factor, public))?;
    let m2 = protector.protect(&crypto::xor_mask(public_factor, private))?;
    Ok((STANDARD.encode(m1), STANDARD.encode(m2)))
}

fn unseal_mask(
    sealed: Option<&str>,
    protector: Option<&dyn SecretProtector>,
) -> Result<Option<SymmetricKey>> {
    let (Some(sealed), Some(protector)) = (sealed, protector) else {
        return Ok(None);
    };
    let sealed = STANDARD
        .decode(sealed)
        .map_err(|_| StoreError::NotAuthenticated)?;
    let mask = protector.unprotect(&sealed)?;
    Ok(Some(
        crypto::key_from_slice(&mask).map_err(|_| StoreError::NotAuthenticated)?,
    ))
}

fn decode_info(codec: &FieldCodec, row: &AccountRow) -> Result<AccountInfo> {
    Ok(AccountInfo {
        username: codec.read_str(&row.user_name, FieldPolicy::Default)?,
        url: codec.read_str(&row.url, FieldPolicy::Default)?,
        theme: row.theme.clone(),
        parameters: codec
            .read_json(&row.parameters, FieldPolicy::Default)
            .map_err(|_| StoreError::NotAuthenticated)?,
    })
}

// A wrong factor yields wrong keys; the only signal is a failed decode.
fn verify_keys(
    conn: &Connection,
    codec: &FieldCodec,
    token: &str,
    username: &str,
) -> Result<AccountInfo> {
    let row = load_account(conn, token)?.ok_or(StoreError::NotAuthenticated)?;
    let info = decode_info(codec, &row)?;
    if info.username.trim().to_lowercase() != username.trim().to_lowercase() {
        return Err(StoreError::NotAuthenticated);
    }
    if codec.has_private() {
        codec.read_str(&row.api, FieldPolicy::Private)?;
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protector::DeviceKeyProtector;
    use crate::test_support::{new_account, open_blank, sample_document};

    #[test]
    fn login_before_setup_reports_first_run() {
        let (mut db, _dir) = open_blank();
        assert!(!db.has_account().unwrap());
        assert!(matches!(
            db.login("ada", "pw", AuthFactor::Knowledge, None),
            Err(StoreError::NoUserConfigured)
        ));
    }

    #[test]
    fn masks_never_equal_keys() {
        let (mut db, _dir) = open_blank();
        db.create_account(new_account("ada", "pw"), None).unwrap();
        let keys = db.codec().keys().cloned().unwrap();

        let public_mask = db
            .public_xor_cipher("ada", AuthFactor::Knowledge, None)
            .unwrap()
            .unwrap();
        let private_mask = db
            .private_xor_cipher("ada", AuthFactor::Knowledge, None)
            .unwrap()
            .unwrap();
        assert_ne!(public_mask, keys.public);
        assert_ne!(Some(private_mask), keys.private);
        let derived = crypto::derive_factor_key("ada", "pw");
        assert_eq!(crypto::xor_mask(&derived, &public_mask), keys.public);
        assert_eq!(crypto::xor_mask(&derived, &private_mask), keys.private.unwrap());
        assert!(db
            .private_xor_cipher("ada", AuthFactor::Public, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn knowledge_login_restores_encrypted_fields() {
        let (mut db, _dir) = open_blank();
        db.create_account(new_account("ada", "pw"), None).unwrap();
        let staged = db.create(sample_document("draft", "hello")).unwrap();
        db.logout();

        assert!(matches!(
            db.login("ada", "wrong", AuthFactor::Knowledge, None),
            Err(StoreError::NotAuthenticated)
        ));
        assert!(db.session().is_none());

        let info = db.login("Ada", "pw", AuthFactor::Knowledge, None).unwrap();
        assert_eq!(info.url, "https://collab.example");
        assert_eq!(db.api_credential().unwrap(), "api-secret");

        let entry = db.get_staged(&staged.token).unwrap().unwrap();
        assert_eq!(entry.object.as_object().unwrap().title(), "draft");
    }

    #[test]
    fn public_factor_cannot_open_password_account() {
        let (mut db, _dir) = open_blank();
        db.create_account(new_account("ada", "correct horse"), None).unwrap();
        db.create(sample_document("secret plan", "body")).unwrap();
        db.logout();

        for factor in [AuthFactor::Public, AuthFactor::Experience] {
            assert!(matches!(
                db.login("ada", "", factor, None),
                Err(StoreError::NotAuthenticated)
            ));
            assert!(db.session().is_none());
            assert!(matches!(db.list_staged(), Err(StoreError::NotLoggedIn)));
        }
    }

    #[test]
    fn public_factor_reads_default_fields_only() {
        let (mut db, _dir) = open_blank();
        db.create_account(new_account("ada", ""), None).unwrap();
        db.logout();

        db.login("ada", "", AuthFactor::Public, None).unwrap();
        assert_eq!(db.account_info().unwrap().username, "ada");
        assert!(matches!(db.api_credential(), Err(StoreError::NotAuthenticated)));

        db.logout();
        db.login("ada", "", AuthFactor::Experience, None).unwrap();
        assert!(!db.codec().has_private());
    }

    #[test]
    fn unknown_user_is_not_authenticated() {
        let (mut db, _dir) = open_blank();
        db.create_account(new_account("ada", "pw"), None).unwrap();
        db.logout();
        assert!(matches!(
            db.login("mallory", "pw", AuthFactor::Knowledge, None),
            Err(StoreError::NotAuthenticated)
        ));
    }

    #[test]
    fn password_change_rewrites_only_the_mask() {
        let (mut db, _dir) = open_blank();
        db.create_account(new_account("ada", "old"), None).unwrap();
        let staged = db.create(sample_document("kept", "body")).unwrap();
        let header_before: String = db
            .conn()
            .query_row(
                "SELECT header_data FROM stage WHERE token = ?1",
                [staged.token.as_str()],
                |r| r.get(0),
            )
            .unwrap();
        let keys_before = db.codec().keys().cloned().unwrap();
        let public_before = db.public_xor_cipher("ada", AuthFactor::Knowledge, None).unwrap();

        assert!(matches!(
            db.change_password("nope", "new"),
            Err(StoreError::NotAuthenticated)
        ));
        db.change_password("old", "new").unwrap();
        db.logout();

        assert!(db.login("ada", "old", AuthFactor::Knowledge, None).is_err());
        db.login("ada", "new", AuthFactor::Knowledge, None).unwrap();

        let header_after: String = db
            .conn()
            .query_row(
                "SELECT header_data FROM stage WHERE token = ?1",
                [staged.token.as_str()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(header_before, header_after);
        assert_ne!(
            public_before,
            db.public_xor_cipher("ada", AuthFactor::Knowledge, None).unwrap()
        );
        let keys_after = db.codec().keys().cloned().unwrap();
        assert_eq!(keys_after.public, keys_before.public);
        assert_eq!(keys_after.private, keys_before.private);
        let entry = db.get_staged(&staged.token).unwrap().unwrap();
        assert_eq!(entry.object.as_object().unwrap().title(), "kept");
        assert_eq!(db.api_credential().unwrap(), "api-secret");
    }

    #[test]
    fn ownership_factor_unlocks_same_keys() {
        let (mut db, dir) = open_blank();
        let protector = DeviceKeyProtector::open(&dir.path().join("device.key")).unwrap();
        db.create_account(new_account("ada", "pw"), None).unwrap();
        let keys = db.codec().keys().cloned().unwrap();

        db.logout();
        assert!(matches!(
            db.login("ada", "", AuthFactor::Ownership, Some(&protector)),
            Err(StoreError::NotAuthenticated)
        ));

        db.login("ada", "pw", AuthFactor::Knowledge, None).unwrap();
        db.enroll_ownership(&protector).unwrap();
        db.logout();

        db.login("ada", "", AuthFactor::Ownership, Some(&protector))
            .unwrap();
        let unlocked = db.codec().keys().cloned().unwrap();
        assert_eq!(unlocked.public, keys.public);
        assert_eq!(unlocked.private, keys.private);
        assert_eq!(db.api_credential().unwrap(), "api-secret");

        // a password change leaves the ownership path intact
        db.change_password("pw", "pw2").unwrap();
        db.logout();
        db.login("ada", "", AuthFactor::Ownership, Some(&protector))
            .unwrap();

        db.revoke_ownership().unwrap();
        db.logout();
        assert!(db
            .login("ada", "", AuthFactor::Ownership, Some(&protector))
            .is_err());
    }

    #[test]
    fn settings_update_and_duplicate_account() {
        let (mut db, _dir) = open_blank();
        db.create_account(new_account("ada", "pw"), None).unwrap();
        assert!(matches!(
            db.create_account(new_account("ADA", "x"), None),
            Err(StoreError::AccountExists)
        ));

        let params = serde_json::json!({ "sync_interval": 30 });
        let info = db
            .update_account_settings(Some("https://other.example"), Some("dark"), Some(&params))
            .unwrap();
        assert_eq!(info.url, "https://other.example");
        assert_eq!(info.theme, "dark");
        assert_eq!(info.parameters["sync_interval"], 30);
    }
}
