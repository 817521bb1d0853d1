use std::sync::Arc;

use nostr_sdk::nips::nip49::{EncryptedSecretKey, KeySecurity};
use nostr_sdk::prelude::*;
use tracing::{debug, info, warn};

use crate::constants::HEX_KEY_LEN;
use crate::error::{BijaError, BijaResult};
use crate::models::KeyRecord;
use crate::store::Database;

/// True when `raw` is exactly 64 hex characters
pub fn is_hex_key(raw: &str) -> bool {
    raw.len() == HEX_KEY_LEN && raw.chars().all(|c| c.is_ascii_hexdigit())
}

/// Fresh secp256k1 identity
pub fn generate_identity() -> Keys {
    Keys::generate()
}

/// Parse a hex private key. Anything that is not a valid 64-hex secret key
/// is rejected before any state changes.
pub fn load_identity(raw_key_hex: &str) -> BijaResult<Keys> {
    let raw = raw_key_hex.trim();
    if !is_hex_key(raw) {
        return Err(BijaError::InvalidKeyFormat);
    }
    let secret_key = SecretKey::from_hex(raw).map_err(|_| BijaError::InvalidKeyFormat)?;
    Ok(Keys::new(secret_key))
}

/// Encrypt a secret key with NIP-49 (scrypt + XChaCha20-Poly1305) into an
/// `ncryptsec` string
pub fn encrypt_at_rest(password: &str, secret_key: &SecretKey, log_n: u8) -> BijaResult<String> {
    let encrypted = EncryptedSecretKey::new(secret_key, password, log_n, KeySecurity::Unknown)
        .map_err(|e| {
            warn!("Key encryption failed: {}", e);
            BijaError::IncorrectCredentials
        })?;
    encrypted.to_bech32().map_err(|e| {
        warn!("Key encoding failed: {}", e);
        BijaError::IncorrectCredentials
    })
}

/// Decrypt an `ncryptsec` string.
///
/// A wrong password and a damaged blob both yield `IncorrectCredentials`.
pub fn decrypt_at_rest(password: &str, cipher_blob: &str) -> BijaResult<SecretKey> {
    let encrypted =
        EncryptedSecretKey::from_bech32(cipher_blob).map_err(|_| BijaError::IncorrectCredentials)?;
    encrypted
        .decrypt(password)
        .map_err(|_| BijaError::IncorrectCredentials)
}

/// Custody of the single stored key record.
#[derive(Clone)]
pub struct KeyVault {
    db: Arc<Database>,
    scrypt_log_n: u8,
}

impl KeyVault {
    pub fn new(db: Arc<Database>, scrypt_log_n: u8) -> Self {
        Self { db, scrypt_log_n }
    }

    pub fn stored_record(&self) -> BijaResult<Option<KeyRecord>> {
        self.db.key_record()
    }

    /// Persist `keys`, encrypted when `password` is non-empty. Replaces any
    /// previous record.
    pub fn save(&self, keys: &Keys, password: Option<&str>) -> BijaResult<()> {
        let record = match password.filter(|p| !p.is_empty()) {
            Some(password) => KeyRecord {
                key: encrypt_at_rest(password, keys.secret_key(), self.scrypt_log_n)?,
                encrypted: true,
            },
            None => KeyRecord {
                key: keys.secret_key().to_secret_hex(),
                encrypted: false,
            },
        };
        self.db.save_key_record(&record)?;
        info!("Stored identity key (encrypted: {})", record.encrypted);
        Ok(())
    }

    /// Keys from an unencrypted record, if that is what is stored
    pub fn load_unencrypted(&self) -> BijaResult<Option<Keys>> {
        match self.stored_record()? {
            Some(record) if !record.encrypted => {
                let keys = load_identity(&record.key).map_err(|_| {
                    warn!("Stored key record is unusable");
                    BijaError::IncorrectCredentials
                })?;
                Ok(Some(keys))
            }
            _ => Ok(None),
        }
    }

    /// Decrypt the stored encrypted record with `password`
    pub fn unlock(&self, password: &str) -> BijaResult<Keys> {
        let record = self
            .stored_record()?
            .ok_or(BijaError::IncorrectCredentials)?;
        if !record.encrypted {
            debug!("Unlock requested for an unencrypted record");
            return load_identity(&record.key).map_err(|_| BijaError::IncorrectCredentials);
        }
        let secret_key = decrypt_at_rest(password, &record.key)?;
        Ok(Keys::new(secret_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::tests::open_temp;

    const TEST_LOG_N: u8 = 4;

    #[test]
    fn test_is_hex_key() {
        assert!(is_hex_key(&"a".repeat(64)));
        assert!(is_hex_key(&"0F".repeat(32)));
        assert!(!is_hex_key(&"a".repeat(63)));
        assert!(!is_hex_key(&"g".repeat(64)));
        assert!(!is_hex_key(""));
    }

    #[test]
    fn test_load_identity_rejects_malformed_keys() {
        assert!(matches!(load_identity("abc"), Err(BijaError::InvalidKeyFormat)));
        assert!(matches!(
            load_identity(&"z".repeat(64)),
            Err(BijaError::InvalidKeyFormat)
        ));
        // Valid hex but outside the curve order
        assert!(matches!(
            load_identity(&"f".repeat(64)),
            Err(BijaError::InvalidKeyFormat)
        ));

        let nsec = generate_identity().secret_key().to_bech32().unwrap();
        assert!(matches!(load_identity(&nsec), Err(BijaError::InvalidKeyFormat)));
    }

    #[test]
    fn test_load_identity_accepts_generated_hex() {
        let keys = generate_identity();
        let loaded = load_identity(&keys.secret_key().to_secret_hex()).unwrap();
        assert_eq!(loaded.public_key(), keys.public_key());
    }

    #[test]
    fn test_encryption_round_trip() {
        let keys = generate_identity();
        for password in ["password123", "p", "unicodé pässwörd"] {
            let blob = encrypt_at_rest(password, keys.secret_key(), TEST_LOG_N).unwrap();
            assert!(blob.starts_with("ncryptsec"));
            let decrypted = decrypt_at_rest(password, &blob).unwrap();
            assert_eq!(&decrypted, keys.secret_key());
        }
    }

    #[test]
    fn test_wrong_password_and_corrupt_blob_look_the_same() {
        let keys = generate_identity();
        let blob = encrypt_at_rest("right", keys.secret_key(), TEST_LOG_N).unwrap();

        let wrong = decrypt_at_rest("wrong", &blob);
        assert!(matches!(wrong, Err(BijaError::IncorrectCredentials)));

        let corrupt = decrypt_at_rest("right", "ncryptsec1garbage");
        assert!(matches!(corrupt, Err(BijaError::IncorrectCredentials)));
    }

    #[test]
    fn test_vault_stores_plain_key_without_password() {
        let (_dir, db) = open_temp();
        let vault = KeyVault::new(Arc::new(db), TEST_LOG_N);
        let keys = generate_identity();

        vault.save(&keys, Some("")).unwrap();
        let record = vault.stored_record().unwrap().unwrap();
        assert!(!record.encrypted);

        let loaded = vault.load_unencrypted().unwrap().unwrap();
        assert_eq!(loaded.public_key(), keys.public_key());
    }

    #[test]
    fn test_vault_never_stores_plaintext_when_encrypted() {
        let (_dir, db) = open_temp();
        let vault = KeyVault::new(Arc::new(db), TEST_LOG_N);
        let keys = generate_identity();

        vault.save(&keys, Some("secret")).unwrap();
        let record = vault.stored_record().unwrap().unwrap();
        assert!(record.encrypted);
        assert!(!record.key.contains(&keys.secret_key().to_secret_hex()));
        assert!(vault.load_unencrypted().unwrap().is_none());

        assert!(matches!(
            vault.unlock("nope"),
            Err(BijaError::IncorrectCredentials)
        ));
        assert_eq!(vault.unlock("secret").unwrap().public_key(), keys.public_key());
    }

    #[test]
    fn test_unlock_without_record_fails() {
        let (_dir, db) = open_temp();
        let vault = KeyVault::new(Arc::new(db), TEST_LOG_N);
        assert!(matches!(
            vault.unlock("anything"),
            Err(BijaError::IncorrectCredentials)
        ));
    }
}
