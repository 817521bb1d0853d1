use nostr_sdk::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::KeyRecord;

/// Login phase as seen by a page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    LoggedOutNoKey,
    LoggedOutPasswordRequired,
    LoggedIn,
}

impl LoginState {
    /// Phase implied by the stored record when no session is active.
    /// An unencrypted record is logged in without user action.
    pub fn from_record(record: Option<&KeyRecord>) -> Self {
        match record {
            None => LoginState::LoggedOutNoKey,
            Some(record) if record.encrypted => LoginState::LoggedOutPasswordRequired,
            Some(_) => LoginState::LoggedIn,
        }
    }
}

/// Password to store a key with. An empty password stores it unencrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveKey {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginRequest {
    /// Decrypt the stored encrypted key
    Unlock { password: String },
    /// Use a freshly supplied hex private key
    Import {
        private_key: String,
        #[serde(default)]
        save: Option<SaveKey>,
    },
    /// Create a new identity
    Generate {
        #[serde(default)]
        save: Option<SaveKey>,
    },
}

/// Decrypted key material for the active login. Lives only in memory and
/// is dropped on logout or reset.
#[derive(Default)]
pub struct SessionState {
    active: RwLock<Option<Keys>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active identity
    pub fn activate(&self, keys: Keys) {
        *self.active.write() = Some(keys);
    }

    pub fn clear(&self) {
        self.active.write().take();
    }

    pub fn is_logged_in(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn keys(&self) -> Option<Keys> {
        self.active.read().clone()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.active.read().as_ref().map(|k| k.public_key())
    }

    pub fn public_key_hex(&self) -> Option<String> {
        self.public_key().map(|pk| pk.to_hex())
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_record() {
        assert_eq!(LoginState::from_record(None), LoginState::LoggedOutNoKey);

        let plain = KeyRecord {
            key: "k".to_string(),
            encrypted: false,
        };
        assert_eq!(LoginState::from_record(Some(&plain)), LoginState::LoggedIn);

        let encrypted = KeyRecord {
            key: "ncryptsec1...".to_string(),
            encrypted: true,
        };
        assert_eq!(
            LoginState::from_record(Some(&encrypted)),
            LoginState::LoggedOutPasswordRequired
        );
    }

    #[test]
    fn test_session_lifecycle() {
        let session = SessionState::new();
        assert!(!session.is_logged_in());
        assert!(session.keys().is_none());

        let keys = Keys::generate();
        session.activate(keys.clone());
        assert!(session.is_logged_in());
        assert_eq!(session.public_key(), Some(keys.public_key()));
        assert_eq!(session.public_key_hex(), Some(keys.public_key().to_hex()));

        session.clear();
        assert!(!session.is_logged_in());
        assert!(session.public_key().is_none());
    }

    #[test]
    fn test_debug_hides_secret() {
        let session = SessionState::new();
        let keys = Keys::generate();
        let secret = keys.secret_key().to_secret_hex();
        session.activate(keys);
        assert!(!format!("{:?}", session).contains(&secret));
    }

    #[test]
    fn test_login_request_json() {
        let request: LoginRequest = serde_json::from_str(
            r#"{"type":"import","private_key":"abc","save":{"password":"pw"}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            LoginRequest::Import {
                private_key: "abc".to_string(),
                save: Some(SaveKey {
                    password: "pw".to_string()
                }),
            }
        );

        let request: LoginRequest = serde_json::from_str(r#"{"type":"generate"}"#).unwrap();
        assert_eq!(request, LoginRequest::Generate { save: None });

        assert_eq!(
            serde_json::to_string(&LoginState::LoggedOutPasswordRequired).unwrap(),
            r#""logged_out_password_required""#
        );
    }
}
