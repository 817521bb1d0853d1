pub mod session;
pub mod vault;

pub use session::{LoginRequest, LoginState, SaveKey, SessionState};
pub use vault::{
    decrypt_at_rest, encrypt_at_rest, generate_identity, is_hex_key, load_identity, KeyVault,
};
