//! Application-wide constants
//!
//! Centralized location for relay defaults, page sizes and event kinds
//! that are used across multiple modules.

/// Relays used when the configuration does not name any
pub const DEFAULT_RELAYS: [&str; 3] = [
    "wss://nostr.drss.io",
    "wss://nostr-pub.wellorder.net",
    "wss://nostr-relay.wlvs.space",
];

/// Maximum number of notes returned by one feed or profile page
pub const FEED_PAGE_SIZE: usize = 50;

/// Maximum number of private messages shown in one conversation
pub const MESSAGE_THREAD_LIMIT: usize = 100;

/// Length of a hex-encoded secret key, public key or event id
pub const HEX_KEY_LEN: usize = 64;

pub const DAY_SECS: u64 = 24 * 60 * 60;
pub const WEEK_SECS: u64 = 7 * DAY_SECS;

/// Message shown for every failed login, whatever the cause
pub const LOGIN_FAILED_MESSAGE: &str = "Incorrect key or password";

// Nostr event kinds handled by the reader
pub mod kinds {
    /// Profile metadata
    pub const METADATA: u16 = 0;
    /// Text note (post or reply)
    pub const TEXT_NOTE: u16 = 1;
    /// Follow list
    pub const CONTACT_LIST: u16 = 3;
    /// NIP-04 encrypted direct message
    pub const ENCRYPTED_DIRECT_MESSAGE: u16 = 4;
}
