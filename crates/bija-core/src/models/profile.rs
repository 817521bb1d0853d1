use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::constants::kinds;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub public_key: String,
    pub name: Option<String>,
    pub nip05: Option<String>,
    pub pic: Option<String>,
    pub about: Option<String>,
    pub updated_at: Option<u64>,
    pub following: bool,
    /// JSON list of keys this profile follows
    pub contacts: Option<String>,
}

impl Profile {
    pub fn contact_keys(&self) -> Vec<String> {
        self.contacts
            .as_deref()
            .and_then(|c| serde_json::from_str(c).ok())
            .unwrap_or_default()
    }
}

/// Short form used by follow lists and message lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub public_key: String,
    pub name: Option<String>,
    pub pic: Option<String>,
}

/// Display fields carried by a kind:0 metadata event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub public_key: String,
    pub name: Option<String>,
    pub nip05: Option<String>,
    pub pic: Option<String>,
    pub about: Option<String>,
    pub updated_at: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetadataContent {
    name: Option<String>,
    display_name: Option<String>,
    nip05: Option<String>,
    picture: Option<String>,
    about: Option<String>,
}

impl ProfileUpdate {
    /// Parse a kind:0 event. Malformed metadata JSON yields None.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind.as_u16() != kinds::METADATA {
            return None;
        }
        let content: MetadataContent = serde_json::from_str(&event.content).ok()?;
        let name = content
            .name
            .filter(|n| !n.trim().is_empty())
            .or(content.display_name);

        Some(ProfileUpdate {
            public_key: event.pubkey.to_hex(),
            name,
            nip05: content.nip05,
            pic: content.picture,
            about: content.about,
            updated_at: event.created_at.as_secs(),
        })
    }
}
