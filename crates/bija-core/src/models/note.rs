use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use super::tag_utils::{extract_all_tag_values, extract_event_references, EventReference};
use crate::constants::kinds;

/// A stored kind:1 text note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub public_key: String,
    pub content: String,
    /// Direct parent note id
    pub response_to: Option<String>,
    /// Root note id of the conversation
    pub thread_root: Option<String>,
    pub created_at: u64,
    /// JSON list of p-tagged participants
    pub members: Option<String>,
}

impl Note {
    /// Create a Note from a kind:1 event, resolving NIP-10 `e` tags.
    ///
    /// Marked tags win: `root` is the thread root, `reply` the direct parent
    /// (a lone `root` marker means a direct reply to the root). Without
    /// markers the deprecated positional scheme applies: first = root,
    /// last = parent, and a single tag is both.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind.as_u16() != kinds::TEXT_NOTE {
            return None;
        }

        let (thread_root, response_to) = resolve_nip10(&extract_event_references(event));

        let p_tags = extract_all_tag_values(event, "p");
        let members = if p_tags.is_empty() {
            None
        } else {
            serde_json::to_string(&p_tags).ok()
        };

        Some(Note {
            id: event.id.to_hex(),
            public_key: event.pubkey.to_hex(),
            content: event.content.clone(),
            response_to,
            thread_root,
            created_at: event.created_at.as_secs(),
            members,
        })
    }

    pub fn is_reply(&self) -> bool {
        self.response_to.is_some()
    }

    /// Participant keys decoded from `members`
    pub fn member_keys(&self) -> Vec<String> {
        self.members
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or_default()
    }
}

impl AsRef<Note> for Note {
    fn as_ref(&self) -> &Note {
        self
    }
}

/// Returns (thread_root, response_to)
fn resolve_nip10(refs: &[EventReference]) -> (Option<String>, Option<String>) {
    let marked = |name: &str| {
        refs.iter()
            .find(|r| r.marker.as_deref() == Some(name))
            .map(|r| r.event_id.clone())
    };
    let root = marked("root");
    let reply = marked("reply");

    if root.is_some() || reply.is_some() {
        let response_to = reply.or_else(|| root.clone());
        return (root, response_to);
    }

    // "mention" markers never describe the reply chain
    let unmarked: Vec<&EventReference> = refs.iter().filter(|r| r.marker.is_none()).collect();
    match (unmarked.first(), unmarked.last()) {
        (Some(first), Some(last)) => (Some(first.event_id.clone()), Some(last.event_id.clone())),
        _ => (None, None),
    }
}

/// Display fields of a note's author, joined from the profile table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSummary {
    pub name: Option<String>,
    pub pic: Option<String>,
    pub nip05: Option<String>,
}

/// A note joined with its author's display fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteView {
    #[serde(flatten)]
    pub note: Note,
    #[serde(flatten)]
    pub author: AuthorSummary,
}

impl AsRef<Note> for NoteView {
    fn as_ref(&self) -> &Note {
        &self.note
    }
}
