use nostr_sdk::prelude::*;
use tracing::{debug, warn};

use crate::constants::kinds;
use crate::error::BijaResult;
use crate::models::tag_utils::{extract_all_tag_values, extract_tag_value};
use crate::models::{Note, PrivateMessage, ProfileUpdate};
use crate::store::Database;

/// What an incoming event changed in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Profile { changed: bool },
    /// `unknown_author` is set when the author had no profile row yet
    Note {
        inserted: bool,
        unknown_author: Option<String>,
    },
    Contacts { count: usize },
    Message { inserted: bool },
    Ignored,
}

/// Fold one protocol event into the store.
///
/// `identity` is the logged-in public key; it decides which contact list
/// drives the follow flags and which direct messages belong to us.
pub fn ingest_event(
    db: &Database,
    event: &Event,
    identity: Option<&PublicKey>,
) -> BijaResult<IngestOutcome> {
    match event.kind.as_u16() {
        kinds::METADATA => match ProfileUpdate::from_event(event) {
            Some(update) => Ok(IngestOutcome::Profile {
                changed: db.upsert_profile(&update)?,
            }),
            None => {
                debug!("Ignoring malformed metadata {}", event.id.to_hex());
                Ok(IngestOutcome::Ignored)
            }
        },
        kinds::TEXT_NOTE => ingest_note(db, event, identity),
        kinds::CONTACT_LIST => {
            let keys = extract_all_tag_values(event, "p");
            let author = event.pubkey.to_hex();
            db.set_contacts(&author, &keys)?;
            if identity == Some(&event.pubkey) {
                db.set_following(&keys, true)?;
            }
            Ok(IngestOutcome::Contacts { count: keys.len() })
        }
        kinds::ENCRYPTED_DIRECT_MESSAGE => ingest_direct_message(db, event, identity),
        other => {
            debug!("Ignoring event of kind {}", other);
            Ok(IngestOutcome::Ignored)
        }
    }
}

fn ingest_note(
    db: &Database,
    event: &Event,
    identity: Option<&PublicKey>,
) -> BijaResult<IngestOutcome> {
    let Some(note) = Note::from_event(event) else {
        return Ok(IngestOutcome::Ignored);
    };

    let unknown_author = if db.is_known_pubkey(&note.public_key)? {
        None
    } else {
        db.ensure_profile(&note.public_key)?;
        Some(note.public_key.clone())
    };

    let own = identity == Some(&event.pubkey);
    let inserted = db.insert_note(&note, own)?;
    Ok(IngestOutcome::Note {
        inserted,
        unknown_author,
    })
}

fn ingest_direct_message(
    db: &Database,
    event: &Event,
    identity: Option<&PublicKey>,
) -> BijaResult<IngestOutcome> {
    let Some(me) = identity else {
        return Ok(IngestOutcome::Ignored);
    };
    let me_hex = me.to_hex();
    let (counterparty, is_sender) = if event.pubkey == *me {
        match extract_tag_value(event, "p") {
            Some(recipient) => (recipient, false),
            None => {
                warn!("Outgoing message {} has no recipient", event.id.to_hex());
                return Ok(IngestOutcome::Ignored);
            }
        }
    } else if extract_all_tag_values(event, "p").contains(&me_hex) {
        (event.pubkey.to_hex(), true)
    } else {
        return Ok(IngestOutcome::Ignored);
    };

    db.ensure_profile(&counterparty)?;
    let inserted = db.insert_private_message(&PrivateMessage {
        id: event.id.to_hex(),
        public_key: counterparty,
        content: event.content.clone(),
        is_sender,
        created_at: event.created_at.as_secs(),
        seen: !is_sender,
    })?;
    Ok(IngestOutcome::Message { inserted })
}
