use std::collections::HashMap;

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::identity::is_hex_key;

/// Raw note form fields, as posted by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSubmission {
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub new_post: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// A submission that passed validation and may be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedNote {
    NewPost { content: String },
    Reply { content: String, parent_id: String },
}

impl ValidatedNote {
    pub fn content(&self) -> &str {
        match self {
            ValidatedNote::NewPost { content } | ValidatedNote::Reply { content, .. } => content,
        }
    }
}

impl NoteSubmission {
    /// Collect `[name, value]` form pairs. Unknown names are ignored and a
    /// repeated name keeps its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut fields: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        NoteSubmission {
            reply: fields.remove("reply"),
            new_post: fields.remove("new_post"),
            parent_id: fields.remove("parent_id"),
        }
    }

    pub fn validate(&self) -> Result<ValidatedNote, ValidationError> {
        if self.reply.is_none() && self.new_post.is_none() {
            return Err(ValidationError::Invalid);
        }
        if self.reply.as_deref().is_some_and(is_blank)
            || self.new_post.as_deref().is_some_and(is_blank)
        {
            return Err(ValidationError::Empty);
        }

        if let Some(content) = &self.reply {
            let parent_id = self
                .parent_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or(ValidationError::MissingParent)?;
            return Ok(ValidatedNote::Reply {
                content: content.clone(),
                parent_id: parent_id.to_string(),
            });
        }

        match &self.new_post {
            Some(content) => Ok(ValidatedNote::NewPost {
                content: content.clone(),
            }),
            None => Err(ValidationError::Invalid),
        }
    }
}

/// A private message that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMessage {
    pub recipient: PublicKey,
    pub content: String,
}

pub fn validate_message(recipient: &str, content: &str) -> Result<ValidatedMessage, ValidationError> {
    let recipient = recipient.trim();
    if !is_hex_key(recipient) {
        return Err(ValidationError::InvalidRecipient);
    }
    let recipient = PublicKey::from_hex(recipient).map_err(|_| ValidationError::InvalidRecipient)?;
    if is_blank(content) {
        return Err(ValidationError::Empty);
    }
    Ok(ValidatedMessage {
        recipient,
        content: content.to_string(),
    })
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}
