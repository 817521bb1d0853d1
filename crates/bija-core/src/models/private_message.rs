use nostr_sdk::nips::nip04;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Shown in place of content that does not decrypt with the session key
pub const UNREADABLE_MESSAGE: &str = "[unable to decrypt message]";

/// A NIP-04 direct message as stored. `content` is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub id: String,
    /// The other party of the conversation
    pub public_key: String,
    pub content: String,
    /// true = `public_key` sent it, false = we sent it
    pub is_sender: bool,
    pub created_at: u64,
    pub seen: bool,
}

/// Decrypted message ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub public_key: String,
    pub content: String,
    pub is_sender: bool,
    pub created_at: u64,
    pub name: Option<String>,
    pub pic: Option<String>,
}

impl MessageView {
    /// Decrypt a stored message with the session key. The shared secret is
    /// the same in both directions, so the counterparty key is used either way.
    pub fn decrypt(
        message: PrivateMessage,
        keys: &Keys,
        name: Option<String>,
        pic: Option<String>,
    ) -> Self {
        let content = PublicKey::from_hex(&message.public_key)
            .ok()
            .and_then(|peer| nip04::decrypt(keys.secret_key(), &peer, &message.content).ok())
            .unwrap_or_else(|| {
                debug!("Could not decrypt message {}", message.id);
                UNREADABLE_MESSAGE.to_string()
            });

        MessageView {
            id: message.id,
            public_key: message.public_key,
            content,
            is_sender: message.is_sender,
            created_at: message.created_at,
            name,
            pic,
        }
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub public_key: String,
    pub name: Option<String>,
    pub pic: Option<String>,
    pub last_message: u64,
    pub is_sender: bool,
    pub unseen: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, peer: &Keys, ciphertext: String, is_sender: bool) -> PrivateMessage {
        PrivateMessage {
            id: id.to_string(),
            public_key: peer.public_key().to_hex(),
            content: ciphertext,
            is_sender,
            created_at: 1,
            seen: false,
        }
    }

    #[test]
    fn test_decrypt_received_and_sent() {
        let me = Keys::generate();
        let peer = Keys::generate();

        let received = nip04::encrypt(peer.secret_key(), &me.public_key(), "hi there").unwrap();
        let view = MessageView::decrypt(stored("a", &peer, received, true), &me, None, None);
        assert_eq!(view.content, "hi there");
        assert!(view.is_sender);

        let sent = nip04::encrypt(me.secret_key(), &peer.public_key(), "hello back").unwrap();
        let view = MessageView::decrypt(
            stored("b", &peer, sent, false),
            &me,
            Some("peer".to_string()),
            None,
        );
        assert_eq!(view.content, "hello back");
        assert_eq!(view.name.as_deref(), Some("peer"));
    }

    #[test]
    fn test_undecryptable_content_is_replaced() {
        let me = Keys::generate();
        let peer = Keys::generate();
        let view = MessageView::decrypt(
            stored("c", &peer, "not ciphertext".to_string(), true),
            &me,
            None,
            None,
        );
        assert_eq!(view.content, UNREADABLE_MESSAGE);
    }
}
