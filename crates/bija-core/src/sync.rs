use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BijaResult;
use crate::identity::SessionState;
use crate::models::{MessageView, Profile};
use crate::store::{Database, NoticeQueue};

/// The page a poll comes from, with the watermark the client holds for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollPage {
    Home,
    Profile { public_key: String, updated_ts: u64 },
    MessagesFrom { public_key: String },
    /// Unknown or incomplete page identity
    Other,
}

impl PollPage {
    /// Build from raw query values. Anything missing or malformed becomes
    /// `Other` instead of an error.
    pub fn from_params(page: Option<&str>, pk: Option<&str>, updated_ts: Option<&str>) -> Self {
        let pk = pk.map(str::trim).filter(|pk| !pk.is_empty());
        match (page, pk) {
            (Some("home"), _) => PollPage::Home,
            (Some("profile"), Some(pk)) => match updated_ts.and_then(|ts| ts.trim().parse().ok()) {
                Some(updated_ts) => PollPage::Profile {
                    public_key: pk.to_string(),
                    updated_ts,
                },
                None => PollPage::Other,
            },
            (Some("messages_from"), Some(pk)) => PollPage::MessagesFrom {
                public_key: pk.to_string(),
            },
            _ => PollPage::Other,
        }
    }
}

/// Changed display fields of the profile being viewed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDelta {
    pub name: Option<String>,
    pub nip05: Option<String>,
    pub about: Option<String>,
    pub updated_at: Option<u64>,
    pub pic: Option<String>,
}

impl From<Profile> for ProfileDelta {
    fn from(profile: Profile) -> Self {
        ProfileDelta {
            name: profile.name,
            nip05: profile.nip05,
            about: profile.about,
            updated_at: profile.updated_at,
            pic: profile.pic,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub unseen_posts: u64,
    pub notices: Vec<String>,
    pub unseen_messages: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<MessageView>>,
}

/// Merges feed, profile, message and notice deltas into one poll response.
pub struct SyncCoordinator<'a> {
    db: &'a Database,
    notices: &'a NoticeQueue,
    session: &'a SessionState,
}

impl<'a> SyncCoordinator<'a> {
    pub fn new(db: &'a Database, notices: &'a NoticeQueue, session: &'a SessionState) -> Self {
        Self {
            db,
            notices,
            session,
        }
    }

    /// Answer one poll.
    ///
    /// Notices are drained last so a store failure leaves them queued for
    /// the next poll. Messages from a `MessagesFrom` counterparty are marked
    /// read only when they are returned here.
    pub fn poll(&self, page: &PollPage) -> BijaResult<SyncResult> {
        let viewer = self.session.public_key_hex().unwrap_or_default();
        let mut result = SyncResult {
            unseen_posts: self.db.unseen_in_feed(&viewer)?,
            ..Default::default()
        };

        match page {
            PollPage::Profile {
                public_key,
                updated_ts,
            } => {
                result.profile = self
                    .db
                    .get_profile_updates(public_key, *updated_ts)?
                    .map(ProfileDelta::from);
            }
            PollPage::MessagesFrom { public_key } => {
                result.messages = self.take_messages(public_key)?;
            }
            PollPage::Home | PollPage::Other => {}
        }

        result.unseen_messages = self.db.unseen_message_count()?;
        result.notices = self.notices.drain();
        Ok(result)
    }

    fn take_messages(&self, public_key: &str) -> BijaResult<Option<Vec<MessageView>>> {
        let Some(keys) = self.session.keys() else {
            return Ok(None);
        };
        let messages = self.db.take_unseen_messages(public_key)?;
        if messages.is_empty() {
            return Ok(None);
        }
        debug!("Delivering {} new message(s)", messages.len());

        let profile = self.db.get_profile(public_key)?;
        let (name, pic) = profile.map(|p| (p.name, p.pic)).unwrap_or_default();
        Ok(Some(
            messages
                .into_iter()
                .map(|m| MessageView::decrypt(m, &keys, name.clone(), pic.clone()))
                .collect(),
        ))
    }
}
