use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::constants::{MESSAGE_THREAD_LIMIT, WEEK_SECS};
use crate::error::{BijaError, BijaResult};
use crate::feed::FeedPaginator;
use crate::identity::{
    generate_identity, is_hex_key, load_identity, KeyVault, LoginRequest, LoginState, SaveKey,
    SessionState,
};
use crate::models::{
    ConversationSummary, MessageView, NoteView, Profile, ProfileSummary, ThreadedNotes,
};
use crate::nostr::{NostrCommand, NostrWorker};
use crate::store::{Database, NoticeQueue};
use crate::submit::{validate_message, NoteSubmission, ValidatedNote};
use crate::sync::{PollPage, SyncCoordinator, SyncResult};
use crate::threads::assemble_threads;

#[derive(Clone)]
pub struct CoreHandle {
    command_tx: Sender<NostrCommand>,
}

impl CoreHandle {
    pub(crate) fn new(command_tx: Sender<NostrCommand>) -> Self {
        Self { command_tx }
    }

    pub fn send(&self, command: NostrCommand) -> Result<(), mpsc::SendError<NostrCommand>> {
        self.command_tx.send(command)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfilePage {
    pub profile: Option<Profile>,
    pub is_me: bool,
    #[serde(flatten)]
    pub notes: ThreadedNotes<NoteView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowingPage {
    pub profile: Option<Profile>,
    pub is_me: bool,
    pub profiles: Vec<ProfileSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageThreadPage {
    /// The counterparty, when a valid key was given
    pub public_key: Option<String>,
    pub messages: Vec<MessageView>,
}

/// Service context shared by every request: store, session, notices and the
/// handle to the background worker.
pub struct CoreRuntime {
    config: CoreConfig,
    db: Arc<Database>,
    session: Arc<SessionState>,
    notices: Arc<NoticeQueue>,
    vault: KeyVault,
    handle: CoreHandle,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    /// Held while the session key and the worker identity change together
    session_lock: Mutex<()>,
}

impl CoreRuntime {
    pub fn new(config: CoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data dir {}", config.data_dir.display())
        })?;
        let db = Arc::new(Database::open(config.database_path())?);
        let notices = Arc::new(NoticeQueue::new());

        let (command_tx, command_rx) = mpsc::channel::<NostrCommand>();
        let worker = NostrWorker::new(
            db.clone(),
            notices.clone(),
            command_rx,
            config.command_timeout,
        );
        let worker_handle = std::thread::Builder::new()
            .name("bija-nostr".to_string())
            .spawn(move || worker.run())
            .context("Failed to spawn nostr worker")?;

        info!(
            "Core runtime started ({} relay(s), data in {})",
            config.relays.len(),
            config.data_dir.display()
        );
        Ok(Self {
            vault: KeyVault::new(db.clone(), config.scrypt_log_n),
            config,
            db,
            session: Arc::new(SessionState::new()),
            notices,
            handle: CoreHandle::new(command_tx),
            worker_handle: Mutex::new(Some(worker_handle)),
            session_lock: Mutex::new(()),
        })
    }

    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn notices(&self) -> Arc<NoticeQueue> {
        self.notices.clone()
    }

    pub fn session(&self) -> Arc<SessionState> {
        self.session.clone()
    }

    pub fn public_key(&self) -> Option<String> {
        self.session.public_key_hex()
    }

    // ===== Identity =====

    /// Current login phase. A stored unencrypted key logs in here without
    /// any user action.
    pub fn login_state(&self) -> BijaResult<LoginState> {
        if self.session.is_logged_in() {
            return Ok(LoginState::LoggedIn);
        }
        let record = self.vault.stored_record()?;
        match LoginState::from_record(record.as_ref()) {
            LoginState::LoggedIn => match self.vault.load_unencrypted()? {
                Some(keys) => {
                    info!("Logging in with stored key");
                    self.start_session(keys)?;
                    Ok(LoginState::LoggedIn)
                }
                None => Ok(LoginState::LoggedOutNoKey),
            },
            state => Ok(state),
        }
    }

    /// Log in and return the hex public key of the new session
    pub fn login(&self, request: LoginRequest) -> BijaResult<String> {
        let keys = match request {
            LoginRequest::Unlock { password } => self.vault.unlock(password.trim())?,
            LoginRequest::Import { private_key, save } => {
                let keys = load_identity(&private_key)?;
                self.save_key(&keys, save)?;
                keys
            }
            LoginRequest::Generate { save } => {
                let keys = generate_identity();
                self.save_key(&keys, save)?;
                keys
            }
        };
        let public_key = keys.public_key().to_hex();
        self.start_session(keys)?;
        Ok(public_key)
    }

    fn save_key(&self, keys: &Keys, save: Option<SaveKey>) -> BijaResult<()> {
        match save {
            Some(SaveKey { password }) => self.vault.save(keys, Some(password.trim())),
            None => Ok(()),
        }
    }

    fn start_session(&self, keys: Keys) -> BijaResult<()> {
        let public_key = keys.public_key().to_hex();
        self.db.ensure_profile(&public_key)?;
        let _guard = self.session_lock.lock();
        self.session.activate(keys.clone());
        info!("Session started for {}", &public_key[..8]);
        self.dispatch(NostrCommand::Connect {
            keys,
            relay_urls: self.config.relays.clone(),
            response_tx: None,
        });
        Ok(())
    }

    /// Stop subscriptions, then drop the session key, then wipe the store
    pub fn reset_identity(&self) -> BijaResult<()> {
        let _guard = self.session_lock.lock();
        let (tx, rx) = mpsc::channel();
        self.dispatch(NostrCommand::Disconnect {
            response_tx: Some(tx),
        });
        if let Err(e) = self.wait(rx) {
            warn!("Disconnect before reset did not complete: {}", e);
        }
        self.session.clear();
        self.db.reset()?;
        info!("Identity reset");
        Ok(())
    }

    // ===== Pages =====

    /// First feed page; marks the feed seen
    pub fn home_feed(&self) -> BijaResult<ThreadedNotes<NoteView>> {
        let viewer = self.require_login()?;
        let threads = FeedPaginator::new(&self.db).threaded_feed(u64::MAX, &viewer)?;
        self.db.set_all_seen_in_feed(&viewer)?;
        Ok(threads)
    }

    pub fn feed_page(&self, before: Option<u64>) -> BijaResult<ThreadedNotes<NoteView>> {
        let viewer = self.require_login()?;
        FeedPaginator::new(&self.db).threaded_feed(before.unwrap_or(u64::MAX), &viewer)
    }

    /// A profile and its recent notes. Without a valid key, the viewer's own.
    pub fn profile_page(&self, public_key: Option<&str>) -> BijaResult<ProfilePage> {
        let me = self.require_login()?;
        let (target, is_me) = self.resolve_target(public_key, &me);
        if !is_me {
            self.dispatch(NostrCommand::SubscribeProfile {
                pubkey: target.clone(),
                since: Some(Timestamp::now().as_secs().saturating_sub(WEEK_SECS)),
            });
        }
        Ok(ProfilePage {
            profile: self.db.get_profile(&target)?,
            is_me,
            notes: FeedPaginator::new(&self.db).threaded_profile(&target, u64::MAX, None)?,
        })
    }

    /// A note with its stored replies
    pub fn note_page(&self, note_id: &str) -> BijaResult<ThreadedNotes<NoteView>> {
        self.require_login()?;
        if is_hex_key(note_id) {
            self.dispatch(NostrCommand::SubscribeThread {
                note_id: note_id.to_string(),
            });
        }
        Ok(assemble_threads(self.db.get_note_thread(note_id)?))
    }

    pub fn message_list(&self) -> BijaResult<Vec<ConversationSummary>> {
        self.require_login()?;
        self.db.message_list()
    }

    /// Conversation with `public_key`, oldest first. Unread messages are
    /// marked read only when they fall inside the returned window.
    pub fn message_thread(&self, public_key: Option<&str>) -> BijaResult<MessageThreadPage> {
        self.require_login()?;
        let keys = self.session.keys().ok_or(BijaError::NotLoggedIn)?;
        let Some(peer) = public_key.map(str::trim).filter(|pk| is_hex_key(pk)) else {
            return Ok(MessageThreadPage {
                public_key: None,
                messages: Vec::new(),
            });
        };

        let (name, pic) = self
            .db
            .get_profile(peer)?
            .map(|p| (p.name, p.pic))
            .unwrap_or_default();
        let messages = self
            .db
            .open_message_thread(peer, MESSAGE_THREAD_LIMIT)?
            .into_iter()
            .map(|m| MessageView::decrypt(m, &keys, name.clone(), pic.clone()))
            .collect();
        Ok(MessageThreadPage {
            public_key: Some(peer.to_string()),
            messages,
        })
    }

    /// Who a profile follows. Without a valid key, the viewer's own follows.
    pub fn following_page(&self, public_key: Option<&str>) -> BijaResult<FollowingPage> {
        let me = self.require_login()?;
        let (target, is_me) = self.resolve_target(public_key, &me);
        let profile = self.db.get_profile(&target)?;

        let profiles = if is_me {
            self.db.following()?
        } else {
            self.dispatch(NostrCommand::SubscribeProfile {
                pubkey: target.clone(),
                since: Some(Timestamp::now().as_secs().saturating_sub(WEEK_SECS)),
            });
            let contacts = profile.as_ref().map(Profile::contact_keys).unwrap_or_default();
            let mut profiles = Vec::with_capacity(contacts.len());
            for key in contacts {
                if let Some(p) = self.db.get_profile(&key)? {
                    profiles.push(ProfileSummary {
                        public_key: p.public_key,
                        name: p.name,
                        pic: p.pic,
                    });
                }
            }
            profiles
        };

        Ok(FollowingPage {
            profile,
            is_me,
            profiles,
        })
    }

    // ===== Actions =====

    /// Follow or unfollow, then republish the follow list in the background
    pub fn set_following(&self, public_key: &str, following: bool) -> BijaResult<Option<Profile>> {
        self.require_login()?;
        let public_key = public_key.trim();
        if !is_hex_key(public_key) {
            return Err(BijaError::InvalidKeyFormat);
        }
        self.db.set_following(&[public_key.to_string()], following)?;
        info!(
            "{} {}",
            if following { "Following" } else { "Unfollowed" },
            &public_key[..8]
        );
        self.dispatch(NostrCommand::PublishContactList { response_tx: None });
        self.db.get_profile(public_key)
    }

    /// Validate and publish a note; returns the new event id. Nothing reaches
    /// the worker unless validation passes.
    pub fn submit_note(&self, submission: &NoteSubmission) -> BijaResult<String> {
        self.require_login()?;
        let validated = submission.validate()?;
        let (content, reply_to) = match validated {
            ValidatedNote::NewPost { content } => (content, None),
            ValidatedNote::Reply { content, parent_id } => (content, Some(parent_id)),
        };

        let (tx, rx) = mpsc::channel();
        self.dispatch(NostrCommand::PublishNote {
            content,
            reply_to,
            response_tx: Some(tx),
        });
        self.wait(rx)
    }

    pub fn submit_message(&self, recipient: &str, content: &str) -> BijaResult<String> {
        self.require_login()?;
        let message = validate_message(recipient, content)?;

        let (tx, rx) = mpsc::channel();
        self.dispatch(NostrCommand::PublishMessage {
            recipient: message.recipient,
            content: message.content,
            response_tx: Some(tx),
        });
        self.wait(rx)
    }

    pub fn poll(&self, page: &PollPage) -> BijaResult<SyncResult> {
        SyncCoordinator::new(&self.db, &self.notices, &self.session).poll(page)
    }

    pub fn close_secondary_subscriptions(&self) {
        self.dispatch(NostrCommand::CloseSecondarySubscriptions);
    }

    pub fn shutdown(&self) {
        let _ = self.handle.send(NostrCommand::Shutdown);
        if let Some(worker_handle) = self.worker_handle.lock().take() {
            let _ = worker_handle.join();
        }
        self.session.clear();
        info!("Core runtime stopped");
    }

    // ===== Helpers =====

    fn require_login(&self) -> BijaResult<String> {
        if !self.session.is_logged_in() {
            self.login_state()?;
        }
        self.session.public_key_hex().ok_or(BijaError::NotLoggedIn)
    }

    fn resolve_target(&self, public_key: Option<&str>, me: &str) -> (String, bool) {
        match public_key.map(str::trim).filter(|pk| is_hex_key(pk)) {
            Some(pk) if pk != me => (pk.to_string(), false),
            _ => (me.to_string(), true),
        }
    }

    fn dispatch(&self, command: NostrCommand) {
        if let Err(e) = self.handle.send(command) {
            warn!("Background worker is gone, dropped {:?}", e.0);
        }
    }

    fn wait<T>(&self, rx: Receiver<Result<T, String>>) -> BijaResult<T> {
        match rx.recv_timeout(self.config.command_timeout) {
            Ok(result) => result.map_err(BijaError::Background),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(BijaError::Background(
                "Background worker did not respond in time".to_string(),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BijaError::Background(
                "Background worker stopped".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LOGIN_FAILED_MESSAGE;
    use crate::error::ValidationError;
    use nostr_sdk::nips::nip04;
    use tempfile::{tempdir, TempDir};

    fn offline_runtime() -> (TempDir, CoreRuntime) {
        let dir = tempdir().unwrap();
        let config = CoreConfig::new(dir.path())
            .with_relays(Vec::new())
            .with_scrypt_log_n(4);
        let runtime = CoreRuntime::new(config).unwrap();
        (dir, runtime)
    }

    fn reopen(dir: &TempDir) -> CoreRuntime {
        let config = CoreConfig::new(dir.path())
            .with_relays(Vec::new())
            .with_scrypt_log_n(4);
        CoreRuntime::new(config).unwrap()
    }

    #[test]
    fn test_fresh_store_has_no_key() {
        let (_dir, runtime) = offline_runtime();
        assert_eq!(runtime.login_state().unwrap(), LoginState::LoggedOutNoKey);
        assert!(matches!(runtime.home_feed(), Err(BijaError::NotLoggedIn)));
        runtime.shutdown();
    }

    #[test]
    fn test_stored_plain_key_logs_in_without_prompt() {
        let (dir, runtime) = offline_runtime();
        let keys = Keys::generate();
        runtime
            .login(LoginRequest::Import {
                private_key: keys.secret_key().to_secret_hex(),
                save: Some(SaveKey {
                    password: String::new(),
                }),
            })
            .unwrap();
        runtime.shutdown();

        let restarted = reopen(&dir);
        assert_eq!(restarted.login_state().unwrap(), LoginState::LoggedIn);
        assert_eq!(restarted.public_key(), Some(keys.public_key().to_hex()));
        restarted.shutdown();
    }

    #[test]
    fn test_encrypted_key_requires_password() {
        let (dir, runtime) = offline_runtime();
        let public_key = runtime
            .login(LoginRequest::Generate {
                save: Some(SaveKey {
                    password: "hunter2".to_string(),
                }),
            })
            .unwrap();
        runtime.shutdown();

        let restarted = reopen(&dir);
        assert_eq!(
            restarted.login_state().unwrap(),
            LoginState::LoggedOutPasswordRequired
        );

        let wrong = restarted
            .login(LoginRequest::Unlock {
                password: "wrong".to_string(),
            })
            .unwrap_err();
        assert_eq!(wrong.user_message(), LOGIN_FAILED_MESSAGE);
        assert!(restarted.public_key().is_none());

        let unlocked = restarted
            .login(LoginRequest::Unlock {
                password: "hunter2".to_string(),
            })
            .unwrap();
        assert_eq!(unlocked, public_key);
        assert_eq!(restarted.login_state().unwrap(), LoginState::LoggedIn);
        restarted.shutdown();
    }

    #[test]
    fn test_malformed_key_is_rejected_without_state_change() {
        let (_dir, runtime) = offline_runtime();
        let err = runtime
            .login(LoginRequest::Import {
                private_key: "not-a-key".to_string(),
                save: Some(SaveKey {
                    password: String::new(),
                }),
            })
            .unwrap_err();
        assert_eq!(err.user_message(), LOGIN_FAILED_MESSAGE);
        assert!(runtime.database().key_record().unwrap().is_none());
        assert_eq!(runtime.login_state().unwrap(), LoginState::LoggedOutNoKey);
        runtime.shutdown();
    }

    #[test]
    fn test_submit_and_read_back_in_feed() {
        let (_dir, runtime) = offline_runtime();
        runtime.login(LoginRequest::Generate { save: None }).unwrap();

        let root_id = runtime
            .submit_note(&NoteSubmission::from_pairs([("new_post", "first post")]))
            .unwrap();
        let reply_id = runtime
            .submit_note(&NoteSubmission::from_pairs([
                ("reply", "a reply"),
                ("parent_id", root_id.as_str()),
            ]))
            .unwrap();

        let feed = runtime.home_feed().unwrap();
        assert_eq!(feed.threads.len(), 1);
        assert_eq!(feed.ids, vec![root_id.clone(), reply_id]);

        let thread = runtime.note_page(&root_id).unwrap();
        assert_eq!(thread.ids.len(), 2);
        runtime.shutdown();
    }

    #[test]
    fn test_empty_reply_creates_nothing() {
        let (_dir, runtime) = offline_runtime();
        runtime.login(LoginRequest::Generate { save: None }).unwrap();

        let err = runtime
            .submit_note(&NoteSubmission::from_pairs([("reply", ""), ("parent_id", "abc")]))
            .unwrap_err();
        assert!(matches!(
            err,
            BijaError::Validation(ValidationError::Empty)
        ));
        assert!(runtime.home_feed().unwrap().ids.is_empty());
        runtime.shutdown();
    }

    #[test]
    fn test_follow_toggle() {
        let (_dir, runtime) = offline_runtime();
        let me = runtime.login(LoginRequest::Generate { save: None }).unwrap();
        let friend = Keys::generate().public_key().to_hex();

        let profile = runtime.set_following(&friend, true).unwrap().unwrap();
        assert!(profile.following);
        let page = runtime.following_page(None).unwrap();
        assert!(page.is_me);
        assert_eq!(page.profiles.len(), 1);

        runtime.set_following(&friend, false).unwrap();
        assert!(runtime.following_page(Some(&me)).unwrap().profiles.is_empty());
        assert!(matches!(
            runtime.set_following("bogus", true),
            Err(BijaError::InvalidKeyFormat)
        ));
        runtime.shutdown();
    }

    #[test]
    fn test_message_round_trip_and_poll() {
        let (_dir, runtime) = offline_runtime();
        let me = Keys::generate();
        runtime
            .login(LoginRequest::Import {
                private_key: me.secret_key().to_secret_hex(),
                save: None,
            })
            .unwrap();
        let peer = Keys::generate();
        let peer_hex = peer.public_key().to_hex();

        runtime.submit_message(&peer_hex, "hello peer").unwrap();
        assert!(matches!(
            runtime.submit_message(&peer_hex, " "),
            Err(BijaError::Validation(ValidationError::Empty))
        ));

        let incoming = nip04::encrypt(peer.secret_key(), &me.public_key(), "hello back").unwrap();
        runtime
            .database()
            .insert_private_message(&crate::models::PrivateMessage {
                id: "incoming".to_string(),
                public_key: peer_hex.clone(),
                content: incoming,
                is_sender: true,
                created_at: Timestamp::now().as_secs() + 10,
                seen: false,
            })
            .unwrap();

        let page = PollPage::MessagesFrom {
            public_key: peer_hex.clone(),
        };
        let first = runtime.poll(&page).unwrap();
        assert_eq!(first.messages.unwrap()[0].content, "hello back");
        assert_eq!(first.unseen_messages, 0);
        assert!(runtime.poll(&page).unwrap().messages.is_none());

        let thread = runtime.message_thread(Some(&peer_hex)).unwrap();
        let contents: Vec<&str> = thread.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello peer", "hello back"]);
        runtime.shutdown();
    }

    #[test]
    fn test_message_thread_marks_only_shown_messages_read() {
        let (_dir, runtime) = offline_runtime();
        runtime.login(LoginRequest::Generate { save: None }).unwrap();
        let peer = Keys::generate().public_key().to_hex();
        let db = runtime.database();
        for i in 0..150u64 {
            db.insert_private_message(&crate::store::db::tests::message(
                &format!("m{:03}", i),
                &peer,
                true,
                1_000 + i,
            ))
            .unwrap();
        }

        let page = runtime.message_thread(Some(&peer)).unwrap();
        assert_eq!(page.messages.len(), MESSAGE_THREAD_LIMIT);
        assert_eq!(db.unseen_message_count().unwrap(), 50);

        let older = runtime
            .poll(&PollPage::MessagesFrom {
                public_key: peer.clone(),
            })
            .unwrap();
        assert_eq!(older.messages.map(|m| m.len()), Some(50));
        assert_eq!(older.unseen_messages, 0);
        runtime.shutdown();
    }

    #[test]
    fn test_concurrent_logins_leave_session_and_worker_in_agreement() {
        let (_dir, runtime) = offline_runtime();
        let identities: Vec<Keys> = (0..4).map(|_| Keys::generate()).collect();

        std::thread::scope(|scope| {
            for keys in &identities {
                let runtime = &runtime;
                scope.spawn(move || {
                    runtime
                        .login(LoginRequest::Import {
                            private_key: keys.secret_key().to_secret_hex(),
                            save: None,
                        })
                        .unwrap();
                });
            }
        });

        let active = runtime.public_key().unwrap();
        assert!(identities
            .iter()
            .any(|k| k.public_key().to_hex() == active));

        let note_id = runtime
            .submit_note(&NoteSubmission::from_pairs([("new_post", "who am i")]))
            .unwrap();
        let note = runtime.database().get_note(&note_id).unwrap().unwrap();
        assert_eq!(note.note.public_key, active);
        runtime.shutdown();
    }

    #[test]
    fn test_reset_identity_clears_everything() {
        let (_dir, runtime) = offline_runtime();
        runtime
            .login(LoginRequest::Generate {
                save: Some(SaveKey {
                    password: String::new(),
                }),
            })
            .unwrap();
        runtime
            .submit_note(&NoteSubmission::from_pairs([("new_post", "gone soon")]))
            .unwrap();

        runtime.reset_identity().unwrap();
        assert!(runtime.public_key().is_none());
        assert!(runtime.database().key_record().unwrap().is_none());
        assert_eq!(runtime.login_state().unwrap(), LoginState::LoggedOutNoKey);
        runtime.shutdown();
    }

    #[test]
    fn test_worker_stops_on_shutdown() {
        let (_dir, runtime) = offline_runtime();
        runtime.shutdown();
        assert!(runtime.worker_handle.lock().is_none());

        let (tx, rx) = mpsc::channel();
        runtime.dispatch(NostrCommand::Disconnect {
            response_tx: Some(tx),
        });
        assert!(matches!(runtime.wait(rx), Err(BijaError::Background(_))));
    }
}
