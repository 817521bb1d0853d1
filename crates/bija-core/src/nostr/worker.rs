use std::collections::HashSet;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nostr_sdk::nips::nip04;
use nostr_sdk::prelude::*;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::constants::{DAY_SECS, WEEK_SECS};
use crate::models::Note;
use crate::store::{Database, NoticeQueue};

use super::ingest::{ingest_event, IngestOutcome};

/// Completion signal for a background command
pub type Completion<T> = Option<Sender<Result<T, String>>>;

pub enum NostrCommand {
    /// Start a session: connect to relays and subscribe to the identity's
    /// primary streams. With no relays the worker stays offline but keeps
    /// the keys for local publishing.
    Connect {
        keys: Keys,
        relay_urls: Vec<String>,
        response_tx: Completion<()>,
    },
    /// Fetch a profile's metadata, follow list and recent notes
    SubscribeProfile {
        pubkey: String,
        /// Only notes newer than this; defaults to one week back
        since: Option<u64>,
    },
    /// Fetch a note and its replies
    SubscribeThread { note_id: String },
    /// Drop every profile and thread subscription, keeping the primary ones
    CloseSecondarySubscriptions,
    /// Sign, store and publish a kind:1 note. Replies to `reply_to` when set.
    PublishNote {
        content: String,
        reply_to: Option<String>,
        response_tx: Completion<String>,
    },
    /// Encrypt, sign, store and publish a direct message
    PublishMessage {
        recipient: PublicKey,
        content: String,
        response_tx: Completion<String>,
    },
    /// Publish the current follow list
    PublishContactList { response_tx: Completion<String> },
    /// Close subscriptions and forget the session, keeping the worker alive
    Disconnect { response_tx: Completion<()> },
    Shutdown,
}

impl std::fmt::Debug for NostrCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NostrCommand::Connect { .. } => "Connect",
            NostrCommand::SubscribeProfile { .. } => "SubscribeProfile",
            NostrCommand::SubscribeThread { .. } => "SubscribeThread",
            NostrCommand::CloseSecondarySubscriptions => "CloseSecondarySubscriptions",
            NostrCommand::PublishNote { .. } => "PublishNote",
            NostrCommand::PublishMessage { .. } => "PublishMessage",
            NostrCommand::PublishContactList { .. } => "PublishContactList",
            NostrCommand::Disconnect { .. } => "Disconnect",
            NostrCommand::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

pub struct NostrWorker {
    client: Option<Client>,
    keys: Option<Keys>,
    db: Arc<Database>,
    notices: Arc<NoticeQueue>,
    command_rx: Receiver<NostrCommand>,
    rt_handle: Option<tokio::runtime::Handle>,
    /// Pubkeys for which a kind:0 subscription was already opened
    requested_profiles: Arc<RwLock<HashSet<String>>>,
    /// Profile and thread subscriptions, closed when the user leaves the page
    secondary_subscriptions: Vec<SubscriptionId>,
    /// Signals background tasks to stop on disconnect
    cancel_tx: Option<watch::Sender<bool>>,
    network_timeout: Duration,
}

impl NostrWorker {
    pub fn new(
        db: Arc<Database>,
        notices: Arc<NoticeQueue>,
        command_rx: Receiver<NostrCommand>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            client: None,
            keys: None,
            db,
            notices,
            command_rx,
            rt_handle: None,
            requested_profiles: Arc::new(RwLock::new(HashSet::new())),
            secondary_subscriptions: Vec::new(),
            cancel_tx: None,
            network_timeout,
        }
    }

    pub fn run(mut self) {
        let rt = match Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create worker runtime: {}", e);
                return;
            }
        };
        self.rt_handle = Some(rt.handle().clone());
        debug!("Nostr worker thread started");

        while let Ok(cmd) = self.command_rx.recv() {
            debug!("Worker: {:?}", cmd);
            match cmd {
                NostrCommand::Connect {
                    keys,
                    relay_urls,
                    response_tx,
                } => {
                    let result = rt.block_on(self.handle_connect(keys, relay_urls));
                    if let Err(e) = &result {
                        error!("Failed to connect: {:#}", e);
                        self.notices.push(format!("Connection failed: {}", e));
                    }
                    respond(response_tx, result);
                }
                NostrCommand::SubscribeProfile { pubkey, since } => {
                    if let Err(e) = rt.block_on(self.handle_subscribe_profile(&pubkey, since)) {
                        warn!("Profile subscription failed: {:#}", e);
                    }
                }
                NostrCommand::SubscribeThread { note_id } => {
                    if let Err(e) = rt.block_on(self.handle_subscribe_thread(&note_id)) {
                        warn!("Thread subscription failed: {:#}", e);
                    }
                }
                NostrCommand::CloseSecondarySubscriptions => {
                    rt.block_on(self.handle_close_secondary());
                }
                NostrCommand::PublishNote {
                    content,
                    reply_to,
                    response_tx,
                } => {
                    let signed = self
                        .sign(|keys| Self::build_note(&self.db, keys, content, reply_to.as_deref()));
                    rt.block_on(self.store_and_publish("note", signed, response_tx));
                }
                NostrCommand::PublishMessage {
                    recipient,
                    content,
                    response_tx,
                } => {
                    let signed =
                        self.sign(|keys| Self::build_direct_message(keys, &recipient, &content));
                    rt.block_on(self.store_and_publish("message", signed, response_tx));
                }
                NostrCommand::PublishContactList { response_tx } => {
                    let signed = self
                        .db
                        .following_pubkeys()
                        .map_err(anyhow::Error::from)
                        .and_then(|following| {
                            self.sign(|_| Ok(Self::build_contact_list(&following)))
                        });
                    rt.block_on(self.store_and_publish("follow list", signed, response_tx));
                }
                NostrCommand::Disconnect { response_tx } => {
                    rt.block_on(self.handle_disconnect());
                    respond(response_tx, Ok(()));
                }
                NostrCommand::Shutdown => {
                    rt.block_on(self.handle_disconnect());
                    break;
                }
            }
        }

        debug!("Nostr worker thread stopped");
    }

    async fn handle_connect(&mut self, keys: Keys, relay_urls: Vec<String>) -> Result<()> {
        if self.keys.is_some() {
            self.handle_disconnect().await;
        }
        let pubkey = keys.public_key();
        self.keys = Some(keys.clone());

        if relay_urls.is_empty() {
            info!("No relays configured, staying offline");
            return Ok(());
        }

        let client = Client::builder().signer(keys).build();
        for url in &relay_urls {
            if let Err(e) = client.add_relay(url.as_str()).await {
                warn!("Skipping relay {}: {}", url, e);
            }
        }

        tokio::time::timeout(self.network_timeout, client.connect())
            .await
            .context("Relay connect timed out")?;
        info!("Connected to {} relay(s)", relay_urls.len());

        self.client = Some(client);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        self.cancel_tx = Some(cancel_tx);

        self.spawn_notification_handler(pubkey);
        self.start_subscriptions(pubkey).await
    }

    async fn start_subscriptions(&self, pubkey: PublicKey) -> Result<()> {
        let client = self.client.as_ref().context("No client")?;
        let now = Timestamp::now().as_secs();

        let mut authors: Vec<PublicKey> = self
            .db
            .following_pubkeys()?
            .iter()
            .filter_map(|pk| PublicKey::from_hex(pk).ok())
            .collect();
        authors.push(pubkey);

        let filters = vec![
            Filter::new()
                .kinds([Kind::Metadata, Kind::ContactList])
                .authors(authors.clone()),
            Filter::new()
                .kind(Kind::TextNote)
                .authors(authors)
                .since(Timestamp::from(now.saturating_sub(DAY_SECS))),
            Filter::new().kind(Kind::TextNote).pubkey(pubkey),
            Filter::new().kind(Kind::EncryptedDirectMessage).pubkey(pubkey),
            Filter::new().kind(Kind::EncryptedDirectMessage).author(pubkey),
        ];

        for filter in filters {
            match tokio::time::timeout(self.network_timeout, client.subscribe(filter, None)).await {
                Ok(Ok(output)) => debug!("Primary subscription {}", output.val),
                Ok(Err(e)) => warn!("Primary subscription failed: {}", e),
                Err(_) => warn!("Primary subscription timed out"),
            }
        }
        Ok(())
    }

    async fn handle_subscribe_profile(&mut self, pubkey: &str, since: Option<u64>) -> Result<()> {
        let Some(client) = self.client.clone() else {
            return Ok(());
        };
        let author = PublicKey::from_hex(pubkey).context("Invalid profile key")?;
        let since = since.unwrap_or_else(|| Timestamp::now().as_secs().saturating_sub(WEEK_SECS));

        let filters = vec![
            Filter::new()
                .kinds([Kind::Metadata, Kind::ContactList])
                .author(author),
            Filter::new()
                .kind(Kind::TextNote)
                .author(author)
                .since(Timestamp::from(since)),
        ];
        for filter in filters {
            self.subscribe_secondary(&client, filter).await?;
        }
        Ok(())
    }

    async fn handle_subscribe_thread(&mut self, note_id: &str) -> Result<()> {
        let Some(client) = self.client.clone() else {
            return Ok(());
        };
        let id = EventId::from_hex(note_id).context("Invalid note id")?;

        let filters = vec![
            Filter::new().id(id),
            Filter::new().kind(Kind::TextNote).event(id),
        ];
        for filter in filters {
            self.subscribe_secondary(&client, filter).await?;
        }
        Ok(())
    }

    async fn subscribe_secondary(&mut self, client: &Client, filter: Filter) -> Result<()> {
        let output = tokio::time::timeout(self.network_timeout, client.subscribe(filter, None))
            .await
            .context("Subscription timed out")??;
        debug!("Secondary subscription {}", output.val);
        self.secondary_subscriptions.push(output.val);
        Ok(())
    }

    async fn handle_close_secondary(&mut self) {
        let ids = std::mem::take(&mut self.secondary_subscriptions);
        let Some(client) = &self.client else {
            return;
        };
        if !ids.is_empty() {
            debug!("Closing {} secondary subscription(s)", ids.len());
        }
        for id in ids {
            client.unsubscribe(&id).await;
        }
    }

    fn spawn_notification_handler(&self, identity: PublicKey) {
        let (Some(client), Some(rt_handle), Some(cancel_tx)) =
            (self.client.clone(), self.rt_handle.clone(), self.cancel_tx.as_ref())
        else {
            return;
        };
        let mut cancel_rx = cancel_tx.subscribe();
        let db = self.db.clone();
        let notices = self.notices.clone();
        let requested_profiles = self.requested_profiles.clone();

        rt_handle.spawn(async move {
            let mut notifications = client.notifications();
            debug!("Notification handler started");

            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            debug!("Notification handler cancelled");
                            break;
                        }
                    }
                    result = notifications.recv() => {
                        match result {
                            Ok(RelayPoolNotification::Event { relay_url, event, .. }) => {
                                match ingest_event(&db, &event, Some(&identity)) {
                                    Ok(IngestOutcome::Note { unknown_author: Some(author), .. }) => {
                                        request_profile(&client, &requested_profiles, author).await;
                                    }
                                    Ok(_) => {}
                                    Err(e) => warn!(
                                        "Failed to ingest {} from {}: {}",
                                        event.id.to_hex(),
                                        relay_url,
                                        e
                                    ),
                                }
                            }
                            Ok(RelayPoolNotification::Message { relay_url, message }) => {
                                if let RelayMessage::Notice(notice) = &message {
                                    info!("Notice from {}: {}", relay_url, notice);
                                    notices.push(format!("{}: {}", relay_url, notice));
                                }
                            }
                            Ok(RelayPoolNotification::Shutdown) => {
                                debug!("Relay pool shut down");
                                break;
                            }
                            Err(_) => {
                                debug!("Notification channel closed");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Notification handler stopped");
        });
    }

    fn sign<F>(&self, build: F) -> Result<Event>
    where
        F: FnOnce(&Keys) -> Result<EventBuilder>,
    {
        let keys = self.keys.as_ref().context("Not logged in")?;
        Ok(build(keys)?.sign_with_keys(keys)?)
    }

    /// Store the event locally and report its id, then send it to the
    /// relays. Relay failures become notices.
    async fn store_and_publish(
        &self,
        what: &str,
        signed: Result<Event>,
        response_tx: Completion<String>,
    ) {
        let identity = self.keys.as_ref().map(|k| k.public_key());
        let stored = signed.and_then(|event| {
            ingest_event(&self.db, &event, identity.as_ref())?;
            Ok(event)
        });
        let event = match stored {
            Ok(event) => event,
            Err(e) => {
                error!("Failed to publish {}: {:#}", what, e);
                respond(response_tx, Err(e));
                return;
            }
        };
        let event_id = event.id.to_hex();
        info!("Stored {} {}", what, event_id);
        respond(response_tx, Ok(event_id.clone()));

        let Some(client) = &self.client else {
            debug!("Offline, {} stored locally only", event_id);
            return;
        };
        match tokio::time::timeout(self.network_timeout, client.send_event(&event)).await {
            Ok(Ok(output)) => debug!("Published {}", output.id()),
            Ok(Err(e)) => {
                warn!("Publishing {} failed: {}", event_id, e);
                self.notices.push(format!("Publishing {} failed: {}", what, e));
            }
            Err(_) => {
                warn!("Publishing {} timed out (event saved locally)", event_id);
                self.notices.push(format!("Publishing {} timed out", what));
            }
        }
    }

    async fn handle_disconnect(&mut self) {
        if let Some(cancel_tx) = &self.cancel_tx {
            let _ = cancel_tx.send(true);
        }
        if let Some(client) = &self.client {
            client.disconnect().await;
            info!("Disconnected from relays");
        }
        self.requested_profiles.write().await.clear();
        self.secondary_subscriptions.clear();
        self.client = None;
        self.keys = None;
        self.cancel_tx = None;
    }

    /// kind:1 note. A reply carries NIP-10 marked `e` tags for the thread
    /// root and parent, plus `p` tags for the parent's author and members.
    pub(crate) fn build_note(
        db: &Database,
        keys: &Keys,
        content: String,
        reply_to: Option<&str>,
    ) -> Result<EventBuilder> {
        let mut builder = EventBuilder::text_note(content);
        let Some(parent_id) = reply_to else {
            return Ok(builder);
        };

        let parent: Option<Note> = db.get_note(parent_id)?.map(|view| view.note);
        let root_id = parent
            .as_ref()
            .and_then(|p| p.thread_root.clone())
            .unwrap_or_else(|| parent_id.to_string());

        builder = builder.tag(e_tag(&root_id, "root"));
        if root_id != parent_id {
            builder = builder.tag(e_tag(parent_id, "reply"));
        }

        let me = keys.public_key().to_hex();
        let mut mentioned = HashSet::new();
        if let Some(parent) = &parent {
            let members = std::iter::once(parent.public_key.clone()).chain(parent.member_keys());
            for member in members {
                if member == me || !mentioned.insert(member.clone()) {
                    continue;
                }
                if let Ok(pk) = PublicKey::from_hex(&member) {
                    builder = builder.tag(Tag::public_key(pk));
                }
            }
        }
        Ok(builder)
    }

    pub(crate) fn build_direct_message(
        keys: &Keys,
        recipient: &PublicKey,
        content: &str,
    ) -> Result<EventBuilder> {
        let encrypted = nip04::encrypt(keys.secret_key(), recipient, content)?;
        Ok(EventBuilder::new(Kind::EncryptedDirectMessage, encrypted).tag(Tag::public_key(*recipient)))
    }

    pub(crate) fn build_contact_list(following: &[String]) -> EventBuilder {
        following
            .iter()
            .filter_map(|pk| PublicKey::from_hex(pk).ok())
            .fold(EventBuilder::new(Kind::ContactList, ""), |builder, pk| {
                builder.tag(Tag::public_key(pk))
            })
    }
}

fn e_tag(event_id: &str, marker: &str) -> Tag {
    Tag::custom(
        TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)),
        vec![event_id.to_string(), String::new(), marker.to_string()],
    )
}

async fn request_profile(
    client: &Client,
    requested_profiles: &RwLock<HashSet<String>>,
    author: String,
) {
    let Ok(pubkey) = PublicKey::from_hex(&author) else {
        return;
    };
    if !requested_profiles.write().await.insert(author.clone()) {
        return;
    }
    let filter = Filter::new().kind(Kind::Metadata).author(pubkey);
    if let Err(e) = client.subscribe(filter, None).await {
        requested_profiles.write().await.remove(&author);
        warn!("Failed to subscribe to profile for {}: {}", &author[..8], e);
    }
}

fn respond<T>(response_tx: Completion<T>, result: Result<T>) {
    if let Some(tx) = response_tx {
        let _ = tx.send(result.map_err(|e| e.to_string()));
    }
}
