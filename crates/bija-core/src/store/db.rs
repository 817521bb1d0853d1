use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument};

use crate::error::BijaResult;
use crate::models::{
    AuthorSummary, ConversationSummary, KeyRecord, Note, NoteView, PrivateMessage, Profile,
    ProfileSummary, ProfileUpdate,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS profile (
        public_key TEXT PRIMARY KEY,
        name TEXT,
        nip05 TEXT,
        pic TEXT,
        about TEXT,
        updated_at INTEGER,
        following INTEGER NOT NULL DEFAULT 0,
        contacts TEXT
    );

    CREATE TABLE IF NOT EXISTS note (
        id TEXT PRIMARY KEY,
        public_key TEXT NOT NULL,
        content TEXT NOT NULL,
        response_to TEXT,
        thread_root TEXT,
        created_at INTEGER NOT NULL,
        members TEXT,
        seen INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS note_created_at ON note (created_at);
    CREATE INDEX IF NOT EXISTS note_author ON note (public_key, created_at);
    CREATE INDEX IF NOT EXISTS note_response_to ON note (response_to);
    CREATE INDEX IF NOT EXISTS note_thread_root ON note (thread_root);

    CREATE TABLE IF NOT EXISTS private_message (
        id TEXT PRIMARY KEY,
        public_key TEXT NOT NULL,
        content TEXT NOT NULL,
        is_sender INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        seen INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS private_message_peer ON private_message (public_key, created_at);

    CREATE TABLE IF NOT EXISTS credentials (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        key TEXT NOT NULL,
        encrypted INTEGER NOT NULL
    );
"#;

const NOTE_VIEW_COLUMNS: &str = "n.id, n.public_key, n.content, n.response_to, n.thread_root, \
     n.created_at, n.members, p.name, p.pic, p.nip05";

const PROFILE_COLUMNS: &str =
    "public_key, name, nip05, pic, about, updated_at, following, contacts";

/// SQLite-backed store for profiles, notes, private messages and the key
/// record.
///
/// Writes are serialized through one connection. Reads use a second
/// connection; with WAL enabled they see the last committed snapshot and
/// never wait on a writer.
pub struct Database {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Database {
    /// Open (and create if needed) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> BijaResult<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = Connection::open(&path)?;
        writer.busy_timeout(Duration::from_secs(5))?;
        writer.execute_batch("PRAGMA journal_mode=WAL;")?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open(&path)?;
        reader.busy_timeout(Duration::from_secs(5))?;

        info!("Opened store at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ===== Profiles =====

    /// Make sure a profile row exists for `public_key` without touching it
    pub fn ensure_profile(&self, public_key: &str) -> BijaResult<()> {
        self.writer.lock().execute(
            "INSERT OR IGNORE INTO profile (public_key) VALUES (?1)",
            params![public_key],
        )?;
        Ok(())
    }

    /// Merge display fields, last write wins by `updated_at`.
    /// Returns whether the stored profile changed.
    pub fn upsert_profile(&self, update: &ProfileUpdate) -> BijaResult<bool> {
        let changed = self.writer.lock().execute(
            r#"
            INSERT INTO profile (public_key, name, nip05, pic, about, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(public_key) DO UPDATE SET
                name = excluded.name,
                nip05 = excluded.nip05,
                pic = excluded.pic,
                about = excluded.about,
                updated_at = excluded.updated_at
            WHERE profile.updated_at IS NULL OR profile.updated_at < excluded.updated_at
            "#,
            params![
                update.public_key,
                update.name,
                update.nip05,
                update.pic,
                update.about,
                to_sql_ts(update.updated_at),
            ],
        )?;
        if changed > 0 {
            debug!("Profile {} updated", short(&update.public_key));
        }
        Ok(changed > 0)
    }

    pub fn set_contacts(&self, public_key: &str, keys: &[String]) -> BijaResult<()> {
        let contacts = serde_json::to_string(keys).unwrap_or_else(|_| "[]".to_string());
        self.writer.lock().execute(
            r#"
            INSERT INTO profile (public_key, contacts) VALUES (?1, ?2)
            ON CONFLICT(public_key) DO UPDATE SET contacts = excluded.contacts
            "#,
            params![public_key, contacts],
        )?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(key_count = keys.len()))]
    pub fn set_following(&self, keys: &[String], following: bool) -> BijaResult<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute(
                r#"
                INSERT INTO profile (public_key, following) VALUES (?1, ?2)
                ON CONFLICT(public_key) DO UPDATE SET following = excluded.following
                "#,
                params![key, following],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn following_pubkeys(&self) -> BijaResult<Vec<String>> {
        let conn = self.reader.lock();
        let mut stmt =
            conn.prepare("SELECT public_key FROM profile WHERE following = 1 ORDER BY public_key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    pub fn following(&self) -> BijaResult<Vec<ProfileSummary>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            "SELECT public_key, name, pic FROM profile WHERE following = 1 ORDER BY name, public_key",
        )?;
        let profiles = stmt
            .query_map([], |row| {
                Ok(ProfileSummary {
                    public_key: row.get(0)?,
                    name: row.get(1)?,
                    pic: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    pub fn get_profile(&self, public_key: &str) -> BijaResult<Option<Profile>> {
        let conn = self.reader.lock();
        let profile = conn
            .query_row(
                &format!("SELECT {} FROM profile WHERE public_key = ?1", PROFILE_COLUMNS),
                params![public_key],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    /// The profile, only if it changed after `since`
    pub fn get_profile_updates(&self, public_key: &str, since: u64) -> BijaResult<Option<Profile>> {
        let conn = self.reader.lock();
        let profile = conn
            .query_row(
                &format!(
                    "SELECT {} FROM profile WHERE public_key = ?1 AND updated_at > ?2",
                    PROFILE_COLUMNS
                ),
                params![public_key, to_sql_ts(since)],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn is_known_pubkey(&self, public_key: &str) -> BijaResult<bool> {
        let conn = self.reader.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM profile WHERE public_key = ?1",
                params![public_key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ===== Notes =====

    /// Store a note. Notes are immutable: a known id is left untouched and
    /// false is returned.
    pub fn insert_note(&self, note: &Note, seen: bool) -> BijaResult<bool> {
        let inserted = self.writer.lock().execute(
            r#"
            INSERT INTO note (id, public_key, content, response_to, thread_root, created_at, members, seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                note.id,
                note.public_key,
                note.content,
                note.response_to,
                note.thread_root,
                to_sql_ts(note.created_at),
                note.members,
                seen,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn is_note(&self, note_id: &str) -> BijaResult<bool> {
        let conn = self.reader.lock();
        let found = conn
            .query_row("SELECT 1 FROM note WHERE id = ?1", params![note_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_note(&self, note_id: &str) -> BijaResult<Option<NoteView>> {
        let conn = self.reader.lock();
        let note = conn
            .query_row(
                &format!(
                    "SELECT {} FROM note n LEFT JOIN profile p ON p.public_key = n.public_key \
                     WHERE n.id = ?1",
                    NOTE_VIEW_COLUMNS
                ),
                params![note_id],
                note_view_from_row,
            )
            .optional()?;
        Ok(note)
    }

    /// The note plus every stored note replying to it directly or naming it
    /// as thread root, oldest first
    pub fn get_note_thread(&self, note_id: &str) -> BijaResult<Vec<NoteView>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM note n LEFT JOIN profile p ON p.public_key = n.public_key \
             WHERE n.id = ?1 OR n.response_to = ?1 OR n.thread_root = ?1 \
             ORDER BY n.created_at ASC, n.id ASC",
            NOTE_VIEW_COLUMNS
        ))?;
        let notes = stmt
            .query_map(params![note_id], note_view_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    #[instrument(skip(self, note_ids), fields(id_count = note_ids.len()))]
    pub fn get_notes_by_ids(&self, note_ids: &[String]) -> BijaResult<Vec<NoteView>> {
        if note_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; note_ids.len()].join(", ");
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM note n LEFT JOIN profile p ON p.public_key = n.public_key \
             WHERE n.id IN ({}) ORDER BY n.created_at DESC, n.id DESC",
            NOTE_VIEW_COLUMNS, placeholders
        ))?;
        let notes = stmt
            .query_map(params_from_iter(note_ids.iter()), note_view_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// Notes by followed authors or by `viewer`, strictly older than
    /// `before`, newest first
    pub fn get_feed(&self, before: u64, viewer: &str, limit: usize) -> BijaResult<Vec<NoteView>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM note n LEFT JOIN profile p ON p.public_key = n.public_key \
             WHERE n.created_at < ?1 AND (p.following = 1 OR n.public_key = ?2) \
             ORDER BY n.created_at DESC, n.id DESC LIMIT ?3",
            NOTE_VIEW_COLUMNS
        ))?;
        let notes = stmt
            .query_map(
                params![to_sql_ts(before), viewer, limit as i64],
                note_view_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// One author's notes with `after < created_at < before`, newest first
    pub fn get_notes_by_pubkey(
        &self,
        public_key: &str,
        before: u64,
        after: Option<u64>,
        limit: usize,
    ) -> BijaResult<Vec<NoteView>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM note n LEFT JOIN profile p ON p.public_key = n.public_key \
             WHERE n.public_key = ?1 AND n.created_at < ?2 AND n.created_at > ?3 \
             ORDER BY n.created_at DESC, n.id DESC LIMIT ?4",
            NOTE_VIEW_COLUMNS
        ))?;
        let after = after.map(to_sql_ts).unwrap_or(-1);
        let notes = stmt
            .query_map(
                params![public_key, to_sql_ts(before), after, limit as i64],
                note_view_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    pub fn unseen_in_feed(&self, viewer: &str) -> BijaResult<u64> {
        let conn = self.reader.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM note n LEFT JOIN profile p ON p.public_key = n.public_key \
             WHERE n.seen = 0 AND (p.following = 1 OR n.public_key = ?1)",
            params![viewer],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn set_all_seen_in_feed(&self, viewer: &str) -> BijaResult<usize> {
        let updated = self.writer.lock().execute(
            "UPDATE note SET seen = 1 WHERE seen = 0 AND (public_key = ?1 OR public_key IN \
             (SELECT public_key FROM profile WHERE following = 1))",
            params![viewer],
        )?;
        Ok(updated)
    }

    // ===== Private messages =====

    /// Store a message; a known id keeps its current read state
    pub fn insert_private_message(&self, message: &PrivateMessage) -> BijaResult<bool> {
        let inserted = self.writer.lock().execute(
            r#"
            INSERT INTO private_message (id, public_key, content, is_sender, created_at, seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                message.id,
                message.public_key,
                message.content,
                message.is_sender,
                to_sql_ts(message.created_at),
                message.seen,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// One row per counterparty, most recent conversation first
    pub fn message_list(&self) -> BijaResult<Vec<ConversationSummary>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT m.public_key, p.name, p.pic, MAX(m.created_at) AS last_message,
                (SELECT l.is_sender FROM private_message l WHERE l.public_key = m.public_key
                 ORDER BY l.created_at DESC LIMIT 1),
                SUM(CASE WHEN m.seen = 0 THEN 1 ELSE 0 END)
            FROM private_message m
            LEFT JOIN profile p ON p.public_key = m.public_key
            GROUP BY m.public_key
            ORDER BY last_message DESC
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConversationSummary {
                    public_key: row.get(0)?,
                    name: row.get(1)?,
                    pic: row.get(2)?,
                    last_message: from_sql_ts(row.get(3)?),
                    is_sender: row.get(4)?,
                    unseen: from_sql_ts(row.get(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The latest `limit` messages with `public_key`, oldest first
    pub fn message_thread(&self, public_key: &str, limit: usize) -> BijaResult<Vec<PrivateMessage>> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare(
            "SELECT id, public_key, content, is_sender, created_at, seen FROM private_message \
             WHERE public_key = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let mut messages = stmt
            .query_map(params![public_key, limit as i64], private_message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Return the unread messages from `public_key` and mark exactly those
    /// read, in one transaction. A second call returns nothing new.
    pub fn take_unseen_messages(&self, public_key: &str) -> BijaResult<Vec<PrivateMessage>> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let messages = {
            let mut stmt = tx.prepare(
                "SELECT id, public_key, content, is_sender, created_at, seen FROM private_message \
                 WHERE public_key = ?1 AND seen = 0 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![public_key], private_message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for message in &messages {
            tx.execute(
                "UPDATE private_message SET seen = 1 WHERE id = ?1",
                params![message.id],
            )?;
        }
        tx.commit()?;
        if !messages.is_empty() {
            debug!(
                "Marked {} message(s) from {} read",
                messages.len(),
                short(public_key)
            );
        }
        Ok(messages)
    }

    /// The latest `limit` messages with `public_key`, oldest first. Unread
    /// rows among the returned ones are marked read in the same
    /// transaction; older unread rows outside the window stay unread.
    pub fn open_message_thread(
        &self,
        public_key: &str,
        limit: usize,
    ) -> BijaResult<Vec<PrivateMessage>> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let mut messages = {
            let mut stmt = tx.prepare(
                "SELECT id, public_key, content, is_sender, created_at, seen FROM private_message \
                 WHERE public_key = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![public_key, limit as i64], private_message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let mut marked = 0;
        for message in messages.iter().filter(|m| !m.seen) {
            marked += tx.execute(
                "UPDATE private_message SET seen = 1 WHERE id = ?1",
                params![message.id],
            )?;
        }
        tx.commit()?;
        if marked > 0 {
            debug!("Marked {} message(s) from {} read", marked, short(public_key));
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn unseen_message_count(&self) -> BijaResult<u64> {
        let conn = self.reader.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM private_message WHERE seen = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    // ===== Key record =====

    pub fn key_record(&self) -> BijaResult<Option<KeyRecord>> {
        let conn = self.reader.lock();
        let record = conn
            .query_row(
                "SELECT key, encrypted FROM credentials WHERE id = 1",
                [],
                |row| {
                    Ok(KeyRecord {
                        key: row.get(0)?,
                        encrypted: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Store the single key record, replacing any previous one
    pub fn save_key_record(&self, record: &KeyRecord) -> BijaResult<()> {
        self.writer.lock().execute(
            r#"
            INSERT INTO credentials (id, key, encrypted) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET key = excluded.key, encrypted = excluded.encrypted
            "#,
            params![record.key, record.encrypted],
        )?;
        Ok(())
    }

    /// Remove every profile, note, message and the key record
    pub fn reset(&self) -> BijaResult<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM profile", [])?;
        tx.execute("DELETE FROM private_message", [])?;
        tx.execute("DELETE FROM note", [])?;
        tx.execute("DELETE FROM credentials", [])?;
        tx.commit()?;
        info!("Store reset");
        Ok(())
    }
}

fn to_sql_ts(ts: u64) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn from_sql_ts(value: i64) -> u64 {
    value.max(0) as u64
}

fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

fn note_view_from_row(row: &Row<'_>) -> rusqlite::Result<NoteView> {
    Ok(NoteView {
        note: Note {
            id: row.get(0)?,
            public_key: row.get(1)?,
            content: row.get(2)?,
            response_to: row.get(3)?,
            thread_root: row.get(4)?,
            created_at: from_sql_ts(row.get(5)?),
            members: row.get(6)?,
        },
        author: AuthorSummary {
            name: row.get(7)?,
            pic: row.get(8)?,
            nip05: row.get(9)?,
        },
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let updated_at: Option<i64> = row.get(5)?;
    Ok(Profile {
        public_key: row.get(0)?,
        name: row.get(1)?,
        nip05: row.get(2)?,
        pic: row.get(3)?,
        about: row.get(4)?,
        updated_at: updated_at.map(from_sql_ts),
        following: row.get(6)?,
        contacts: row.get(7)?,
    })
}

fn private_message_from_row(row: &Row<'_>) -> rusqlite::Result<PrivateMessage> {
    Ok(PrivateMessage {
        id: row.get(0)?,
        public_key: row.get(1)?,
        content: row.get(2)?,
        is_sender: row.get(3)?,
        created_at: from_sql_ts(row.get(4)?),
        seen: row.get(5)?,
    })
}
