use crate::constants::FEED_PAGE_SIZE;
use crate::error::BijaResult;
use crate::models::{NoteView, ThreadedNotes};
use crate::store::Database;
use crate::threads::assemble_threads;

/// Cursor-based note retrieval over the store.
///
/// Pages are strictly older than the `before` cursor. Passing the oldest
/// `created_at` of one page as the next cursor never repeats a note, except
/// when notes share that exact timestamp across the page boundary, in which
/// case the ones that did not fit are skipped rather than repeated.
pub struct FeedPaginator<'a> {
    db: &'a Database,
    page_size: usize,
}

impl<'a> FeedPaginator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            page_size: FEED_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Notes by followed authors or by `viewer`, newest first
    pub fn feed_page(&self, before: u64, viewer: &str) -> BijaResult<Vec<NoteView>> {
        self.db.get_feed(before, viewer, self.page_size)
    }

    /// A single author's timeline, newest first, optionally bounded below
    pub fn profile_notes(
        &self,
        public_key: &str,
        before: u64,
        after: Option<u64>,
    ) -> BijaResult<Vec<NoteView>> {
        self.db
            .get_notes_by_pubkey(public_key, before, after, self.page_size)
    }

    pub fn threaded_feed(&self, before: u64, viewer: &str) -> BijaResult<ThreadedNotes<NoteView>> {
        Ok(assemble_threads(self.feed_page(before, viewer)?))
    }

    pub fn threaded_profile(
        &self,
        public_key: &str,
        before: u64,
        after: Option<u64>,
    ) -> BijaResult<ThreadedNotes<NoteView>> {
        Ok(assemble_threads(self.profile_notes(public_key, before, after)?))
    }
}

/// Cursor for the page after `page`: the oldest timestamp it contains
pub fn next_cursor(page: &[NoteView]) -> Option<u64> {
    page.iter().map(|n| n.note.created_at).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::tests::{note, open_temp};
    use std::collections::HashSet;

    #[test]
    fn test_consecutive_pages_are_disjoint() {
        let (_dir, db) = open_temp();
        db.set_following(&["friend".to_string()], true).unwrap();
        for i in 0..120u64 {
            let author = if i % 3 == 0 { "me" } else { "friend" };
            db.insert_note(&note(&format!("n{:03}", i), author, 1_000 + i * 7), false)
                .unwrap();
        }

        let paginator = FeedPaginator::new(&db).with_page_size(25);
        let mut seen = HashSet::new();
        let mut before = u64::MAX;
        let mut pages = 0;
        loop {
            let page = paginator.feed_page(before, "me").unwrap();
            if page.is_empty() {
                break;
            }
            for view in &page {
                assert!(view.note.created_at < before);
                assert!(seen.insert(view.note.id.clone()), "repeated {}", view.note.id);
            }
            before = next_cursor(&page).unwrap();
            pages += 1;
        }
        assert_eq!(pages, 5);
        assert_eq!(seen.len(), 120);
    }

    #[test]
    fn test_boundary_ties_are_not_repeated() {
        let (_dir, db) = open_temp();
        for i in 0..4 {
            db.insert_note(&note(&format!("tie{}", i), "me", 500), false).unwrap();
        }
        db.insert_note(&note("older", "me", 400), false).unwrap();

        let paginator = FeedPaginator::new(&db).with_page_size(2);
        let first = paginator.feed_page(u64::MAX, "me").unwrap();
        assert_eq!(first.len(), 2);
        let second = paginator.feed_page(next_cursor(&first).unwrap(), "me").unwrap();
        let ids: Vec<&str> = second.iter().map(|n| n.note.id.as_str()).collect();
        assert_eq!(ids, vec!["older"]);
    }

    #[test]
    fn test_default_page_size() {
        let (_dir, db) = open_temp();
        for i in 0..60u64 {
            db.insert_note(&note(&format!("n{}", i), "me", i + 1), false).unwrap();
        }
        let page = FeedPaginator::new(&db).feed_page(u64::MAX, "me").unwrap();
        assert_eq!(page.len(), FEED_PAGE_SIZE);
        assert_eq!(page[0].note.created_at, 60);
    }

    #[test]
    fn test_threaded_profile_groups_replies() {
        let (_dir, db) = open_temp();
        db.insert_note(&note("root", "author", 10), false).unwrap();
        let mut reply = note("reply", "author", 20);
        reply.response_to = Some("root".to_string());
        reply.thread_root = Some("root".to_string());
        db.insert_note(&reply, false).unwrap();
        db.insert_note(&note("solo", "author", 15), false).unwrap();

        let threaded = FeedPaginator::new(&db)
            .threaded_profile("author", u64::MAX, None)
            .unwrap();
        assert_eq!(threaded.threads.len(), 2);
        assert_eq!(threaded.ids, vec!["root", "reply", "solo"]);
        assert!(threaded.threads[0].entries[0].is_parent);
        assert_eq!(threaded.threads[0].entries[1].depth, 1);
    }
}
