use parking_lot::Mutex;

/// Relay notices waiting to be shown to the user.
///
/// Each notice is handed out by exactly one `drain`.
#[derive(Debug, Default)]
pub struct NoticeQueue {
    pending: Mutex<Vec<String>>,
}

impl NoticeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notice: impl Into<String>) {
        self.pending.lock().push(notice.into());
    }

    /// Take every pending notice in arrival order, leaving the queue empty
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
