use serde::{Deserialize, Serialize};

/// One note inside an assembled thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadEntry<T> {
    #[serde(flatten)]
    pub item: T,
    /// Distance from the thread root (root = 0)
    pub depth: usize,
    /// Whether another note in the same thread replies to this one
    pub is_parent: bool,
}

/// A root note plus every note transitively replying to it, root first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread<T> {
    pub entries: Vec<ThreadEntry<T>>,
}

impl<T> Thread<T> {
    pub fn root(&self) -> Option<&T> {
        self.entries.first().map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.item)
    }
}

/// Output of thread assembly: the threads plus every note id they consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadedNotes<T> {
    pub threads: Vec<Thread<T>>,
    pub ids: Vec<String>,
}

impl<T> Default for ThreadedNotes<T> {
    fn default() -> Self {
        Self {
            threads: Vec::new(),
            ids: Vec::new(),
        }
    }
}

impl<T: Clone> ThreadedNotes<T> {
    /// Flatten back into a plain note list (thread order preserved)
    pub fn flatten(&self) -> Vec<T> {
        self.threads
            .iter()
            .flat_map(|t| t.items().cloned())
            .collect()
    }
}
