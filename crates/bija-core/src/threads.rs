//! Thread reconstruction: groups a flat set of notes into conversations.
//!
//! Assembly never mutates its input while scanning it. An immutable
//! id → position index and parent table are built first, cycles are broken,
//! and the threads are then read off the resulting forest.

use std::collections::{HashMap, VecDeque};

use crate::models::{Note, Thread, ThreadEntry, ThreadedNotes};

/// Group `notes` into threads.
///
/// Every distinct note id of the input lands in exactly one thread (a note
/// repeated in the input is kept once, first occurrence wins). Within a
/// thread notes are ordered by depth below the root, then creation time,
/// then id, so every note follows all of its ancestors. Threads are ordered
/// by their most recent note, newest first.
///
/// A note's parent is the note named by `response_to` when that note is in
/// the input; otherwise the note named by `thread_root`; otherwise it has no
/// parent and roots its own thread. Parent references that form a cycle are
/// cut at the oldest note of the cycle, which becomes the root.
pub fn assemble_threads<T: AsRef<Note>>(notes: Vec<T>) -> ThreadedNotes<T> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(notes.len());
    let mut items: Vec<T> = Vec::with_capacity(notes.len());
    for note in notes {
        let id = note.as_ref().id.clone();
        if index.contains_key(&id) {
            continue;
        }
        index.insert(id, items.len());
        items.push(note);
    }

    let mut parents = resolve_parents(&items, &index);
    break_cycles(&items, &mut parents);

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    let mut roots = Vec::new();
    for (idx, parent) in parents.iter().enumerate() {
        match parent {
            Some(p) => children[*p].push(idx),
            None => roots.push(idx),
        }
    }

    let mut layouts: Vec<Vec<(usize, usize)>> = roots
        .iter()
        .map(|&root| {
            let mut members = collect_subtree(root, &children);
            members.sort_by(|&(a, da), &(b, db)| {
                let (na, nb) = (items[a].as_ref(), items[b].as_ref());
                da.cmp(&db)
                    .then(na.created_at.cmp(&nb.created_at))
                    .then_with(|| na.id.cmp(&nb.id))
            });
            members
        })
        .collect();

    layouts.sort_by(|a, b| {
        let latest = |layout: &Vec<(usize, usize)>| {
            layout
                .iter()
                .map(|&(idx, _)| items[idx].as_ref().created_at)
                .max()
                .unwrap_or(0)
        };
        let root_id = |layout: &Vec<(usize, usize)>| items[layout[0].0].as_ref().id.clone();
        latest(b)
            .cmp(&latest(a))
            .then_with(|| root_id(a).cmp(&root_id(b)))
    });

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut ids = Vec::with_capacity(slots.len());
    let mut threads = Vec::with_capacity(layouts.len());

    for layout in layouts {
        let mut entries = Vec::with_capacity(layout.len());
        for (idx, depth) in layout {
            if let Some(item) = slots[idx].take() {
                ids.push(item.as_ref().id.clone());
                entries.push(ThreadEntry {
                    item,
                    depth,
                    is_parent: !children[idx].is_empty(),
                });
            }
        }
        threads.push(Thread { entries });
    }

    ThreadedNotes { threads, ids }
}

fn resolve_parents<T: AsRef<Note>>(
    items: &[T],
    index: &HashMap<String, usize>,
) -> Vec<Option<usize>> {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let note = item.as_ref();
            let lookup = |reference: &Option<String>| {
                reference
                    .as_ref()
                    .and_then(|id| index.get(id).copied())
                    .filter(|&p| p != idx)
            };
            lookup(&note.response_to).or_else(|| lookup(&note.thread_root))
        })
        .collect()
}

/// Every node has at most one parent, so each cycle is found by walking
/// parent links until a node on the current walk repeats.
fn break_cycles<T: AsRef<Note>>(items: &[T], parents: &mut [Option<usize>]) {
    const UNVISITED: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNVISITED; items.len()];

    for start in 0..items.len() {
        if state[start] != UNVISITED {
            continue;
        }

        let mut path: Vec<usize> = Vec::new();
        let mut current = Some(start);
        while let Some(node) = current {
            match state[node] {
                DONE => break,
                ON_PATH => {
                    let from = path.iter().position(|&p| p == node).unwrap_or(0);
                    let cut = path[from..]
                        .iter()
                        .copied()
                        .min_by(|&a, &b| {
                            let (na, nb) = (items[a].as_ref(), items[b].as_ref());
                            na.created_at
                                .cmp(&nb.created_at)
                                .then_with(|| na.id.cmp(&nb.id))
                        })
                        .unwrap_or(node);
                    parents[cut] = None;
                    break;
                }
                _ => {
                    state[node] = ON_PATH;
                    path.push(node);
                    current = parents[node];
                }
            }
        }

        for node in path {
            state[node] = DONE;
        }
    }
}

/// Breadth-first walk returning (index, depth) for a root and its descendants
fn collect_subtree(root: usize, children: &[Vec<usize>]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([(root, 0usize)]);
    while let Some((idx, depth)) = queue.pop_front() {
        out.push((idx, depth));
        for &child in &children[idx] {
            queue.push_back((child, depth + 1));
        }
    }
    out
}
