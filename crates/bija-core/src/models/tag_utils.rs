//! Tag extraction utilities for parsing nostr-sdk Events
//!
//! Provides helper functions to reduce boilerplate when parsing tags from Nostr events.

use nostr_sdk::prelude::*;

/// Extract all second-position values for a given tag name.
/// Useful for tags that appear multiple times (e.g., "p", "e").
pub fn extract_all_tag_values(event: &Event, tag_name: &str) -> Vec<String> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let slice = tag.as_slice();
            if slice.first().map(String::as_str) == Some(tag_name) {
                slice.get(1).cloned()
            } else {
                None
            }
        })
        .collect()
}

/// Extract the first second-position value for a tag name.
pub fn extract_tag_value(event: &Event, tag_name: &str) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        if slice.first().map(String::as_str) == Some(tag_name) {
            slice.get(1).cloned()
        } else {
            None
        }
    })
}

/// One `e` tag: the referenced id plus its NIP-10 marker, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReference {
    pub event_id: String,
    pub marker: Option<String>,
}

/// Collect `e` tags in order. NIP-10 format: ["e", id, relay, marker].
pub fn extract_event_references(event: &Event) -> Vec<EventReference> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let slice = tag.as_slice();
            if slice.first().map(String::as_str) != Some("e") {
                return None;
            }
            let event_id = slice.get(1)?.clone();
            let marker = slice
                .get(3)
                .filter(|m| !m.is_empty())
                .cloned();
            Some(EventReference { event_id, marker })
        })
        .collect()
}
