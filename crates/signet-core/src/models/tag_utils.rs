//! Tag extraction utilities for parsing signed records
//!
//! Provides helper functions to reduce boilerplate when reading tags from Nostr events.

use nostr_sdk::prelude::*;

use crate::error::CoreError;

/// Extract a single string value from a tag by name.
/// Returns the first occurrence if multiple tags exist.
pub fn extract_tag_str<'a>(event: &'a Event, tag_name: &str) -> Option<&'a str> {
    event
        .tags
        .iter()
        .map(|t| t.as_slice())
        .find(|t| t.first().map(String::as_str) == Some(tag_name))
        .and_then(|t| t.get(1))
        .map(String::as_str)
}

/// All tags with the given name, as raw string slices (name included).
pub fn tags_named<'a>(event: &'a Event, tag_name: &'a str) -> impl Iterator<Item = &'a [String]> {
    event
        .tags
        .iter()
        .map(|t| t.as_slice())
        .filter(move |t| t.first().map(String::as_str) == Some(tag_name))
}

/// Copy every tag out as an owned `Vec<String>`.
pub fn raw_tags(event: &Event) -> Vec<Vec<String>> {
    event.tags.iter().map(|t| t.as_slice().to_vec()).collect()
}

/// Build nostr tags from raw string vectors, skipping empty ones.
pub fn build_tags(raw: &[Vec<String>]) -> Result<Vec<Tag>, CoreError> {
    raw.iter()
        .filter(|t| !t.is_empty())
        .map(|t| {
            Tag::parse(t.iter().map(String::as_str))
                .map_err(|e| CoreError::InvalidTag(format!("{:?}: {}", t, e)))
        })
        .collect()
}
