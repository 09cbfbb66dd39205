use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::tag_utils::tags_named;
use crate::nostr::nip11::RelayDescriptor;

/// One entry of a NIP-65 relay list. `read` and `write` are independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySpec {
    pub url: String,
    pub read: bool,
    pub write: bool,
}

impl RelaySpec {
    pub fn new(url: impl Into<String>, read: bool, write: bool) -> Self {
        Self {
            url: url.into(),
            read,
            write,
        }
    }

    /// Parse `url`, `url:read` or `url:write` (CLI syntax).
    pub fn parse_marked(input: &str) -> Self {
        if let Some(url) = input.strip_suffix(":read") {
            Self::new(url, true, false)
        } else if let Some(url) = input.strip_suffix(":write") {
            Self::new(url, false, true)
        } else {
            Self::new(input, true, true)
        }
    }

    /// The `r` tag for this entry, or `None` when neither flag is set.
    pub fn to_tag(&self) -> Option<Vec<String>> {
        match (self.read, self.write) {
            (true, true) => Some(vec!["r".to_string(), self.url.clone()]),
            (true, false) => Some(vec!["r".to_string(), self.url.clone(), "read".to_string()]),
            (false, true) => Some(vec!["r".to_string(), self.url.clone(), "write".to_string()]),
            (false, false) => None,
        }
    }
}

/// A relay list entry enriched with its (optional) capability descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayInfo {
    pub spec: RelaySpec,
    pub descriptor: Option<RelayDescriptor>,
    pub expanded: bool,
}

impl RelayInfo {
    pub fn new(spec: RelaySpec, descriptor: Option<RelayDescriptor>) -> Self {
        Self {
            spec,
            descriptor,
            expanded: false,
        }
    }
}

/// Read the `r` tags of a kind:10002 record in tag order.
pub fn parse_relay_list(event: &Event) -> Vec<RelaySpec> {
    tags_named(event, "r")
        .filter_map(|tag| {
            let url = tag.get(1).filter(|u| !u.is_empty())?;
            let spec = match tag.get(2).map(String::as_str) {
                Some("read") => RelaySpec::new(url.clone(), true, false),
                Some("write") => RelaySpec::new(url.clone(), false, true),
                _ => RelaySpec::new(url.clone(), true, true),
            };
            Some(spec)
        })
        .collect()
}

pub fn relay_list_tags(specs: &[RelaySpec]) -> Vec<Vec<String>> {
    specs.iter().filter_map(RelaySpec::to_tag).collect()
}

/// URLs flagged `write`, in list order.
pub fn write_relays(specs: &[RelaySpec]) -> Vec<String> {
    specs
        .iter()
        .filter(|s| s.write)
        .map(|s| s.url.clone())
        .collect()
}
