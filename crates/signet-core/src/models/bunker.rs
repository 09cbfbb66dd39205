use nostr_sdk::prelude::*;
use serde::Serialize;

use crate::error::CoreError;
use crate::models::tag_utils::{extract_tag_str, raw_tags};
use crate::nostr::url::encode_uri_component;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("bunker config record {event_id} has no host tag")]
    MissingHost { event_id: String },
}

/// A remote-signer session descriptor derived from one `profile` tag.
///
/// `uri` is fixed at construction. The UI-only fields (`expanded`, `renaming`,
/// `pending_name`, `saving`) are never published; ingestion carries
/// `expanded`/`renaming` forward from the previous profile with the same uri.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BunkerProfile {
    uri: String,
    #[serde(skip_serializing)]
    secret: String,
    pub name: String,
    pub restrictions: Option<Filter>,
    pub expanded: bool,
    pub renaming: bool,
    pub pending_name: String,
    pub saving: bool,
}

impl BunkerProfile {
    pub fn new(
        host: &str,
        coordinator: &str,
        secret: &str,
        name: impl Into<String>,
        restrictions: Option<Filter>,
    ) -> Self {
        Self {
            uri: bunker_uri(host, coordinator, secret),
            secret: secret.to_string(),
            name: name.into(),
            restrictions,
            expanded: false,
            renaming: false,
            pending_name: String::new(),
            saving: false,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

/// `bunker://<host>?relay=<encoded coordinator>&secret=<secret>`
pub fn bunker_uri(host: &str, coordinator: &str, secret: &str) -> String {
    format!(
        "bunker://{}?relay={}&secret={}",
        host,
        encode_uri_component(coordinator),
        secret
    )
}

/// Decode the restrictions payload of a `profile` tag.
/// Missing or empty payload means "no restriction"; undecodable JSON is logged
/// and treated the same way so the remaining profiles still load.
fn parse_restrictions(payload: Option<&str>) -> Option<Filter> {
    let payload = payload.filter(|p| !p.is_empty())?;
    match serde_json::from_str::<Filter>(payload) {
        Ok(filter) => Some(filter),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring undecodable bunker restrictions");
            None
        }
    }
}

/// Build the new profile list from the tags of a bunker-config record.
///
/// Output order follows tag order. A `profile` tag lacking name or secret is
/// skipped; a missing `h` tag rejects the whole record.
pub fn ingest_bunker_tags(
    previous: &[BunkerProfile],
    tags: &[Vec<String>],
    coordinator: &str,
    event_id: &str,
) -> Result<Vec<BunkerProfile>, IngestError> {
    let host = tags
        .iter()
        .find(|t| t.first().map(String::as_str) == Some("h"))
        .and_then(|t| t.get(1))
        .ok_or_else(|| IngestError::MissingHost {
            event_id: event_id.to_string(),
        })?;

    let mut items = Vec::new();
    for tag in tags.iter().filter(|t| t.first().map(String::as_str) == Some("profile")) {
        let (name, secret) = match (tag.get(1), tag.get(2)) {
            (Some(name), Some(secret)) => (name, secret),
            _ => {
                tracing::warn!(event_id, ?tag, "skipping malformed profile tag");
                continue;
            }
        };

        let restrictions = parse_restrictions(tag.get(3).map(String::as_str));
        let mut profile = BunkerProfile::new(host, coordinator, secret, name.clone(), restrictions);

        if let Some(prior) = previous.iter().find(|p| p.uri == profile.uri) {
            profile.expanded = prior.expanded;
            profile.renaming = prior.renaming;
        }

        items.push(profile);
    }

    Ok(items)
}

pub fn ingest_bunker_event(
    previous: &[BunkerProfile],
    event: &Event,
    coordinator: &str,
) -> Result<Vec<BunkerProfile>, IngestError> {
    ingest_bunker_tags(previous, &raw_tags(event), coordinator, &event.id.to_hex())
}

/// The `h` tag of a bunker-config record, if any.
pub fn bunker_host(event: &Event) -> Option<&str> {
    extract_tag_str(event, "h")
}

/// Rewrite the tags of a bunker-config record so that the profile addressed by
/// `uri` carries `new_name`. Every other tag is preserved in order.
pub fn rename_profile_tags(
    tags: &[Vec<String>],
    coordinator: &str,
    uri: &str,
    new_name: &str,
) -> Result<Vec<Vec<String>>, CoreError> {
    let host = tags
        .iter()
        .find(|t| t.first().map(String::as_str) == Some("h"))
        .and_then(|t| t.get(1))
        .cloned()
        .ok_or(CoreError::NoBunkerRecord)?;

    let mut found = false;
    let rewritten = tags
        .iter()
        .map(|tag| {
            let is_target = tag.first().map(String::as_str) == Some("profile")
                && tag
                    .get(2)
                    .map(|secret| bunker_uri(&host, coordinator, secret) == uri)
                    .unwrap_or(false);
            if is_target && tag.len() > 1 {
                found = true;
                let mut renamed = tag.clone();
                renamed[1] = new_name.to_string();
                renamed
            } else {
                tag.clone()
            }
        })
        .collect();

    if found {
        Ok(rewritten)
    } else {
        Err(CoreError::UnknownProfile(uri.to_string()))
    }
}
