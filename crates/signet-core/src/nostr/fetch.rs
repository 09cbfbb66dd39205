//! One-shot loads of replaceable records from the index relays.

use std::time::Duration;

use futures::future::join_all;
use nostr_sdk::prelude::*;

use crate::constants::kinds;
use crate::models::metadata::ProfileMetadata;
use crate::models::relay::{parse_relay_list, RelayInfo, RelaySpec};
use crate::nostr::transport::{RelayTransport, TransportError};

/// A record's decoded payload together with its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub created_at: Timestamp,
}

fn latest_filter(public_key: PublicKey, kind: u16) -> Filter {
    Filter::new()
        .author(public_key)
        .kind(Kind::from(kind))
        .limit(1)
}

/// Latest relay list of `public_key`. A missing record, or one without any
/// `r` tag, yields `None`.
pub async fn fetch_relay_list(
    transport: &dyn RelayTransport,
    index_relays: &[String],
    public_key: PublicKey,
    timeout: Duration,
) -> Result<Option<Fetched<Vec<RelaySpec>>>, TransportError> {
    let filter = latest_filter(public_key, kinds::RELAY_LIST);
    let Some(event) = transport.fetch_latest(index_relays, filter, timeout).await? else {
        tracing::debug!(pubkey = %public_key, "no relay list found");
        return Ok(None);
    };

    let specs = parse_relay_list(&event);
    if specs.is_empty() {
        tracing::debug!(pubkey = %public_key, event_id = %event.id, "relay list has no relays");
        return Ok(None);
    }
    Ok(Some(Fetched {
        value: specs,
        created_at: event.created_at,
    }))
}

/// Attach NIP-11 descriptors to `specs`, fetched concurrently. Order is kept;
/// relays that do not answer simply get no descriptor.
pub async fn enrich_relays(
    transport: &dyn RelayTransport,
    specs: Vec<RelaySpec>,
    timeout: Duration,
) -> Vec<RelayInfo> {
    let lookups = specs
        .iter()
        .map(|spec| transport.fetch_descriptor(&spec.url, timeout));
    let descriptors = join_all(lookups).await;
    specs
        .into_iter()
        .zip(descriptors)
        .map(|(spec, descriptor)| RelayInfo::new(spec, descriptor))
        .collect()
}

/// Latest profile metadata of `public_key`.
pub async fn fetch_profile(
    transport: &dyn RelayTransport,
    index_relays: &[String],
    public_key: PublicKey,
    timeout: Duration,
) -> Result<Option<Fetched<ProfileMetadata>>, TransportError> {
    let filter = latest_filter(public_key, kinds::METADATA);
    let event = transport.fetch_latest(index_relays, filter, timeout).await?;
    Ok(event.map(|event| Fetched {
        value: ProfileMetadata::from_content(&event.content),
        created_at: event.created_at,
    }))
}
