//! Relay capability discovery (NIP-11).
//!
//! Descriptors are enrichment only: every failure path returns `None`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::NIP11_ACCEPT;
use crate::nostr::url::http_url;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayLimitation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_filters: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_event_tags: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pow_difficulty: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_nips: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limitation: Option<RelayLimitation>,
}

impl RelayDescriptor {
    /// Minimum proof-of-work the relay demands, zero when unspecified.
    pub fn min_pow_difficulty(&self) -> u8 {
        self.limitation
            .as_ref()
            .and_then(|l| l.min_pow_difficulty)
            .unwrap_or(0)
    }

    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}

/// Fetch the NIP-11 document for a relay. Non-2xx responses, timeouts and
/// unparseable bodies all degrade to `None`.
pub async fn fetch_relay_descriptor(
    http: &reqwest::Client,
    relay_url: &str,
    timeout: Duration,
) -> Option<RelayDescriptor> {
    let url = http_url(relay_url);
    let response = match http
        .get(&url)
        .header(reqwest::header::ACCEPT, NIP11_ACCEPT)
        .timeout(timeout)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(relay = %relay_url, error = %e, "NIP-11 request failed");
            return None;
        }
    };

    if !response.status().is_success() {
        tracing::debug!(relay = %relay_url, status = %response.status(), "NIP-11 non-success status");
        return None;
    }

    match response.json::<RelayDescriptor>().await {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            tracing::debug!(relay = %relay_url, error = %e, "NIP-11 body did not parse");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_descriptor() {
        let body = r#"{
            "name": "Example",
            "description": "a relay",
            "contact": "admin@example.com",
            "supported_nips": [1, 11, 13, 42],
            "software": "strfry",
            "version": "1.0",
            "limitation": {"min_pow_difficulty": 16, "auth_required": true, "max_limit": 500},
            "unknown": {"nested": true}
        }"#;
        let descriptor = RelayDescriptor::parse(body).unwrap();
        assert_eq!(descriptor.name.as_deref(), Some("Example"));
        assert_eq!(descriptor.supported_nips, vec![1, 11, 13, 42]);
        assert_eq!(descriptor.min_pow_difficulty(), 16);
        let limitation = descriptor.limitation.unwrap();
        assert_eq!(limitation.auth_required, Some(true));
        assert_eq!(limitation.max_limit, Some(500));
    }

    #[test]
    fn test_parse_minimal_descriptor() {
        let descriptor = RelayDescriptor::parse("{}").unwrap();
        assert_eq!(descriptor, RelayDescriptor::default());
        assert_eq!(descriptor.min_pow_difficulty(), 0);
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(RelayDescriptor::parse("<html>").is_none());
    }

    #[test]
    fn test_unreachable_relay_degrades_to_none() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let http = reqwest::Client::new();
        let descriptor = rt.block_on(fetch_relay_descriptor(
            &http,
            "ws://127.0.0.1:1",
            Duration::from_millis(500),
        ));
        assert!(descriptor.is_none());
    }
}
