//! Event id hashing for the nonce search.
//!
//! The id of an event is the SHA-256 of its NIP-01 serialization
//! `[0, pubkey, created_at, kind, tags, content]`. While mining, only the
//! nonce digits change, so everything before and after them is serialized
//! once and the hasher state for the prefix is reused.

use nostr_sdk::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub type EventIdBytes = [u8; 32];

/// An unsigned event in the shape that is hashed into its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsignedRecord {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedRecord {
    pub fn new(
        pubkey: &PublicKey,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            pubkey: pubkey.to_hex(),
            created_at: created_at.as_u64(),
            kind,
            tags,
            content: content.into(),
        }
    }

    fn serialize_for_id(&self) -> String {
        serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content])
            .to_string()
    }

    pub fn compute_id(&self) -> EventIdBytes {
        Sha256::digest(self.serialize_for_id().as_bytes()).into()
    }

    /// Copy of this record with `["nonce", nonce, target]` appended.
    pub fn with_nonce(&self, nonce: u64, target: u8) -> Self {
        let mut record = self.clone();
        record.tags.push(vec![
            "nonce".to_string(),
            nonce.to_string(),
            target.to_string(),
        ]);
        record
    }

    /// The nonce tag value, if this record carries one.
    pub fn nonce(&self) -> Option<u64> {
        self.tags
            .iter()
            .rev()
            .find(|t| t.first().map(String::as_str) == Some("nonce"))
            .and_then(|t| t.get(1))
            .and_then(|n| n.parse().ok())
    }
}

/// Number of leading zero bits of an id (NIP-13 difficulty).
pub use nostr_sdk::nips::nip13::get_leading_zero_bits as leading_zero_bits;

/// Hashes `record.with_nonce(n, target)` for many `n` without reserializing.
#[derive(Clone)]
pub struct NonceHasher {
    prefix: Sha256,
    suffix: Vec<u8>,
}

impl NonceHasher {
    pub fn new(record: &UnsignedRecord, target: u8) -> Self {
        // Tags serialize as `[...]`; reopen the array to append the nonce tag.
        let tags = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());
        let open = &tags[..tags.len().saturating_sub(1)];
        let separator = if record.tags.is_empty() { "" } else { "," };

        let prefix = format!(
            "[0,{},{},{},{}{}[\"nonce\",\"",
            serde_json::Value::from(record.pubkey.as_str()),
            record.created_at,
            record.kind,
            open,
            separator,
        );
        let suffix = format!(
            "\",\"{}\"]],{}]",
            target,
            serde_json::Value::from(record.content.as_str()),
        );

        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        Self {
            prefix: hasher,
            suffix: suffix.into_bytes(),
        }
    }

    pub fn hash(&self, nonce: u64) -> EventIdBytes {
        let mut hasher = self.prefix.clone();
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(&self.suffix);
        hasher.finalize().into()
    }
}
