use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::constants::PROFILE_FIELDS;

/// Profile metadata (kind:0 content) restricted to the recognized field allowlist.
///
/// Keys are always members of [`PROFILE_FIELDS`]; anything else is dropped on
/// construction, so unknown metadata never round-trips through a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileMetadata {
    fields: BTreeMap<&'static str, String>,
}

fn allowlisted(key: &str) -> Option<&'static str> {
    PROFILE_FIELDS.iter().copied().find(|field| *field == key)
}

impl ProfileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse kind:0 content. Non-string values and unknown keys are ignored;
    /// content that is not a JSON object yields empty metadata.
    pub fn from_content(content: &str) -> Self {
        let mut metadata = Self::new();
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) {
            for (key, value) in map {
                if let Value::String(s) = value {
                    metadata.set(&key, s);
                }
            }
        }
        metadata
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut metadata = Self::new();
        for (key, value) in pairs {
            metadata.set(key.as_ref(), value);
        }
        metadata
    }

    /// Set a field. Returns false (and stores nothing) if the key is not allowlisted.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> bool {
        match allowlisted(key) {
            Some(field) => {
                self.fields.insert(field, value.into());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Combine previously known metadata with a partial update.
    ///
    /// Non-empty fields of `self` are kept, then every field present in
    /// `incoming` overwrites, including empty values, which clear the field.
    pub fn merge(&self, incoming: &ProfileMetadata) -> ProfileMetadata {
        let mut fields: BTreeMap<&'static str, String> = self
            .fields
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        for (key, value) in &incoming.fields {
            fields.insert(*key, value.clone());
        }

        ProfileMetadata { fields }
    }

    /// Serialize as kind:0 event content
    pub fn to_content(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Serialize for ProfileMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}
