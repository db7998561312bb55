//! Key records as returned by the key vault.
//!
//! A vault document looks like:
//! ```text
//! {
//!   "_id": "K1",
//!   "keyMaterial": "<base64>",
//!   "keyAltNames": ["payroll"],
//!   "masterKey": {"provider": "local"}
//! }
//! ```
//! `keyAltNames` and `masterKey` are optional; other fields are ignored.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use zeroize::Zeroizing;

/// Master key that wraps a data key in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum MasterKey {
    /// Wrapped with the locally configured master key.
    Local,
    /// Wrapped with an AWS KMS customer master key.
    Aws {
        /// AWS region of the CMK
        region: String,
        /// CMK ARN or alias
        key: String,
    },
}

impl MasterKey {
    /// Provider name as written in vault documents.
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Aws { .. } => "aws",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDocument {
    #[serde(rename = "_id")]
    id: String,
    key_material: String,
    #[serde(default)]
    key_alt_names: Vec<String>,
    #[serde(default)]
    master_key: Option<MasterKey>,
}

/// A raw key record from the vault, not yet validated.
///
/// When `master_key` is set, `key_material` holds wrapped bytes that must be
/// unwrapped by the matching KMS provider before use.
pub struct KeyRecord {
    id: String,
    key_material: SecretVec<u8>,
    alt_names: Vec<String>,
    master_key: Option<MasterKey>,
}

impl KeyRecord {
    /// Creates a record holding raw key material.
    #[must_use]
    pub fn new(id: impl Into<String>, key_material: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            key_material: SecretVec::new(key_material),
            alt_names: Vec::new(),
            master_key: None,
        }
    }

    /// Sets the alternate names of the key.
    #[must_use]
    pub fn with_alt_names<I, S>(mut self, alt_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alt_names = alt_names.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the material as wrapped by the given master key.
    #[must_use]
    pub fn with_master_key(mut self, master_key: MasterKey) -> Self {
        self.master_key = Some(master_key);
        self
    }

    /// Parses a record from a JSON vault document.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the document is not valid
    /// JSON, lacks `_id`/`keyMaterial`, or the material is not base64.
    pub fn from_slice(document: &[u8]) -> Result<Self, String> {
        let KeyDocument { id, key_material, key_alt_names, master_key } =
            serde_json::from_slice(document).map_err(|e| format!("malformed key document: {e}"))?;
        let encoded = Zeroizing::new(key_material);
        let material = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| format!("key '{id}': keyMaterial is not base64: {e}"))?;

        Ok(Self {
            id,
            key_material: SecretVec::new(material),
            alt_names: key_alt_names,
            master_key,
        })
    }

    /// Renders the record as a vault document.
    #[must_use]
    pub fn to_document(&self) -> Value {
        let mut doc = json!({
            "_id": self.id,
            "keyMaterial": STANDARD.encode(self.key_material.expose_secret()),
        });
        if !self.alt_names.is_empty() {
            doc["keyAltNames"] = json!(self.alt_names);
        }
        if let Some(master_key) = &self.master_key {
            doc["masterKey"] = json!(master_key);
        }
        doc
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the (possibly wrapped) key material.
    #[must_use]
    pub fn key_material(&self) -> &SecretVec<u8> {
        &self.key_material
    }

    /// Returns the alternate names.
    #[must_use]
    pub fn alt_names(&self) -> &[String] {
        &self.alt_names
    }

    /// Returns the wrapping master key, if any.
    #[must_use]
    pub fn master_key(&self) -> Option<&MasterKey> {
        self.master_key.as_ref()
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("alt_names", &self.alt_names)
            .field("master_key", &self.master_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_document() {
        let doc = json!({"_id": "K1", "keyMaterial": STANDARD.encode([9u8; 32])});
        let record = KeyRecord::from_slice(doc.to_string().as_bytes()).unwrap();

        assert_eq!(record.id(), "K1");
        assert_eq!(record.key_material().expose_secret(), &vec![9u8; 32]);
        assert!(record.alt_names().is_empty());
        assert!(record.master_key().is_none());
    }

    #[test]
    fn test_parse_full_document() {
        let doc = json!({
            "_id": "K2",
            "keyMaterial": STANDARD.encode([1u8; 48]),
            "keyAltNames": ["payroll", "hr"],
            "masterKey": {"provider": "aws", "region": "us-east-1", "key": "arn:aws:kms:k"},
            "creationDate": "2024-01-01",
        });
        let record = KeyRecord::from_slice(doc.to_string().as_bytes()).unwrap();

        assert_eq!(record.alt_names(), ["payroll", "hr"]);
        assert_eq!(
            record.master_key(),
            Some(&MasterKey::Aws { region: "us-east-1".into(), key: "arn:aws:kms:k".into() })
        );
    }

    #[test]
    fn test_missing_id_rejected() {
        let doc = json!({"keyMaterial": STANDARD.encode([1u8; 32])});
        assert!(KeyRecord::from_slice(doc.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_bad_base64_rejected() {
        let doc = json!({"_id": "K1", "keyMaterial": "not base64!!"});
        let err = KeyRecord::from_slice(doc.to_string().as_bytes()).unwrap_err();
        assert!(err.contains("not base64"));
    }

    #[test]
    fn test_document_rendering_parses_back() {
        let record = KeyRecord::new("K3", vec![5u8; 32])
            .with_alt_names(["ops"])
            .with_master_key(MasterKey::Local);
        let doc = record.to_document();

        assert_eq!(doc["masterKey"], json!({"provider": "local"}));
        let parsed = KeyRecord::from_slice(doc.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.id(), "K3");
        assert_eq!(parsed.alt_names(), ["ops"]);
        assert_eq!(parsed.master_key(), Some(&MasterKey::Local));
    }

    #[test]
    fn test_debug_redacts_material() {
        let record = KeyRecord::new("K4", vec![0xAB; 32]).with_alt_names(["ops"]);
        let debug = format!("{record:?}");

        assert!(debug.contains("K4"));
        assert!(debug.contains("ops"));
        assert!(!debug.contains("171"));
        assert!(!debug.contains("key_material"));
    }
}
