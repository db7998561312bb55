//! Context configuration.
//!
//! Options deserialize from camelCase JSON:
//!
//! ```text
//! {
//!   "keyVaultUri": "mongodb://localhost:27017",
//!   "keyVaultNamespace": "admin.datakeys",
//!   "kmsProviders": {"local": {"key": "<base64, 32 bytes>"}},
//!   "defaultKey": {"keyAltName": "payroll"},
//!   "keyQueryBatchSize": 50,
//!   "shareKeyCache": true
//! }
//! ```
//!
//! Only `keyVaultUri` is required.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString, SecretVec};
use serde::Deserialize;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use crate::error::Error;
use crate::key_id::KeyReference;
use crate::kms::LOCAL_MASTER_KEY_SIZE;

/// Namespace used when `keyVaultNamespace` is not set.
pub const DEFAULT_KEY_VAULT_NAMESPACE: &str = "admin.datakeys";

/// `database.collection` holding the data keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyVaultNamespace {
    database: String,
    collection: String,
}

impl KeyVaultNamespace {
    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl FromStr for KeyVaultNamespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((database, collection)) if !database.is_empty() && !collection.is_empty() => {
                Ok(Self { database: database.to_string(), collection: collection.to_string() })
            }
            _ => Err(Error::Config(format!(
                "key vault namespace '{s}' must have the form <database>.<collection>"
            ))),
        }
    }
}

impl fmt::Display for KeyVaultNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// AWS credentials handed to an externally registered AWS KMS provider.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AwsCredentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: SecretString,
    /// Region of the KMS endpoint
    pub region: String,
    /// Session token for temporary credentials
    #[serde(default)]
    pub session_token: Option<SecretString>,
}

/// Local master key, base64 encoded.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalMasterKeyOptions {
    /// Base64 of a 32-byte master key
    pub key: SecretString,
}

/// Credentials per KMS provider.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KmsProviders {
    /// AWS KMS credentials
    #[serde(default)]
    pub aws: Option<AwsCredentials>,
    /// Local master key
    #[serde(default)]
    pub local: Option<LocalMasterKeyOptions>,
}

/// Key used by schema leaves that name none. Set exactly one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DefaultKey {
    /// Key id
    #[serde(default)]
    pub key_id: Option<String>,
    /// Key alternate name
    #[serde(default)]
    pub key_alt_name: Option<String>,
}

impl DefaultKey {
    fn reference(&self) -> Result<KeyReference, Error> {
        match (&self.key_id, &self.key_alt_name) {
            (Some(id), None) => KeyReference::id(id.as_str()),
            (None, Some(name)) => KeyReference::alt_name(name.as_str()),
            _ => Err("set exactly one of keyId and keyAltName".to_string()),
        }
        .map_err(|e| Error::Config(format!("invalid default key: {e}")))
    }
}

/// Options for a [`Context`](crate::context::Context).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    /// Locator of the key vault, passed through to the caller's vault client
    pub key_vault_uri: String,
    /// `database.collection` of the key vault
    #[serde(default = "default_namespace")]
    pub key_vault_namespace: String,
    /// KMS credentials
    #[serde(default)]
    pub kms_providers: KmsProviders,
    /// Key for schema leaves without one
    #[serde(default)]
    pub default_key: Option<DefaultKey>,
    /// Maximum references per key query; unlimited when unset
    #[serde(default)]
    pub key_query_batch_size: Option<usize>,
    /// Share resolved keys between requests of one context
    #[serde(default = "default_share_key_cache")]
    pub share_key_cache: bool,
}

fn default_namespace() -> String {
    DEFAULT_KEY_VAULT_NAMESPACE.to_string()
}

const fn default_share_key_cache() -> bool {
    true
}

impl Options {
    /// Creates options with defaults for everything but the vault locator.
    #[must_use]
    pub fn new(key_vault_uri: impl Into<String>) -> Self {
        Self {
            key_vault_uri: key_vault_uri.into(),
            key_vault_namespace: default_namespace(),
            kms_providers: KmsProviders::default(),
            default_key: None,
            key_query_batch_size: None,
            share_key_cache: default_share_key_cache(),
        }
    }

    /// Parses options from a JSON buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the buffer is not valid options JSON.
    pub fn from_slice(buffer: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(buffer).map_err(|e| Error::Config(e.to_string()))
    }

    /// Sets the key vault namespace.
    #[must_use]
    pub fn with_key_vault_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.key_vault_namespace = namespace.into();
        self
    }

    /// Sets the local master key (base64).
    #[must_use]
    pub fn with_local_master_key(mut self, key_base64: impl Into<String>) -> Self {
        self.kms_providers.local =
            Some(LocalMasterKeyOptions { key: SecretString::new(key_base64.into()) });
        self
    }

    /// Sets AWS credentials.
    #[must_use]
    pub fn with_aws_credentials(mut self, credentials: AwsCredentials) -> Self {
        self.kms_providers.aws = Some(credentials);
        self
    }

    /// Sets the default key by id.
    #[must_use]
    pub fn with_default_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.default_key = Some(DefaultKey { key_id: Some(key_id.into()), key_alt_name: None });
        self
    }

    /// Sets the default key by alternate name.
    #[must_use]
    pub fn with_default_key_alt_name(mut self, name: impl Into<String>) -> Self {
        self.default_key = Some(DefaultKey { key_id: None, key_alt_name: Some(name.into()) });
        self
    }

    /// Limits the number of references per key query.
    #[must_use]
    pub const fn with_key_query_batch_size(mut self, size: usize) -> Self {
        self.key_query_batch_size = Some(size);
        self
    }

    /// Chooses between a context-wide key cache and one per request.
    #[must_use]
    pub const fn with_share_key_cache(mut self, share: bool) -> Self {
        self.share_key_cache = share;
        self
    }

    /// Checks every option.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid option.
    pub fn validate(&self) -> Result<(), Error> {
        self.resolve().map(|_| ())
    }

    pub(crate) fn resolve(&self) -> Result<ResolvedOptions, Error> {
        if self.key_vault_uri.trim().is_empty() {
            return Err(Error::Config("keyVaultUri is required".to_string()));
        }

        let namespace = self.key_vault_namespace.parse()?;

        let batch_size = self
            .key_query_batch_size
            .map(|size| {
                NonZeroUsize::new(size).ok_or_else(|| {
                    Error::Config("keyQueryBatchSize must be at least 1".to_string())
                })
            })
            .transpose()?;

        let default_key = self.default_key.as_ref().map(DefaultKey::reference).transpose()?;

        if let Some(aws) = &self.kms_providers.aws {
            if aws.access_key_id.is_empty() || aws.secret_access_key.expose_secret().is_empty() {
                return Err(Error::Config("AWS credentials are incomplete".to_string()));
            }
            if aws.region.is_empty() {
                return Err(Error::Config("AWS region is required".to_string()));
            }
        }

        let local_master_key = self
            .kms_providers
            .local
            .as_ref()
            .map(|local| decode_local_master_key(&local.key))
            .transpose()?;

        Ok(ResolvedOptions { namespace, batch_size, default_key, local_master_key })
    }
}

fn decode_local_master_key(encoded: &SecretString) -> Result<SecretVec<u8>, Error> {
    let key = STANDARD
        .decode(encoded.expose_secret())
        .map_err(|e| Error::Config(format!("local master key is not base64: {e}")))?;
    if key.len() != LOCAL_MASTER_KEY_SIZE {
        return Err(Error::Config(format!(
            "local master key must be {LOCAL_MASTER_KEY_SIZE} bytes, got {}",
            key.len()
        )));
    }
    Ok(SecretVec::new(key))
}

/// Options after validation, in the form the context uses.
pub(crate) struct ResolvedOptions {
    pub namespace: KeyVaultNamespace,
    pub batch_size: Option<NonZeroUsize>,
    pub default_key: Option<KeyReference>,
    pub local_master_key: Option<SecretVec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json() {
        let options = Options::from_slice(br#"{"keyVaultUri": "mongodb://localhost"}"#).unwrap();

        assert_eq!(options.key_vault_namespace, DEFAULT_KEY_VAULT_NAMESPACE);
        assert!(options.share_key_cache);
        assert!(options.default_key.is_none());
        options.validate().unwrap();
    }

    #[test]
    fn test_full_json() {
        let json = format!(
            r#"{{
                "keyVaultUri": "mongodb://localhost",
                "keyVaultNamespace": "crypt.keys",
                "kmsProviders": {{
                    "aws": {{
                        "accessKeyId": "AKIA",
                        "secretAccessKey": "s3cr3t",
                        "region": "us-east-1"
                    }},
                    "local": {{"key": "{}"}}
                }},
                "defaultKey": {{"keyAltName": "payroll"}},
                "keyQueryBatchSize": 2,
                "shareKeyCache": false
            }}"#,
            STANDARD.encode([7u8; 32])
        );
        let options = Options::from_slice(json.as_bytes()).unwrap();
        let resolved = options.resolve().unwrap();

        assert_eq!(resolved.namespace.database(), "crypt");
        assert_eq!(resolved.namespace.collection(), "keys");
        assert_eq!(resolved.batch_size, NonZeroUsize::new(2));
        assert_eq!(resolved.default_key, Some(KeyReference::AltName("payroll".into())));
        assert!(resolved.local_master_key.is_some());
        assert!(!options.share_key_cache);
    }

    #[test]
    fn test_missing_uri_rejected() {
        assert!(matches!(Options::from_slice(b"{}"), Err(Error::Config(_))));
        assert!(matches!(Options::new("  ").validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let result = Options::from_slice(br#"{"keyVaultUri": "x", "bypass": true}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_namespace_validation() {
        for bad in ["admin", ".keys", "admin.", ""] {
            let result = Options::new("uri").with_key_vault_namespace(bad).validate();
            assert!(matches!(result, Err(Error::Config(_))), "{bad}");
        }
        let ns: KeyVaultNamespace = "db.coll.sub".parse().unwrap();
        assert_eq!(ns.collection(), "coll.sub");
        assert_eq!(ns.to_string(), "db.coll.sub");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = Options::new("uri").with_key_query_batch_size(0).validate();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_local_master_key_validation() {
        let short = Options::new("uri").with_local_master_key(STANDARD.encode([1u8; 16]));
        assert!(matches!(short.validate(), Err(Error::Config(_))));

        let garbage = Options::new("uri").with_local_master_key("***");
        assert!(matches!(garbage.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_default_key_needs_exactly_one_field() {
        let both = Options::from_slice(
            br#"{"keyVaultUri": "x", "defaultKey": {"keyId": "K1", "keyAltName": "a"}}"#,
        )
        .unwrap();
        assert!(matches!(both.validate(), Err(Error::Config(_))));

        let neither =
            Options::from_slice(br#"{"keyVaultUri": "x", "defaultKey": {}}"#).unwrap();
        assert!(matches!(neither.validate(), Err(Error::Config(_))));

        let by_id = Options::new("x").with_default_key_id("K1").resolve().unwrap();
        assert_eq!(by_id.default_key.unwrap().to_string(), "id:K1");
    }

    #[test]
    fn test_incomplete_aws_credentials_rejected() {
        let options = Options::from_slice(
            br#"{
                "keyVaultUri": "x",
                "kmsProviders": {"aws": {"accessKeyId": "", "secretAccessKey": "s", "region": "r"}}
            }"#,
        )
        .unwrap();
        assert!(matches!(options.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let options = Options::new("uri").with_local_master_key("c2VjcmV0LWtleQ==");
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("c2VjcmV0LWtleQ=="));
    }
}
