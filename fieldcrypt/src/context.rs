//! Session context: configuration, KMS providers, and the shared key cache.

use secrecy::ExposeSecret;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use tracing::info;

use crate::crypto::envelope_key_id;
use crate::document::{find_encrypted, parse_document};
use crate::error::{Error, KmsError};
use crate::kdf::derive_field_keys;
use crate::key_cache::{DataKey, KeyCache};
use crate::key_id::{KeyId, KeyReference};
use crate::key_record::KeyRecord;
use crate::kms::{KmsKind, KmsProvider, LocalKms};
use crate::options::{KeyVaultNamespace, Options};
use crate::request::{EncryptedField, Request, Work};
use crate::schema::{match_fields, Schema};

/// A configured encryption session.
///
/// Requests borrow the context, so it cannot be torn down while any request
/// is alive. The context is `Sync`: requests may run on several threads at
/// once and share resolved keys through [`Context::key_cache`].
///
/// # Example
///
/// ```
/// use fieldcrypt::prelude::*;
///
/// let ctx = Context::new(Options::new("mongodb://localhost:27017")).unwrap();
/// let schema = Schema::from_slice(
///     br#"{"filter": {"ssn": {"$encrypt": {"algorithm": "Deterministic", "keyId": "K1"}}}}"#,
/// )
/// .unwrap();
///
/// let command = br#"{"find": "c", "filter": {"ssn": "457-55-5642"}}"#;
/// let mut request = ctx.start_encrypt(&schema, command).unwrap();
/// let query = request.next_key_query().unwrap();
/// assert_eq!(query.ids()[0].as_str(), "K1");
/// ```
pub struct Context {
    options: Options,
    namespace: KeyVaultNamespace,
    batch_size: Option<NonZeroUsize>,
    default_key: Option<KeyReference>,
    key_cache: KeyCache,
    kms: HashMap<KmsKind, Box<dyn KmsProvider>>,
}

impl Context {
    /// Creates a context from validated options.
    ///
    /// A local master key in the options installs [`LocalKms`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any option is missing or invalid.
    pub fn new(options: Options) -> Result<Self, Error> {
        let resolved = options.resolve()?;

        let mut kms: HashMap<KmsKind, Box<dyn KmsProvider>> = HashMap::new();
        if let Some(master_key) = resolved.local_master_key {
            let local = LocalKms::new(master_key).map_err(|e| Error::Config(e.to_string()))?;
            kms.insert(KmsKind::Local, Box::new(local));
        }

        info!(
            key_vault = %resolved.namespace,
            share_key_cache = options.share_key_cache,
            kms_providers = kms.len(),
            "Encryption context created"
        );

        Ok(Self {
            options,
            namespace: resolved.namespace,
            batch_size: resolved.batch_size,
            default_key: resolved.default_key,
            key_cache: KeyCache::new(),
            kms,
        })
    }

    /// Installs a KMS provider, replacing any provider of the same kind.
    pub fn register_kms(&mut self, kind: KmsKind, provider: Box<dyn KmsProvider>) {
        self.kms.insert(kind, provider);
    }

    /// Returns the options the context was created with.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Returns the shared key cache.
    #[must_use]
    pub const fn key_cache(&self) -> &KeyCache {
        &self.key_cache
    }

    /// Drops every cached key. Requests in flight keep the keys they pinned.
    pub fn invalidate_keys(&self) {
        self.key_cache.invalidate_all();
    }

    /// Starts encrypting the fields of `command` that `schema` selects.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidDocument` if `command` is not a JSON document
    /// - `Error::Schema` if the schema does not fit the command
    pub fn start_encrypt(&self, schema: &Schema, command: &[u8]) -> Result<Request<'_>, Error> {
        let document = parse_document(command)?;
        let fields = match_fields(schema, &document, self.default_key.as_ref())?;
        let references: BTreeSet<KeyReference> = fields.iter().map(|f| f.key.clone()).collect();

        Ok(Request::new(self, document, Work::Encrypt(fields), references))
    }

    /// Starts decrypting every encrypted value in `document`.
    ///
    /// Envelopes whose header cannot be read do not fail here; they fail
    /// [`Request::finish`] with `Error::Decryption`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocument` if `document` is not a JSON document.
    pub fn start_decrypt(&self, document: &[u8]) -> Result<Request<'_>, Error> {
        let document = parse_document(document)?;

        let mut references = BTreeSet::new();
        let fields: Vec<EncryptedField> = find_encrypted(&document)
            .into_iter()
            .map(|(path, envelope)| {
                let envelope = envelope.and_then(|bytes| match envelope_key_id(&bytes) {
                    Ok(id) => {
                        references.insert(KeyReference::Id(id));
                        Ok(bytes)
                    }
                    Err(e) => Err(e.to_string()),
                });
                EncryptedField { path, envelope }
            })
            .collect();

        Ok(Request::new(self, document, Work::Decrypt(fields), references))
    }

    /// Consumes the context. Cached keys are zeroized as they drop.
    pub fn teardown(self) {
        info!(cached_keys = self.key_cache.len(), "Encryption context torn down");
    }

    pub(crate) const fn key_vault_namespace(&self) -> &KeyVaultNamespace {
        &self.namespace
    }

    pub(crate) const fn key_query_batch_size(&self) -> Option<NonZeroUsize> {
        self.batch_size
    }

    /// Validates a key record, unwrapping its material when it names a
    /// master key, and derives the data key.
    pub(crate) fn data_key(&self, record: &KeyRecord) -> Result<DataKey, String> {
        let id = KeyId::parse(record.id()).map_err(|e| format!("invalid _id: {e}"))?;
        for name in record.alt_names() {
            KeyReference::alt_name(name.as_str()).map_err(|e| format!("key '{id}': {e}"))?;
        }

        let keys = match record.master_key() {
            None => derive_field_keys(record.key_material()),
            Some(master_key) => {
                let kind = KmsKind::of(master_key);
                let provider = self
                    .kms
                    .get(&kind)
                    .ok_or_else(|| KmsError::ProviderNotRegistered(kind.to_string()))
                    .map_err(|e| format!("key '{id}': {e}"))?;
                let material = provider
                    .unwrap_key(master_key, record.key_material().expose_secret())
                    .map_err(|e| format!("key '{id}': {e}"))?;
                derive_field_keys(&material)
            }
        }
        .map_err(|e| format!("key '{id}': {e}"))?;

        Ok(DataKey::new(id, keys, record.alt_names().to_vec()))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("key_vault_namespace", &self.namespace)
            .field("key_cache", &self.key_cache)
            .field("kms", &self.kms.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
