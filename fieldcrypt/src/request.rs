//! Encrypt and decrypt requests.
//!
//! A request does no I/O. When keys are missing it suspends in
//! [`State::GatheringKeys`] and hands out [`KeyQuery`] values; the caller
//! runs them against the key vault and feeds the results back through
//! [`Request::add_keys`]. Once every key is resolved, [`Request::finish`]
//! transforms the document.
//!
//! ```text
//! GatheringKeys --(all keys resolved)--> ReadyToTransform --finish--> Completed
//!                                                         \--error--> Failed
//! ```
//!
//! Keys are pinned in the request as they resolve, so invalidating the key
//! cache does not affect a request in flight.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::Context;
use crate::crypto::{decrypt_field, encrypt_field};
use crate::document::{encrypted_value, to_buffer, FieldPath};
use crate::error::Error;
use crate::key_cache::{DataKey, KeyCache};
use crate::key_id::{KeyId, KeyReference};
use crate::key_query::KeyQuery;
use crate::key_record::KeyRecord;
use crate::schema::MatchedField;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Waiting for key records from the caller
    GatheringKeys,
    /// Every key is resolved; `finish` may run
    ReadyToTransform,
    /// `finish` succeeded
    Completed,
    /// `finish` failed
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GatheringKeys => "GatheringKeys",
            Self::ReadyToTransform => "ReadyToTransform",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Encrypt the fields a schema selects
    Encrypt,
    /// Decrypt every encrypted value in a document
    Decrypt,
}

/// An encrypted value found in a document, with its envelope or the reason
/// the envelope could not be read.
#[derive(Debug)]
pub(crate) struct EncryptedField {
    pub path: FieldPath,
    pub envelope: Result<Vec<u8>, String>,
}

#[derive(Debug)]
pub(crate) enum Work {
    Encrypt(Vec<MatchedField>),
    Decrypt(Vec<EncryptedField>),
}

impl Work {
    const fn kind(&self) -> RequestKind {
        match self {
            Self::Encrypt(_) => RequestKind::Encrypt,
            Self::Decrypt(_) => RequestKind::Decrypt,
        }
    }
}

#[derive(Debug)]
struct PendingQuery {
    query: KeyQuery,
    handed_out: bool,
    satisfied: bool,
}

/// One encrypt or decrypt operation on a single document.
///
/// Borrows its [`Context`], so it cannot outlive it.
pub struct Request<'ctx> {
    context: &'ctx Context,
    private_cache: Option<KeyCache>,
    document: Value,
    work: Work,
    references: BTreeSet<KeyReference>,
    unresolved: BTreeSet<KeyReference>,
    queries: Vec<PendingQuery>,
    pinned: HashMap<KeyId, Arc<DataKey>>,
    alt_names: HashMap<String, KeyId>,
    state: State,
}

impl<'ctx> Request<'ctx> {
    pub(crate) fn new(
        context: &'ctx Context,
        document: Value,
        work: Work,
        references: BTreeSet<KeyReference>,
    ) -> Self {
        let private_cache = (!context.options().share_key_cache).then(KeyCache::new);
        let mut request = Self {
            context,
            private_cache,
            document,
            work,
            references,
            unresolved: BTreeSet::new(),
            queries: Vec::new(),
            pinned: HashMap::new(),
            alt_names: HashMap::new(),
            state: State::GatheringKeys,
        };

        let references: Vec<KeyReference> = request.references.iter().cloned().collect();
        for reference in references {
            match request.cache().resolve(&reference) {
                Some(key) => request.pin(&reference, key),
                None => {
                    request.unresolved.insert(reference);
                }
            }
        }

        request.queries = KeyQuery::plan(
            context.key_vault_namespace(),
            &request.unresolved,
            context.key_query_batch_size(),
        )
        .into_iter()
        .map(|query| PendingQuery { query, handed_out: false, satisfied: false })
        .collect();

        if request.unresolved.is_empty() {
            request.state = State::ReadyToTransform;
        }

        debug!(
            kind = ?request.kind(),
            references = request.references.len(),
            cached = request.pinned.len(),
            queries = request.queries.len(),
            state = %request.state,
            "Request started"
        );
        request
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns whether this request encrypts or decrypts.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.work.kind()
    }

    /// Returns true while the request is waiting for key records.
    #[must_use]
    pub fn needs_keys(&self) -> bool {
        self.state == State::GatheringKeys
    }

    /// Hands out the next key query that is neither handed out nor satisfied.
    ///
    /// Returns `None` once every query has been handed out. If
    /// [`unresolved_keys`](Self::unresolved_keys) is still non-empty at that
    /// point, the vault does not hold those keys.
    pub fn next_key_query(&mut self) -> Option<KeyQuery> {
        if !self.needs_keys() {
            return None;
        }
        let pending = self.queries.iter_mut().find(|q| !q.handed_out && !q.satisfied)?;
        pending.handed_out = true;

        debug!(
            sequence = pending.query.sequence(),
            ids = pending.query.ids().len(),
            alt_names = pending.query.alt_names().len(),
            "Key query emitted"
        );
        Some(pending.query.clone())
    }

    /// References that no key record has resolved yet, in sorted order.
    #[must_use]
    pub fn unresolved_keys(&self) -> Vec<KeyReference> {
        self.unresolved.iter().cloned().collect()
    }

    /// Applies raw key-vault documents.
    ///
    /// Documents are applied in order; for a repeated id the later record
    /// wins. Returns the number of records applied.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState` if the request has completed or failed
    /// - `Error::KeyValidation` if any document was rejected; the valid ones
    ///   are still applied and counted in `applied`
    pub fn add_keys<I>(&mut self, documents: I) -> Result<usize, Error>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.apply(documents.into_iter().map(|doc| KeyRecord::from_slice(doc.as_ref())))
    }

    /// Applies already-parsed key records. See [`add_keys`](Self::add_keys).
    ///
    /// # Errors
    ///
    /// Same as [`add_keys`](Self::add_keys).
    pub fn add_key_records<I>(&mut self, records: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = KeyRecord>,
    {
        self.apply(records.into_iter().map(Ok))
    }

    fn apply(
        &mut self,
        records: impl Iterator<Item = Result<KeyRecord, String>>,
    ) -> Result<usize, Error> {
        if matches!(self.state, State::Completed | State::Failed) {
            return Err(Error::InvalidState(self.state));
        }

        let mut applied = 0;
        let mut rejected = None;
        for record in records {
            match record.and_then(|record| self.context.data_key(&record)) {
                Ok(key) => {
                    let key = self.cache().insert(key);
                    self.absorb(&key);
                    applied += 1;
                }
                Err(reason) => {
                    warn!(%reason, "Key record rejected");
                    rejected.get_or_insert(reason);
                }
            }
        }

        for pending in &mut self.queries {
            pending.satisfied = pending.query.references().all(|r| !self.unresolved.contains(&r));
        }
        if self.state == State::GatheringKeys && self.unresolved.is_empty() {
            self.state = State::ReadyToTransform;
            debug!("All keys resolved");
        }

        match rejected {
            Some(reason) => Err(Error::KeyValidation { applied, reason }),
            None => Ok(applied),
        }
    }

    /// Transforms the document and returns the output buffer.
    ///
    /// # Errors
    ///
    /// - `Error::NotReady` while keys are outstanding; the request stays usable
    /// - `Error::InvalidState` if the request has completed or failed
    /// - `Error::Encryption` / `Error::Decryption` if a field cannot be
    ///   transformed; the request moves to `Failed` and no output is produced
    pub fn finish(&mut self) -> Result<Vec<u8>, Error> {
        match self.state {
            State::GatheringKeys => {
                return Err(Error::NotReady { outstanding: self.unresolved_keys() });
            }
            State::Completed | State::Failed => return Err(Error::InvalidState(self.state)),
            State::ReadyToTransform => {}
        }

        let document = std::mem::take(&mut self.document);
        let result = self.transform(document);
        self.state = if result.is_ok() { State::Completed } else { State::Failed };

        debug!(kind = ?self.kind(), state = %self.state, "Request finished");
        result
    }

    fn transform(&self, mut document: Value) -> Result<Vec<u8>, Error> {
        match &self.work {
            Work::Encrypt(fields) => {
                for field in fields {
                    let key = self.pinned_key(&field.key).ok_or_else(|| {
                        Error::Encryption(format!("key {} is not resolved", field.key))
                    })?;
                    let slot = field.path.get_mut(&mut document).ok_or_else(|| {
                        Error::Encryption(format!("field '{}' disappeared", field.path))
                    })?;
                    let envelope = encrypt_field(slot, &key, field.algorithm)?;
                    *slot = encrypted_value(&envelope);
                }
            }
            Work::Decrypt(fields) => {
                for field in fields {
                    let envelope = field.envelope.as_ref().map_err(|reason| {
                        Error::Decryption(format!("field '{}': {reason}", field.path))
                    })?;
                    let value = decrypt_field(envelope, &self.pinned)?;
                    let slot = field.path.get_mut(&mut document).ok_or_else(|| {
                        Error::Decryption(format!("field '{}' disappeared", field.path))
                    })?;
                    *slot = value;
                }
            }
        }
        to_buffer(&document)
    }

    fn cache(&self) -> &KeyCache {
        self.private_cache.as_ref().unwrap_or_else(|| self.context.key_cache())
    }

    fn pin(&mut self, reference: &KeyReference, key: Arc<DataKey>) {
        if let KeyReference::AltName(name) = reference {
            self.alt_names.insert(name.clone(), key.id().clone());
        }
        self.pinned.insert(key.id().clone(), key);
    }

    /// Resolves every reference of this request that `key` satisfies.
    fn absorb(&mut self, key: &Arc<DataKey>) {
        let satisfied: Vec<KeyReference> =
            self.references.iter().filter(|r| key.satisfies(r)).cloned().collect();
        let repinned = self.pinned.contains_key(key.id());

        for reference in &satisfied {
            self.unresolved.remove(reference);
            self.pin(reference, Arc::clone(key));
        }
        if repinned && satisfied.is_empty() {
            self.pinned.insert(key.id().clone(), Arc::clone(key));
        }
    }

    fn pinned_key(&self, reference: &KeyReference) -> Option<Arc<DataKey>> {
        let id = match reference {
            KeyReference::Id(id) => id,
            KeyReference::AltName(name) => self.alt_names.get(name)?,
        };
        self.pinned.get(id).cloned()
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind())
            .field("state", &self.state)
            .field("unresolved", &self.unresolved)
            .field("pinned", &self.pinned.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
