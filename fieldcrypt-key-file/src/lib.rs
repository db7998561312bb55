//! File-backed key vault for `fieldcrypt`.
//!
//! The vault is a JSON array of key documents in a single file and is meant
//! for development, tests, and the CLI:
//! ```text
//! [
//!   {"_id": "3f2a...", "keyMaterial": "<base64>", "keyAltNames": ["payroll"]},
//!   {"_id": "9b1c...", "keyMaterial": "<base64, wrapped>", "masterKey": {"provider": "local"}}
//! ]
//! ```
//! On Unix the file is written with 0600 permissions.

#![warn(clippy::pedantic, clippy::nursery)]

use fieldcrypt::error::{Error as FieldcryptError, KmsError};
use fieldcrypt::key_query::KeyQuery;
use fieldcrypt::key_record::{KeyRecord, MasterKey};
use fieldcrypt::kms::LocalKms;
use fieldcrypt::request::Request;
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zeroize::Zeroizing;

/// Size of generated data keys in bytes.
pub const DATA_KEY_SIZE: usize = 32;

const KEY_ID_BYTES: usize = 16;

/// Errors from the file key vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Reading or writing the vault file failed
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Vault file
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The vault file is not a JSON array of key documents
    #[error("malformed key vault {}: {reason}", .path.display())]
    Malformed {
        /// Vault file
        path: PathBuf,
        /// What is wrong
        reason: String,
    },

    /// `init` was called on an existing file
    #[error("key vault already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// An alternate name is already used by another key
    #[error("key alt name '{0}' is already in use")]
    DuplicateAltName(String),

    /// Wrapping a new data key failed
    #[error("key wrap failed: {0}")]
    Kms(#[from] KmsError),

    /// The request rejected what the vault returned
    #[error(transparent)]
    Request(#[from] FieldcryptError),

    /// Queries are exhausted but keys are still missing
    #[error("key vault has no key for: {}", .0.join(", "))]
    MissingKeys(Vec<String>),
}

/// Key vault stored in a single JSON file.
#[derive(Debug)]
pub struct FileKeyVault {
    path: PathBuf,
    documents: Vec<Value>,
}

impl FileKeyVault {
    /// Creates an empty vault file.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::AlreadyExists` if the file exists, or
    /// `VaultError::Io` if it cannot be written.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        if path.exists() {
            return Err(VaultError::AlreadyExists(path));
        }
        let vault = Self { path, documents: Vec::new() };
        vault.persist()?;
        Ok(vault)
    }

    /// Loads a vault file.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Io` if the file cannot be read, or
    /// `VaultError::Malformed` if it is not an array of key documents.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        let contents =
            fs::read(&path).map_err(|source| VaultError::Io { path: path.clone(), source })?;

        let documents: Vec<Value> = serde_json::from_slice(&contents).map_err(|e| {
            VaultError::Malformed { path: path.clone(), reason: e.to_string() }
        })?;
        if let Some(i) = documents.iter().position(|doc| document_id(doc).is_none()) {
            return Err(VaultError::Malformed {
                path,
                reason: format!("entry {i} has no string _id"),
            });
        }

        debug!(path = %path.display(), keys = documents.len(), "Key vault opened");
        Ok(Self { path, documents })
    }

    /// Returns the vault file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the vault holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Returns the ids of all keys, in file order.
    #[must_use]
    pub fn key_ids(&self) -> Vec<&str> {
        self.documents.iter().filter_map(document_id).collect()
    }

    /// Runs a key query, returning matching documents as raw buffers.
    #[must_use]
    pub fn find(&self, query: &KeyQuery) -> Vec<Vec<u8>> {
        self.documents
            .iter()
            .filter(|doc| {
                document_id(doc).is_some_and(|id| query.matches(id, &document_alt_names(doc)))
            })
            .map(|doc| doc.to_string().into_bytes())
            .collect()
    }

    /// Generates a random data key, optionally wrapped under a local master
    /// key, and persists it. Returns the new key id.
    ///
    /// # Errors
    ///
    /// - `VaultError::DuplicateAltName` if an alt name is already taken
    /// - `VaultError::Kms` if wrapping fails
    /// - `VaultError::Io` if the vault cannot be written
    pub fn generate_key(
        &mut self,
        alt_names: &[String],
        wrap_with: Option<&LocalKms>,
    ) -> Result<String, VaultError> {
        let mut material = Zeroizing::new(vec![0u8; DATA_KEY_SIZE]);
        OsRng.fill_bytes(&mut material);

        let mut id_bytes = [0u8; KEY_ID_BYTES];
        OsRng.fill_bytes(&mut id_bytes);
        let id = hex::encode(id_bytes);

        let record = match wrap_with {
            Some(kms) => KeyRecord::new(id.as_str(), kms.wrap_key(&material)?)
                .with_master_key(MasterKey::Local),
            None => KeyRecord::new(id.as_str(), material.to_vec()),
        }
        .with_alt_names(alt_names.iter().cloned());

        self.insert(&record)?;
        Ok(id)
    }

    /// Adds a key record and persists the vault. A record with an existing id
    /// replaces the stored one.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::DuplicateAltName` if another key already uses one
    /// of the record's alt names, or `VaultError::Io` if the write fails.
    pub fn insert(&mut self, record: &KeyRecord) -> Result<(), VaultError> {
        for doc in &self.documents {
            if document_id(doc) == Some(record.id()) {
                continue;
            }
            let taken = document_alt_names(doc);
            if let Some(name) = record.alt_names().iter().find(|n| taken.contains(n)) {
                return Err(VaultError::DuplicateAltName(name.clone()));
            }
        }

        self.documents.retain(|doc| document_id(doc) != Some(record.id()));
        self.documents.push(record.to_document());
        self.persist()?;

        debug!(key_id = record.id(), alt_names = record.alt_names().len(), "Key stored");
        Ok(())
    }

    fn persist(&self) -> Result<(), VaultError> {
        let io_error = |source: io::Error| VaultError::Io { path: self.path.clone(), source };

        let contents = Zeroizing::new(serde_json::to_vec_pretty(&self.documents).map_err(|e| {
            VaultError::Malformed { path: self.path.clone(), reason: e.to_string() }
        })?);

        let mut staged = staging_file(&self.path).map_err(io_error)?;
        staged.write_all(&contents).map_err(io_error)?;
        staged.as_file().sync_all().map_err(io_error)?;
        staged.persist(&self.path).map_err(|e| io_error(e.error))?;
        Ok(())
    }
}

/// Creates the temp file a vault write goes through, beside `path`.
/// On Unix it is created with 0600 permissions.
fn staging_file(path: &Path) -> io::Result<NamedTempFile> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new().prefix(".fieldcrypt-vault").suffix(".tmp").tempfile_in(dir)
}

fn document_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

fn document_alt_names(doc: &Value) -> Vec<String> {
    doc.get("keyAltNames")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Answers every key query of `request` from `vault`.
///
/// Returns the number of key records applied.
///
/// # Errors
///
/// - `VaultError::Request` if the request rejects a key record
/// - `VaultError::MissingKeys` if the vault lacks a requested key
pub fn satisfy_key_queries(
    vault: &FileKeyVault,
    request: &mut Request<'_>,
) -> Result<usize, VaultError> {
    let mut applied = 0;
    while let Some(query) = request.next_key_query() {
        let documents = vault.find(&query);
        debug!(sequence = query.sequence(), found = documents.len(), "Key query answered");
        applied += request.add_keys(documents)?;
    }

    if request.needs_keys() {
        let missing = request.unresolved_keys().iter().map(ToString::to_string).collect();
        return Err(VaultError::MissingKeys(missing));
    }
    Ok(applied)
}
