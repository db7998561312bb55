//! # `fieldcrypt`
//!
//! Client-side field-level encryption for document databases, driven by a
//! schema and resolved through a caller-run key vault.
//!
//! ## Features
//!
//! - Schema-selected field encryption in commands and documents
//! - Deterministic (equality-queryable) and randomized AEAD (ChaCha20-Poly1305)
//! - Self-describing envelopes: decryption needs no schema
//! - I/O-free key resolution: requests emit key queries, the caller answers them
//! - Context-wide key cache with explicit invalidation
//! - Pluggable KMS unwrapping, with a built-in local master key
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldcrypt::prelude::*;
//!
//! let ctx = Context::new(Options::new("mongodb://localhost:27017"))?;
//! let schema = Schema::from_slice(schema_json)?;
//!
//! let mut request = ctx.start_encrypt(&schema, command)?;
//! while let Some(query) = request.next_key_query() {
//!     let records = vault.find(&query);
//!     request.add_keys(records)?;
//! }
//! let encrypted = request.finish()?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod crypto;
pub mod document;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod key_cache;
pub mod key_id;
pub mod key_query;
pub mod key_record;
pub mod kms;
pub mod options;
pub mod request;
pub mod schema;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::context::Context;
    pub use crate::error::{Error, ErrorKind, KmsError};
    pub use crate::key_cache::{DataKey, KeyCache};
    pub use crate::key_id::{KeyId, KeyReference};
    pub use crate::key_query::KeyQuery;
    pub use crate::key_record::{KeyRecord, MasterKey};
    pub use crate::kms::{KmsKind, KmsProvider, LocalKms};
    pub use crate::options::Options;
    pub use crate::request::{Request, RequestKind, State};
    pub use crate::schema::{Algorithm, Schema};
}
