//! Ciphertext envelope format for encrypted fields.
//!
//! The envelope is self-describing, so the decrypt path can discover which
//! key a field needs without a schema:
//! - Envelope version
//! - Algorithm
//! - Key identifier
//! - Type of the original value
//! - Nonce
//!
//! followed by `ciphertext || tag`. The header bytes are the AEAD associated
//! data.

use serde_json::Value;

use crate::error::Error;
use crate::key_id::KeyId;
use crate::schema::Algorithm;

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// Kind of the plaintext value, using BSON type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Floating point number
    Double,
    /// UTF-8 string
    String,
    /// Embedded document
    Document,
    /// Array
    Array,
    /// Boolean
    Boolean,
    /// Null
    Null,
    /// Integer
    Int64,
}

impl ValueType {
    /// Classifies a JSON value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Int64,
            Value::Number(_) => Self::Double,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Document,
        }
    }

    /// Returns the BSON type code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Document => 0x03,
            Self::Array => 0x04,
            Self::Boolean => 0x08,
            Self::Null => 0x0A,
            Self::Int64 => 0x12,
        }
    }

    /// Parses a BSON type code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Double),
            0x02 => Some(Self::String),
            0x03 => Some(Self::Document),
            0x04 => Some(Self::Array),
            0x08 => Some(Self::Boolean),
            0x0A => Some(Self::Null),
            0x12 => Some(Self::Int64),
            _ => None,
        }
    }
}

/// Envelope header preceding the ciphertext.
///
/// Format:
/// ```text
/// [version:1][algorithm:1][key_id_len:1][key_id:N][value_type:1][nonce_len:1][nonce:L]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    version: u8,
    algorithm: Algorithm,
    key_id: KeyId,
    value_type: ValueType,
    nonce: Vec<u8>,
}

impl EnvelopeHeader {
    /// Creates a new envelope header.
    #[must_use]
    pub fn new(algorithm: Algorithm, key_id: KeyId, value_type: ValueType, nonce: Vec<u8>) -> Self {
        Self { version: ENVELOPE_VERSION, algorithm, key_id, value_type, nonce }
    }

    /// Returns the envelope version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the key identifier.
    #[must_use]
    pub const fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Returns the type of the encrypted value.
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Returns the nonce.
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Serializes everything except the nonce.
    ///
    /// This prefix is what the deterministic nonce is derived from.
    #[must_use]
    pub fn prefix_bytes(&self) -> Vec<u8> {
        let key_id = self.key_id.as_str().as_bytes();
        let mut bytes = Vec::with_capacity(4 + key_id.len());

        bytes.push(self.version);
        bytes.push(self.algorithm.as_u8());

        // Safe cast: KeyId guarantees at most 255 bytes
        #[allow(clippy::cast_possible_truncation)]
        let key_id_len = key_id.len() as u8;
        bytes.push(key_id_len);
        bytes.extend_from_slice(key_id);

        bytes.push(self.value_type.as_u8());
        bytes
    }

    /// Serializes the header to bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the nonce is too long (> 255 bytes).
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.nonce.len() > 255 {
            return Err(Error::Encryption(format!(
                "nonce too long: {} bytes (max: 255)",
                self.nonce.len()
            )));
        }

        let mut bytes = self.prefix_bytes();

        // Safe cast: length validated above
        #[allow(clippy::cast_possible_truncation)]
        let nonce_len = self.nonce.len() as u8;
        bytes.push(nonce_len);
        bytes.extend_from_slice(&self.nonce);

        Ok(bytes)
    }

    /// Deserializes a header from the start of an envelope.
    ///
    /// Returns the header and its length in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` if:
    /// - The data is truncated
    /// - The version or algorithm is not supported
    /// - The key id or value type is invalid
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), Error> {
        let mut reader = Reader { data, pos: 0 };

        let version = reader.byte("version")?;
        if version != ENVELOPE_VERSION {
            return Err(malformed(format!(
                "unsupported version: {version} (supported: {ENVELOPE_VERSION})"
            )));
        }

        let algorithm_byte = reader.byte("algorithm")?;
        let algorithm = Algorithm::from_u8(algorithm_byte)
            .ok_or_else(|| malformed(format!("unknown algorithm: {algorithm_byte}")))?;

        let key_id_len = usize::from(reader.byte("key id length")?);
        let key_id = std::str::from_utf8(reader.take(key_id_len, "key id")?)
            .map_err(|e| malformed(format!("invalid key id UTF-8: {e}")))?;
        let key_id = KeyId::parse(key_id).map_err(malformed)?;

        let type_byte = reader.byte("value type")?;
        let value_type = ValueType::from_u8(type_byte)
            .ok_or_else(|| malformed(format!("unknown value type: {type_byte:#04x}")))?;

        let nonce_len = usize::from(reader.byte("nonce length")?);
        let nonce = reader.take(nonce_len, "nonce")?.to_vec();

        let header = Self { version, algorithm, key_id, value_type, nonce };
        Ok((header, reader.pos))
    }
}

fn malformed(reason: impl std::fmt::Display) -> Error {
    Error::Decryption(format!("malformed envelope: {reason}"))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self, what: &str) -> Result<u8, Error> {
        let byte = *self.data.get(self.pos).ok_or_else(|| malformed(format!("missing {what}")))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], Error> {
        let end = self.pos + len;
        let bytes =
            self.data.get(self.pos..end).ok_or_else(|| malformed(format!("{what} truncated")))?;
        self.pos = end;
        Ok(bytes)
    }
}
