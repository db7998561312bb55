//! Key identifiers and references to keys from document fields.

use std::fmt;

/// Maximum encoded length of a key identifier (it is length-prefixed with one byte).
pub const MAX_KEY_ID_LEN: usize = 255;

/// A validated data key identifier.
///
/// Identifiers are non-empty UTF-8 strings of at most [`MAX_KEY_ID_LEN`] bytes
/// without control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    /// Parses and validates a key identifier.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the identifier is empty, too
    /// long, or contains control characters.
    pub fn parse(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.is_empty() {
            return Err("key id is empty".to_string());
        }
        if id.len() > MAX_KEY_ID_LEN {
            return Err(format!("key id too long: {} bytes (max: {MAX_KEY_ID_LEN})", id.len()));
        }
        if id.chars().any(char::is_control) {
            return Err("key id contains control characters".to_string());
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a document field names the key it needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyReference {
    /// Key addressed by identifier.
    Id(KeyId),
    /// Key addressed by one of its alternate names.
    AltName(String),
}

impl KeyReference {
    /// Builds an identifier reference, validating the id.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the id is invalid.
    pub fn id(id: impl Into<String>) -> Result<Self, String> {
        KeyId::parse(id).map(Self::Id)
    }

    /// Builds an alternate-name reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty.
    pub fn alt_name(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty() {
            return Err("key alt name is empty".to_string());
        }
        Ok(Self::AltName(name))
    }
}

impl fmt::Display for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::AltName(name) => write!(f, "altname:{name}"),
        }
    }
}
