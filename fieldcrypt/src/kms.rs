//! KMS abstraction for unwrapping data keys fetched from the vault.
//!
//! The core never talks to a KMS over the network. Providers are plugged into
//! the [`Context`](crate::context::Context); a local master key configured in
//! the options installs [`LocalKms`] automatically.

use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;

use crate::error::KmsError;
use crate::key_record::MasterKey;

/// Size of the local master key in bytes.
pub const LOCAL_MASTER_KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const WRAP_AAD: &[u8] = b"fieldcrypt-local-kms";

/// Which KMS a master key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KmsKind {
    /// Local master key from the options.
    Local,
    /// AWS KMS.
    Aws,
}

impl KmsKind {
    /// Returns the kind of KMS that holds `master_key`.
    #[must_use]
    pub const fn of(master_key: &MasterKey) -> Self {
        match master_key {
            MasterKey::Local => Self::Local,
            MasterKey::Aws { .. } => Self::Aws,
        }
    }
}

impl fmt::Display for KmsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Aws => f.write_str("aws"),
        }
    }
}

/// Unwraps data keys protected by a master key.
///
/// Implementations must be thread-safe (`Send + Sync`): one context serves
/// requests on many threads.
pub trait KmsProvider: Send + Sync {
    /// Unwraps (decrypts) a data key wrapped under `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::UnwrapFailed` if the wrapped bytes cannot be
    /// decrypted.
    fn unwrap_key(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError>;
}

/// KMS backed by a locally held 256-bit master key.
///
/// Wrapped format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
pub struct LocalKms {
    master_key: SecretVec<u8>,
}

impl LocalKms {
    /// Creates a local KMS from a 32-byte master key.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::InvalidCredentials` if the key has the wrong length.
    pub fn new(master_key: SecretVec<u8>) -> Result<Self, KmsError> {
        let len = master_key.expose_secret().len();
        if len != LOCAL_MASTER_KEY_SIZE {
            return Err(KmsError::InvalidCredentials(format!(
                "local master key must be {LOCAL_MASTER_KEY_SIZE} bytes, got {len}"
            )));
        }
        Ok(Self { master_key })
    }

    /// Wraps a data key for storage in the vault.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::WrapFailed` if encryption fails.
    pub fn wrap_key(&self, data_key: &[u8]) -> Result<Vec<u8>, KmsError> {
        let cipher = self.cipher().map_err(KmsError::WrapFailed)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let sealed = cipher
            .encrypt(
                &Nonce::from(nonce_bytes),
                chacha20poly1305::aead::Payload { msg: data_key, aad: WRAP_AAD },
            )
            .map_err(|e| KmsError::WrapFailed(e.to_string()))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + sealed.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, String> {
        ChaCha20Poly1305::new_from_slice(self.master_key.expose_secret())
            .map_err(|e| format!("invalid master key: {e}"))
    }
}

impl KmsProvider for LocalKms {
    fn unwrap_key(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError> {
        if *master_key != MasterKey::Local {
            return Err(KmsError::UnwrapFailed(format!(
                "local KMS cannot unwrap keys held by '{}'",
                master_key.provider()
            )));
        }
        if wrapped.len() < NONCE_SIZE {
            return Err(KmsError::UnwrapFailed("wrapped key too short".to_string()));
        }

        let cipher = self.cipher().map_err(KmsError::UnwrapFailed)?;
        let (nonce_bytes, sealed) = wrapped.split_at(NONCE_SIZE);

        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                chacha20poly1305::aead::Payload { msg: sealed, aad: WRAP_AAD },
            )
            .map(SecretVec::new)
            .map_err(|_| KmsError::UnwrapFailed("authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_kms() -> LocalKms {
        LocalKms::new(SecretVec::new(vec![0x11; LOCAL_MASTER_KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let kms = local_kms();
        let wrapped = kms.wrap_key(&[7u8; 32]).unwrap();

        assert_ne!(&wrapped[NONCE_SIZE..NONCE_SIZE + 32], &[7u8; 32]);
        let unwrapped = kms.unwrap_key(&MasterKey::Local, &wrapped).unwrap();
        assert_eq!(unwrapped.expose_secret(), &vec![7u8; 32]);
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let wrapped = local_kms().wrap_key(&[7u8; 32]).unwrap();
        let other = LocalKms::new(SecretVec::new(vec![0x22; LOCAL_MASTER_KEY_SIZE])).unwrap();

        assert!(matches!(
            other.unwrap_key(&MasterKey::Local, &wrapped),
            Err(KmsError::UnwrapFailed(_))
        ));
    }

    #[test]
    fn test_aws_master_key_rejected() {
        let kms = local_kms();
        let wrapped = kms.wrap_key(&[7u8; 32]).unwrap();
        let aws = MasterKey::Aws { region: "us-east-1".into(), key: "k".into() };

        assert!(kms.unwrap_key(&aws, &wrapped).is_err());
    }

    #[test]
    fn test_invalid_master_key_length() {
        let result = LocalKms::new(SecretVec::new(vec![0u8; 16]));
        assert!(matches!(result, Err(KmsError::InvalidCredentials(_))));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(KmsKind::of(&MasterKey::Local).to_string(), "local");
        assert_eq!(KmsKind::Aws.to_string(), "aws");
    }
}
