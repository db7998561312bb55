//! Per-field authenticated encryption.
//!
//! Every field value is serialized, then sealed with ChaCha20-Poly1305 under
//! the data key's derived AEAD key. The envelope header is the associated
//! data, so algorithm, key id and value type cannot be swapped.
//!
//! # Nonces
//!
//! - **Random**: 96 bits from the OS RNG per call
//! - **Deterministic**: `HMAC-SHA256(iv_key, header prefix || plaintext)[..12]`,
//!   so the same value under the same key always yields the same envelope.
//!   Decryption recomputes it and rejects envelopes whose nonce does not match.
//!
//! Deterministic encryption reveals equality patterns; schemas should use it
//! only for fields that are queried by equality.

use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde_json::Value;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::envelope::{EnvelopeHeader, ValueType, NONCE_SIZE, TAG_SIZE};
use crate::error::Error;
use crate::key_cache::{DataKey, KeyLookup};
use crate::key_id::KeyId;
use crate::schema::Algorithm;

type HmacSha256 = Hmac<Sha256>;

/// Encrypts one field value into an envelope.
///
/// # Errors
///
/// Returns `Error::Encryption` if serialization or sealing fails.
pub fn encrypt_field(value: &Value, key: &DataKey, algorithm: Algorithm) -> Result<Vec<u8>, Error> {
    let value_type = ValueType::of(value);
    let plaintext = Zeroizing::new(
        serde_json::to_vec(value).map_err(|e| Error::Encryption(format!("serialize value: {e}")))?,
    );

    let nonce = match algorithm {
        Algorithm::Deterministic => {
            let prefix = EnvelopeHeader::new(algorithm, key.id().clone(), value_type, Vec::new())
                .prefix_bytes();
            synthetic_nonce(key, &prefix, &plaintext).map_err(Error::Encryption)?
        }
        Algorithm::Random => {
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            nonce
        }
    };

    let header = EnvelopeHeader::new(algorithm, key.id().clone(), value_type, nonce.to_vec());
    let header_bytes = header.to_bytes()?;

    let ciphertext = cipher(key)
        .map_err(Error::Encryption)?
        .encrypt(&Nonce::from(nonce), Payload { msg: &plaintext, aad: &header_bytes })
        .map_err(|e| Error::Encryption(format!("ChaCha20-Poly1305 encryption failed: {e}")))?;

    let mut envelope = Vec::with_capacity(header_bytes.len() + ciphertext.len());
    envelope.extend_from_slice(&header_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Decrypts an envelope, finding its key through `keys`.
///
/// # Errors
///
/// Returns `Error::Decryption` if:
/// - The envelope is malformed
/// - Its key is not available in `keys`
/// - Authentication fails
/// - A deterministic envelope carries the wrong nonce
pub fn decrypt_field(envelope: &[u8], keys: &impl KeyLookup) -> Result<Value, Error> {
    let (header, header_len) = EnvelopeHeader::from_bytes(envelope)?;
    let (aad, sealed) = envelope.split_at(header_len);

    let nonce: [u8; NONCE_SIZE] = header
        .nonce()
        .try_into()
        .map_err(|_| Error::Decryption("invalid nonce size".to_string()))?;
    if sealed.len() < TAG_SIZE {
        return Err(Error::Decryption("ciphertext too short".to_string()));
    }

    let key = keys
        .find(header.key_id())
        .ok_or_else(|| Error::Decryption(format!("key '{}' is not resolved", header.key_id())))?;

    let plaintext = Zeroizing::new(
        cipher(&key)
            .map_err(Error::Decryption)?
            .decrypt(&Nonce::from(nonce), Payload { msg: sealed, aad })
            .map_err(|_| {
                Error::Decryption(
                    "authentication failed: ciphertext may be corrupted or tampered".to_string(),
                )
            })?,
    );

    if header.algorithm() == Algorithm::Deterministic {
        let expected =
            synthetic_nonce(&key, &header.prefix_bytes(), &plaintext).map_err(Error::Decryption)?;
        if expected != nonce {
            return Err(Error::Decryption("deterministic nonce mismatch".to_string()));
        }
    }

    let value: Value = serde_json::from_slice(&plaintext)
        .map_err(|e| Error::Decryption(format!("decrypted value is not valid: {e}")))?;
    if ValueType::of(&value) != header.value_type() {
        return Err(Error::Decryption(
            "decrypted value does not match its declared type".to_string(),
        ));
    }
    Ok(value)
}

/// Reads the key id from an envelope without decrypting it.
///
/// # Errors
///
/// Returns `Error::Decryption` if the envelope header is malformed.
pub fn envelope_key_id(envelope: &[u8]) -> Result<KeyId, Error> {
    EnvelopeHeader::from_bytes(envelope).map(|(header, _)| header.key_id().clone())
}

fn cipher(key: &DataKey) -> Result<ChaCha20Poly1305, String> {
    ChaCha20Poly1305::new_from_slice(key.field_keys().aead_key().expose_secret())
        .map_err(|e| format!("invalid data key: {e}"))
}

fn synthetic_nonce(
    key: &DataKey,
    prefix: &[u8],
    plaintext: &[u8],
) -> Result<[u8; NONCE_SIZE], String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.field_keys().iv_key().expose_secret())
        .map_err(|e| format!("invalid IV key: {e}"))?;
    mac.update(prefix);
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    Ok(nonce)
}
