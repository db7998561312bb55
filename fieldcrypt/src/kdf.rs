//! Sub-key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! A data key from the vault is never used directly. Two independent 256-bit
//! sub-keys are expanded from it with HKDF-SHA256:
//! - the AEAD key that encrypts field values
//! - the synthetic-IV key that derives deterministic nonces

use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

/// Minimum length of data key material accepted from the vault.
pub const MIN_KEY_MATERIAL_LEN: usize = 32;

/// Size of each derived sub-key in bytes.
pub const SUBKEY_SIZE: usize = 32;

const SALT: &[u8] = b"fieldcrypt/v1";
const AEAD_INFO: &[u8] = b"field-aead";
const IV_INFO: &[u8] = b"field-synthetic-iv";

/// Sub-keys derived from one data key.
pub struct FieldKeys {
    aead_key: SecretVec<u8>,
    iv_key: SecretVec<u8>,
}

impl FieldKeys {
    /// Key for ChaCha20-Poly1305.
    #[must_use]
    pub fn aead_key(&self) -> &SecretVec<u8> {
        &self.aead_key
    }

    /// Key for the deterministic nonce HMAC.
    #[must_use]
    pub fn iv_key(&self) -> &SecretVec<u8> {
        &self.iv_key
    }
}

/// Derives the field sub-keys from raw data key material.
///
/// # Errors
///
/// Returns a description of the problem if the material is shorter than
/// [`MIN_KEY_MATERIAL_LEN`].
pub fn derive_field_keys(material: &SecretVec<u8>) -> Result<FieldKeys, String> {
    let ikm = material.expose_secret();
    if ikm.is_empty() {
        return Err("key material is empty".to_string());
    }
    if ikm.len() < MIN_KEY_MATERIAL_LEN {
        return Err(format!(
            "key material too short: {} bytes (min: {MIN_KEY_MATERIAL_LEN})",
            ikm.len()
        ));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(SALT), ikm);
    Ok(FieldKeys { aead_key: expand(&hkdf, AEAD_INFO)?, iv_key: expand(&hkdf, IV_INFO)? })
}

fn expand(hkdf: &Hkdf<Sha256>, info: &[u8]) -> Result<SecretVec<u8>, String> {
    let mut okm = vec![0u8; SUBKEY_SIZE];
    hkdf.expand(info, &mut okm).map_err(|e| format!("HKDF expand failed: {e}"))?;
    Ok(SecretVec::new(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let material = SecretVec::new(vec![1u8; 32]);

        let a = derive_field_keys(&material).unwrap();
        let b = derive_field_keys(&material).unwrap();

        assert_eq!(a.aead_key().expose_secret(), b.aead_key().expose_secret());
        assert_eq!(a.iv_key().expose_secret(), b.iv_key().expose_secret());
    }

    #[test]
    fn test_sub_keys_are_independent() {
        let keys = derive_field_keys(&SecretVec::new(vec![7u8; 32])).unwrap();

        assert_ne!(keys.aead_key().expose_secret(), keys.iv_key().expose_secret());
        assert_eq!(keys.aead_key().expose_secret().len(), SUBKEY_SIZE);
    }

    #[test]
    fn test_different_material_different_keys() {
        let a = derive_field_keys(&SecretVec::new(vec![1u8; 32])).unwrap();
        let b = derive_field_keys(&SecretVec::new(vec![2u8; 32])).unwrap();

        assert_ne!(a.aead_key().expose_secret(), b.aead_key().expose_secret());
    }

    #[test]
    fn test_longer_material_accepted() {
        assert!(derive_field_keys(&SecretVec::new(vec![3u8; 96])).is_ok());
    }

    #[test]
    fn test_short_material_rejected() {
        assert!(derive_field_keys(&SecretVec::new(vec![3u8; 16])).is_err());
        assert!(derive_field_keys(&SecretVec::new(Vec::new())).is_err());
    }

    // RFC 5869 Test Case 1 (HKDF-SHA256)
    #[test]
    fn test_hkdf_rfc5869_test_case_1() {
        let ikm = hex::decode("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").unwrap();
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();
        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865",
        )
        .unwrap();

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut okm = vec![0u8; 42];
        hkdf.expand(&info, &mut okm).unwrap();

        assert_eq!(okm, expected);
    }
}
