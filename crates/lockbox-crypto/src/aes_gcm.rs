//! AES-256-GCM with detached IVs.
//!
//! Every envelope in this crate stores the IV next to the ciphertext rather
//! than prefixing it, so both helpers take and return the IV separately.
//! Ciphertext always carries the 16-byte tag at its end.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::types::{AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH};

/// Fill a fixed-size buffer from the OS RNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(buf)
}

/// Generate a random 12-byte IV for AES-GCM.
pub fn generate_iv() -> Result<[u8; AES_GCM_IV_LENGTH], CryptoError> {
    random_bytes::<AES_GCM_IV_LENGTH>()
}

/// Generate a random 256-bit symmetric key.
pub fn generate_key() -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, CryptoError> {
    random_bytes::<AES_KEY_LENGTH>().map(Zeroizing::new)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: key.len(),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Encrypt under a fresh random IV.
///
/// Returns `(iv, ciphertext || tag)`.
pub fn encrypt_detached(
    key: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; AES_GCM_IV_LENGTH], Vec<u8>), CryptoError> {
    let cipher = cipher_for(key)?;
    let iv = generate_iv()?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok((iv, ciphertext))
}

/// Decrypt `ciphertext || tag` with the given IV and AAD.
///
/// The IV length is checked before it reaches the cipher; a wrong-length IV
/// is reported like any other authentication failure.
pub fn decrypt_detached(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher_for(key)?;
    if iv.len() != AES_GCM_IV_LENGTH {
        return Err(CryptoError::InvalidIvLength {
            expected: AES_GCM_IV_LENGTH,
            got: iv.len(),
        });
    }
    if ciphertext.len() < AES_GCM_TAG_LENGTH {
        return Err(CryptoError::DataTooShort);
    }

    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; 32] {
        random_bytes::<32>().unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = random_key();
        let (iv, ct) = encrypt_detached(&key, b"hello", b"aad").unwrap();
        let pt = decrypt_detached(&key, &iv, &ct, b"aad").unwrap();
        assert_eq!(pt.as_slice(), b"hello");
    }

    #[test]
    fn ciphertext_carries_tag() {
        let key = random_key();
        let (_, ct) = encrypt_detached(&key, b"", b"").unwrap();
        assert_eq!(ct.len(), AES_GCM_TAG_LENGTH);
    }

    #[test]
    fn fresh_iv_per_call() {
        let key = random_key();
        let (iv1, ct1) = encrypt_detached(&key, b"same", b"").unwrap();
        let (iv2, ct2) = encrypt_detached(&key, b"same", b"").unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn wrong_key_fails() {
        let (iv, ct) = encrypt_detached(&random_key(), b"secret", b"").unwrap();
        assert!(decrypt_detached(&random_key(), &iv, &ct, b"").is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let key = random_key();
        let (iv, ct) = encrypt_detached(&key, b"secret", b"a").unwrap();
        assert!(decrypt_detached(&key, &iv, &ct, b"b").is_err());
    }

    #[test]
    fn rejects_bad_iv_length_without_panicking() {
        let key = random_key();
        let (_, ct) = encrypt_detached(&key, b"secret", b"").unwrap();
        assert!(matches!(
            decrypt_detached(&key, &[0u8; 11], &ct, b""),
            Err(CryptoError::InvalidIvLength { .. })
        ));
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let key = random_key();
        assert!(matches!(
            decrypt_detached(&key, &[0u8; 12], &[0u8; 15], b""),
            Err(CryptoError::DataTooShort)
        ));
    }

    #[test]
    fn rejects_short_key() {
        assert!(matches!(
            encrypt_detached(&[0u8; 16], b"x", b""),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: 16
            })
        ));
    }
}
