//! Per-store Content Encryption Key (CEK) primitives.
//!
//! Each store gets one random 256-bit CEK. The CEK is wrapped (encrypted)
//! under the KEK with AES-256-GCM and persisted by the caller as
//! `{iv, ciphertext}`; the plaintext CEK only ever lives in engine memory.

use zeroize::Zeroizing;

use crate::aes_gcm::{decrypt_detached, encrypt_detached, generate_key};
use crate::error::CryptoError;
use crate::types::{WrappedCekBlob, AES_KEY_LENGTH, CEK_WRAP_AAD};

/// A plaintext CEK. Zeroized on drop.
pub type Cek = Zeroizing<[u8; AES_KEY_LENGTH]>;

/// Generate a random 256-bit Content Encryption Key.
pub fn generate_cek() -> Result<Cek, CryptoError> {
    generate_key()
}

/// Wrap a CEK under a KEK.
pub fn wrap_cek(cek: &[u8], kek: &[u8]) -> Result<WrappedCekBlob, CryptoError> {
    if cek.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: cek.len(),
        });
    }
    let (iv, ciphertext) = encrypt_detached(kek, cek, CEK_WRAP_AAD)?;
    Ok(WrappedCekBlob {
        iv: iv.to_vec(),
        ciphertext,
    })
}

/// Unwrap a CEK blob under a KEK.
pub fn unwrap_cek(blob: &WrappedCekBlob, kek: &[u8]) -> Result<Cek, CryptoError> {
    let plaintext = decrypt_detached(kek, &blob.iv, &blob.ciphertext, CEK_WRAP_AAD)?;
    if plaintext.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: plaintext.len(),
        });
    }
    let mut cek = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    cek.copy_from_slice(&plaintext);
    Ok(cek)
}

/// Move a CEK blob from one KEK to another.
///
/// Nothing is returned unless both the unwrap and the re-wrap succeed.
pub fn rewrap_cek(
    blob: &WrappedCekBlob,
    current_kek: &[u8],
    new_kek: &[u8],
) -> Result<WrappedCekBlob, CryptoError> {
    let cek = unwrap_cek(blob, current_kek)?;
    wrap_cek(cek.as_ref(), new_kek)
}
