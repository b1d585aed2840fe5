//! HKDF-SHA256 key derivation.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::types::AES_KEY_LENGTH;

/// Derive a 256-bit key using HKDF-SHA256.
///
/// # Arguments
/// * `ikm` - Input keying material (an ECDH shared secret here)
/// * `salt` - Per-envelope salt; an empty salt falls back to the RFC 5869 default
/// * `info` - Context label for domain separation
pub fn hkdf_derive(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; AES_KEY_LENGTH]>, CryptoError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    hk.expand(info, okm.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}
