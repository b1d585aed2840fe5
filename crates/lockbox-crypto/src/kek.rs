//! Wrapped-KEK envelopes addressed to a device keypair.
//!
//! Seal (server side):
//!   ephemeral P-256 key → ECDH(ephemeral, device public) → HKDF(shared, salt, info)
//!   → AES-256-GCM(KEK)
//! Open (engine side) runs the same agreement with the device private key and
//! the envelope's ephemeral public key. The `alg` string is authenticated as
//! AAD so an envelope cannot be replayed under another algorithm label.

use p256::elliptic_curve::rand_core::OsRng;
use p256::SecretKey;
use zeroize::Zeroizing;

use crate::aes_gcm::{decrypt_detached, encrypt_detached, random_bytes};
use crate::ecdh::{encode_public_key, shared_secret};
use crate::error::CryptoError;
use crate::hkdf::hkdf_derive;
use crate::identity::DeviceKeyPair;
use crate::types::{WrappedKekEnvelope, AES_KEY_LENGTH, KEK_ENVELOPE_ALG, KEK_SALT_LENGTH};

/// A plaintext KEK. Zeroized on drop.
pub type Kek = Zeroizing<[u8; AES_KEY_LENGTH]>;

/// Validate raw KEK bytes and copy them into a zeroizing buffer.
pub fn kek_from_bytes(raw: &[u8]) -> Result<Kek, CryptoError> {
    if raw.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: raw.len(),
        });
    }
    let mut kek = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    kek.copy_from_slice(raw);
    Ok(kek)
}

/// Seal a KEK for the device owning `device_public_raw`.
pub fn seal_kek_for_device(
    kek: &[u8],
    device_public_raw: &[u8],
    info: &[u8],
) -> Result<WrappedKekEnvelope, CryptoError> {
    let kek = kek_from_bytes(kek)?;
    let ephemeral = SecretKey::random(&mut OsRng);
    let shared = shared_secret(&ephemeral, device_public_raw)?;
    let salt = random_bytes::<KEK_SALT_LENGTH>()?;
    let wrapping_key = hkdf_derive(shared.as_ref(), &salt, info)?;

    let (iv, ciphertext) =
        encrypt_detached(wrapping_key.as_ref(), kek.as_ref(), KEK_ENVELOPE_ALG.as_bytes())?;

    Ok(WrappedKekEnvelope {
        alg: KEK_ENVELOPE_ALG.to_string(),
        ephemeral_public_key: encode_public_key(&ephemeral.public_key()),
        iv: iv.to_vec(),
        ciphertext,
        salt: salt.to_vec(),
    })
}

/// Recover the KEK from an envelope with the device keypair.
pub fn open_kek_envelope(
    envelope: &WrappedKekEnvelope,
    device: &DeviceKeyPair,
    info: &[u8],
) -> Result<Kek, CryptoError> {
    if envelope.alg != KEK_ENVELOPE_ALG {
        return Err(CryptoError::UnsupportedAlgorithm(envelope.alg.clone()));
    }
    let shared = shared_secret(device.secret(), &envelope.ephemeral_public_key)?;
    let wrapping_key = hkdf_derive(shared.as_ref(), &envelope.salt, info)?;

    let plaintext = decrypt_detached(
        wrapping_key.as_ref(),
        &envelope.iv,
        &envelope.ciphertext,
        envelope.alg.as_bytes(),
    )?;
    kek_from_bytes(&plaintext)
}
