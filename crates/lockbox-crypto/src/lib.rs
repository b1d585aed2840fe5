//! Cryptographic primitives for the lockbox key hierarchy.
//!
//! - `aes_gcm`: AES-256-GCM with detached IVs
//! - `hkdf`: HKDF-SHA256
//! - `ecdh`: P-256 key agreement
//! - `identity`: device keypair, JWK backup form
//! - `kek`: wrapped-KEK envelopes (ECDH → HKDF → AES-GCM)
//! - `cek`: per-store CEK generation and wrapping
//! - `row`: row envelopes with `(store, record id)` AAD

pub mod aes_gcm;
pub mod base64url;
pub mod cek;
pub mod ecdh;
pub mod error;
pub mod hkdf;
pub mod identity;
pub mod kek;
pub mod row;
pub mod types;

pub use base64url::{base64url_decode, base64url_encode};
pub use cek::{generate_cek, rewrap_cek, unwrap_cek, wrap_cek, Cek};
pub use error::CryptoError;
pub use hkdf::hkdf_derive;
pub use identity::{DeviceKeyPair, DevicePrivateJwk, ExportedDeviceKeys};
pub use kek::{kek_from_bytes, open_kek_envelope, seal_kek_for_device, Kek};
pub use row::{build_row_aad, decrypt_row, encrypt_row};
pub use types::{
    EncryptedRow, RecordId, RowEnvelope, SecretBytes, WrappedCekBlob, WrappedKekEnvelope,
    AES_GCM_IV_LENGTH, AES_KEY_LENGTH, DEFAULT_KEK_WRAP_INFO, KEK_ENVELOPE_ALG,
    P256_PUBLIC_KEY_LENGTH,
};
