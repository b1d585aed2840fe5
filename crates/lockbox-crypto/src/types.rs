use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-GCM IV length in bytes (96 bits per NIST recommendation).
pub const AES_GCM_IV_LENGTH: usize = 12;

/// AES-GCM tag length in bytes (128 bits).
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// AES key length in bytes (256 bits). Applies to both KEKs and CEKs.
pub const AES_KEY_LENGTH: usize = 32;

/// Uncompressed SEC1 P-256 point: 0x04 || x(32) || y(32).
pub const P256_PUBLIC_KEY_LENGTH: usize = 65;

/// Algorithm identifier carried by every wrapped-KEK envelope.
pub const KEK_ENVELOPE_ALG: &str = "P-256+A256GCM";

/// Default HKDF info label for the KEK wrapping key.
pub const DEFAULT_KEK_WRAP_INFO: &[u8] = b"lockbox/kek-wrap/v1";

/// Salt length used when sealing a KEK envelope.
pub const KEK_SALT_LENGTH: usize = 32;

/// AAD bound to every wrapped CEK blob.
pub const CEK_WRAP_AAD: &[u8] = b"lockbox/cek/v1";

/// Secret byte buffer: zeroized on drop, redacted in `Debug`.
///
/// Serializes as base64url so it can cross the engine boundary inside a
/// request (raw KEKs travel this way).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for SecretBytes {
    fn from(bytes: [u8; N]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

impl Serialize for SecretBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        crate::base64url::bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        crate::base64url::bytes::deserialize(deserializer).map(Self)
    }
}

/// Identifier of a record inside a store.
///
/// Always canonicalised to its string form; numeric ids use their decimal
/// representation, so `1` and `"1"` address the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

macro_rules! record_id_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for RecordId {
            fn from(id: $t) -> Self {
                Self(id.to_string())
            }
        })*
    };
}

record_id_from_int!(u32, u64, i32, i64, usize);

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireId {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match WireId::deserialize(deserializer)? {
            WireId::Text(s) => RecordId(s),
            WireId::Unsigned(n) => RecordId(n.to_string()),
            WireId::Signed(n) => RecordId(n.to_string()),
        })
    }
}

/// KEK ciphertext addressed to this device.
///
/// Produced by ECDH(device key, ephemeral key) → HKDF(shared, salt) →
/// AES-256-GCM(KEK). Superseded on rotation, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKekEnvelope {
    pub alg: String,
    #[serde(with = "crate::base64url::bytes")]
    pub ephemeral_public_key: Vec<u8>,
    #[serde(with = "crate::base64url::bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "crate::base64url::bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::base64url::bytes")]
    pub salt: Vec<u8>,
}

/// A store's CEK encrypted under the current KEK. Persisted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedCekBlob {
    #[serde(with = "crate::base64url::bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "crate::base64url::bytes")]
    pub ciphertext: Vec<u8>,
}

/// Encrypted record as persisted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowEnvelope {
    pub enc: EncryptedRow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRow {
    #[serde(with = "crate::base64url::bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "crate::base64url::bytes")]
    pub ciphertext: Vec<u8>,
    /// Canonical `(store, record id)` binding, see [`crate::row::build_row_aad`].
    #[serde(with = "crate::base64url::bytes")]
    pub aad: Vec<u8>,
}
