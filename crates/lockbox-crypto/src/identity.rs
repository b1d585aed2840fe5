//! Device identity: a long-lived P-256 keypair used for KEK key agreement.
//!
//! The private half leaves this module only as a JWK (`{kty, crv, x, y, d}`)
//! for explicit backup; the public half is exposed as an uncompressed SEC1
//! point so servers can address wrapped-KEK envelopes to the device.

use std::fmt;

use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::base64url::{base64url_decode, base64url_encode};
use crate::ecdh::{encode_public_key, parse_public_key};
use crate::error::CryptoError;

const JWK_KTY: &str = "EC";
const JWK_CRV: &str = "P-256";
const COORDINATE_LENGTH: usize = 32;

/// P-256 private key in JWK form. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DevicePrivateJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub d: String,
}

impl fmt::Debug for DevicePrivateJwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePrivateJwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("d", &"[REDACTED]")
            .finish()
    }
}

/// Backup form of a device keypair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedDeviceKeys {
    pub private_key_repr: DevicePrivateJwk,
    #[serde(with = "crate::base64url::bytes")]
    pub public_key_raw_bytes: Vec<u8>,
}

/// The device's key-agreement keypair.
pub struct DeviceKeyPair {
    secret: SecretKey,
    public_raw: Vec<u8>,
}

impl DeviceKeyPair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public_raw = encode_public_key(&secret.public_key());
        Self { secret, public_raw }
    }

    /// Rebuild a keypair from backup material.
    ///
    /// Fails if the JWK is malformed, names another curve, or if either the
    /// JWK coordinates or `public_raw` do not belong to `d`.
    pub fn import(private_jwk: &DevicePrivateJwk, public_raw: &[u8]) -> Result<Self, CryptoError> {
        if private_jwk.kty != JWK_KTY {
            return Err(CryptoError::InvalidJwk(format!("kty: {}", private_jwk.kty)));
        }
        if private_jwk.crv != JWK_CRV {
            return Err(CryptoError::InvalidJwk(format!("crv: {}", private_jwk.crv)));
        }
        if private_jwk.d.is_empty() {
            return Err(CryptoError::MissingJwkField("d"));
        }

        let d = Zeroizing::new(
            base64url_decode(&private_jwk.d)
                .map_err(|e| CryptoError::InvalidJwk(format!("d: {}", e)))?,
        );
        let secret = SecretKey::from_slice(&d)
            .map_err(|e| CryptoError::InvalidJwk(format!("P-256 scalar: {}", e)))?;
        let derived = secret.public_key();

        let supplied = parse_public_key(public_raw)?;
        if supplied != derived {
            return Err(CryptoError::KeyMismatch);
        }

        let point = derived.to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(CryptoError::InvalidPublicKey("identity point".to_string())),
        };
        if !coordinate_matches(&private_jwk.x, x.as_slice(), "x")?
            || !coordinate_matches(&private_jwk.y, y.as_slice(), "y")?
        {
            return Err(CryptoError::KeyMismatch);
        }

        Ok(Self::from_secret(secret))
    }

    /// Serialize for backup. The caller owns the returned secret material.
    pub fn export(&self) -> Result<ExportedDeviceKeys, CryptoError> {
        let point = self.secret.public_key().to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(CryptoError::InvalidPublicKey("identity point".to_string())),
        };
        let scalar = Zeroizing::new(self.secret.to_bytes().to_vec());

        Ok(ExportedDeviceKeys {
            private_key_repr: DevicePrivateJwk {
                kty: JWK_KTY.to_string(),
                crv: JWK_CRV.to_string(),
                x: base64url_encode(x.as_slice()),
                y: base64url_encode(y.as_slice()),
                d: base64url_encode(&scalar),
            },
            public_key_raw_bytes: self.public_raw.clone(),
        })
    }

    /// Uncompressed SEC1 public key (65 bytes).
    pub fn public_key_raw(&self) -> &[u8] {
        &self.public_raw
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeyPair")
            .field("public_raw_len", &self.public_raw.len())
            .finish_non_exhaustive()
    }
}

/// Compare a base64url JWK coordinate with the derived one.
/// JWKs may drop leading zero bytes, so shorter values are left-padded.
fn coordinate_matches(encoded: &str, expected: &[u8], name: &str) -> Result<bool, CryptoError> {
    let decoded =
        base64url_decode(encoded).map_err(|e| CryptoError::InvalidJwk(format!("{}: {}", name, e)))?;
    if decoded.is_empty() || decoded.len() > COORDINATE_LENGTH {
        return Err(CryptoError::InvalidJwk(format!("{}: bad length", name)));
    }
    let mut padded = [0u8; COORDINATE_LENGTH];
    padded[COORDINATE_LENGTH - decoded.len()..].copy_from_slice(&decoded);
    Ok(padded.as_slice() == expected)
}
