//! P-256 ECDH key agreement.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Parse a SEC1-encoded P-256 public key (compressed or uncompressed).
pub fn parse_public_key(raw: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_sec1_bytes(raw).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Encode a public key as an uncompressed SEC1 point (65 bytes).
pub fn encode_public_key(public: &PublicKey) -> Vec<u8> {
    public.to_encoded_point(false).as_bytes().to_vec()
}

/// Compute the raw ECDH shared secret (x-coordinate, 32 bytes).
pub fn shared_secret(
    secret: &SecretKey,
    peer_public_raw: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let peer = parse_public_key(peer_public_raw)?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::elliptic_curve::rand_core::OsRng;

    #[test]
    fn both_sides_agree() {
        let alice = SecretKey::random(&mut OsRng);
        let bob = SecretKey::random(&mut OsRng);
        let alice_pub = encode_public_key(&alice.public_key());
        let bob_pub = encode_public_key(&bob.public_key());

        let ab = shared_secret(&alice, &bob_pub).unwrap();
        let ba = shared_secret(&bob, &alice_pub).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn public_key_is_uncompressed() {
        let key = SecretKey::random(&mut OsRng);
        let raw = encode_public_key(&key.public_key());
        assert_eq!(raw.len(), 65);
        assert_eq!(raw[0], 0x04);
    }

    #[test]
    fn rejects_point_off_curve() {
        let key = SecretKey::random(&mut OsRng);
        let mut bogus = vec![0x04];
        bogus.extend_from_slice(&[0x11; 64]);
        assert!(shared_secret(&key, &bogus).is_err());
        assert!(shared_secret(&key, &[]).is_err());
    }
}
