//! Row envelopes: JSON records encrypted under a store's CEK.
//!
//! AAD format: [4 bytes: store length (u32 BE)][store UTF-8][record id UTF-8]
//! The AAD is stored in the envelope so a row can be decrypted knowing only
//! its store; the store prefix is checked before the cipher runs and the
//! whole AAD is authenticated by the tag.

use serde_json::Value;
use zeroize::Zeroizing;

use crate::aes_gcm::{decrypt_detached, encrypt_detached};
use crate::error::CryptoError;
use crate::types::{EncryptedRow, RecordId, RowEnvelope};

const STORE_LENGTH_PREFIX: usize = 4;

/// Build the canonical AAD binding a row to `(store, record_id)`.
pub fn build_row_aad(store: &str, record_id: &RecordId) -> Vec<u8> {
    let store_bytes = store.as_bytes();
    let record_bytes = record_id.as_str().as_bytes();
    let mut aad = Vec::with_capacity(STORE_LENGTH_PREFIX + store_bytes.len() + record_bytes.len());
    aad.extend_from_slice(&(store_bytes.len() as u32).to_be_bytes());
    aad.extend_from_slice(store_bytes);
    aad.extend_from_slice(record_bytes);
    aad
}

/// Check that `aad` names `store` and return the record id part.
fn record_part<'a>(aad: &'a [u8], store: &str) -> Result<&'a [u8], CryptoError> {
    if aad.len() < STORE_LENGTH_PREFIX {
        return Err(CryptoError::MalformedAad);
    }
    let mut prefix = [0u8; STORE_LENGTH_PREFIX];
    prefix.copy_from_slice(&aad[..STORE_LENGTH_PREFIX]);
    let store_len = u32::from_be_bytes(prefix) as usize;

    let rest = &aad[STORE_LENGTH_PREFIX..];
    if rest.len() < store_len {
        return Err(CryptoError::MalformedAad);
    }
    if &rest[..store_len] != store.as_bytes() {
        return Err(CryptoError::AadMismatch(store.to_string()));
    }
    Ok(&rest[store_len..])
}

/// Serialize and encrypt one row.
pub fn encrypt_row(
    cek: &[u8],
    store: &str,
    record_id: &RecordId,
    row: &Value,
) -> Result<RowEnvelope, CryptoError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(row)?);
    let aad = build_row_aad(store, record_id);
    let (iv, ciphertext) = encrypt_detached(cek, &plaintext, &aad)?;
    Ok(RowEnvelope {
        enc: EncryptedRow {
            iv: iv.to_vec(),
            ciphertext,
            aad,
        },
    })
}

/// Authenticate, decrypt, and deserialize one row.
///
/// The envelope's AAD must name `store`; with `expected_id` it must equal
/// the canonical AAD for that record exactly.
pub fn decrypt_row(
    cek: &[u8],
    store: &str,
    expected_id: Option<&RecordId>,
    envelope: &RowEnvelope,
) -> Result<Value, CryptoError> {
    let enc = &envelope.enc;
    let record = record_part(&enc.aad, store)?;
    if let Some(id) = expected_id {
        if record != id.as_str().as_bytes() {
            return Err(CryptoError::AadMismatch(store.to_string()));
        }
    }

    let plaintext = decrypt_detached(cek, &enc.iv, &enc.ciphertext, &enc.aad)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aes_gcm::random_bytes;
    use serde_json::json;

    fn random_key() -> [u8; 32] {
        random_bytes::<32>().unwrap()
    }

    #[test]
    fn aad_format() {
        let aad = build_row_aad("tasks", &RecordId::from(1u64));
        assert_eq!(&aad[..4], &[0, 0, 0, 5]);
        assert_eq!(&aad[4..9], b"tasks");
        assert_eq!(&aad[9..], b"1");
    }

    #[test]
    fn length_prefix_separates_store_from_id() {
        let a = build_row_aad("ab", &RecordId::from("c"));
        let b = build_row_aad("a", &RecordId::from("bc"));
        assert_ne!(a, b);
    }

    #[test]
    fn row_round_trip() {
        let cek = random_key();
        let row = json!({"name": "x", "done": false, "tags": [1, 2]});
        let envelope = encrypt_row(&cek, "tasks", &RecordId::from(1u64), &row).unwrap();
        assert_eq!(decrypt_row(&cek, "tasks", None, &envelope).unwrap(), row);
        assert_eq!(
            decrypt_row(&cek, "tasks", Some(&RecordId::from("1")), &envelope).unwrap(),
            row
        );
    }

    #[test]
    fn wrong_store_fails() {
        let cek = random_key();
        let envelope = encrypt_row(&cek, "tasks", &RecordId::from("r1"), &json!(1)).unwrap();
        assert!(matches!(
            decrypt_row(&cek, "notes", None, &envelope),
            Err(CryptoError::AadMismatch(_))
        ));
    }

    #[test]
    fn wrong_expected_id_fails() {
        let cek = random_key();
        let envelope = encrypt_row(&cek, "tasks", &RecordId::from("r1"), &json!(1)).unwrap();
        assert!(decrypt_row(&cek, "tasks", Some(&RecordId::from("r2")), &envelope).is_err());
    }

    #[test]
    fn relocated_aad_fails_authentication() {
        let cek = random_key();
        let mut envelope = encrypt_row(&cek, "tasks", &RecordId::from("r1"), &json!(1)).unwrap();
        envelope.enc.aad = build_row_aad("tasks", &RecordId::from("r2"));
        assert!(matches!(
            decrypt_row(&cek, "tasks", None, &envelope),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let cek = random_key();
        let envelope =
            encrypt_row(&cek, "tasks", &RecordId::from(7u64), &json!({"name": "x"})).unwrap();

        let fields: [fn(&mut RowEnvelope) -> &mut Vec<u8>; 3] = [
            |e| &mut e.enc.ciphertext,
            |e| &mut e.enc.iv,
            |e| &mut e.enc.aad,
        ];
        for field in fields {
            let len = field(&mut envelope.clone()).len();
            for byte in 0..len {
                for bit in 0..8 {
                    let mut tampered = envelope.clone();
                    field(&mut tampered)[byte] ^= 1 << bit;
                    assert!(decrypt_row(&cek, "tasks", None, &tampered).is_err());
                }
            }
        }
    }

    #[test]
    fn truncated_aad_is_malformed() {
        let cek = random_key();
        let mut envelope = encrypt_row(&cek, "tasks", &RecordId::from("r"), &json!(1)).unwrap();
        envelope.enc.aad.truncate(2);
        assert!(matches!(
            decrypt_row(&cek, "tasks", None, &envelope),
            Err(CryptoError::MalformedAad)
        ));
    }
}
