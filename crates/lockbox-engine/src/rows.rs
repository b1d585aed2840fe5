//! Row encryption against the resident CEK of a store.

use lockbox_crypto::{RecordId, RowEnvelope};
use serde_json::Value;
use tracing::debug;

use crate::error::KeyError;
use crate::keys::KeyHierarchy;

pub fn encrypt(
    keys: &KeyHierarchy,
    store: &str,
    id: &RecordId,
    row: &Value,
) -> Result<RowEnvelope, KeyError> {
    let cek = keys.cek_for(store)?;
    lockbox_crypto::encrypt_row(cek.as_ref(), store, id, row).map_err(|e| {
        debug!(op = "row.encrypt", store, reason = %e, "encryption failed");
        KeyError::Encrypt
    })
}

/// Decrypt a row. With `expected_id`, the envelope must also be bound to
/// that record.
pub fn decrypt(
    keys: &KeyHierarchy,
    store: &str,
    expected_id: Option<&RecordId>,
    envelope: &RowEnvelope,
) -> Result<Value, KeyError> {
    let cek = keys.cek_for(store)?;
    lockbox_crypto::decrypt_row(cek.as_ref(), store, expected_id, envelope).map_err(|e| {
        debug!(op = "row.decrypt", store, reason = %e, "decryption failed");
        KeyError::Decrypt
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn keys_with_store(store: &str) -> KeyHierarchy {
        let keys = KeyHierarchy::new();
        keys.provision_kek(&[3u8; 32]).unwrap();
        keys.ensure_cek(store, None).await.unwrap();
        keys
    }

    #[tokio::test]
    async fn round_trip() {
        let keys = keys_with_store("tasks").await;
        let row = json!({"name": "x", "done": false});
        let envelope = encrypt(&keys, "tasks", &RecordId::from(1u64), &row).unwrap();
        assert_eq!(decrypt(&keys, "tasks", None, &envelope).unwrap(), row);
    }

    #[tokio::test]
    async fn missing_keys_are_reported() {
        let keys = KeyHierarchy::new();
        let id = RecordId::from("r");
        assert_eq!(
            encrypt(&keys, "tasks", &id, &json!(1)).unwrap_err(),
            KeyError::NoKek
        );

        keys.provision_kek(&[3u8; 32]).unwrap();
        assert_eq!(
            encrypt(&keys, "tasks", &id, &json!(1)).unwrap_err(),
            KeyError::NoCek
        );
    }

    #[tokio::test]
    async fn envelope_from_other_store_is_decrypt_error() {
        let keys = keys_with_store("tasks").await;
        keys.ensure_cek("notes", None).await.unwrap();
        let envelope = encrypt(&keys, "tasks", &RecordId::from("r"), &json!(1)).unwrap();
        assert_eq!(
            decrypt(&keys, "notes", None, &envelope).unwrap_err(),
            KeyError::Decrypt
        );
    }

    #[tokio::test]
    async fn expected_id_is_enforced() {
        let keys = keys_with_store("tasks").await;
        let envelope = encrypt(&keys, "tasks", &RecordId::from("r1"), &json!(1)).unwrap();
        assert_eq!(
            decrypt(&keys, "tasks", Some(&RecordId::from("r2")), &envelope).unwrap_err(),
            KeyError::Decrypt
        );
        assert!(decrypt(&keys, "tasks", Some(&RecordId::from("r1")), &envelope).is_ok());
    }
}
