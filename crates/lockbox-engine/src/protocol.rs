//! Messages exchanged with the isolated engine.
//!
//! Every request travels in a [`RequestEnvelope`] carrying a caller-chosen
//! correlation id; the engine answers with a [`ResponseEnvelope`] echoing it.
//! Replies may arrive in any order.
//!
//! JSON shape: `{"type": "ENSURE_CEK", "store": "tasks", "wrappedCek": {...}}`.
//! Binary fields are base64url without padding.

use std::collections::BTreeMap;

use lockbox_crypto::{
    DevicePrivateJwk, ExportedDeviceKeys, RecordId, RowEnvelope, SecretBytes, WrappedCekBlob,
    WrappedKekEnvelope,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeyError;

/// A KEK in either of its accepted forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KekMaterial {
    /// 32 raw bytes.
    RawKek(SecretBytes),
    /// An envelope sealed to this device's public key.
    WrappedKek(WrappedKekEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    GetDevicePub,
    #[serde(rename_all = "camelCase")]
    ImportDeviceKeys {
        private_key_repr: DevicePrivateJwk,
        #[serde(with = "lockbox_crypto::base64url::bytes")]
        public_key_raw_bytes: Vec<u8>,
    },
    ExportDeviceKeys,
    ProvisionKek {
        #[serde(flatten)]
        kek: KekMaterial,
    },
    Encrypt {
        store: String,
        id: RecordId,
        row: Value,
    },
    Decrypt {
        store: String,
        envelope: RowEnvelope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RecordId>,
    },
    #[serde(rename_all = "camelCase")]
    EnsureCek {
        store: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrapped_cek: Option<WrappedCekBlob>,
    },
    Zeroize,
    HasKek,
    #[serde(rename_all = "camelCase")]
    RewrapCekBlob {
        wrapped_cek: WrappedCekBlob,
        new_wrapped_kek: WrappedKekEnvelope,
    },
    #[serde(rename_all = "camelCase")]
    RewrapCekBlobRaw {
        wrapped_cek: WrappedCekBlob,
        new_raw_kek: SecretBytes,
    },
    #[serde(rename_all = "camelCase")]
    RewrapCekBlobs {
        wrapped_ceks: BTreeMap<String, WrappedCekBlob>,
        new_kek: KekMaterial,
    },
    /// Rewrap every blob and make the new KEK resident in one step.
    /// Refused unless `wrapped_ceks` covers every store with a resident CEK.
    #[serde(rename_all = "camelCase")]
    RotateKek {
        wrapped_ceks: BTreeMap<String, WrappedCekBlob>,
        new_kek: KekMaterial,
    },
    Status,
}

impl Request {
    /// Operation name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetDevicePub => "device.public_key",
            Request::ImportDeviceKeys { .. } => "device.import",
            Request::ExportDeviceKeys => "device.export",
            Request::ProvisionKek { .. } => "kek.provision",
            Request::Encrypt { .. } => "row.encrypt",
            Request::Decrypt { .. } => "row.decrypt",
            Request::EnsureCek { .. } => "cek.ensure",
            Request::Zeroize => "zeroize",
            Request::HasKek => "kek.has",
            Request::RewrapCekBlob { .. } => "cek.rewrap",
            Request::RewrapCekBlobRaw { .. } => "cek.rewrap_raw",
            Request::RewrapCekBlobs { .. } => "cek.rewrap_all",
            Request::RotateKek { .. } => "kek.rotate",
            Request::Status => "status",
        }
    }
}

/// Snapshot of what the engine currently holds. Names only, never keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub has_kek: bool,
    pub has_device_key: bool,
    pub stores: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    #[serde(rename_all = "camelCase")]
    DevicePub {
        #[serde(with = "lockbox_crypto::base64url::bytes")]
        device_public_key: Vec<u8>,
    },
    DeviceKeysImported,
    DeviceKeys {
        #[serde(flatten)]
        keys: ExportedDeviceKeys,
    },
    KekProvisioned,
    Encrypted {
        envelope: RowEnvelope,
    },
    Decrypted {
        row: Value,
    },
    /// `wrapped_cek` is set only when a new CEK was generated or an
    /// existing cached one was returned for a blob-less call.
    #[serde(rename_all = "camelCase")]
    CekEnsured {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrapped_cek: Option<WrappedCekBlob>,
    },
    Zeroized,
    HasKek {
        has: bool,
    },
    #[serde(rename_all = "camelCase")]
    Rewrapped {
        wrapped_cek: WrappedCekBlob,
    },
    #[serde(rename_all = "camelCase")]
    RewrappedAll {
        wrapped_ceks: BTreeMap<String, WrappedCekBlob>,
    },
    #[serde(rename_all = "camelCase")]
    Rotated {
        wrapped_ceks: BTreeMap<String, WrappedCekBlob>,
    },
    Status {
        status: EngineStatus,
    },
    Failed {
        error: KeyError,
    },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::DevicePub { .. } => "DEVICE_PUB",
            Reply::DeviceKeysImported => "DEVICE_KEYS_IMPORTED",
            Reply::DeviceKeys { .. } => "DEVICE_KEYS",
            Reply::KekProvisioned => "KEK_PROVISIONED",
            Reply::Encrypted { .. } => "ENCRYPTED",
            Reply::Decrypted { .. } => "DECRYPTED",
            Reply::CekEnsured { .. } => "CEK_ENSURED",
            Reply::Zeroized => "ZEROIZED",
            Reply::HasKek { .. } => "HAS_KEK",
            Reply::Rewrapped { .. } => "REWRAPPED",
            Reply::RewrappedAll { .. } => "REWRAPPED_ALL",
            Reply::Rotated { .. } => "ROTATED",
            Reply::Status { .. } => "STATUS",
            Reply::Failed { .. } => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub reply: Reply,
}
