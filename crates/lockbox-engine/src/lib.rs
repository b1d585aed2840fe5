//! Client-side key management for locally stored records.
//!
//! A device P-256 keypair receives a key-encryption key (KEK) from the
//! server. The KEK wraps one content-encryption key (CEK) per store, and
//! each CEK encrypts that store's rows. All plaintext keys live inside an
//! isolated engine thread; the application talks to it through
//! [`EngineClient`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use lockbox_engine::{EngineClient, EngineConfig};
//! use serde_json::json;
//!
//! let client = EngineClient::start(EngineConfig::default())?;
//! client.provision_kek([7u8; 32]).await?;
//! let blob = client.ensure_cek("tasks", None).await?;
//! // persist `blob` next to the store
//!
//! let envelope = client.encrypt_row("tasks", 1u64, &json!({"name": "x"})).await?;
//! let row: serde_json::Value = client.decrypt_row("tasks", envelope).await?;
//! # let _ = (blob, row);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod rows;

pub use client::EngineClient;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ClientError, KeyError, TransportError};
pub use protocol::{EngineStatus, KekMaterial, Reply, Request, RequestEnvelope, ResponseEnvelope};

pub use lockbox_crypto::{
    DevicePrivateJwk, ExportedDeviceKeys, RecordId, RowEnvelope, SecretBytes, WrappedCekBlob,
    WrappedKekEnvelope,
};
