//! The isolated key-management context.
//!
//! The engine owns all plaintext key material and runs on its own OS thread
//! with a private single-threaded Tokio runtime. Callers reach it only
//! through the request channel; key bytes never cross back except inside
//! wrapped blobs and the device JWK export.
//!
//! Each request is handled in its own task, so a slow CEK establishment for
//! one store does not hold up requests for others. A handler that panics is
//! answered with [`KeyError::Internal`] and the engine keeps serving.

use std::sync::Arc;
use std::thread;

use lockbox_crypto::kek_from_bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::device::DeviceIdentity;
use crate::error::{KeyError, TransportError};
use crate::keys::KeyHierarchy;
use crate::protocol::{EngineStatus, KekMaterial, Reply, Request, RequestEnvelope, ResponseEnvelope};
use crate::rows;

pub struct Engine {
    config: EngineConfig,
    device: DeviceIdentity,
    keys: KeyHierarchy,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            device: DeviceIdentity::new(),
            keys: KeyHierarchy::new(),
        }
    }

    /// Answer one request. Failures become [`Reply::Failed`].
    pub async fn handle(&self, request: Request) -> Reply {
        let op = request.kind();
        match self.dispatch(request).await {
            Ok(reply) => reply,
            Err(error) => {
                debug!(op, %error, "request failed");
                Reply::Failed { error }
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Reply, KeyError> {
        match request {
            Request::GetDevicePub => Ok(Reply::DevicePub {
                device_public_key: self.device.public_key(),
            }),
            Request::ImportDeviceKeys {
                private_key_repr,
                public_key_raw_bytes,
            } => {
                self.device.import(&private_key_repr, &public_key_raw_bytes)?;
                Ok(Reply::DeviceKeysImported)
            }
            Request::ExportDeviceKeys => Ok(Reply::DeviceKeys {
                keys: self.device.export()?,
            }),
            Request::ProvisionKek { kek } => {
                match kek {
                    KekMaterial::RawKek(raw) => self.keys.provision_kek(raw.as_bytes())?,
                    KekMaterial::WrappedKek(envelope) => {
                        let kek = self.device.open_kek(&envelope, self.wrap_info())?;
                        self.keys.install_kek(kek);
                    }
                }
                Ok(Reply::KekProvisioned)
            }
            Request::Encrypt { store, id, row } => Ok(Reply::Encrypted {
                envelope: rows::encrypt(&self.keys, &store, &id, &row)?,
            }),
            Request::Decrypt {
                store,
                envelope,
                id,
            } => Ok(Reply::Decrypted {
                row: rows::decrypt(&self.keys, &store, id.as_ref(), &envelope)?,
            }),
            Request::EnsureCek { store, wrapped_cek } => Ok(Reply::CekEnsured {
                wrapped_cek: self.keys.ensure_cek(&store, wrapped_cek.as_ref()).await?,
            }),
            Request::Zeroize => {
                self.keys.zeroize();
                if self.config.zeroize_device_identity {
                    self.device.clear();
                }
                Ok(Reply::Zeroized)
            }
            Request::HasKek => Ok(Reply::HasKek {
                has: self.keys.has_kek(),
            }),
            Request::RewrapCekBlob {
                wrapped_cek,
                new_wrapped_kek,
            } => {
                let new_kek = self
                    .device
                    .open_kek(&new_wrapped_kek, self.wrap_info())
                    .map_err(|_| KeyError::Rewrap)?;
                Ok(Reply::Rewrapped {
                    wrapped_cek: self.keys.rewrap(&wrapped_cek, new_kek.as_ref())?,
                })
            }
            Request::RewrapCekBlobRaw {
                wrapped_cek,
                new_raw_kek,
            } => Ok(Reply::Rewrapped {
                wrapped_cek: self.keys.rewrap(&wrapped_cek, new_raw_kek.as_bytes())?,
            }),
            Request::RewrapCekBlobs {
                wrapped_ceks,
                new_kek,
            } => {
                let rewrapped = match new_kek {
                    KekMaterial::RawKek(raw) => self.keys.rewrap_all(&wrapped_ceks, raw.as_bytes())?,
                    KekMaterial::WrappedKek(envelope) => {
                        let new_kek = self
                            .device
                            .open_kek(&envelope, self.wrap_info())
                            .map_err(|_| KeyError::Rewrap)?;
                        self.keys.rewrap_all(&wrapped_ceks, new_kek.as_ref())?
                    }
                };
                Ok(Reply::RewrappedAll {
                    wrapped_ceks: rewrapped,
                })
            }
            Request::RotateKek {
                wrapped_ceks,
                new_kek,
            } => {
                let new_kek = match new_kek {
                    KekMaterial::RawKek(raw) => {
                        kek_from_bytes(raw.as_bytes()).map_err(|_| KeyError::Rewrap)?
                    }
                    KekMaterial::WrappedKek(envelope) => self
                        .device
                        .open_kek(&envelope, self.wrap_info())
                        .map_err(|_| KeyError::Rewrap)?,
                };
                Ok(Reply::Rotated {
                    wrapped_ceks: self.keys.rotate(&wrapped_ceks, new_kek)?,
                })
            }
            Request::Status => Ok(Reply::Status {
                status: EngineStatus {
                    has_kek: self.keys.has_kek(),
                    has_device_key: self.device.is_loaded(),
                    stores: self.keys.stores(),
                },
            }),
        }
    }

    fn wrap_info(&self) -> &[u8] {
        self.config.kek_wrap_info.as_bytes()
    }
}

/// Start the engine thread.
///
/// The engine stops once every request sender is dropped; in-flight
/// requests are abandoned and all key material is dropped with it.
pub(crate) fn spawn(
    config: EngineConfig,
    requests: mpsc::Receiver<RequestEnvelope>,
    replies: mpsc::UnboundedSender<ResponseEnvelope>,
) -> Result<thread::JoinHandle<()>, TransportError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| TransportError::Spawn(e.to_string()))?;

    let name = config.thread_name.clone();
    let engine = Arc::new(Engine::new(config));
    thread::Builder::new()
        .name(name)
        .spawn(move || runtime.block_on(serve(engine, requests, replies)))
        .map_err(|e| TransportError::Spawn(e.to_string()))
}

async fn serve(
    engine: Arc<Engine>,
    mut requests: mpsc::Receiver<RequestEnvelope>,
    replies: mpsc::UnboundedSender<ResponseEnvelope>,
) {
    info!(op = "engine.start", "engine running");

    while let Some(RequestEnvelope { id, request }) = requests.recv().await {
        let engine = engine.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let op = request.kind();
            let worker = tokio::spawn(async move { engine.handle(request).await });
            let reply = match worker.await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(op, id, panicked = e.is_panic(), "request handler aborted");
                    Reply::Failed {
                        error: KeyError::Internal,
                    }
                }
            };
            if replies.send(ResponseEnvelope { id, reply }).is_err() {
                debug!(op, id, "reply dropped, caller is gone");
            }
        });
    }

    info!(op = "engine.stop", "request channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_crypto::{seal_kek_for_device, RecordId, SecretBytes, DEFAULT_KEK_WRAP_INFO};
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default())
    }

    async fn provision(engine: &Engine, raw: [u8; 32]) {
        let reply = engine
            .handle(Request::ProvisionKek {
                kek: KekMaterial::RawKek(SecretBytes::from(raw)),
            })
            .await;
        assert!(matches!(reply, Reply::KekProvisioned));
    }

    #[tokio::test]
    async fn has_kek_tracks_provisioning() {
        let engine = engine();
        assert!(matches!(
            engine.handle(Request::HasKek).await,
            Reply::HasKek { has: false }
        ));
        provision(&engine, [1u8; 32]).await;
        assert!(matches!(
            engine.handle(Request::HasKek).await,
            Reply::HasKek { has: true }
        ));
    }

    #[tokio::test]
    async fn invalid_raw_kek_is_rejected() {
        let reply = engine()
            .handle(Request::ProvisionKek {
                kek: KekMaterial::RawKek(SecretBytes::from([0u8; 8])),
            })
            .await;
        assert!(matches!(
            reply,
            Reply::Failed {
                error: KeyError::InvalidKek
            }
        ));
    }

    #[tokio::test]
    async fn wrapped_kek_opens_with_device_key() {
        let engine = engine();
        let public = match engine.handle(Request::GetDevicePub).await {
            Reply::DevicePub { device_public_key } => device_public_key,
            other => panic!("unexpected {other:?}"),
        };
        let envelope = seal_kek_for_device(&[5u8; 32], &public, DEFAULT_KEK_WRAP_INFO).unwrap();
        let reply = engine
            .handle(Request::ProvisionKek {
                kek: KekMaterial::WrappedKek(envelope),
            })
            .await;
        assert!(matches!(reply, Reply::KekProvisioned));
        assert!(engine.keys.has_kek());
    }

    #[tokio::test]
    async fn encrypt_before_ensure_is_no_cek() {
        let engine = engine();
        provision(&engine, [1u8; 32]).await;
        let reply = engine
            .handle(Request::Encrypt {
                store: "tasks".into(),
                id: RecordId::from(1u64),
                row: json!({}),
            })
            .await;
        assert!(matches!(
            reply,
            Reply::Failed {
                error: KeyError::NoCek
            }
        ));
    }

    #[tokio::test]
    async fn zeroize_keeps_device_identity_by_default() {
        let engine = engine();
        engine.handle(Request::GetDevicePub).await;
        provision(&engine, [1u8; 32]).await;
        engine.handle(Request::Zeroize).await;
        assert!(!engine.keys.has_kek());
        assert!(engine.device.is_loaded());
    }

    #[tokio::test]
    async fn zeroize_can_discard_device_identity() {
        let engine = Engine::new(EngineConfig {
            zeroize_device_identity: true,
            ..Default::default()
        });
        engine.handle(Request::GetDevicePub).await;
        engine.handle(Request::Zeroize).await;
        assert!(!engine.device.is_loaded());
    }

    #[tokio::test]
    async fn status_lists_resident_stores() {
        let engine = engine();
        provision(&engine, [1u8; 32]).await;
        for store in ["notes", "tasks"] {
            engine
                .handle(Request::EnsureCek {
                    store: store.into(),
                    wrapped_cek: None,
                })
                .await;
        }
        match engine.handle(Request::Status).await {
            Reply::Status { status } => {
                assert!(status.has_kek);
                assert!(!status.has_device_key);
                assert_eq!(status.stores, vec!["notes", "tasks"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rotate_switches_kek_and_keeps_rows_readable() {
        let engine = engine();
        provision(&engine, [1u8; 32]).await;
        let blob = match engine
            .handle(Request::EnsureCek {
                store: "tasks".into(),
                wrapped_cek: None,
            })
            .await
        {
            Reply::CekEnsured {
                wrapped_cek: Some(blob),
            } => blob,
            other => panic!("unexpected {other:?}"),
        };
        let envelope = rows::encrypt(&engine.keys, "tasks", &RecordId::from(1u64), &json!({"a": 1}))
            .unwrap();

        let mut wrapped_ceks = std::collections::BTreeMap::new();
        wrapped_ceks.insert("tasks".to_string(), blob);
        let rotated = match engine
            .handle(Request::RotateKek {
                wrapped_ceks,
                new_kek: KekMaterial::RawKek(SecretBytes::from([2u8; 32])),
            })
            .await
        {
            Reply::Rotated { wrapped_ceks } => wrapped_ceks,
            other => panic!("unexpected {other:?}"),
        };
        assert!(lockbox_crypto::unwrap_cek(&rotated["tasks"], &[2u8; 32]).is_ok());
        assert_eq!(
            rows::decrypt(&engine.keys, "tasks", None, &envelope).unwrap(),
            json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn rotate_with_short_kek_is_rewrap_failure() {
        let engine = engine();
        provision(&engine, [1u8; 32]).await;
        let reply = engine
            .handle(Request::RotateKek {
                wrapped_ceks: Default::default(),
                new_kek: KekMaterial::RawKek(SecretBytes::from([2u8; 8])),
            })
            .await;
        assert!(matches!(
            reply,
            Reply::Failed {
                error: KeyError::Rewrap
            }
        ));
        assert!(engine.keys.has_kek());
    }
}
