//! Caller-side facade over the engine channel.
//!
//! Each call gets a fresh correlation id and a oneshot slot in the pending
//! table. A router thread reads replies and completes the matching slot, so
//! any number of calls can be outstanding at once and replies may complete
//! them in any order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lockbox_crypto::{
    DevicePrivateJwk, ExportedDeviceKeys, RecordId, RowEnvelope, SecretBytes, WrappedCekBlob,
    WrappedKekEnvelope,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::EngineConfig;
use crate::engine;
use crate::error::{ClientError, TransportError};
use crate::protocol::{EngineStatus, KekMaterial, Reply, Request, RequestEnvelope, ResponseEnvelope};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

pub struct EngineClient {
    requests: mpsc::Sender<RequestEnvelope>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Option<Duration>,
}

impl EngineClient {
    /// Start an engine and return a client connected to it.
    ///
    /// Dropping the client shuts the engine down.
    pub fn start(config: EngineConfig) -> Result<Self, TransportError> {
        let (request_tx, request_rx) = mpsc::channel(config.effective_capacity());
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();
        let timeout = config.request_timeout();
        let router_name = format!("{}-router", config.thread_name);

        engine::spawn(config, request_rx, reply_tx)?;

        let routes = pending.clone();
        thread::Builder::new()
            .name(router_name)
            .spawn(move || route_replies(reply_rx, routes))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        Ok(Self {
            requests: request_tx,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
        })
    }

    /// Send one request and wait for its reply.
    ///
    /// Engine-side failures come back as [`ClientError::Key`].
    pub async fn call(&self, request: Request) -> Result<Reply, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // Released on every exit, including when the caller drops this future.
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        self.requests
            .send(RequestEnvelope { id, request })
            .await
            .map_err(|_| TransportError::Closed)?;

        let received = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => rx.await,
        };

        match received.map_err(|_| TransportError::Closed)? {
            Reply::Failed { error } => Err(error.into()),
            reply => Ok(reply),
        }
    }

    /// The device public key, generating the keypair on first use.
    pub async fn device_public_key(&self) -> Result<Vec<u8>, ClientError> {
        match self.call(Request::GetDevicePub).await? {
            Reply::DevicePub { device_public_key } => Ok(device_public_key),
            other => Err(unexpected(other)),
        }
    }

    pub async fn import_device_keys(
        &self,
        private_key_repr: DevicePrivateJwk,
        public_key_raw_bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        let request = Request::ImportDeviceKeys {
            private_key_repr,
            public_key_raw_bytes,
        };
        match self.call(request).await? {
            Reply::DeviceKeysImported => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn export_device_keys(&self) -> Result<ExportedDeviceKeys, ClientError> {
        match self.call(Request::ExportDeviceKeys).await? {
            Reply::DeviceKeys { keys } => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    /// Provision a raw 32-byte KEK.
    pub async fn provision_kek(&self, raw: impl Into<SecretBytes>) -> Result<(), ClientError> {
        self.provision(KekMaterial::RawKek(raw.into())).await
    }

    /// Provision a KEK sealed to this device's public key.
    pub async fn provision_wrapped_kek(
        &self,
        envelope: WrappedKekEnvelope,
    ) -> Result<(), ClientError> {
        self.provision(KekMaterial::WrappedKek(envelope)).await
    }

    async fn provision(&self, kek: KekMaterial) -> Result<(), ClientError> {
        match self.call(Request::ProvisionKek { kek }).await? {
            Reply::KekProvisioned => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn has_kek(&self) -> Result<bool, ClientError> {
        match self.call(Request::HasKek).await? {
            Reply::HasKek { has } => Ok(has),
            other => Err(unexpected(other)),
        }
    }

    /// Make the CEK for `store` resident.
    ///
    /// Returns a blob only when there is one for the caller to persist:
    /// a freshly generated CEK, or the resident CEK when `wrapped_cek` is
    /// `None`.
    pub async fn ensure_cek(
        &self,
        store: &str,
        wrapped_cek: Option<WrappedCekBlob>,
    ) -> Result<Option<WrappedCekBlob>, ClientError> {
        let request = Request::EnsureCek {
            store: store.to_string(),
            wrapped_cek,
        };
        match self.call(request).await? {
            Reply::CekEnsured { wrapped_cek } => Ok(wrapped_cek),
            other => Err(unexpected(other)),
        }
    }

    pub async fn encrypt_row<T: Serialize>(
        &self,
        store: &str,
        id: impl Into<RecordId>,
        row: &T,
    ) -> Result<RowEnvelope, ClientError> {
        let request = Request::Encrypt {
            store: store.to_string(),
            id: id.into(),
            row: serde_json::to_value(row)?,
        };
        match self.call(request).await? {
            Reply::Encrypted { envelope } => Ok(envelope),
            other => Err(unexpected(other)),
        }
    }

    pub async fn decrypt_row<T: DeserializeOwned>(
        &self,
        store: &str,
        envelope: RowEnvelope,
    ) -> Result<T, ClientError> {
        self.decrypt(store, envelope, None).await
    }

    /// Like [`Self::decrypt_row`], but the envelope must belong to record `id`.
    pub async fn decrypt_row_for<T: DeserializeOwned>(
        &self,
        store: &str,
        id: impl Into<RecordId>,
        envelope: RowEnvelope,
    ) -> Result<T, ClientError> {
        self.decrypt(store, envelope, Some(id.into())).await
    }

    async fn decrypt<T: DeserializeOwned>(
        &self,
        store: &str,
        envelope: RowEnvelope,
        id: Option<RecordId>,
    ) -> Result<T, ClientError> {
        let request = Request::Decrypt {
            store: store.to_string(),
            envelope,
            id,
        };
        match self.call(request).await? {
            Reply::Decrypted { row } => Ok(serde_json::from_value(row)?),
            other => Err(unexpected(other)),
        }
    }

    /// Re-wrap a CEK blob under a new KEK delivered as a device envelope.
    pub async fn rewrap_cek_blob(
        &self,
        wrapped_cek: WrappedCekBlob,
        new_wrapped_kek: WrappedKekEnvelope,
    ) -> Result<WrappedCekBlob, ClientError> {
        let request = Request::RewrapCekBlob {
            wrapped_cek,
            new_wrapped_kek,
        };
        match self.call(request).await? {
            Reply::Rewrapped { wrapped_cek } => Ok(wrapped_cek),
            other => Err(unexpected(other)),
        }
    }

    /// Re-wrap a CEK blob under a new raw KEK.
    pub async fn rewrap_cek_blob_raw(
        &self,
        wrapped_cek: WrappedCekBlob,
        new_raw_kek: impl Into<SecretBytes>,
    ) -> Result<WrappedCekBlob, ClientError> {
        let request = Request::RewrapCekBlobRaw {
            wrapped_cek,
            new_raw_kek: new_raw_kek.into(),
        };
        match self.call(request).await? {
            Reply::Rewrapped { wrapped_cek } => Ok(wrapped_cek),
            other => Err(unexpected(other)),
        }
    }

    /// Re-wrap every blob in `wrapped_ceks`, or none of them.
    pub async fn rewrap_cek_blobs(
        &self,
        wrapped_ceks: BTreeMap<String, WrappedCekBlob>,
        new_kek: KekMaterial,
    ) -> Result<BTreeMap<String, WrappedCekBlob>, ClientError> {
        let request = Request::RewrapCekBlobs {
            wrapped_ceks,
            new_kek,
        };
        match self.call(request).await? {
            Reply::RewrappedAll { wrapped_ceks } => Ok(wrapped_ceks),
            other => Err(unexpected(other)),
        }
    }

    /// Move every blob to `new_kek` and make `new_kek` resident, as one
    /// engine operation.
    ///
    /// `wrapped_ceks` must include every store with a resident CEK. The
    /// caller must persist the returned blobs. On failure the old KEK stays
    /// resident and nothing is returned.
    pub async fn rotate_kek(
        &self,
        wrapped_ceks: BTreeMap<String, WrappedCekBlob>,
        new_kek: KekMaterial,
    ) -> Result<BTreeMap<String, WrappedCekBlob>, ClientError> {
        let request = Request::RotateKek {
            wrapped_ceks,
            new_kek,
        };
        match self.call(request).await? {
            Reply::Rotated { wrapped_ceks } => Ok(wrapped_ceks),
            other => Err(unexpected(other)),
        }
    }

    /// Drop the KEK and all CEKs held by the engine.
    pub async fn zeroize(&self) -> Result<(), ClientError> {
        match self.call(Request::Zeroize).await? {
            Reply::Zeroized => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<EngineStatus, ClientError> {
        match self.call(Request::Status).await? {
            Reply::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes a call's pending entry when the call ends.
///
/// If the reply already arrived the router has removed it and this is a
/// no-op.
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

fn unexpected(reply: Reply) -> ClientError {
    TransportError::UnexpectedReply(reply.kind()).into()
}

/// Complete pending calls as replies arrive. Exits when the engine stops,
/// which drops every remaining slot and fails its caller with `Closed`.
fn route_replies(mut replies: mpsc::UnboundedReceiver<ResponseEnvelope>, pending: Pending) {
    while let Some(ResponseEnvelope { id, reply }) = replies.blocking_recv() {
        let slot = pending.lock().remove(&id);
        match slot {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(id, "caller stopped waiting");
                }
            }
            None => debug!(id, "reply for unknown request"),
        }
    }
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyError;

    #[tokio::test]
    async fn failures_surface_as_key_errors() {
        let client = EngineClient::start(EngineConfig::default()).unwrap();
        let err = client.ensure_cek("tasks", None).await.unwrap_err();
        assert_eq!(err.key_error(), Some(KeyError::NoKek));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn ids_are_unique_per_call() {
        let client = EngineClient::start(EngineConfig::default()).unwrap();
        let (a, b) = tokio::join!(client.has_kek(), client.device_public_key());
        assert!(!a.unwrap());
        assert_eq!(b.unwrap().len(), 65);
        assert_eq!(client.next_id.load(Ordering::Relaxed), 3);
    }

    /// A client whose engine never answers.
    fn silent_client(timeout: Option<Duration>) -> (EngineClient, mpsc::Receiver<RequestEnvelope>) {
        let (requests, inbox) = mpsc::channel(4);
        let client = EngineClient {
            requests,
            pending: Arc::default(),
            next_id: AtomicU64::new(1),
            timeout,
        };
        (client, inbox)
    }

    #[tokio::test]
    async fn timeout_releases_pending_slot() {
        let (client, _inbox) = silent_client(Some(Duration::from_millis(20)));
        let err = client.has_kek().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::Timeout(_))
        ));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn stopped_engine_is_closed() {
        let (client, inbox) = silent_client(None);
        drop(inbox);
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Closed)));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn abandoned_calls_release_their_slots() {
        let (requests, _inbox) = mpsc::channel(1);
        let client = EngineClient {
            requests,
            pending: Arc::default(),
            next_id: AtomicU64::new(1),
            timeout: None,
        };
        let wait = Duration::from_millis(20);

        // Sent, then abandoned while waiting for a reply.
        assert!(tokio::time::timeout(wait, client.has_kek()).await.is_err());
        // Abandoned while blocked on the full request channel.
        assert!(tokio::time::timeout(wait, client.status()).await.is_err());

        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn raw_call_returns_reply() {
        let client = EngineClient::start(EngineConfig::default()).unwrap();
        assert!(matches!(
            client.call(Request::HasKek).await.unwrap(),
            Reply::HasKek { has: false }
        ));
    }
}
