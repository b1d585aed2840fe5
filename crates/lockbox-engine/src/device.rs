//! The device identity slot.
//!
//! Holds at most one P-256 keypair. The private half is used only to open
//! KEK envelopes and is exported only in its JWK backup form.

use lockbox_crypto::{
    open_kek_envelope, DeviceKeyPair, DevicePrivateJwk, ExportedDeviceKeys, Kek,
    WrappedKekEnvelope,
};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::KeyError;

#[derive(Default)]
pub struct DeviceIdentity {
    keypair: RwLock<Option<DeviceKeyPair>>,
}

impl DeviceIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Public key of the current keypair, generating one on first use.
    pub fn public_key(&self) -> Vec<u8> {
        if let Some(pair) = self.keypair.read().as_ref() {
            return pair.public_key_raw().to_vec();
        }

        let mut slot = self.keypair.write();
        // Another request may have generated it between the two locks.
        let pair = slot.get_or_insert_with(|| {
            info!(op = "device.generate", "generated device keypair");
            DeviceKeyPair::generate()
        });
        pair.public_key_raw().to_vec()
    }

    /// Replace the current keypair. The slot is untouched on failure.
    pub fn import(&self, private_jwk: &DevicePrivateJwk, public_raw: &[u8]) -> Result<(), KeyError> {
        let pair = DeviceKeyPair::import(private_jwk, public_raw).map_err(|e| {
            debug!(op = "device.import", reason = %e, "rejected device keys");
            KeyError::Import
        })?;
        let replaced = self.keypair.write().replace(pair).is_some();
        info!(op = "device.import", replaced, "imported device keypair");
        Ok(())
    }

    pub fn export(&self) -> Result<ExportedDeviceKeys, KeyError> {
        let slot = self.keypair.read();
        let pair = slot.as_ref().ok_or(KeyError::Export)?;
        pair.export().map_err(|e| {
            debug!(op = "device.export", reason = %e, "export failed");
            KeyError::Export
        })
    }

    /// Open a KEK envelope addressed to this device.
    pub fn open_kek(&self, envelope: &WrappedKekEnvelope, info: &[u8]) -> Result<Kek, KeyError> {
        let slot = self.keypair.read();
        let pair = slot.as_ref().ok_or_else(|| {
            debug!(op = "kek.open", "no device keypair");
            KeyError::Unwrap
        })?;
        open_kek_envelope(envelope, pair, info).map_err(|e| {
            debug!(op = "kek.open", reason = %e, "envelope rejected");
            KeyError::Unwrap
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.keypair.read().is_some()
    }

    pub fn clear(&self) {
        if self.keypair.write().take().is_some() {
            info!(op = "device.clear", "discarded device keypair");
        }
    }
}
