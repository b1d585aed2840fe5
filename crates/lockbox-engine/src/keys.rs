//! The resident key hierarchy: one KEK and a cache of unwrapped CEKs.
//!
//! State changes are guarded by a synchronous `RwLock` that is never held
//! across an await. CEK establishment for a store is serialized by a
//! per-store async mutex, so concurrent `ensure` calls for the same store
//! produce exactly one CEK.
//!
//! Every KEK change bumps `generation`. A CEK prepared under an older
//! generation is discarded instead of installed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lockbox_crypto::{
    generate_cek, kek_from_bytes, rewrap_cek, unwrap_cek, wrap_cek, Cek, Kek, WrappedCekBlob,
};
use parking_lot::{Mutex, RwLock};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::KeyError;

struct CachedCek {
    cek: Cek,
    wrapped: WrappedCekBlob,
    generation: u64,
}

#[derive(Default)]
struct KeyTable {
    kek: Option<Kek>,
    ceks: HashMap<String, CachedCek>,
    generation: u64,
}

#[derive(Default)]
pub struct KeyHierarchy {
    table: RwLock<KeyTable>,
    store_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a raw 32-byte KEK.
    pub fn provision_kek(&self, raw: &[u8]) -> Result<(), KeyError> {
        let kek = kek_from_bytes(raw).map_err(|_| KeyError::InvalidKek)?;
        self.install_kek(kek);
        Ok(())
    }

    /// Make `kek` resident.
    ///
    /// Re-provisioning the same KEK keeps cached CEKs. A different KEK
    /// drops them, since they were established under the old one.
    pub fn install_kek(&self, kek: Kek) {
        let mut table = self.table.write();
        if table
            .kek
            .as_ref()
            .is_some_and(|current| bool::from(current[..].ct_eq(&kek[..])))
        {
            debug!(op = "kek.provision", "same KEK already resident");
            return;
        }
        let replaced = table.kek.is_some();
        table.generation += 1;
        table.ceks.clear();
        table.kek = Some(kek);
        info!(
            op = "kek.provision",
            replaced,
            generation = table.generation,
            "KEK installed"
        );
    }

    pub fn has_kek(&self) -> bool {
        self.table.read().kek.is_some()
    }

    fn current_kek(&self) -> Option<(Kek, u64)> {
        let table = self.table.read();
        table.kek.clone().map(|kek| (kek, table.generation))
    }

    fn store_lock(&self, store: &str) -> Arc<AsyncMutex<()>> {
        self.store_locks
            .lock()
            .entry(store.to_string())
            .or_default()
            .clone()
    }

    /// Establish the CEK for `store`.
    ///
    /// With `existing`, the blob is unwrapped under the resident KEK and
    /// nothing is returned. Without it, the cached CEK's blob is returned if
    /// one is resident, otherwise a fresh CEK is generated and its blob
    /// returned for the caller to persist.
    pub async fn ensure_cek(
        &self,
        store: &str,
        existing: Option<&WrappedCekBlob>,
    ) -> Result<Option<WrappedCekBlob>, KeyError> {
        let lock = self.store_lock(store);
        let _guard = lock.lock().await;

        let (kek, generation) = self.current_kek().ok_or(KeyError::NoKek)?;

        if let Some(cached) = self.cached(store, generation) {
            match existing {
                Some(blob) if *blob == cached => return Ok(None),
                None => return Ok(Some(cached)),
                Some(_) => {}
            }
        }

        match existing {
            Some(blob) => {
                let cek = unwrap_cek(blob, kek.as_ref()).map_err(|e| {
                    debug!(op = "cek.ensure", store, reason = %e, "unwrap failed");
                    KeyError::Unwrap
                })?;
                self.install_cek(store, cek, blob.clone(), generation)?;
                debug!(op = "cek.ensure", store, "CEK unwrapped");
                Ok(None)
            }
            None => {
                let cek = generate_cek().map_err(|_| KeyError::Internal)?;
                let wrapped = wrap_cek(cek.as_ref(), kek.as_ref()).map_err(|_| KeyError::Internal)?;
                self.install_cek(store, cek, wrapped.clone(), generation)?;
                info!(op = "cek.ensure", store, "CEK generated");
                Ok(Some(wrapped))
            }
        }
    }

    fn cached(&self, store: &str, generation: u64) -> Option<WrappedCekBlob> {
        self.table
            .read()
            .ceks
            .get(store)
            .filter(|c| c.generation == generation)
            .map(|c| c.wrapped.clone())
    }

    fn install_cek(
        &self,
        store: &str,
        cek: Cek,
        wrapped: WrappedCekBlob,
        generation: u64,
    ) -> Result<(), KeyError> {
        let mut table = self.table.write();
        if table.kek.is_none() || table.generation != generation {
            debug!(op = "cek.ensure", store, "KEK changed while establishing CEK");
            return Err(KeyError::NoKek);
        }
        table.ceks.insert(
            store.to_string(),
            CachedCek {
                cek,
                wrapped,
                generation,
            },
        );
        Ok(())
    }

    /// The resident CEK for `store`.
    pub fn cek_for(&self, store: &str) -> Result<Cek, KeyError> {
        let table = self.table.read();
        if table.kek.is_none() {
            return Err(KeyError::NoKek);
        }
        table
            .ceks
            .get(store)
            .filter(|c| c.generation == table.generation)
            .map(|c| c.cek.clone())
            .ok_or(KeyError::NoCek)
    }

    /// Re-wrap a CEK blob from the resident KEK to `new_kek`.
    ///
    /// Neither the resident KEK nor the cache changes.
    pub fn rewrap(&self, blob: &WrappedCekBlob, new_kek: &[u8]) -> Result<WrappedCekBlob, KeyError> {
        let (current, _) = self.current_kek().ok_or(KeyError::Rewrap)?;
        rewrap_cek(blob, current.as_ref(), new_kek).map_err(|e| {
            debug!(op = "cek.rewrap", reason = %e, "rewrap failed");
            KeyError::Rewrap
        })
    }

    /// Re-wrap a set of blobs. Either every blob is re-wrapped or none is
    /// returned.
    pub fn rewrap_all(
        &self,
        blobs: &BTreeMap<String, WrappedCekBlob>,
        new_kek: &[u8],
    ) -> Result<BTreeMap<String, WrappedCekBlob>, KeyError> {
        let (current, _) = self.current_kek().ok_or(KeyError::Rewrap)?;
        blobs
            .iter()
            .map(|(store, blob)| {
                rewrap_cek(blob, current.as_ref(), new_kek)
                    .map(|rewrapped| (store.clone(), rewrapped))
                    .map_err(|e| {
                        debug!(op = "cek.rewrap_all", store = %store, reason = %e, "rewrap failed");
                        KeyError::Rewrap
                    })
            })
            .collect()
    }

    /// Rewrap `blobs` under `new_kek` and make it resident, atomically.
    ///
    /// Runs entirely under the table write lock, so no CEK can be
    /// established under the old KEK between the rewrap and the switch.
    /// Refused with `Rewrap` if a store with a resident CEK is missing from
    /// `blobs`, since its blob would be stranded under the old KEK. The
    /// rotated CEKs stay resident under the new KEK.
    pub fn rotate(
        &self,
        blobs: &BTreeMap<String, WrappedCekBlob>,
        new_kek: Kek,
    ) -> Result<BTreeMap<String, WrappedCekBlob>, KeyError> {
        let mut table = self.table.write();
        let current = table.kek.clone().ok_or(KeyError::Rewrap)?;
        let generation = table.generation;

        let missing = table
            .ceks
            .iter()
            .find(|(store, c)| c.generation == generation && !blobs.contains_key(*store))
            .map(|(store, _)| store.clone());
        if let Some(store) = missing {
            debug!(op = "kek.rotate", store = %store, "resident store missing from rotation");
            return Err(KeyError::Rewrap);
        }

        let mut rotated = Vec::with_capacity(blobs.len());
        for (store, blob) in blobs {
            let moved = unwrap_cek(blob, current.as_ref()).and_then(|cek| {
                wrap_cek(cek.as_ref(), new_kek.as_ref()).map(|wrapped| (cek, wrapped))
            });
            match moved {
                Ok((cek, wrapped)) => rotated.push((store.clone(), cek, wrapped)),
                Err(e) => {
                    debug!(op = "kek.rotate", store = %store, reason = %e, "rewrap failed");
                    return Err(KeyError::Rewrap);
                }
            }
        }

        table.generation += 1;
        let generation = table.generation;
        let mut rewrapped = BTreeMap::new();
        table.ceks.clear();
        for (store, cek, wrapped) in rotated {
            rewrapped.insert(store.clone(), wrapped.clone());
            table.ceks.insert(
                store,
                CachedCek {
                    cek,
                    wrapped,
                    generation,
                },
            );
        }
        table.kek = Some(new_kek);
        info!(op = "kek.rotate", stores = rewrapped.len(), generation, "KEK rotated");
        Ok(rewrapped)
    }

    /// Drop the KEK and every cached CEK.
    pub fn zeroize(&self) {
        let mut table = self.table.write();
        let stores = table.ceks.len();
        table.kek = None;
        table.ceks.clear();
        table.generation += 1;
        drop(table);

        // Locks still held or awaited stay; a fresh one is made on next use.
        self.store_locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        info!(op = "zeroize", stores, "key material dropped");
    }

    /// Names of stores with a resident CEK, sorted.
    pub fn stores(&self) -> Vec<String> {
        let table = self.table.read();
        let mut stores: Vec<String> = table
            .ceks
            .iter()
            .filter(|(_, c)| c.generation == table.generation)
            .map(|(name, _)| name.clone())
            .collect();
        stores.sort();
        stores
    }
}
