//! Engine configuration.
//!
//! Supports loading from environment variables with the `LOCKBOX_` prefix.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on queued requests.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default name of the engine thread.
pub const DEFAULT_THREAD_NAME: &str = "lockbox-engine";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Requests that may queue before `send` waits.
    pub channel_capacity: usize,
    /// Caller-side limit on a single request. `None` waits forever.
    pub request_timeout_ms: Option<u64>,
    /// Whether zeroize also discards the device keypair.
    pub zeroize_device_identity: bool,
    /// Name of the isolated engine thread.
    pub thread_name: String,
    /// HKDF info label used to derive the KEK wrapping key.
    pub kek_wrap_info: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            request_timeout_ms: None,
            zeroize_device_identity: false,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            kek_wrap_info: String::from_utf8_lossy(lockbox_crypto::DEFAULT_KEK_WRAP_INFO)
                .into_owned(),
        }
    }
}

impl EngineConfig {
    /// Load from `LOCKBOX_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            channel_capacity: lookup("LOCKBOX_CHANNEL_CAPACITY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.channel_capacity),
            request_timeout_ms: lookup("LOCKBOX_REQUEST_TIMEOUT_MS").and_then(|s| s.parse().ok()),
            zeroize_device_identity: lookup("LOCKBOX_ZEROIZE_DEVICE_IDENTITY")
                .map(|s| s.to_lowercase() == "true" || s == "1")
                .unwrap_or(defaults.zeroize_device_identity),
            thread_name: lookup("LOCKBOX_THREAD_NAME").unwrap_or(defaults.thread_name),
            kek_wrap_info: lookup("LOCKBOX_KEK_WRAP_INFO").unwrap_or(defaults.kek_wrap_info),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// `tokio::sync::mpsc` rejects a zero capacity.
    pub(crate) fn effective_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}
