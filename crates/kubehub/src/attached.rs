//! Per-connection, per-key single-flight cache.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use ferry_core::{FerryError, Result};
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::debug;

type Resolved = Result<Arc<dyn Any + Send + Sync>>;
type Slot = Arc<OnceCell<Resolved>>;

/// Lazily resolved values bound to one cluster connection.
///
/// The map lock is only held to find or insert a slot; resolution runs under
/// the slot's own cell, so concurrent callers for the same key await a single
/// resolution and observe the same value or error.
#[derive(Default)]
pub struct AttachedState {
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for AttachedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedState").field("keys", &self.keys()).finish()
    }
}

/// `key:subkey`, or `key` when there is no subkey.
pub fn state_key(key: &str, subkey: &str) -> String {
    if subkey.is_empty() { key.to_string() } else { format!("{}:{}", key, subkey) }
}

impl AttachedState {
    pub fn new() -> Self { Self::default() }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    pub async fn get_or_resolve<T, F, Fut>(&self, key: &str, resolve: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = self.slot(key);
        let resolved = slot
            .get_or_init(|| async move {
                debug!(key, "resolving attached state");
                counter!("attached_state_resolve", 1u64);
                resolve().await.map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
            })
            .await;
        match resolved {
            Ok(v) => v.clone().downcast::<T>().map_err(|_| FerryError::internal(format!("attached state {}: unexpected type", key))),
            Err(e) => Err(e.clone()),
        }
    }

    /// Drop a cached entry; the next request resolves again.
    pub fn reset(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.remove(key).is_some() {
            debug!(key, "attached state reset");
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<_> = slots.keys().cloned().collect();
        keys.sort();
        keys
    }
}
