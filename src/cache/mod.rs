//! The single resource slot.
//!
//! [`CacheStore`] owns the validated dataset. It is not keyed by URL: one
//! store holds one logical resource for the lifetime of the process (or
//! until [`CacheStore::clear`]). Every mutation is a wholesale swap of an
//! `Arc<[Record]>` published through a [`watch`] channel, so readers never
//! observe a half-written collection and subscribers see every change.

use std::sync::{Arc, LazyLock};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::CacheError;
use crate::record::Record;

/// Shared, immutable snapshot of the slot contents.
pub type Records = Arc<[Record]>;

static GLOBAL: LazyLock<Arc<CacheStore>> = LazyLock::new(|| Arc::new(CacheStore::new()));

/// Returns the process-wide store used by the crate-level free functions.
pub fn global() -> Arc<CacheStore> {
    Arc::clone(&GLOBAL)
}

/// Serializes the process-wide cache for handoff to a client.
pub fn serialize_cache() -> Result<String, CacheError> {
    GLOBAL.serialize()
}

/// Installs a serialized cache into the process-wide store (hydration).
pub fn initialize_cache(serialized: &str) -> Result<(), CacheError> {
    GLOBAL.deserialize(serialized)
}

/// Empties the process-wide store.
pub fn wipe_cache() {
    GLOBAL.clear();
}

fn empty() -> Records {
    Vec::new().into()
}

/// Holder of the one cached dataset.
///
/// # Examples
///
/// ```
/// use slotfetch::cache::CacheStore;
/// use slotfetch::record::Record;
///
/// let store = CacheStore::new();
/// assert!(store.is_empty());
///
/// store.replace(vec![Record { first: "Ann".into(), ..Default::default() }]);
/// let text = store.serialize().unwrap();
///
/// let client = CacheStore::new();
/// client.deserialize(&text).unwrap();
/// assert_eq!(client.get(), store.get());
/// ```
#[derive(Debug)]
pub struct CacheStore {
    slot: watch::Sender<Records>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(empty());
        Self { slot }
    }

    /// Returns the current contents; empty if nothing is cached.
    pub fn get(&self) -> Records {
        Arc::clone(&self.slot.borrow())
    }

    /// Returns `true` if the slot holds no records.
    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_empty()
    }

    /// Returns the number of cached records.
    pub fn len(&self) -> usize {
        self.slot.borrow().len()
    }

    /// Swaps in `records` as the new contents.
    pub fn replace(&self, records: impl Into<Records>) {
        let records = records.into();
        debug!(records = records.len(), "cache slot replaced");
        self.slot.send_replace(records);
    }

    /// Resets the slot to empty.
    pub fn clear(&self) {
        let previous = self.slot.send_replace(empty());
        debug!(records = previous.len(), "cache slot cleared");
    }

    /// Encodes the current contents as a JSON array.
    pub fn serialize(&self) -> Result<String, CacheError> {
        let records = self.get();
        serde_json::to_string(&*records).map_err(CacheError::Serialize)
    }

    /// Installs a JSON array produced by [`serialize`](Self::serialize).
    ///
    /// The text is trusted as already validated by the producing side; no key
    /// allowlist check runs here and unknown keys are carried along in
    /// [`Record::extra`]. On a parse failure the slot is untouched.
    pub fn deserialize(&self, text: &str) -> Result<(), CacheError> {
        let records: Vec<Record> = serde_json::from_str(text).map_err(CacheError::Deserialize)?;
        info!(records = records.len(), "cache initialized from serialized text");
        self.slot.send_replace(records.into());
        Ok(())
    }

    /// Returns a receiver that is notified on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<Records> {
        self.slot.subscribe()
    }
}
