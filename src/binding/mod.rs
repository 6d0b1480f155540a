//! Per-consumer view of the shared cache.
//!
//! A [`CachingFetch`] is what one mounted UI consumer holds: its own loading
//! flag and error, plus a live view of the shared [`CacheStore`](crate::cache::CacheStore).
//! Binding while the store is populated (after a preload or a hydration)
//! starts out not loading, so the first render needs no loading state.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::Records;
use crate::error::FetchError;
use crate::fetch::{self, FetchCoordinator};

/// What a consumer renders from.
#[derive(Debug, Clone)]
pub struct FetchState {
    pub is_loading: bool,
    pub data: Records,
    pub error: Option<FetchError>,
}

#[derive(Debug, Clone, Default)]
struct Local {
    is_loading: bool,
    error: Option<FetchError>,
}

/// One consumer's binding to a [`FetchCoordinator`].
///
/// `data` always reflects the shared store, so a fetch completed by any
/// binding is visible to all of them. `error` belongs to this binding alone
/// and is not cleared by another binding's later success.
///
/// Dropping the binding (unmounting) stops it waiting; a fetch it started
/// keeps running for the other consumers.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use slotfetch::binding::CachingFetch;
/// use slotfetch::cache::CacheStore;
/// use slotfetch::client::HttpTransport;
/// use slotfetch::fetch::FetchCoordinator;
/// use slotfetch::record::Record;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(CacheStore::new());
/// store.replace(vec![Record { first: "Ann".into(), ..Default::default() }]);
///
/// let coordinator = FetchCoordinator::new(store, Arc::new(HttpTransport::new()));
/// let binding = CachingFetch::bind(&coordinator, "http://api.local/people");
///
/// let state = binding.state();
/// assert!(!state.is_loading);
/// assert_eq!(state.data[0].first, "Ann");
/// # }
/// ```
#[derive(Debug)]
pub struct CachingFetch {
    url: String,
    store: watch::Receiver<Records>,
    local: watch::Receiver<Local>,
    local_open: bool,
    task: Option<JoinHandle<()>>,
}

impl CachingFetch {
    /// Binds a consumer to `url` through `coordinator`.
    ///
    /// If the store is empty this spawns the consumer's `fetch_or_reuse`
    /// call; concurrent bindings collapse into the coordinator's one fetch.
    /// Must be called from within a Tokio runtime.
    pub fn bind(coordinator: &FetchCoordinator, url: impl Into<String>) -> Self {
        let url = url.into();
        let store = coordinator.store().subscribe();
        let preloaded = !store.borrow().is_empty();

        let (tx, local) = watch::channel(Local {
            is_loading: !preloaded,
            error: None,
        });

        let task = (!preloaded).then(|| {
            let coordinator = coordinator.clone();
            let url = url.clone();
            tokio::spawn(async move {
                let result = coordinator.fetch_or_reuse(&url).await;
                tx.send_modify(|local| {
                    local.is_loading = false;
                    if let Err(e) = result {
                        local.error = Some(e);
                    }
                });
            })
        });

        debug!(url, preloaded, "consumer bound");
        Self {
            url,
            store,
            local,
            local_open: true,
            task,
        }
    }

    /// Returns the URL this consumer was bound with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the current `{is_loading, data, error}` snapshot.
    pub fn state(&self) -> FetchState {
        let local = self.local.borrow();
        FetchState {
            is_loading: local.is_loading,
            data: Arc::clone(&self.store.borrow()),
            error: local.error.clone(),
        }
    }

    /// Returns `true` until this consumer's fetch settles.
    pub fn is_loading(&self) -> bool {
        self.local.borrow().is_loading
    }

    /// Returns the current shared records.
    pub fn data(&self) -> Records {
        Arc::clone(&self.store.borrow())
    }

    /// Returns this consumer's most recent fetch failure.
    pub fn error(&self) -> Option<FetchError> {
        self.local.borrow().error.clone()
    }

    /// Waits until this consumer's state or the shared store changes.
    ///
    /// Returns `false` once nothing can change any more.
    pub async fn changed(&mut self) -> bool {
        loop {
            tokio::select! {
                res = self.local.changed(), if self.local_open => match res {
                    Ok(()) => return true,
                    Err(_) => self.local_open = false,
                },
                res = self.store.changed() => return res.is_ok(),
            }
        }
    }

    /// Waits for this consumer's fetch to settle and returns the resulting state.
    pub async fn settled(&mut self) -> FetchState {
        let _ = self.local.wait_for(|local| !local.is_loading).await;
        self.state()
    }
}

impl Drop for CachingFetch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Binds a consumer to the process-wide coordinator.
pub fn use_caching_fetch(url: impl Into<String>) -> CachingFetch {
    CachingFetch::bind(&fetch::global(), url)
}
