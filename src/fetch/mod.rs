//! Fetch-or-reuse with at most one request in flight.
//!
//! [`FetchCoordinator`] collapses any number of concurrent callers into a
//! single network fetch. Per slot the states are
//! `Empty → FetchInFlight → {Populated | Empty}`; `Populated` stays until the
//! store is cleared.
//!
//! The fetch itself runs as a spawned task and every caller, the initiator
//! included, waits on a [`watch`] channel for its outcome. Dropping a caller
//! therefore never cancels the fetch or strands the other waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheStore, Records};
use crate::client::{HttpTransport, Transport};
use crate::decode::decode_full;
use crate::error::{FetchError, MalformedResponse};
use crate::record::filter_records;

/// `None` until the in-flight fetch settles.
type Outcome = Option<Result<Records, FetchError>>;

static GLOBAL: LazyLock<FetchCoordinator> =
    LazyLock::new(|| FetchCoordinator::new(cache::global(), Arc::new(HttpTransport::new())));

/// Returns the process-wide coordinator: [`cache::global`] plus a default [`HttpTransport`].
pub fn global() -> FetchCoordinator {
    GLOBAL.clone()
}

/// [`FetchCoordinator::fetch_or_reuse`] on the process-wide coordinator.
pub async fn fetch_or_reuse(url: &str) -> Result<Records, FetchError> {
    GLOBAL.fetch_or_reuse(url).await
}

/// [`FetchCoordinator::preload`] on the process-wide coordinator.
pub async fn preload(url: &str) -> Result<(), FetchError> {
    GLOBAL.preload(url).await
}

/// Point-in-time copy of a coordinator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Calls answered from a populated store.
    pub hits: u64,
    /// Calls that joined a fetch another caller started.
    pub joins: u64,
    /// Network fetches started.
    pub fetches: u64,
    /// Fetches that ended in an error.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    joins: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

struct Inner {
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    in_flight: Mutex<Option<watch::Receiver<Outcome>>>,
    counters: Counters,
}

enum Begin {
    Cached(Records),
    Wait(watch::Receiver<Outcome>),
}

/// Cheaply cloneable handle that coordinates fetches into one [`CacheStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use slotfetch::cache::CacheStore;
/// use slotfetch::client::{FetchResponse, Transport, TransportFuture};
/// use slotfetch::fetch::FetchCoordinator;
///
/// struct People;
///
/// impl Transport for People {
///     fn get<'a>(&'a self, _url: &'a str) -> TransportFuture<'a> {
///         let body = Bytes::from_static(br#"[{"first":"Ann"},{"oops":true}]"#);
///         Box::pin(async move { Ok(FetchResponse::from_chunks(vec![body])) })
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let coordinator = FetchCoordinator::new(Arc::new(CacheStore::new()), Arc::new(People));
/// let people = coordinator.fetch_or_reuse("http://api/people").await.unwrap();
/// assert_eq!(people.len(), 1);
/// assert_eq!(people[0].first, "Ann");
/// # }
/// ```
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("store", &self.inner.store)
            .field("fetching", &self.is_fetching())
            .finish()
    }
}

impl FetchCoordinator {
    /// Creates a coordinator that fills `store` through `transport`.
    pub fn new(store: Arc<CacheStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                in_flight: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the store this coordinator fills.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    /// Returns `true` while a fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.inner.lock_in_flight().is_some()
    }

    /// Returns a snapshot of the hit/join/fetch/failure counters.
    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        CoordinatorStats {
            hits: c.hits.load(Ordering::Relaxed),
            joins: c.joins.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Returns the cached records, fetching them first if the store is empty.
    ///
    /// A populated store answers immediately, whatever `url` is: the slot is
    /// not keyed by URL. While a fetch is in flight, further callers join it
    /// and receive the same outcome.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Transport`]: no response or no body could be obtained.
    /// - [`FetchError::Malformed`]: the body was not a JSON array.
    /// - [`FetchError::Aborted`]: the fetch task died without an outcome.
    ///
    /// On error the store is left as it was, so a later call retries.
    pub async fn fetch_or_reuse(&self, url: &str) -> Result<Records, FetchError> {
        let mut rx = match Inner::begin(&self.inner, url) {
            Begin::Cached(records) => return Ok(records),
            Begin::Wait(rx) => rx,
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|settled| settled.clone());
        outcome.unwrap_or_else(|| {
            Err(FetchError::Aborted {
                url: url.to_owned(),
            })
        })
    }

    /// Populates the store before any consumer is bound.
    pub async fn preload(&self, url: &str) -> Result<(), FetchError> {
        let records = self.fetch_or_reuse(url).await?;
        info!(url, records = records.len(), "cache preloaded");
        Ok(())
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, Option<watch::Receiver<Outcome>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers from the store, joins the fetch in flight, or starts one.
    ///
    /// The emptiness check and the in-flight registration share one lock with
    /// the settle step of [`InFlight`], so no caller can slip in
    /// between a fetch's store write and its in-flight clear.
    fn begin(this: &Arc<Self>, url: &str) -> Begin {
        let mut in_flight = this.lock_in_flight();

        if !this.store.is_empty() {
            this.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Begin::Cached(this.store.get());
        }

        if let Some(rx) = in_flight.as_ref() {
            this.counters.joins.fetch_add(1, Ordering::Relaxed);
            debug!(url, "joining in-flight fetch");
            return Begin::Wait(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        *in_flight = Some(rx.clone());
        this.counters.fetches.fetch_add(1, Ordering::Relaxed);
        drop(in_flight);

        debug!(url, "starting fetch");
        tokio::spawn(Self::run(Arc::clone(this), url.to_owned(), tx));
        Begin::Wait(rx)
    }

    async fn run(this: Arc<Self>, url: String, tx: watch::Sender<Outcome>) {
        let flight = InFlight {
            inner: Arc::clone(&this),
            tx,
            settled: false,
        };
        let outcome = this.fetch(&url).await;
        flight.settle(&url, outcome);
    }

    async fn fetch(&self, url: &str) -> Result<Records, FetchError> {
        let mut response = self.transport.get(url).await?;
        let text = decode_full(url, response.take_body()).await?;

        let value: Value =
            serde_json::from_str(&text).map_err(|e| MalformedResponse::InvalidJson {
                url: url.to_owned(),
                source: Arc::new(e),
            })?;

        let values = match value {
            Value::Array(values) => values,
            other => {
                return Err(MalformedResponse::NotAnArray {
                    url: url.to_owned(),
                    found: json_kind(&other),
                }
                .into());
            }
        };

        let received = values.len();
        let records = filter_records(values);
        info!(url, received, records = records.len(), "fetched and cached");
        Ok(records.into())
    }
}

/// Owns the sending side of one fetch.
///
/// If the task unwinds before [`settle`](Self::settle), dropping this clears
/// the in-flight handle before the channel closes, so waiters observe
/// [`FetchError::Aborted`] and a new caller starts a fresh fetch.
struct InFlight {
    inner: Arc<Inner>,
    tx: watch::Sender<Outcome>,
    settled: bool,
}

impl InFlight {
    fn settle(mut self, url: &str, outcome: Result<Records, FetchError>) {
        {
            let mut in_flight = self.inner.lock_in_flight();
            match &outcome {
                Ok(records) => self.inner.store.replace(Arc::clone(records)),
                Err(e) => {
                    self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(url, error = %e, "fetch failed; cache left unchanged");
                }
            }
            in_flight.take();
        }
        self.settled = true;
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.lock_in_flight().take();
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
