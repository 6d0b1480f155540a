//! # slotfetch
//!
//! A single-slot fetch cache with request deduplication, built for data
//! that is rendered once on a server and again, without a second request,
//! on the client after hydration.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slotfetch::{initialize_cache, preload, serialize_cache, use_caching_fetch, wipe_cache};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Server: fill the cache before rendering, then hand it off.
//!     preload("https://api.example.com/people").await?;
//!     let payload = serialize_cache()?;
//!
//!     // Client: install the payload; consumers render without fetching.
//!     wipe_cache();
//!     initialize_cache(&payload)?;
//!     let people = use_caching_fetch("https://api.example.com/people");
//!     assert!(!people.state().is_loading);
//!     Ok(())
//! }
//! ```

// ── Core pipeline ─────────────────────────────────────────────────────────────
pub mod binding;
pub mod cache;
pub mod decode;
pub mod fetch;
pub mod record;

// ── Transport ─────────────────────────────────────────────────────────────────
pub mod client;

pub mod error;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use binding::{CachingFetch, FetchState, use_caching_fetch};
pub use cache::{CacheStore, Records, initialize_cache, serialize_cache, wipe_cache};
pub use client::{ClientConfig, HttpTransport, Transport};
pub use error::{CacheError, FetchError, MalformedResponse, TransportError};
pub use fetch::{FetchCoordinator, fetch_or_reuse, preload};
pub use record::{Record, filter_records, is_record};
