//! # Shared State Store Boundary
//!
//! Every process instance of the orchestration service coordinates breaker
//! state and rate-limit counters through a common store. This module pins
//! down that collaborator as a trait and supplies the two implementations
//! this crate ships itself.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`StateStore`] | The counter/state store trait instances share |
//! | [`MemoryStore`] | In-process implementation for tests and local mode |
//! | [`FailoverStore`] | Primary store with degrade-to-local fallback |
//! | [`StoreKey`] | Typed constructors for every key this crate writes |
//!
//! The store is multi-writer: single-key updates go through
//! [`StateStore::incr_by`] or [`StateStore::fetch_update`], which
//! implementations must make atomic (an atomic script or CAS loop on a
//! networked store). Production callers inject their own client (e.g.
//! Redis) behind [`StateStore`]; this crate never talks to a wire protocol
//! itself.

mod backend;
mod failover;
mod key;

pub use backend::{MemoryStore, StateStore, UpdateOutcome};
pub use failover::FailoverStore;
pub use key::StoreKey;

/// Current unix time in milliseconds.
///
/// All persisted timestamps in this crate are unix millis so that
/// sub-second recovery timeouts behave under test.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
