//! Store key schema.
//!
//! Every key this crate writes is built here, so the full keyspace is
//! visible in one place. Segments are sanitized to keep the `:` delimiter
//! unambiguous.

/// A fully-formed key in the shared state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    raw: String,
}

const PREFIX: &str = "cg";

fn segment(part: &str) -> String {
    part.replace(':', "_")
}

impl StoreKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Persisted circuit breaker state record for one named breaker.
    pub fn circuit(name: &str) -> Self {
        Self::new(format!("{}:cb:{}", PREFIX, segment(name)))
    }

    /// Rate-limit counter for one client, path and granularity.
    pub fn rate_counter(client_id: &str, path: &str, granularity: &str) -> Self {
        Self::new(format!(
            "{}:rl:{}:{}:{}",
            PREFIX,
            segment(client_id),
            segment(path),
            granularity
        ))
    }

    /// Aligned-window variant of [`StoreKey::rate_counter`], used by the
    /// fixed window algorithm (one counter per window start).
    pub fn rate_window(client_id: &str, path: &str, granularity: &str, window_start_ms: u64) -> Self {
        Self::new(format!(
            "{}:rl:{}:{}:{}:{}",
            PREFIX,
            segment(client_id),
            segment(path),
            granularity,
            window_start_ms
        ))
    }

    /// Hash of `(path, granularity)` pairs a client has touched, so admin
    /// operations can enumerate a client's counters without a store scan.
    pub fn client_index(client_id: &str) -> Self {
        Self::new(format!("{}:rl:index:{}", PREFIX, segment(client_id)))
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StoreKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
