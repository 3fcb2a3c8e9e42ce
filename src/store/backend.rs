//! State store boundary and the in-process implementation.

use super::key::StoreKey;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Result of a [`StateStore::fetch_update`] round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The closure produced a new value and it was written.
    Updated,
    /// The closure returned `None`; the key was left untouched.
    Unchanged,
}

/// The shared counter/state store every process instance coordinates through.
///
/// Implementations must make `incr_by` and `fetch_update` atomic with
/// respect to other writers (other tasks, threads and processes). All
/// multi-writer paths in this crate go through those two primitives; a
/// naive get-then-set against a shared key races across processes and is
/// not used anywhere.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    /// Set a value, creating or replacing the key. A `ttl` of `None` means
    /// the key does not expire.
    async fn set(&self, key: &StoreKey, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &StoreKey) -> Result<bool>;

    /// Atomically add `delta` to an integer counter and return the new
    /// value. A missing key counts from zero; `ttl` is applied only when
    /// the increment creates the key.
    async fn incr_by(&self, key: &StoreKey, delta: i64, ttl: Option<Duration>) -> Result<i64>;

    async fn expire(&self, key: &StoreKey, ttl: Duration) -> Result<bool>;

    async fn hash_set(&self, key: &StoreKey, field: &str, value: &[u8]) -> Result<()>;

    async fn hash_get_all(&self, key: &StoreKey) -> Result<HashMap<String, Vec<u8>>>;

    async fn hash_delete(&self, key: &StoreKey, field: &str) -> Result<bool>;

    /// Atomic conditional read-modify-write: `apply` sees the current value
    /// (or `None`) and returns the replacement, or `None` to leave the key
    /// untouched. The whole step is atomic against concurrent writers, so
    /// callers can fold a decision into the closure via captured state.
    /// The TTL is refreshed whenever a new value is written.
    async fn fetch_update(
        &self,
        key: &StoreKey,
        ttl: Option<Duration>,
        apply: &mut (dyn for<'a> FnMut(Option<&'a [u8]>) -> Option<Vec<u8>> + Send),
    ) -> Result<UpdateOutcome>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

enum Slot {
    Bytes(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

fn wrong_kind(key: &StoreKey) -> Error {
    Error::store_with_context(
        format!("key '{}' holds a value of another kind", key),
        ErrorContext::new().with_source("memory_store"),
    )
}

/// In-process [`StateStore`].
///
/// Backs unit tests and the degraded local-only mode; it is authoritative
/// for nothing beyond the current process. Production deployments inject a
/// shared store client (e.g. Redis) behind the same trait.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) keys, for tests and stats.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>) {
        entries.retain(|_, e| !e.is_expired());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap();
        match entries.get(key.as_str()) {
            Some(entry) if !entry.is_expired() => match &entry.slot {
                Slot::Bytes(data) => Ok(Some(data.clone())),
                Slot::Hash(_) => Err(wrong_kind(key)),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &StoreKey, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        Self::purge_expired(&mut entries);
        entries.insert(
            key.as_str().to_string(),
            Entry {
                slot: Slot::Bytes(value.to_vec()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool> {
        let mut entries = self.entries.write().unwrap();
        Ok(entries.remove(key.as_str()).map(|e| !e.is_expired()).unwrap_or(false))
    }

    async fn incr_by(&self, key: &StoreKey, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key.as_str()) {
            Some(entry) if !entry.is_expired() => {
                let current = match &entry.slot {
                    Slot::Bytes(data) => std::str::from_utf8(data)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| {
                            Error::store_with_context(
                                format!("key '{}' is not an integer counter", key),
                                ErrorContext::new().with_source("memory_store"),
                            )
                        })?,
                    Slot::Hash(_) => return Err(wrong_kind(key)),
                };
                let next = current.saturating_add(delta);
                entry.slot = Slot::Bytes(next.to_string().into_bytes());
                Ok(next)
            }
            _ => {
                entries.insert(
                    key.as_str().to_string(),
                    Entry {
                        slot: Slot::Bytes(delta.to_string().into_bytes()),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn expire(&self, key: &StoreKey, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key.as_str()) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hash_set(&self, key: &StoreKey, field: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key.as_str()) {
            Some(entry) if !entry.is_expired() => match &mut entry.slot {
                Slot::Hash(fields) => {
                    fields.insert(field.to_string(), value.to_vec());
                    Ok(())
                }
                Slot::Bytes(_) => Err(wrong_kind(key)),
            },
            _ => {
                let mut fields = HashMap::new();
                fields.insert(field.to_string(), value.to_vec());
                entries.insert(
                    key.as_str().to_string(),
                    Entry {
                        slot: Slot::Hash(fields),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn hash_get_all(&self, key: &StoreKey) -> Result<HashMap<String, Vec<u8>>> {
        let entries = self.entries.read().unwrap();
        match entries.get(key.as_str()) {
            Some(entry) if !entry.is_expired() => match &entry.slot {
                Slot::Hash(fields) => Ok(fields.clone()),
                Slot::Bytes(_) => Err(wrong_kind(key)),
            },
            _ => Ok(HashMap::new()),
        }
    }

    async fn hash_delete(&self, key: &StoreKey, field: &str) -> Result<bool> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key.as_str()) {
            Some(entry) if !entry.is_expired() => match &mut entry.slot {
                Slot::Hash(fields) => Ok(fields.remove(field).is_some()),
                Slot::Bytes(_) => Err(wrong_kind(key)),
            },
            _ => Ok(false),
        }
    }

    async fn fetch_update(
        &self,
        key: &StoreKey,
        ttl: Option<Duration>,
        apply: &mut (dyn for<'a> FnMut(Option<&'a [u8]>) -> Option<Vec<u8>> + Send),
    ) -> Result<UpdateOutcome> {
        // The write lock makes the read-modify-write atomic; a networked
        // implementation uses a server-side script or CAS loop instead.
        let mut entries = self.entries.write().unwrap();
        let current = match entries.get(key.as_str()) {
            Some(entry) if !entry.is_expired() => match &entry.slot {
                Slot::Bytes(data) => Some(data.clone()),
                Slot::Hash(_) => return Err(wrong_kind(key)),
            },
            _ => None,
        };
        match apply(current.as_deref()) {
            Some(next) => {
                entries.insert(
                    key.as_str().to_string(),
                    Entry {
                        slot: Slot::Bytes(next),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
                Ok(UpdateOutcome::Updated)
            }
            None => Ok(UpdateOutcome::Unchanged),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
