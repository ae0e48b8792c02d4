//! An in-process cache of users with a per-entry time to live.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::types::User;

/// A cached user and the instant at which it stops being served.
#[derive(Clone, Debug)]
struct CacheEntry {
    value: User,
    expires_at: Instant,
}

/// Bookkeeping for a key that has store reads in progress.
#[derive(Debug)]
struct Fill {
    /// Bumped by every invalidation of the key while reads are in progress.
    epoch: u64,
    /// The number of outstanding [`Reservation`]s. The fill is dropped when this reaches zero.
    reservations: usize,
}

type Fills = Arc<Mutex<HashMap<String, Fill>>>;

/// Maps user ids to users for a bounded amount of time.
///
/// There is no background sweeper. An expired entry is removed by the first lookup that finds
/// it. Lookups take a shared lock, so they run in parallel with each other.
#[derive(Debug, Default)]
pub struct TtlCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    fills: Fills,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the user cached under `key` unless it is absent or expired.
    pub fn get(&self, key: &str) -> Option<User> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // The entry may have been refreshed between dropping the read lock and taking the write
        // lock, so only evict what is still expired.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if now < entry.expires_at {
                return Some(entry.value.clone());
            }
            entries.remove(key);
            metric!(counter("users.cache.evicted") += 1);
        }
        None
    }

    /// Stores `value` under `key`, replacing any previous entry and restarting its expiry.
    pub fn put(&self, key: &str, value: User, ttl: Duration) {
        let mut entries = self.entries.write();
        Self::insert(&mut entries, key, value, ttl);
    }

    /// Announces a store read of `key` whose result is going to be written through.
    ///
    /// Must be called before the read starts. Invalidations of `key` from then on make
    /// [`put_reserved`](Self::put_reserved) discard the result. Invalidations of other keys do
    /// not affect it.
    pub fn reserve(&self, key: &str) -> Reservation {
        let mut fills = self.fills.lock();
        let fill = fills.entry(key.to_owned()).or_insert(Fill {
            epoch: 0,
            reservations: 0,
        });
        fill.reservations += 1;

        Reservation {
            key: key.to_owned(),
            epoch: fill.epoch,
            fills: Arc::clone(&self.fills),
        }
    }

    /// Like [`put`](Self::put), but only if `key` was not invalidated since it was reserved.
    ///
    /// Returns whether the value was stored.
    pub fn put_reserved(&self, reservation: Reservation, value: User, ttl: Duration) -> bool {
        // Holding the entries lock keeps invalidations out until the value is in place.
        let mut entries = self.entries.write();
        let current = self
            .fills
            .lock()
            .get(&reservation.key)
            .is_some_and(|fill| fill.epoch == reservation.epoch);
        if !current {
            return false;
        }
        Self::insert(&mut entries, &reservation.key, value, ttl);
        true
    }

    /// Removes the entry for `key`, if any.
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.write();
        if let Some(fill) = self.fills.lock().get_mut(key) {
            fill.epoch += 1;
        }
        entries.remove(key);
    }

    /// The number of stored entries, including expired ones that were not looked up yet.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(entries: &mut HashMap<String, CacheEntry>, key: &str, value: User, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        entries.insert(key.to_owned(), entry);
        metric!(gauge("users.cache.entries") = entries.len() as u64);
    }
}

/// The right to write the result of one store read through to the cache.
///
/// Obtained from [`TtlCache::reserve`]. Dropping it without writing releases it.
pub struct Reservation {
    key: String,
    epoch: u64,
    fills: Fills,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("key", &self.key)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut fills = self.fills.lock();
        if let Some(fill) = fills.get_mut(&self.key) {
            fill.reservations -= 1;
            if fill.reservations == 0 {
                fills.remove(&self.key);
            }
        }
    }
}
