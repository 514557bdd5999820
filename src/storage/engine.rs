//! Sharded, expiring key-value map.
//!
//! ## Design
//!
//! Keys hash onto one of [`NUM_SHARDS`] independent `RwLock<HashMap>`s. A
//! single-key operation holds exactly one shard lock, and any
//! read-modify-write (GETSET, INCR, EXPIRE, ...) runs entirely under that
//! shard's write lock. That makes each operation atomic with respect to every
//! other operation on the same key while unrelated keys proceed in parallel.
//!
//! Multi-key operations (MSET, MSETNX, MGET) lock every shard they touch, in
//! ascending shard order, and hold them all until done. The fixed order keeps
//! two such operations from deadlocking.
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                  StorageEngine                    │
//! │  ┌─────────┐ ┌─────────┐           ┌─────────┐    │
//! │  │ Shard 0 │ │ Shard 1 │    ...    │ Shard 63│    │
//! │  │ RwLock  │ │ RwLock  │           │ RwLock  │    │
//! │  └─────────┘ └─────────┘           └─────────┘    │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Expiry
//!
//! An entry past its deadline is never returned. Read paths first try a
//! shared lock; when they find an expired entry they retake the shard for
//! writing and remove it (lazy eviction). The optional
//! [`ExpirySweeper`](crate::storage::ExpirySweeper) reclaims keys that are
//! never touched again.
//!
//! ## Integers
//!
//! Values are plain bytes. INCR and friends parse the stored bytes as a
//! base-10 `i64` on demand and write the result back as decimal text.
//! Overflow is an error and leaves the value untouched; it never wraps.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of independently locked shards.
pub const NUM_SHARDS: usize = 64;

/// Type tag reported by TYPE for every stored value.
pub const STRING_TYPE: &str = "string";

/// Failures of the integer operations. The `Display` text is the message a
/// client sees after the `ERR ` prefix.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("increment or decrement would overflow")]
    Overflow,
}

/// A stored value and its optional deadline.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    /// `None` means the entry never expires.
    pub expires_at: Option<Instant>,
}

impl Entry {
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Creates an entry that expires `ttl` from now. A ttl too large for
    /// `Instant` to represent yields an entry that never expires.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before expiry, `None` for persistent entries.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

type ShardWriteGuard<'a> = RwLockWriteGuard<'a, HashMap<Bytes, Entry>>;

#[derive(Debug, Default)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

impl Shard {
    // A panic while a guard was held cannot leave a map half-updated: every
    // mutation is a single insert/remove/assignment. Keep serving.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Bytes, Entry>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> ShardWriteGuard<'_> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The store shared by every connection and by direct embedded calls.
///
/// Wrap it in an `Arc` to share it; all methods take `&self`.
///
/// ```
/// use pocketkv::storage::StorageEngine;
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
/// engine.set(Bytes::from("n"), Bytes::from("41"));
/// assert_eq!(engine.incr(b"n"), Ok(42));
/// assert_eq!(engine.getset(Bytes::from("n"), Bytes::from("x")), Some(Bytes::from("42")));
/// assert_eq!(engine.get(b"n"), Some(Bytes::from("x")));
/// ```
pub struct StorageEngine {
    shards: Box<[Shard]>,

    /// Live plus not-yet-evicted keys. Only changed while holding a shard
    /// write lock, so it never drifts from the maps.
    key_count: AtomicU64,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("keys", &self.key_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Write-locks the shards of every key in `pairs`, lowest index first.
    /// Each guard comes with its pairs in their original order.
    fn lock_pairs<'p>(
        &self,
        pairs: &'p [(Bytes, Bytes)],
    ) -> Vec<(ShardWriteGuard<'_>, Vec<&'p (Bytes, Bytes)>)> {
        let mut groups: BTreeMap<usize, Vec<&'p (Bytes, Bytes)>> = BTreeMap::new();
        for pair in pairs {
            groups.entry(self.shard_index(&pair.0)).or_default().push(pair);
        }
        groups
            .into_iter()
            .map(|(index, group)| (self.shards[index].write(), group))
            .collect()
    }

    /// Removes `key` from an already locked shard if it has expired.
    fn evict_if_expired(&self, data: &mut HashMap<Bytes, Entry>, key: &[u8], now: Instant) {
        if matches!(data.get(key), Some(entry) if entry.is_expired_at(now)) {
            data.remove(key);
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Applies `f` to the live entry for `key`.
    ///
    /// Fast path under the read lock; falls back to the write lock only to
    /// evict an expired entry.
    fn read_live<T>(&self, key: &[u8], f: impl Fn(&Entry, Instant) -> T) -> Option<T> {
        let shard = self.shard(key);

        {
            let data = shard.read();
            let now = Instant::now();
            match data.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired_at(now) => return Some(f(entry, now)),
                Some(_) => {}
            }
        }

        let mut data = shard.write();
        let now = Instant::now();
        self.evict_if_expired(&mut data, key, now);
        // Another writer may have replaced the key between the two locks.
        data.get(key).map(|entry| f(entry, now))
    }

    /// Installs `entry`, keeping the key count in step. Returns the previous
    /// entry if it was still live.
    fn replace(
        &self,
        data: &mut HashMap<Bytes, Entry>,
        key: Bytes,
        entry: Entry,
        now: Instant,
    ) -> Option<Entry> {
        match data.insert(key, entry) {
            None => {
                self.key_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(old) if old.is_expired_at(now) => {
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(old) => Some(old),
        }
    }

    /// Returns the value of `key`, or `None` if it is missing or expired.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.read_live(key, |entry, _| entry.value.clone())
    }

    /// Stores `value` under `key`, discarding any previous value and expiry.
    ///
    /// Returns `true` if no live value existed before.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.set_entry(key, Entry::new(value))
    }

    /// Stores `value` under `key` with a time-to-live.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> bool {
        self.set_entry(key, Entry::with_ttl(value, ttl))
    }

    fn set_entry(&self, key: Bytes, entry: Entry) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(&key).write();
        self.replace(&mut data, key, entry, Instant::now()).is_none()
    }

    /// Atomically replaces the value of `key` and returns the previous live
    /// value. The new value never expires.
    pub fn getset(&self, key: Bytes, value: Bytes) -> Option<Bytes> {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(&key).write();
        self.replace(&mut data, key, Entry::new(value), Instant::now())
            .map(|old| old.value)
    }

    /// Stores `value` under `key` only if no live value exists. Returns
    /// whether it was stored.
    pub fn set_nx(&self, key: Bytes, value: Bytes) -> bool {
        let mut data = self.shard(&key).write();
        let now = Instant::now();
        self.evict_if_expired(&mut data, &key, now);

        if data.contains_key(&key) {
            return false;
        }
        self.set_count.fetch_add(1, Ordering::Relaxed);
        self.replace(&mut data, key, Entry::new(value), now);
        true
    }

    /// Appends `value` to the value of `key`, creating it if missing, and
    /// returns the new length. An existing expiry is kept.
    pub fn append(&self, key: &[u8], value: &[u8]) -> usize {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(key).write();
        let now = Instant::now();
        self.evict_if_expired(&mut data, key, now);

        if let Some(entry) = data.get_mut(key) {
            let mut joined = Vec::with_capacity(entry.value.len() + value.len());
            joined.extend_from_slice(&entry.value);
            joined.extend_from_slice(value);
            entry.value = Bytes::from(joined);
            return entry.value.len();
        }

        let entry = Entry::new(Bytes::copy_from_slice(value));
        self.replace(&mut data, Bytes::copy_from_slice(key), entry, now);
        value.len()
    }

    /// Stores every pair at once; no reader sees some of them applied and
    /// others not. A key given twice ends with its last value.
    pub fn mset(&self, pairs: &[(Bytes, Bytes)]) {
        self.set_count.fetch_add(pairs.len() as u64, Ordering::Relaxed);

        let mut locked = self.lock_pairs(pairs);
        let now = Instant::now();
        for (data, group) in locked.iter_mut() {
            for (key, value) in group.iter() {
                self.replace(data, key.clone(), Entry::new(value.clone()), now);
            }
        }
    }

    /// Like [`mset`](Self::mset), but stores nothing if any of the keys
    /// holds a live value. Returns whether the pairs were stored.
    pub fn mset_nx(&self, pairs: &[(Bytes, Bytes)]) -> bool {
        let mut locked = self.lock_pairs(pairs);
        let now = Instant::now();

        let any_live = locked.iter().any(|(data, group)| {
            group
                .iter()
                .any(|(key, _)| matches!(data.get(key), Some(entry) if !entry.is_expired_at(now)))
        });
        if any_live {
            return false;
        }

        self.set_count.fetch_add(pairs.len() as u64, Ordering::Relaxed);
        for (data, group) in locked.iter_mut() {
            for (key, value) in group.iter() {
                self.replace(data, key.clone(), Entry::new(value.clone()), now);
            }
        }
        true
    }

    /// Values of `keys` in order, read under one consistent set of shard
    /// locks. Expired entries read as `None` and are left for eviction.
    pub fn mget(&self, keys: &[Bytes]) -> Vec<Option<Bytes>> {
        self.get_count.fetch_add(keys.len() as u64, Ordering::Relaxed);

        let indices: Vec<usize> = keys.iter().map(|key| self.shard_index(key)).collect();
        let mut order = indices.clone();
        order.sort_unstable();
        order.dedup();

        let guards: Vec<(usize, RwLockReadGuard<'_, HashMap<Bytes, Entry>>)> = order
            .into_iter()
            .map(|index| (index, self.shards[index].read()))
            .collect();
        let now = Instant::now();

        keys.iter()
            .zip(&indices)
            .map(|(key, index)| {
                let (_, data) = guards.iter().find(|(locked, _)| locked == index)?;
                data.get(key)
                    .filter(|entry| !entry.is_expired_at(now))
                    .map(|entry| entry.value.clone())
            })
            .collect()
    }

    /// Removes `key`. Returns `true` only if a live value was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.shard(key).write();
        match data.remove(key) {
            None => false,
            Some(entry) => {
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                if entry.is_expired() {
                    self.expired_count.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Returns whether `key` holds a live value.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.read_live(key, |_, _| ()).is_some()
    }

    /// Returns the type tag of `key`, or `None` if it is missing or expired.
    pub fn key_type(&self, key: &[u8]) -> Option<&'static str> {
        self.read_live(key, |_, _| STRING_TYPE)
    }

    /// Adds one to the integer stored at `key`, treating a missing key as 0.
    pub fn incr(&self, key: &[u8]) -> Result<i64, StorageError> {
        self.incr_by(key, 1)
    }

    /// Subtracts one from the integer stored at `key`.
    pub fn decr(&self, key: &[u8]) -> Result<i64, StorageError> {
        self.incr_by(key, -1)
    }

    /// Subtracts `delta` from the integer stored at `key`.
    pub fn decr_by(&self, key: &[u8], delta: i64) -> Result<i64, StorageError> {
        let delta = delta.checked_neg().ok_or(StorageError::Overflow)?;
        self.incr_by(key, delta)
    }

    /// Adds `delta` to the integer stored at `key`, treating a missing key
    /// as 0, and returns the new value.
    ///
    /// An existing expiry is kept. On error the stored value is unchanged.
    pub fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, StorageError> {
        let mut data = self.shard(key).write();
        let now = Instant::now();
        self.evict_if_expired(&mut data, key, now);

        if let Some(entry) = data.get_mut(key) {
            let current = parse_i64(&entry.value).ok_or(StorageError::NotAnInteger)?;
            let next = current.checked_add(delta).ok_or(StorageError::Overflow)?;
            entry.value = Bytes::from(next.to_string());
            return Ok(next);
        }

        let entry = Entry::new(Bytes::from(delta.to_string()));
        self.replace(&mut data, Bytes::copy_from_slice(key), entry, now);
        Ok(delta)
    }

    /// Sets `key` to expire `ttl` from now.
    ///
    /// Returns `false`, changing nothing, if the key is missing or expired.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let mut data = self.shard(key).write();
        let now = Instant::now();
        self.evict_if_expired(&mut data, key, now);

        match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = now.checked_add(ttl);
                true
            }
            None => false,
        }
    }

    /// Remaining time to live in seconds, rounded to the nearest second.
    ///
    /// `None` if the key is missing, `Some(-1)` if it never expires.
    pub fn ttl(&self, key: &[u8]) -> Option<i64> {
        self.read_live(key, |entry, now| match entry.remaining(now) {
            Some(left) => ((left.as_millis() + 500) / 1000) as i64,
            None => -1,
        })
    }

    /// Remaining time to live in milliseconds, with the same conventions as
    /// [`ttl`](Self::ttl).
    pub fn pttl(&self, key: &[u8]) -> Option<i64> {
        self.read_live(key, |entry, now| match entry.remaining(now) {
            Some(left) => left.as_millis() as i64,
            None => -1,
        })
    }

    /// Number of stored keys, including expired keys not yet evicted.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry from every shard and returns how many
    /// were removed.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in self.shards.iter() {
            let mut data = shard.write();
            let now = Instant::now();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired_at(now));
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    /// Entries removed because their deadline passed.
    pub expired: u64,
}

/// Parses a strict base-10 `i64`: optional `-`, no `+`, no surrounding
/// whitespace, no leading zeros.
pub fn parse_i64(bytes: &[u8]) -> Option<i64> {
    let digits = bytes.strip_prefix(b"-").unwrap_or(bytes);
    match digits {
        [] => return None,
        [b'0', _, ..] => return None,
        _ if !digits.iter().all(u8::is_ascii_digit) => return None,
        _ => {}
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
