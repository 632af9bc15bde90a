//! Keyspace and Storage Engine
//!
//! All keyed state lives in one [`Keyspace`] behind a single mutex. Every
//! command runs its read/modify logic while holding that guard, which makes
//! each command atomic with respect to every other command on every key.
//! Decoding and encoding happen outside the guard, so connections still do
//! their I/O in parallel.
//!
//! ## Design Decisions
//!
//! 1. **One map, one kind per key**: keys map to a single [`Value`] variant, so
//!    a key can never exist as a string and a list at the same time. Operations
//!    against the wrong variant fail with [`StorageError::WrongType`].
//! 2. **Lazy + active expiry**: expired strings are treated as absent on every
//!    access and physically removed by the expiry sweeper.
//! 3. **Direct handoff to blocked clients**: pushes serve BLPOP waiters while the
//!    guard is still held, so an element is delivered to exactly one client.
//! 4. **No empty lists**: popping the last element removes the key.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      StorageEngine                        │
//! │  Mutex<Keyspace>                                          │
//! │  ┌──────────────────┐ ┌──────────────┐ ┌───────────────┐  │
//! │  │ entries          │ │ expiries     │ │ waiters       │  │
//! │  │ key -> Value     │ │ deadline idx │ │ BLPOP queues  │  │
//! │  └──────────────────┘ └──────────────┘ └───────────────┘  │
//! │  Notify ──> ExpirySweeper                                 │
//! └───────────────────────────────────────────────────────────┘
//! ```

use crate::storage::blocking::{Popped, WaitRegistry, WaiterId};
use crate::storage::expiry::{ExpiryIndex, Generation};
use crate::storage::stream::{Fields, IdRequest, Stream, StreamEntry, StreamId, StreamIdError};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{futures::Notified, oneshot, Notify};
use tracing::{debug, trace};

/// Errors returned by keyspace operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The key holds a different kind of value than the operation expects
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// A stream id was malformed or not strictly increasing
    #[error(transparent)]
    StreamId(#[from] StreamIdError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A string value with optional expiry.
#[derive(Debug, Clone)]
pub struct StringValue {
    /// The actual value stored
    pub data: Bytes,
    /// When this value expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// Stamp of the write that produced this value
    pub generation: Generation,
}

impl StringValue {
    /// Checks if this value has expired at `now`.
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// The value stored at a key.
#[derive(Debug, Clone)]
pub enum Value {
    String(StringValue),
    List(VecDeque<Bytes>),
    Stream(Stream),
}

impl Value {
    /// The name TYPE reports for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Stream(_) => "stream",
        }
    }
}

/// Which end of a list to pop from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Front,
    Back,
}

/// Everything guarded by the store mutex.
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<Bytes, Value>,
    expiries: ExpiryIndex,
    waiters: WaitRegistry,
    next_generation: Generation,
}

impl Keyspace {
    /// Drops `key` if it is a string past its deadline. Returns true if dropped.
    fn evict_if_expired(&mut self, key: &[u8], now: Instant) -> bool {
        let expired = matches!(
            self.entries.get(key),
            Some(Value::String(s)) if s.is_expired_at(now)
        );
        if expired {
            self.remove(key);
        }
        expired
    }

    /// Looks up a live value, applying lazy expiry first.
    fn live(&mut self, key: &[u8], now: Instant) -> Option<&mut Value> {
        self.evict_if_expired(key, now);
        self.entries.get_mut(key)
    }

    /// Removes a key, cancelling any deadline attached to it.
    fn remove(&mut self, key: &[u8]) -> Option<Value> {
        let (key, value) = self.entries.remove_entry(key)?;
        if let Value::String(StringValue {
            expires_at: Some(at),
            generation,
            ..
        }) = &value
        {
            self.expiries.cancel(*at, *generation, &key);
        }
        Some(value)
    }

    /// Returns the list at `key`, creating it if the key is absent.
    fn list_or_create(&mut self, key: &Bytes, now: Instant) -> StorageResult<&mut VecDeque<Bytes>> {
        self.evict_if_expired(key, now);
        match self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(list) => Ok(list),
            _ => Err(StorageError::WrongType),
        }
    }

    /// Returns the list at `key` if it exists.
    fn list(&mut self, key: &[u8], now: Instant) -> StorageResult<Option<&mut VecDeque<Bytes>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(StorageError::WrongType),
        }
    }

    /// Returns the stream at `key` if it exists.
    fn stream(&mut self, key: &[u8], now: Instant) -> StorageResult<Option<&mut Stream>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Value::Stream(stream)) => Ok(Some(stream)),
            Some(_) => Err(StorageError::WrongType),
        }
    }

    /// Hands elements of the list at `key` to blocked clients, oldest first,
    /// until either runs out. Returns how many clients were served.
    fn serve_waiters(&mut self, key: &Bytes) -> usize {
        let mut served = 0;

        while self.waiters.has_waiters(key) {
            let Some(Value::List(list)) = self.entries.get_mut(key) else {
                break;
            };
            let Some(value) = list.pop_front() else {
                break;
            };
            let Some(tx) = self.waiters.take_next(key) else {
                list.push_front(value);
                break;
            };

            match tx.send((key.clone(), value)) {
                Ok(()) => served += 1,
                // Receiver vanished between the liveness check and the send
                Err((_, value)) => {
                    if let Some(Value::List(list)) = self.entries.get_mut(key) {
                        list.push_front(value);
                    }
                }
            }
        }

        self.drop_if_empty_list(key);
        served
    }

    fn drop_if_empty_list(&mut self, key: &[u8]) {
        if matches!(self.entries.get(key), Some(Value::List(list)) if list.is_empty()) {
            self.entries.remove(key);
        }
    }
}

/// The shared data store.
///
/// Wrap it in an `Arc` and share it across all connection tasks. All
/// operations take the store guard for their whole duration, except
/// [`blpop`](Self::blpop) which releases it while waiting.
///
/// # Example
///
/// ```
/// use streamkv::storage::StorageEngine;
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"), None);
/// assert_eq!(engine.get(&Bytes::from("name")), Ok(Some(Bytes::from("Ariz"))));
///
/// engine.rpush(Bytes::from("queue"), vec![Bytes::from("a"), Bytes::from("b")]).unwrap();
/// assert_eq!(engine.key_type(&Bytes::from("queue")), "list");
/// ```
pub struct StorageEngine {
    keyspace: Mutex<Keyspace>,

    /// Wakes the expiry sweeper when an earlier deadline is scheduled
    expiry_notify: Notify,

    /// Statistics: keys removed by expiry, lazily or by the sweeper
    expired_count: AtomicU64,

    /// Statistics: elements handed directly to blocked clients
    handoff_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("keys", &self.len())
            .field("expired", &self.expired_count.load(Ordering::Relaxed))
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
            keyspace: Mutex::new(Keyspace::default()),
            expiry_notify: Notify::new(),
            expired_count: AtomicU64::new(0),
            handoff_count: AtomicU64::new(0),
        }
    }

    /// Acquires the store guard.
    ///
    /// Every operation leaves the keyspace consistent before it can panic, so a
    /// poisoned guard is safe to keep using.
    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies lazy expiry to `key` and records it in the stats.
    fn evict_if_expired(&self, keyspace: &mut Keyspace, key: &[u8], now: Instant) {
        if keyspace.evict_if_expired(key, now) {
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // STRING OPERATIONS
    // ========================================================================

    /// Stores a string, replacing whatever the key held before (of any kind).
    ///
    /// With a `ttl` the key expires that long from now. A deadline attached to
    /// the previous value is cancelled.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut keyspace = self.lock();

        keyspace.remove(&key);

        let generation = keyspace.next_generation;
        keyspace.next_generation += 1;

        // A deadline past what Instant can represent never fires
        let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        if let Some(at) = expires_at {
            if keyspace.expiries.schedule(at, generation, key.clone()) {
                self.expiry_notify.notify_one();
            }
        }

        keyspace.entries.insert(
            key,
            Value::String(StringValue {
                data: value,
                expires_at,
                generation,
            }),
        );
    }

    /// Gets the string at `key`.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    pub fn get(&self, key: &Bytes) -> StorageResult<Option<Bytes>> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        match keyspace.entries.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.data.clone())),
            Some(_) => Err(StorageError::WrongType),
        }
    }

    /// Remaining time to live of a string key, `None` if absent or persistent.
    #[cfg(test)]
    fn ttl(&self, key: &Bytes) -> Option<Duration> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        match keyspace.entries.get(key) {
            Some(Value::String(StringValue {
                expires_at: Some(at),
                ..
            })) => Some(at.saturating_duration_since(now)),
            _ => None,
        }
    }

    /// Returns the type of a key: "string", "list", "stream" or "none".
    pub fn key_type(&self, key: &Bytes) -> &'static str {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        keyspace
            .entries
            .get(key)
            .map(Value::type_name)
            .unwrap_or("none")
    }

    // ========================================================================
    // LIST OPERATIONS
    // ========================================================================

    /// Pushes values to the head of a list, one at a time in argument order,
    /// so `LPUSH key a b c` yields `[c, b, a]`. Creates the list if absent.
    ///
    /// Returns the list length after the push, before any blocked client is
    /// served from it.
    pub fn lpush(&self, key: Bytes, values: Vec<Bytes>) -> StorageResult<usize> {
        self.push(key, values, ListEnd::Front)
    }

    /// Pushes values to the tail of a list. Creates the list if absent.
    pub fn rpush(&self, key: Bytes, values: Vec<Bytes>) -> StorageResult<usize> {
        self.push(key, values, ListEnd::Back)
    }

    fn push(&self, key: Bytes, values: Vec<Bytes>, end: ListEnd) -> StorageResult<usize> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, &key, now);

        let list = keyspace.list_or_create(&key, now)?;
        for value in values {
            match end {
                ListEnd::Front => list.push_front(value),
                ListEnd::Back => list.push_back(value),
            }
        }
        let len = list.len();

        let served = keyspace.serve_waiters(&key);
        if served > 0 {
            self.handoff_count.fetch_add(served as u64, Ordering::Relaxed);
            debug!(key = ?key, served = served, "Served blocked clients");
        }

        Ok(len)
    }

    /// Removes up to `count` elements from one end of a list.
    ///
    /// Returns an empty vector if the key is absent.
    pub fn pop(&self, key: &Bytes, end: ListEnd, count: usize) -> StorageResult<Vec<Bytes>> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        let Some(list) = keyspace.list(key, now)? else {
            return Ok(Vec::new());
        };

        let take = count.min(list.len());
        let popped: Vec<Bytes> = match end {
            ListEnd::Front => list.drain(..take).collect(),
            ListEnd::Back => list.drain(list.len() - take..).rev().collect(),
        };

        keyspace.drop_if_empty_list(key);
        Ok(popped)
    }

    /// Removes and returns the first element of a list.
    pub fn lpop(&self, key: &Bytes) -> StorageResult<Option<Bytes>> {
        Ok(self.pop(key, ListEnd::Front, 1)?.pop())
    }

    /// Removes and returns the last element of a list.
    pub fn rpop(&self, key: &Bytes) -> StorageResult<Option<Bytes>> {
        Ok(self.pop(key, ListEnd::Back, 1)?.pop())
    }

    /// Returns the length of a list, 0 if the key doesn't exist.
    pub fn llen(&self, key: &Bytes) -> StorageResult<usize> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        Ok(keyspace.list(key, now)?.map_or(0, |list| list.len()))
    }

    /// Returns the inclusive range `[start, stop]` of a list.
    ///
    /// Negative indices count from the end. After that, a start below zero is
    /// clamped to 0 and a stop past the end to the last index; an empty range
    /// yields an empty vector.
    pub fn lrange(&self, key: &Bytes, start: i64, stop: i64) -> StorageResult<Vec<Bytes>> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        let Some(list) = keyspace.list(key, now)? else {
            return Ok(Vec::new());
        };

        Ok(match normalize_range(start, stop, list.len()) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    /// Pops the head of the first non-empty list among `keys`, waiting for a
    /// push if they are all empty or absent.
    ///
    /// `timeout` of `None` waits forever. Returns `Ok(None)` if the timeout
    /// elapses first. The store guard is released for the whole wait. If the
    /// returned future is dropped mid-wait (the client went away), the waiter
    /// is unregistered and an element already handed to it is put back.
    pub async fn blpop(
        &self,
        keys: &[Bytes],
        timeout: Option<Duration>,
    ) -> StorageResult<Option<Popped>> {
        let mut rx = {
            let now = Instant::now();
            let mut keyspace = self.lock();

            for key in keys {
                self.evict_if_expired(&mut keyspace, key, now);
                if let Some(list) = keyspace.list(key, now)? {
                    if let Some(value) = list.pop_front() {
                        keyspace.drop_if_empty_list(key);
                        return Ok(Some((key.clone(), value)));
                    }
                }
            }

            let (id, rx) = keyspace.waiters.register(keys);
            trace!(waiter = id, keys = keys.len(), "Client blocked");
            PendingPop {
                engine: self,
                id,
                rx: Some(rx),
            }
        };

        let outcome = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx.wait()).await.ok(),
            None => Some(rx.wait().await),
        };

        match outcome {
            Some(Some(popped)) => {
                rx.finish();
                Ok(Some(popped))
            }
            // Timed out, or the registry dropped us
            _ => Ok(rx.cancel()),
        }
    }

    /// Number of clients blocked in [`blpop`](Self::blpop).
    pub fn blocked_clients(&self) -> usize {
        self.lock().waiters.len()
    }

    // ========================================================================
    // STREAM OPERATIONS
    // ========================================================================

    /// Appends an entry to the stream at `key`, creating the stream if absent.
    ///
    /// Returns the id the entry was stored under. A rejected id leaves the
    /// keyspace untouched; in particular no empty stream is created.
    pub fn xadd(&self, key: Bytes, request: IdRequest, fields: Fields) -> StorageResult<StreamId> {
        let now = Instant::now();
        let now_ms = unix_millis();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, &key, now);

        if let Some(stream) = keyspace.stream(&key, now)? {
            return Ok(stream.append(request, fields, now_ms)?);
        }

        let mut stream = Stream::new();
        let id = stream.append(request, fields, now_ms)?;
        keyspace.entries.insert(key, Value::Stream(stream));
        Ok(id)
    }

    /// Entries of the stream at `key` with `start <= id <= end`.
    pub fn xrange(
        &self,
        key: &Bytes,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> StorageResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        Ok(keyspace
            .stream(key, now)?
            .map(|stream| stream.range(start, end, count))
            .unwrap_or_default())
    }

    /// Number of entries in the stream at `key`, 0 if absent.
    pub fn xlen(&self, key: &Bytes) -> StorageResult<usize> {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, key, now);

        Ok(keyspace.stream(key, now)?.map_or(0, |stream| stream.len()))
    }

    // ========================================================================
    // EXPIRY + HOUSEKEEPING
    // ========================================================================

    /// Removes up to `limit` strings whose deadline has passed.
    ///
    /// Returns how many keys were removed and the next pending deadline.
    /// A deadline only removes the key if the key still holds the exact write
    /// that scheduled it.
    pub fn purge_expired(&self, limit: usize) -> (usize, Option<Instant>) {
        let now = Instant::now();
        let mut keyspace = self.lock();
        let mut removed = 0;

        while removed < limit {
            let Some((generation, key)) = keyspace.expiries.pop_due(now) else {
                break;
            };

            let current = matches!(
                keyspace.entries.get(&key),
                Some(Value::String(s)) if s.generation == generation
            );
            if current {
                keyspace.entries.remove(&key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.expired_count.fetch_add(removed as u64, Ordering::Relaxed);
        }

        (removed, keyspace.expiries.next_deadline())
    }

    /// Resolves when a deadline earlier than every pending one is scheduled.
    pub fn expiry_rescheduled(&self) -> Notified<'_> {
        self.expiry_notify.notified()
    }

    /// Number of keys physically present, including expired strings that have
    /// not been removed yet.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns store statistics.
    pub fn stats(&self) -> StorageStats {
        let keyspace = self.lock();
        StorageStats {
            keys: keyspace.entries.len(),
            pending_expiries: keyspace.expiries.len(),
            blocked_clients: keyspace.waiters.len(),
            expired: self.expired_count.load(Ordering::Relaxed),
            handoffs: self.handoff_count.load(Ordering::Relaxed),
        }
    }

    fn unregister_waiter(&self, id: WaiterId, rx: &mut oneshot::Receiver<Popped>) -> Option<Popped> {
        let mut keyspace = self.lock();
        keyspace.waiters.unregister(id);

        // Pushes send under the guard, so once we hold it nothing new can arrive
        rx.try_recv().ok()
    }

    /// Puts an element that was handed to a vanished client back at the head
    /// of its list and offers it to the next waiter.
    fn restore(&self, (key, value): Popped) {
        let now = Instant::now();
        let mut keyspace = self.lock();
        self.evict_if_expired(&mut keyspace, &key, now);

        match keyspace.list_or_create(&key, now) {
            Ok(list) => list.push_front(value),
            Err(_) => {
                debug!(key = ?key, "Dropping element handed to a closed client, key changed type");
                return;
            }
        }
        keyspace.serve_waiters(&key);
    }
}

/// A registered BLPOP waiter. Unregisters itself when dropped.
struct PendingPop<'a> {
    engine: &'a StorageEngine,
    id: WaiterId,
    rx: Option<oneshot::Receiver<Popped>>,
}

impl PendingPop<'_> {
    /// Waits for a handoff. `None` if the sender was dropped without sending.
    async fn wait(&mut self) -> Option<Popped> {
        match self.rx.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }

    /// The waiter was served and its element consumed.
    fn finish(&mut self) {
        self.rx = None;
    }

    /// Unregisters the waiter, returning an element that was handed over in
    /// the meantime.
    fn cancel(&mut self) -> Option<Popped> {
        let mut rx = self.rx.take()?;
        let popped = self.engine.unregister_waiter(self.id, &mut rx);
        if popped.is_none() {
            trace!(waiter = self.id, "Blocked client timed out");
        }
        popped
    }
}

impl Drop for PendingPop<'_> {
    fn drop(&mut self) {
        if self.rx.is_some() {
            if let Some(popped) = self.cancel() {
                self.engine.restore(popped);
            }
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Keys physically present
    pub keys: usize,
    /// String deadlines not yet reached or swept
    pub pending_expiries: usize,
    /// Clients blocked in BLPOP
    pub blocked_clients: usize,
    /// Keys removed by expiry
    pub expired: u64,
    /// Elements handed directly to blocked clients
    pub handoffs: u64,
}

/// Normalizes an inclusive `[start, stop]` range over a sequence of `len`
/// elements into in-bounds indices, or `None` if the range is empty.
pub fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }

    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if start > stop || start >= len {
        return None;
    }

    Some((start as usize, stop as usize))
}

/// Milliseconds since the Unix epoch.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
