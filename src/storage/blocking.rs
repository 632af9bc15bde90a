//! Wait-sets for blocking list pops.
//!
//! A client blocked in BLPOP registers one waiter that is queued on every key
//! it listens to. Pushes hand elements straight to the oldest live waiter of
//! the key through a oneshot channel, so a woken client never has to race other
//! clients for the element it was woken for.
//!
//! The registry lives inside the keyspace and is only touched while the store
//! guard is held. Per-key queues are dropped as soon as they empty out, so keys
//! that were once waited on leave nothing behind.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Identifier of a registered waiter.
pub type WaiterId = u64;

/// What a served waiter receives: the key it was served from and the element.
pub type Popped = (Bytes, Bytes);

#[derive(Debug)]
struct Waiter {
    tx: oneshot::Sender<Popped>,
    keys: Vec<Bytes>,
}

/// Registry of clients blocked on list keys.
#[derive(Debug, Default)]
pub struct WaitRegistry {
    /// Live waiters by id
    waiters: HashMap<WaiterId, Waiter>,
    /// Waiter ids per key, oldest first
    queues: HashMap<Bytes, VecDeque<WaiterId>>,
    next_id: WaiterId,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter on all of `keys`.
    ///
    /// The receiver resolves once a push to one of the keys hands an element
    /// over. The waiter is removed from every key when it is served.
    pub fn register(&mut self, keys: &[Bytes]) -> (WaiterId, oneshot::Receiver<Popped>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut unique: Vec<Bytes> = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(key) {
                unique.push(key.clone());
            }
        }

        for key in &unique {
            self.queues.entry(key.clone()).or_default().push_back(id);
        }
        self.waiters.insert(id, Waiter { tx, keys: unique });

        (id, rx)
    }

    /// Removes a waiter from every queue it is in. Unknown ids are ignored, a
    /// served waiter has already been removed.
    pub fn unregister(&mut self, id: WaiterId) {
        if let Some(waiter) = self.waiters.remove(&id) {
            for key in &waiter.keys {
                self.remove_from_queue(key, id);
            }
        }
    }

    /// Takes the oldest waiter blocked on `key` out of the registry and returns
    /// its sender. Waiters whose client has gone away are discarded on the way.
    pub fn take_next(&mut self, key: &[u8]) -> Option<oneshot::Sender<Popped>> {
        loop {
            let queue = self.queues.get_mut(key)?;
            let Some(id) = queue.pop_front() else {
                self.queues.remove(key);
                return None;
            };
            if queue.is_empty() {
                self.queues.remove(key);
            }

            let Some(waiter) = self.waiters.remove(&id) else {
                continue;
            };
            for other in waiter.keys.iter().filter(|k| k[..] != *key) {
                self.remove_from_queue(other, id);
            }

            if waiter.tx.is_closed() {
                continue;
            }
            return Some(waiter.tx);
        }
    }

    /// Whether any client is blocked on `key`.
    pub fn has_waiters(&self, key: &[u8]) -> bool {
        self.queues.contains_key(key)
    }

    /// Number of clients currently blocked.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Number of keys with at least one waiter.
    pub fn watched_keys(&self) -> usize {
        self.queues.len()
    }

    fn remove_from_queue(&mut self, key: &[u8], id: WaiterId) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.retain(|queued| *queued != id);
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }
}
