//! Recently sent payloads, kept so retry receipts can be answered, and the
//! bounded per-message bookkeeping beside them.
//!
//! A fixed ring: inserting into a full cache overwrites the oldest entry and
//! nothing else ever evicts.

use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::PoisonError;

use async_trait::async_trait;
use courier_shared::ids::Jid;
use tokio::sync::Mutex;

use crate::payload::MessagePayload;

/// Application-provided fallback for payloads that fell out of the cache.
#[async_trait]
pub trait MessageLookup: Send + Sync {
    async fn lookup(&self, chat: &Jid, message_id: &str) -> Option<MessagePayload>;
}

type Key = (Jid, String);

struct Ring {
    slots: Vec<Option<(Key, MessagePayload)>>,
    positions: HashMap<Key, usize>,
    next: usize,
}

pub struct RecentMessages {
    ring: Mutex<Ring>,
}

impl RecentMessages {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                positions: HashMap::with_capacity(capacity),
                next: 0,
            }),
        }
    }

    pub async fn insert(&self, chat: Jid, message_id: String, payload: MessagePayload) {
        let mut ring = self.ring.lock().await;
        let key = (chat, message_id);
        if let Some(&slot) = ring.positions.get(&key) {
            ring.slots[slot] = Some((key, payload));
            return;
        }

        let slot = ring.next;
        let previous = ring.slots[slot].take();
        if let Some((evicted, _)) = previous {
            ring.positions.remove(&evicted);
        }
        ring.positions.insert(key.clone(), slot);
        ring.slots[slot] = Some((key, payload));
        ring.next = (slot + 1) % ring.slots.len();
    }

    pub async fn get(&self, chat: &Jid, message_id: &str) -> Option<MessagePayload> {
        let ring = self.ring.lock().await;
        let slot = *ring.positions.get(&(*chat, message_id.to_string()))?;
        ring.slots[slot].as_ref().map(|(_, payload)| payload.clone())
    }

    /// Cache first, then the application's lookup.
    pub async fn find(
        &self,
        lookup: Option<&dyn MessageLookup>,
        chat: &Jid,
        message_id: &str,
    ) -> Option<MessagePayload> {
        if let Some(payload) = self.get(chat, message_id).await {
            return Some(payload);
        }
        match lookup {
            Some(lookup) => lookup.lookup(chat, message_id).await,
            None => None,
        }
    }

    /// Any cached payload with this id, whatever chat it went to. Our own
    /// other devices ask by id alone.
    pub async fn find_by_id(&self, message_id: &str) -> Option<(Jid, MessagePayload)> {
        let ring = self.ring.lock().await;
        ring.slots
            .iter()
            .flatten()
            .find(|((_, id), _)| id == message_id)
            .map(|((chat, _), payload)| (*chat, payload.clone()))
    }

    pub async fn len(&self) -> usize {
        self.ring.lock().await.positions.len()
    }
}

/// Per-message bookkeeping that must not outlive a burst of traffic: past
/// `capacity` keys, the oldest inserted key is forgotten.
pub struct BoundedMap<K, V> {
    inner: std::sync::Mutex<Bounded<K, V>>,
}

struct Bounded<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> Bounded<K, V> {
    /// Track a new key, evicting the oldest ones if the map is full.
    fn admit(&mut self, key: &K) {
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
    }
}

impl<K: Hash + Eq + Clone, V> BoundedMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: std::sync::Mutex::new(Bounded {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bounded<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: K, value: V) {
        let mut map = self.lock();
        if !map.entries.contains_key(&key) {
            map.admit(&key);
        }
        map.entries.insert(key, value);
    }

    /// Run `f` on the value for `key`, starting from `V::default()` when the
    /// key is new.
    pub fn with_entry<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        let mut map = self.lock();
        if !map.entries.contains_key(&key) {
            map.admit(&key);
        }
        f(map.entries.entry(key).or_default())
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.lock().entries.get(key).cloned()
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut map = self.lock();
        let value = map.entries.remove(key)?;
        map.order.retain(|k| k.borrow() != key);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }
}
