// src/engine/keyspace.rs

//! Sharded keyspace: every key maps to exactly one typed [`Value`].
//!
//! The shard is the unit of locking. A [`LockSet`] takes the shards of all the
//! keys a command (or a whole batch) references, always in ascending shard
//! index order, so two lock sets can never wait on each other in a cycle.
//!
//! All container access goes through the typed accessors generated below;
//! they perform lazy expiry and the type check in one place.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use parking_lot::{Mutex, MutexGuard};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, StoreError};
use crate::expire::ExpiryIndex;
use crate::types::stream::Stream;
use crate::types::zset::SortedSet;

/// The value bound to a key.
#[derive(Debug, Clone)]
pub enum Value {
    String(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    SortedSet(SortedSet),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Stream(Stream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    List,
    Set,
    SortedSet,
    Hash,
    Stream,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Set => "set",
            ValueType::SortedSet => "zset",
            ValueType::Hash => "hash",
            ValueType::Stream => "stream",
        }
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::List(_) => ValueType::List,
            Value::Set(_) => ValueType::Set,
            Value::SortedSet(_) => ValueType::SortedSet,
            Value::Hash(_) => ValueType::Hash,
            Value::Stream(_) => ValueType::Stream,
        }
    }

    /// Collections that drop to zero elements lose their key.
    /// Strings and streams survive empty.
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::String(_) | Value::Stream(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<u64>,
}

/// One lockable slice of the keyspace.
#[derive(Debug, Default)]
pub struct Shard {
    entries: HashMap<Vec<u8>, Entry>,
    expiry: ExpiryIndex,
    // keys removed by lazy expiry since the last `take_evicted`
    evicted: Vec<Vec<u8>>,
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $or_create:ident, $variant:ident, $ty:ty) => {
        pub fn $get(&mut self, key: &[u8], now: u64) -> Result<Option<&$ty>> {
            match self.value(key, now) {
                None => Ok(None),
                Some(Value::$variant(v)) => Ok(Some(v)),
                Some(_) => Err(StoreError::WrongType),
            }
        }

        pub fn $get_mut(&mut self, key: &[u8], now: u64) -> Result<Option<&mut $ty>> {
            self.drop_if_expired(key, now);
            match self.entries.get_mut(key) {
                None => Ok(None),
                Some(Entry { value: Value::$variant(v), .. }) => Ok(Some(v)),
                Some(_) => Err(StoreError::WrongType),
            }
        }

        /// Binds a fresh, empty container when the key is absent.
        pub fn $or_create(&mut self, key: &[u8], now: u64) -> Result<&mut $ty> {
            self.drop_if_expired(key, now);
            let entry = self.entries.entry(key.to_vec()).or_insert_with(|| Entry {
                value: Value::$variant(Default::default()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::$variant(v) => Ok(v),
                _ => Err(StoreError::WrongType),
            }
        }
    };
}

impl Shard {
    typed_access!(string, string_mut, string_or_create, String, Vec<u8>);
    typed_access!(list, list_mut, list_or_create, List, VecDeque<Vec<u8>>);
    typed_access!(set, set_mut, set_or_create, Set, HashSet<Vec<u8>>);
    typed_access!(zset, zset_mut, zset_or_create, SortedSet, SortedSet);
    typed_access!(hash, hash_mut, hash_or_create, Hash, HashMap<Vec<u8>, Vec<u8>>);
    typed_access!(stream, stream_mut, stream_or_create, Stream, Stream);

    /// 惰性过期：deadline 已过则删除，返回是否删除
    fn drop_if_expired(&mut self, key: &[u8], now: u64) -> bool {
        if self.is_expired(key, now) {
            self.remove(key);
            self.evicted.push(key.to_vec());
            true
        } else {
            false
        }
    }

    pub fn is_expired(&self, key: &[u8], now: u64) -> bool {
        self.entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now)
    }

    pub fn value(&mut self, key: &[u8], now: u64) -> Option<&Value> {
        self.drop_if_expired(key, now);
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains(&mut self, key: &[u8], now: u64) -> bool {
        self.value(key, now).is_some()
    }

    pub fn value_type(&mut self, key: &[u8], now: u64) -> Option<ValueType> {
        self.value(key, now).map(Value::value_type)
    }

    /// Binds `value` to `key`, replacing whatever was there (type included).
    pub fn insert(&mut self, key: &[u8], value: Value, expires_at: Option<u64>) {
        self.remove(key);
        if let Some(at) = expires_at {
            self.expiry.schedule(key, at);
        }
        self.entries.insert(key.to_vec(), Entry { value, expires_at });
    }

    /// Replaces the value but keeps the current deadline.
    pub fn replace_value(&mut self, key: &[u8], value: Value, now: u64) {
        self.drop_if_expired(key, now);
        match self.entries.get_mut(key) {
            Some(entry) => entry.value = value,
            None => self.insert(key, value, None),
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        if let Some(at) = entry.expires_at {
            self.expiry.cancel(key, at);
        }
        Some(entry)
    }

    pub fn remove_if_empty(&mut self, key: &[u8]) {
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.value.is_empty_collection())
        {
            self.remove(key);
        }
    }

    /// Attaches a deadline. Returns `false` when the key does not exist.
    pub fn set_expiry(&mut self, key: &[u8], at: u64, now: u64) -> bool {
        self.drop_if_expired(key, now);
        match self.entries.get_mut(key) {
            Some(entry) => {
                if let Some(old) = entry.expires_at.replace(at) {
                    self.expiry.cancel(key, old);
                }
                self.expiry.schedule(key, at);
                true
            }
            None => false,
        }
    }

    /// Removes a deadline. Returns `true` only if one was removed.
    pub fn clear_expiry(&mut self, key: &[u8], now: u64) -> bool {
        self.drop_if_expired(key, now);
        match self.entries.get_mut(key).and_then(|e| e.expires_at.take()) {
            Some(old) => {
                self.expiry.cancel(key, old);
                true
            }
            None => false,
        }
    }

    /// `None` for a missing key, `Some(None)` for a key without deadline.
    pub fn expiry(&mut self, key: &[u8], now: u64) -> Option<Option<u64>> {
        self.drop_if_expired(key, now);
        self.entries.get(key).map(|e| e.expires_at)
    }

    /// Removes at most `budget` expired keys and returns them.
    pub fn sweep(&mut self, now: u64, budget: usize) -> Vec<Vec<u8>> {
        let due = self.expiry.due(now, budget);
        for key in &due {
            self.remove(key);
        }
        due
    }

    /// Number of keys that are still alive at `now`.
    pub fn live_len(&self, now: u64) -> usize {
        self.entries
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }

    /// Copy of the raw entry, used to roll a transaction back.
    pub fn snapshot(&self, key: &[u8]) -> Option<Entry> {
        self.entries.get(key).cloned()
    }

    pub fn restore(&mut self, key: &[u8], entry: Option<Entry>) {
        self.remove(key);
        if let Some(entry) = entry {
            self.insert(key, entry.value, entry.expires_at);
        }
    }

    pub fn take_evicted(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.evicted)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.expiry.clear();
        self.evicted.clear();
    }
}

/// The whole keyspace, split into independently locked shards.
#[derive(Debug)]
pub struct Keyspace {
    shards: Box<[Mutex<Shard>]>,
}

impl Keyspace {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Keyspace { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, key: &[u8]) -> usize {
        (xxh3_64(key) % self.shards.len() as u64) as usize
    }

    /// Locks the shards owning `keys`, in ascending shard order.
    pub fn lock<I, K>(&self, keys: I) -> LockSet<'_>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let order: BTreeSet<usize> = keys
            .into_iter()
            .map(|k| self.shard_of(k.as_ref()))
            .collect();
        let guards = order
            .into_iter()
            .map(|idx| (idx, self.shards[idx].lock()))
            .collect();
        LockSet {
            keyspace: self,
            guards,
        }
    }

    /// Locks every shard, for commands that span the whole keyspace.
    pub fn lock_all(&self) -> LockSet<'_> {
        let guards = self
            .shards
            .iter()
            .enumerate()
            .map(|(idx, s)| (idx, s.lock()))
            .collect();
        LockSet {
            keyspace: self,
            guards,
        }
    }

    pub fn lock_shard(&self, idx: usize) -> Option<MutexGuard<'_, Shard>> {
        self.shards.get(idx).map(|s| s.lock())
    }
}

/// Guards for every shard a command or batch may touch.
pub struct LockSet<'a> {
    keyspace: &'a Keyspace,
    guards: Vec<(usize, MutexGuard<'a, Shard>)>,
}

impl LockSet<'_> {
    /// Keys lazily expired in any locked shard since the last call.
    pub fn take_evicted(&mut self) -> Vec<Vec<u8>> {
        self.guards
            .iter_mut()
            .flat_map(|(_, g)| g.take_evicted())
            .collect()
    }

    /// Live keys across the locked shards. Equals DBSIZE under `lock_all`.
    pub fn live_len(&self, now: u64) -> usize {
        self.guards.iter().map(|(_, g)| g.live_len(now)).sum()
    }

    pub fn shard(&mut self, key: &[u8]) -> Result<&mut Shard> {
        let idx = self.keyspace.shard_of(key);
        match self.guards.binary_search_by_key(&idx, |g| g.0) {
            Ok(pos) => Ok(&mut *self.guards[pos].1),
            Err(_) => Err(StoreError::Internal("key outside of the locked shard set")),
        }
    }
}
