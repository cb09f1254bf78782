// src/engine/mod.rs

//! # 引擎模块
//!
//! `engine` 模块是 KV 服务的核心。它：
//! - 接收已解析的强类型命令（[`Command`]），文本解析只发生在协议边界
//! - 锁定命令涉及的 shard，把业务逻辑委托给类型子模块（`string`、`list`、`zset`、`stream` ...）
//! - 写命令成功后通知 WATCH 管理器；XADD 之后唤醒阻塞中的 XREADGROUP
//! - 返回 [`Reply`]，网络层将其编码为 RESP
//!
//! 除了 `execute` 以外，[`Store`] 还提供一套强类型 API（`set_ex`、`rpush`、`geosearch` ...），
//! 直接返回 Rust 值，供嵌入式调用和测试使用。
pub mod command;
pub mod keyspace;
pub mod watch;

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

pub use command::{Command, Reply, Request, XReadGroup};
pub use keyspace::{Keyspace, LockSet, Shard, Value, ValueType};
pub use watch::WatchManager;

use crate::error::{Result, StoreError};
use crate::expire::{Clock, deadline_after};
use crate::pubsub::PubSub;
use crate::types::geo::{self, DistanceUnit, GeoMatch, GeoPoint, GeoQuery};
use crate::types::hll::{self, Sketch};
use crate::types::stream::{self, GroupStart, PendingSummary, ReadFrom, StreamEntry, StreamId, XAddId, XAddOptions};
use crate::types::zset::{self, ScoreBound};
use crate::types::{hash, list, set, string};

/// Entries read from each stream by one XREADGROUP, in request order.
pub type StreamBatch = Vec<(Vec<u8>, Vec<StreamEntry>)>;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub shard_count: usize,
    /// Messages a subscriber may have queued before it is disconnected.
    pub pubsub_queue_capacity: usize,
    pub clock: Clock,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            shard_count: 16,
            pubsub_queue_capacity: 1024,
            clock: Clock::System,
        }
    }
}

/// The in-memory store. Shared between connections as `Arc<Store>`.
pub struct Store {
    keyspace: Keyspace,
    clock: Clock,
    watch: WatchManager,
    pubsub: PubSub,
    // 每次流发生变化时递增，阻塞读在上面等待
    appends: tokio::sync::watch::Sender<u64>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new(StoreOptions::default())
    }
}

fn owned<V: AsRef<[u8]>>(items: &[V]) -> Vec<Vec<u8>> {
    items.iter().map(|v| v.as_ref().to_vec()).collect()
}

fn owned_pairs<A: AsRef<[u8]>, B: AsRef<[u8]>>(pairs: &[(A, B)]) -> Vec<(Vec<u8>, Vec<u8>)> {
    pairs
        .iter()
        .map(|(a, b)| (a.as_ref().to_vec(), b.as_ref().to_vec()))
        .collect()
}

impl Store {
    pub fn new(opts: StoreOptions) -> Self {
        let (appends, _) = tokio::sync::watch::channel(0);
        Store {
            keyspace: Keyspace::new(opts.shard_count),
            clock: opts.clock,
            watch: WatchManager::new(),
            pubsub: PubSub::new(opts.pubsub_queue_capacity),
            appends,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    pub(crate) fn watch_manager(&self) -> &WatchManager {
        &self.watch
    }

    /// Runs one command atomically with respect to every key it names.
    pub fn execute(&self, cmd: Command) -> Result<Reply> {
        let now = self.clock.now_ms();
        let mut locks = self.lock_for(std::slice::from_ref(&cmd), &[]);
        let out = self.apply(&mut locks, &cmd, now);

        let mut touched = locks.take_evicted();
        if out.is_ok() && cmd.is_write() {
            touched.extend(cmd.keys().into_iter().map(<[u8]>::to_vec));
        }
        self.notify(&touched);
        drop(locks);

        if out.is_ok() && wakes_readers(&cmd) {
            self.wake_readers();
        }
        out
    }

    /// Locks every shard that `cmds` (and `extra` keys) reference.
    pub(crate) fn lock_for(&self, cmds: &[Command], extra: &[Vec<u8>]) -> LockSet<'_> {
        if cmds.iter().any(Command::spans_keyspace) {
            return self.keyspace.lock_all();
        }
        self.keyspace.lock(
            cmds.iter()
                .flat_map(Command::keys)
                .chain(extra.iter().map(Vec::as_slice)),
        )
    }

    /// Marks WATCH sessions on `keys` dirty. Called with the shard locks held.
    pub(crate) fn notify(&self, keys: &[Vec<u8>]) {
        for key in keys {
            let sessions = self.watch.touch(key);
            if !sessions.is_empty() {
                trace!(key = %String::from_utf8_lossy(key), ?sessions, "watched key modified");
            }
        }
    }

    pub(crate) fn wake_readers(&self) {
        self.appends.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// 在已持有锁的前提下执行单条命令
    pub(crate) fn apply(&self, locks: &mut LockSet<'_>, cmd: &Command, now: u64) -> Result<Reply> {
        use Command::*;

        let reply = match cmd {
            Ping(None) => Reply::Pong,
            Ping(Some(msg)) => Reply::Bulk(msg.clone()),

            // --- keyspace ---
            Del(keys) => {
                let mut removed = 0;
                for key in keys {
                    let shard = locks.shard(key)?;
                    if shard.contains(key, now) {
                        shard.remove(key);
                        removed += 1;
                    }
                }
                Reply::int(removed)
            }
            Exists(keys) => {
                let mut found = 0;
                for key in keys {
                    if locks.shard(key)?.contains(key, now) {
                        found += 1;
                    }
                }
                Reply::int(found)
            }
            Type(key) => {
                let ty = locks.shard(key)?.value_type(key, now);
                Reply::bulk(ty.map_or("none", ValueType::as_str))
            }
            DbSize => Reply::int(locks.live_len(now)),
            Expire { key, millis } => {
                let shard = locks.shard(key)?;
                if *millis <= 0 {
                    let existed = shard.contains(key, now);
                    if existed {
                        shard.remove(key);
                    }
                    Reply::Integer(existed as i64)
                } else {
                    let at = deadline_after(now, Duration::from_millis(*millis as u64));
                    Reply::Integer(shard.set_expiry(key, at, now) as i64)
                }
            }
            Ttl { key, millis } => Reply::Integer(remaining_ttl(locks.shard(key)?, key, *millis, now)),
            Persist(key) => Reply::Integer(locks.shard(key)?.clear_expiry(key, now) as i64),

            // --- string ---
            Get(key) => Reply::opt_bulk(string::get(locks.shard(key)?, key, now)?),
            Set { key, value, ttl } => {
                let at = ttl.map(|d| deadline_after(now, d));
                string::set(locks.shard(key)?, key, value, at);
                Reply::Ok
            }
            IncrBy { key, delta } => Reply::Integer(string::incr_by(locks.shard(key)?, key, *delta, now)?),

            // --- list ---
            LPush { key, values } => Reply::int(list::lpush(locks.shard(key)?, key, values, now)?),
            RPush { key, values } => Reply::int(list::rpush(locks.shard(key)?, key, values, now)?),
            LPop(key) => Reply::opt_bulk(list::lpop(locks.shard(key)?, key, now)?),
            RPop(key) => Reply::opt_bulk(list::rpop(locks.shard(key)?, key, now)?),
            LRange { key, start, stop } => Reply::bulks(list::lrange(locks.shard(key)?, key, *start, *stop, now)?),
            LLen(key) => Reply::int(list::llen(locks.shard(key)?, key, now)?),

            // --- set ---
            SAdd { key, members } => Reply::int(set::sadd(locks.shard(key)?, key, members, now)?),
            SRem { key, members } => Reply::int(set::srem(locks.shard(key)?, key, members, now)?),
            SMembers(key) => Reply::bulks(set::smembers(locks.shard(key)?, key, now)?),
            SIsMember { key, member } => {
                Reply::Integer(set::sismember(locks.shard(key)?, key, member, now)? as i64)
            }
            SCard(key) => Reply::int(set::scard(locks.shard(key)?, key, now)?),

            // --- sorted set ---
            ZAdd { key, pairs } => Reply::int(zset::zadd(locks.shard(key)?, key, pairs, now)?),
            ZRange { key, start, stop, with_scores } => {
                scored_reply(zset::zrange(locks.shard(key)?, key, *start, *stop, now)?, *with_scores)
            }
            ZRangeByScore { key, min, max, with_scores } => {
                scored_reply(zset::zrangebyscore(locks.shard(key)?, key, *min, *max, now)?, *with_scores)
            }
            ZScore { key, member } => zset::zscore(locks.shard(key)?, key, member, now)?.map_or(Reply::Nil, Reply::float),
            ZRem { key, members } => Reply::int(zset::zrem(locks.shard(key)?, key, members, now)?),
            ZCard(key) => Reply::int(zset::zcard(locks.shard(key)?, key, now)?),

            // --- hash ---
            HSet { key, pairs } => Reply::int(hash::hset(locks.shard(key)?, key, pairs, now)?),
            HGet { key, field } => Reply::opt_bulk(hash::hget(locks.shard(key)?, key, field, now)?),
            HGetAll(key) => Reply::bulks(
                hash::hgetall(locks.shard(key)?, key, now)?
                    .into_iter()
                    .flat_map(|(f, v)| [f, v]),
            ),
            HDel { key, fields } => Reply::int(hash::hdel(locks.shard(key)?, key, fields, now)?),
            HKeys(key) => Reply::bulks(hash::hkeys(locks.shard(key)?, key, now)?),
            HVals(key) => Reply::bulks(hash::hvals(locks.shard(key)?, key, now)?),
            HLen(key) => Reply::int(hash::hlen(locks.shard(key)?, key, now)?),

            // --- geo ---
            GeoAdd { key, items } => Reply::int(geo::geoadd(locks.shard(key)?, key, items, now)?),
            GeoDist { key, a, b, unit } => match geo::geodist(locks.shard(key)?, key, a, b, *unit, now)? {
                Some(d) => Reply::bulk(format!("{d:.4}")),
                None => Reply::Nil,
            },
            GeoPos { key, members } => Reply::Array(
                geo::geopos(locks.shard(key)?, key, members, now)?
                    .into_iter()
                    .map(|p| p.map_or(Reply::Nil, point_reply))
                    .collect(),
            ),
            GeoSearch { key, query } => geo_reply(geo::geosearch(locks.shard(key)?, key, query, now)?, query),

            // --- hyperloglog ---
            PfAdd { key, members } => Reply::Integer(hll::pfadd(locks.shard(key)?, key, members, now)? as i64),
            PfCount(keys) => {
                let mut union = Sketch::default();
                for key in keys {
                    hll::merge_into(locks.shard(key)?, key, &mut union, now)?;
                }
                Reply::Integer(union.estimate() as i64)
            }
            PfMerge { dest, sources } => {
                let mut union = Sketch::default();
                for key in std::iter::once(dest).chain(sources) {
                    hll::merge_into(locks.shard(key)?, key, &mut union, now)?;
                }
                hll::store(locks.shard(dest)?, dest, &union, now)?;
                Reply::Ok
            }

            // --- pub/sub ---
            Publish { channel, message } => Reply::int(self.pubsub.publish(channel, message)),

            // --- stream ---
            XAdd { key, id, fields, opts } => match stream::xadd(locks.shard(key)?, key, *id, fields, *opts, now)? {
                Some(id) => Reply::bulk(id.to_string()),
                None => Reply::Nil,
            },
            XLen(key) => Reply::int(stream::xlen(locks.shard(key)?, key, now)?),
            XRange { key, start, end, count } => {
                entries_reply(stream::xrange(locks.shard(key)?, key, *start, *end, *count, now)?)
            }
            XGroupCreate { key, group, start, mkstream, replace } => {
                stream::xgroup_create(locks.shard(key)?, key, group, *start, *mkstream, *replace, now)?;
                Reply::Ok
            }
            XGroupCreateConsumer { key, group, consumer } => Reply::Integer(
                stream::xgroup_createconsumer(locks.shard(key)?, key, group, consumer, now)? as i64,
            ),
            XGroupDestroy { key, group } => {
                Reply::Integer(stream::xgroup_destroy(locks.shard(key)?, key, group, now)? as i64)
            }
            XGroupDelConsumer { key, group, consumer } => {
                Reply::int(stream::xgroup_delconsumer(locks.shard(key)?, key, group, consumer, now)?)
            }
            XGroupSetId { key, group, start } => {
                stream::xgroup_setid(locks.shard(key)?, key, group, *start, now)?;
                Reply::Ok
            }
            Command::XReadGroup(req) => streams_reply(read_groups(locks, req, now)?),
            XAck { key, group, ids } => Reply::int(stream::xack(locks.shard(key)?, key, group, ids, now)?),
            XPending { key, group } => pending_reply(stream::xpending(locks.shard(key)?, key, group, now)?),
            XClaim { key, group, consumer, min_idle_ms, ids } => entries_reply(stream::xclaim(
                locks.shard(key)?,
                key,
                group,
                consumer,
                *min_idle_ms,
                ids,
                now,
            )?),
        };
        Ok(reply)
    }

    fn with_shard<T>(&self, key: &[u8], write: bool, f: impl FnOnce(&mut Shard, u64) -> Result<T>) -> Result<T> {
        let now = self.clock.now_ms();
        let mut locks = self.keyspace.lock([key]);
        let out = f(locks.shard(key)?, now);
        let mut touched = locks.take_evicted();
        if write && out.is_ok() {
            touched.push(key.to_vec());
        }
        self.notify(&touched);
        out
    }

    fn with_keys<T>(
        &self,
        keys: &[Vec<u8>],
        write: bool,
        f: impl FnOnce(&mut LockSet<'_>, u64) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now_ms();
        let mut locks = self.keyspace.lock(keys);
        let out = f(&mut locks, now);
        let mut touched = locks.take_evicted();
        if write && out.is_ok() {
            touched.extend(keys.iter().cloned());
        }
        self.notify(&touched);
        out
    }

    // ---------------------------------------------------------------------
    // keyspace
    // ---------------------------------------------------------------------

    pub fn del<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<usize> {
        let keys = owned(keys);
        self.with_keys(&keys, true, |locks, now| {
            let mut removed = 0;
            for key in &keys {
                let shard = locks.shard(key)?;
                if shard.contains(key, now) {
                    shard.remove(key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    pub fn exists(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| Ok(s.contains(key, now)))
    }

    pub fn key_type(&self, key: impl AsRef<[u8]>) -> Result<Option<ValueType>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| Ok(s.value_type(key, now)))
    }

    pub fn dbsize(&self) -> usize {
        let now = self.clock.now_ms();
        self.keyspace.lock_all().live_len(now)
    }

    /// Attaches a TTL. Returns `false` when the key does not exist.
    /// EXPIRE: a zero `ttl` deletes the key right away, same as [`Store::pexpire`].
    pub fn expire(&self, key: impl AsRef<[u8]>, ttl: Duration) -> Result<bool> {
        let key = key.as_ref();
        if ttl.is_zero() {
            return self.pexpire(key, 0);
        }
        self.with_shard(key, true, |s, now| Ok(s.set_expiry(key, deadline_after(now, ttl), now)))
    }

    /// PEXPIRE: a non-positive `millis` deletes the key right away.
    pub fn pexpire(&self, key: impl AsRef<[u8]>, millis: i64) -> Result<bool> {
        let reply = self.execute(Command::Expire { key: key.as_ref().to_vec(), millis })?;
        Ok(reply.as_integer() == Some(1))
    }

    pub fn persist(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| Ok(s.clear_expiry(key, now)))
    }

    /// Remaining seconds, `-1` without deadline, `-2` for a missing key.
    pub fn ttl(&self, key: impl AsRef<[u8]>) -> Result<i64> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| Ok(remaining_ttl(s, key, false, now)))
    }

    pub fn pttl(&self, key: impl AsRef<[u8]>) -> Result<i64> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| Ok(remaining_ttl(s, key, true, now)))
    }

    /// 后台清理入口：逐个 shard 加锁，每个 shard 最多删除 `keys_per_shard` 个过期 key
    pub fn sweep_expired(&self, keys_per_shard: usize) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut total = 0;
        for idx in 0..self.keyspace.shard_count() {
            let mut shard = self
                .keyspace
                .lock_shard(idx)
                .ok_or(StoreError::Internal("shard index out of range"))?;
            let mut removed = shard.sweep(now, keys_per_shard);
            total += removed.len();
            removed.extend(shard.take_evicted());
            self.notify(&removed);
        }
        Ok(total)
    }

    // ---------------------------------------------------------------------
    // string
    // ---------------------------------------------------------------------

    /// Binds a string without deadline, clearing any previous TTL.
    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, _| {
            string::set(s, key, value.as_ref(), None);
            Ok(())
        })
    }

    /// SETEX: binds a string that expires after `ttl`.
    pub fn set_ex(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: Duration) -> Result<()> {
        let key = key.as_ref();
        if ttl.is_zero() {
            return Err(StoreError::InvalidExpire("setex".into()));
        }
        self.with_shard(key, true, |s, now| {
            string::set(s, key, value.as_ref(), Some(deadline_after(now, ttl)));
            Ok(())
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| string::get(s, key, now))
    }

    pub fn incr_by(&self, key: impl AsRef<[u8]>, delta: i64) -> Result<i64> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| string::incr_by(s, key, delta, now))
    }

    // ---------------------------------------------------------------------
    // list
    // ---------------------------------------------------------------------

    pub fn rpush<V: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, values: &[V]) -> Result<usize> {
        let key = key.as_ref();
        let values = owned(values);
        self.with_shard(key, true, |s, now| list::rpush(s, key, &values, now))
    }

    pub fn lpush<V: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, values: &[V]) -> Result<usize> {
        let key = key.as_ref();
        let values = owned(values);
        self.with_shard(key, true, |s, now| list::lpush(s, key, &values, now))
    }

    pub fn lpop(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| list::lpop(s, key, now))
    }

    pub fn rpop(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| list::rpop(s, key, now))
    }

    pub fn lrange(&self, key: impl AsRef<[u8]>, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| list::lrange(s, key, start, stop, now))
    }

    pub fn llen(&self, key: impl AsRef<[u8]>) -> Result<usize> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| list::llen(s, key, now))
    }

    // ---------------------------------------------------------------------
    // set
    // ---------------------------------------------------------------------

    pub fn sadd<V: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, members: &[V]) -> Result<usize> {
        let key = key.as_ref();
        let members = owned(members);
        self.with_shard(key, true, |s, now| set::sadd(s, key, &members, now))
    }

    pub fn srem<V: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, members: &[V]) -> Result<usize> {
        let key = key.as_ref();
        let members = owned(members);
        self.with_shard(key, true, |s, now| set::srem(s, key, &members, now))
    }

    pub fn smembers(&self, key: impl AsRef<[u8]>) -> Result<Vec<Vec<u8>>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| set::smembers(s, key, now))
    }

    pub fn sismember(&self, key: impl AsRef<[u8]>, member: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| set::sismember(s, key, member.as_ref(), now))
    }

    pub fn scard(&self, key: impl AsRef<[u8]>) -> Result<usize> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| set::scard(s, key, now))
    }

    // ---------------------------------------------------------------------
    // sorted set
    // ---------------------------------------------------------------------

    /// Adds or re-scores members. Returns how many were new.
    pub fn zadd<M: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, pairs: &[(f64, M)]) -> Result<usize> {
        let key = key.as_ref();
        let pairs: Vec<(f64, Vec<u8>)> = pairs.iter().map(|(s, m)| (*s, m.as_ref().to_vec())).collect();
        self.with_shard(key, true, |s, now| zset::zadd(s, key, &pairs, now))
    }

    pub fn zrange(&self, key: impl AsRef<[u8]>, start: i64, stop: i64) -> Result<Vec<(Vec<u8>, f64)>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| zset::zrange(s, key, start, stop, now))
    }

    pub fn zrangebyscore(
        &self,
        key: impl AsRef<[u8]>,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| zset::zrangebyscore(s, key, min, max, now))
    }

    pub fn zscore(&self, key: impl AsRef<[u8]>, member: impl AsRef<[u8]>) -> Result<Option<f64>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| zset::zscore(s, key, member.as_ref(), now))
    }

    pub fn zrem<M: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, members: &[M]) -> Result<usize> {
        let key = key.as_ref();
        let members = owned(members);
        self.with_shard(key, true, |s, now| zset::zrem(s, key, &members, now))
    }

    pub fn zcard(&self, key: impl AsRef<[u8]>) -> Result<usize> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| zset::zcard(s, key, now))
    }

    // ---------------------------------------------------------------------
    // hash
    // ---------------------------------------------------------------------

    pub fn hset<F: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, pairs: &[(F, V)]) -> Result<usize> {
        let key = key.as_ref();
        let pairs = owned_pairs(pairs);
        self.with_shard(key, true, |s, now| hash::hset(s, key, &pairs, now))
    }

    pub fn hget(&self, key: impl AsRef<[u8]>, field: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| hash::hget(s, key, field.as_ref(), now))
    }

    pub fn hgetall(&self, key: impl AsRef<[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| hash::hgetall(s, key, now))
    }

    pub fn hdel<F: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, fields: &[F]) -> Result<usize> {
        let key = key.as_ref();
        let fields = owned(fields);
        self.with_shard(key, true, |s, now| hash::hdel(s, key, &fields, now))
    }

    pub fn hlen(&self, key: impl AsRef<[u8]>) -> Result<usize> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| hash::hlen(s, key, now))
    }

    // ---------------------------------------------------------------------
    // geo
    // ---------------------------------------------------------------------

    /// Items are `(longitude, latitude, member)`.
    pub fn geoadd<M: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, items: &[(f64, f64, M)]) -> Result<usize> {
        let key = key.as_ref();
        let items: Vec<(f64, f64, Vec<u8>)> = items
            .iter()
            .map(|(lon, lat, m)| (*lon, *lat, m.as_ref().to_vec()))
            .collect();
        self.with_shard(key, true, |s, now| geo::geoadd(s, key, &items, now))
    }

    pub fn geodist(
        &self,
        key: impl AsRef<[u8]>,
        a: impl AsRef<[u8]>,
        b: impl AsRef<[u8]>,
        unit: DistanceUnit,
    ) -> Result<Option<f64>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| geo::geodist(s, key, a.as_ref(), b.as_ref(), unit, now))
    }

    pub fn geopos<M: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, members: &[M]) -> Result<Vec<Option<GeoPoint>>> {
        let key = key.as_ref();
        let members = owned(members);
        self.with_shard(key, false, |s, now| geo::geopos(s, key, &members, now))
    }

    pub fn geosearch(&self, key: impl AsRef<[u8]>, query: &GeoQuery) -> Result<Vec<GeoMatch>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| geo::geosearch(s, key, query, now))
    }

    // ---------------------------------------------------------------------
    // hyperloglog
    // ---------------------------------------------------------------------

    pub fn pfadd<M: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, members: &[M]) -> Result<bool> {
        let key = key.as_ref();
        let members = owned(members);
        self.with_shard(key, true, |s, now| hll::pfadd(s, key, &members, now))
    }

    /// Estimated cardinality of the union of the given sketches.
    pub fn pfcount<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<u64> {
        let keys = owned(keys);
        self.with_keys(&keys, false, |locks, now| {
            let mut union = Sketch::default();
            for key in &keys {
                hll::merge_into(locks.shard(key)?, key, &mut union, now)?;
            }
            Ok(union.estimate())
        })
    }

    pub fn pfmerge<K: AsRef<[u8]>>(&self, dest: impl AsRef<[u8]>, sources: &[K]) -> Result<()> {
        let dest = dest.as_ref().to_vec();
        let sources = owned(sources);
        self.execute(Command::PfMerge { dest, sources }).map(|_| ())
    }

    // ---------------------------------------------------------------------
    // pub/sub
    // ---------------------------------------------------------------------

    /// Returns the number of subscriptions the message was queued for.
    pub fn publish(&self, channel: impl AsRef<[u8]>, message: impl AsRef<[u8]>) -> usize {
        self.pubsub.publish(channel.as_ref(), message.as_ref())
    }

    // ---------------------------------------------------------------------
    // stream
    // ---------------------------------------------------------------------

    pub fn xadd<F: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: impl AsRef<[u8]>,
        id: XAddId,
        fields: &[(F, V)],
        opts: XAddOptions,
    ) -> Result<Option<StreamId>> {
        let key = key.as_ref();
        let fields = owned_pairs(fields);
        let out = self.with_shard(key, true, |s, now| stream::xadd(s, key, id, &fields, opts, now))?;
        if out.is_some() {
            self.wake_readers();
        }
        Ok(out)
    }

    pub fn xlen(&self, key: impl AsRef<[u8]>) -> Result<usize> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| stream::xlen(s, key, now))
    }

    pub fn xrange(
        &self,
        key: impl AsRef<[u8]>,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| stream::xrange(s, key, start, end, count, now))
    }

    pub fn xgroup_create(
        &self,
        key: impl AsRef<[u8]>,
        group: impl AsRef<[u8]>,
        start: GroupStart,
        mkstream: bool,
        replace: bool,
    ) -> Result<()> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| {
            stream::xgroup_create(s, key, group.as_ref(), start, mkstream, replace, now)
        })?;
        self.wake_readers();
        Ok(())
    }

    pub fn xgroup_createconsumer(
        &self,
        key: impl AsRef<[u8]>,
        group: impl AsRef<[u8]>,
        consumer: impl AsRef<[u8]>,
    ) -> Result<bool> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| {
            stream::xgroup_createconsumer(s, key, group.as_ref(), consumer.as_ref(), now)
        })
    }

    pub fn xgroup_destroy(&self, key: impl AsRef<[u8]>, group: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        let out = self.with_shard(key, true, |s, now| stream::xgroup_destroy(s, key, group.as_ref(), now))?;
        self.wake_readers();
        Ok(out)
    }

    /// Deletes a consumer and its pending entries; returns how many were pending.
    pub fn xgroup_delconsumer(
        &self,
        key: impl AsRef<[u8]>,
        group: impl AsRef<[u8]>,
        consumer: impl AsRef<[u8]>,
    ) -> Result<usize> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| {
            stream::xgroup_delconsumer(s, key, group.as_ref(), consumer.as_ref(), now)
        })
    }

    pub fn xgroup_setid(&self, key: impl AsRef<[u8]>, group: impl AsRef<[u8]>, start: GroupStart) -> Result<()> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| stream::xgroup_setid(s, key, group.as_ref(), start, now))?;
        self.wake_readers();
        Ok(())
    }

    /// Non-blocking XREADGROUP. Streams with nothing to deliver are left out.
    pub fn xreadgroup(&self, req: &XReadGroup) -> Result<StreamBatch> {
        let keys: Vec<Vec<u8>> = req.streams.iter().map(|(k, _)| k.clone()).collect();
        self.with_keys(&keys, true, |locks, now| read_groups(locks, req, now))
    }

    /// XREADGROUP with BLOCK: waits up to `block` (zero waits forever) for
    /// new entries. A timeout yields an empty batch.
    pub async fn xreadgroup_blocking(&self, req: &XReadGroup, block: Duration) -> Result<StreamBatch> {
        self.xreadgroup_until(req, block, std::future::pending::<()>()).await
    }

    /// Like [`Store::xreadgroup_blocking`], but gives up as soon as `cancel`
    /// resolves. No shard lock is held while waiting.
    pub async fn xreadgroup_until<F>(&self, req: &XReadGroup, block: Duration, cancel: F) -> Result<StreamBatch>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let mut appends = self.appends.subscribe();
        let deadline = (!block.is_zero()).then(|| Instant::now() + block);

        loop {
            // 先标记已读再读取，读取之后的 XADD 一定会唤醒下面的等待
            let _ = appends.borrow_and_update();
            let batch = self.xreadgroup(req)?;
            if !batch.is_empty() || !req.may_block() {
                return Ok(batch);
            }

            let woke = async {
                match deadline {
                    Some(at) => matches!(timeout_at(at, appends.changed()).await, Ok(Ok(()))),
                    None => appends.changed().await.is_ok(),
                }
            };
            tokio::select! {
                _ = &mut cancel => {
                    debug!(group = %String::from_utf8_lossy(&req.group), "blocking read cancelled");
                    return Ok(Vec::new());
                }
                woke = woke => {
                    if !woke {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    pub fn xack(&self, key: impl AsRef<[u8]>, group: impl AsRef<[u8]>, ids: &[StreamId]) -> Result<usize> {
        let key = key.as_ref();
        self.with_shard(key, true, |s, now| stream::xack(s, key, group.as_ref(), ids, now))
    }

    pub fn xpending(&self, key: impl AsRef<[u8]>, group: impl AsRef<[u8]>) -> Result<PendingSummary> {
        let key = key.as_ref();
        self.with_shard(key, false, |s, now| stream::xpending(s, key, group.as_ref(), now))
    }

    pub fn xclaim(
        &self,
        key: impl AsRef<[u8]>,
        group: impl AsRef<[u8]>,
        consumer: impl AsRef<[u8]>,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamEntry>> {
        let key = key.as_ref();
        let min_idle_ms = min_idle.as_millis() as u64;
        self.with_shard(key, true, |s, now| {
            stream::xclaim(s, key, group.as_ref(), consumer.as_ref(), min_idle_ms, ids, now)
        })
    }
}

pub(crate) fn wakes_readers(cmd: &Command) -> bool {
    use Command::*;
    matches!(
        cmd,
        XAdd { .. } | XGroupCreate { .. } | XGroupDestroy { .. } | XGroupSetId { .. } | Del(_)
    )
}

fn remaining_ttl(shard: &mut Shard, key: &[u8], millis: bool, now: u64) -> i64 {
    match shard.expiry(key, now) {
        None => -2,
        Some(None) => -1,
        Some(Some(at)) => {
            let left = at.saturating_sub(now);
            let v = if millis { left } else { left.div_ceil(1000) };
            i64::try_from(v).unwrap_or(i64::MAX)
        }
    }
}

fn read_groups(locks: &mut LockSet<'_>, req: &XReadGroup, now: u64) -> Result<StreamBatch> {
    let mut out = Vec::with_capacity(req.streams.len());
    for (key, from) in &req.streams {
        let entries = stream::xreadgroup(
            locks.shard(key)?,
            key,
            &req.group,
            &req.consumer,
            *from,
            req.count,
            req.noack,
            now,
        )?;
        // 读取历史 pending 时即使为空也返回该 stream
        if !entries.is_empty() || matches!(from, ReadFrom::Pending(_)) {
            out.push((key.clone(), entries));
        }
    }
    Ok(out)
}

fn scored_reply(items: Vec<(Vec<u8>, f64)>, with_scores: bool) -> Reply {
    if !with_scores {
        return Reply::bulks(items.into_iter().map(|(m, _)| m));
    }
    Reply::Array(
        items
            .into_iter()
            .flat_map(|(m, s)| [Reply::Bulk(m), Reply::float(s)])
            .collect(),
    )
}

fn point_reply(p: GeoPoint) -> Reply {
    Reply::Array(vec![Reply::float(p.lon), Reply::float(p.lat)])
}

fn geo_reply(matches: Vec<GeoMatch>, query: &GeoQuery) -> Reply {
    if !query.with_dist && !query.with_coord {
        return Reply::bulks(matches.into_iter().map(|m| m.member));
    }
    Reply::Array(
        matches
            .into_iter()
            .map(|m| {
                let mut item = vec![Reply::Bulk(m.member)];
                if query.with_dist {
                    item.push(Reply::bulk(format!("{:.4}", m.distance)));
                }
                if query.with_coord {
                    item.push(point_reply(m.position));
                }
                Reply::Array(item)
            })
            .collect(),
    )
}

pub(crate) fn entries_reply(entries: Vec<StreamEntry>) -> Reply {
    Reply::Array(
        entries
            .into_iter()
            .map(|(id, fields)| {
                Reply::Array(vec![
                    Reply::bulk(id.to_string()),
                    Reply::bulks(fields.into_iter().flat_map(|(f, v)| [f, v])),
                ])
            })
            .collect(),
    )
}

/// XREADGROUP reply: `[[key, entries], ...]`, or nil when nothing was read.
pub fn streams_reply(batch: StreamBatch) -> Reply {
    if batch.is_empty() {
        return Reply::Nil;
    }
    Reply::Array(
        batch
            .into_iter()
            .map(|(key, entries)| Reply::Array(vec![Reply::Bulk(key), entries_reply(entries)]))
            .collect(),
    )
}

fn pending_reply(p: PendingSummary) -> Reply {
    let id = |id: Option<StreamId>| id.map_or(Reply::Nil, |id| Reply::bulk(id.to_string()));
    Reply::Array(vec![
        Reply::int(p.count),
        id(p.min_id),
        id(p.max_id),
        Reply::Array(
            p.consumers
                .into_iter()
                .map(|(name, n)| Reply::Array(vec![Reply::Bulk(name), Reply::bulk(n.to_string())]))
                .collect(),
        ),
    ])
}
