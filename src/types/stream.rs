// src/types/stream.rs

//! # Stream Type Support
//!
//! A stream is an append-only log of entries keyed by strictly increasing
//! [`StreamId`]s, plus the consumer groups reading it.
//!
//! Per group every entry moves through three states:
//! 1. unclaimed: its id is above the group's last-delivered id
//! 2. pending: handed to one consumer by `XREADGROUP`, waiting for `XACK`
//! 3. acknowledged: dropped from the pending list
//!
//! `XCLAIM` moves a pending entry to another consumer once it has been idle
//! long enough.
//!
//! Supported commands:
//! - `XADD`, `XLEN`, `XRANGE`
//! - `XGROUP CREATE | CREATECONSUMER | DESTROY | DELCONSUMER | SETID`
//! - `XREADGROUP`, `XACK`, `XPENDING`, `XCLAIM`

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::engine::keyspace::Shard;
use crate::error::{Result, StoreError};

/// `<ms>-<seq>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId { ms: u64::MAX, seq: u64::MAX };

    pub fn new(ms: u64, seq: u64) -> Self {
        StreamId { ms, seq }
    }

    /// Parses `ms-seq`; a bare `ms` means `ms-<missing_seq>`.
    fn parse_with(raw: &[u8], missing_seq: u64) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| StoreError::InvalidStreamId)?;
        let num = |s: &str| s.parse::<u64>().map_err(|_| StoreError::InvalidStreamId);
        match text.split_once('-') {
            Some((ms, seq)) => Ok(StreamId::new(num(ms)?, num(seq)?)),
            None => Ok(StreamId::new(num(text)?, missing_seq)),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        Self::parse_with(raw, 0)
    }

    /// Lower range bound; `-` is the smallest id.
    pub fn parse_start(raw: &[u8]) -> Result<Self> {
        if raw == b"-" { Ok(StreamId::ZERO) } else { Self::parse_with(raw, 0) }
    }

    /// Upper range bound; `+` is the largest id, a bare `ms` covers the whole millisecond.
    pub fn parse_end(raw: &[u8]) -> Result<Self> {
        if raw == b"+" { Ok(StreamId::MAX) } else { Self::parse_with(raw, u64::MAX) }
    }

    /// The smallest id greater than `self`.
    pub fn next(self) -> Option<Self> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(StreamId::new(self.ms, seq)),
            None => self.ms.checked_add(1).map(|ms| StreamId::new(ms, 0)),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

pub type Fields = Vec<(Vec<u8>, Vec<u8>)>;
pub type StreamEntry = (StreamId, Fields);

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub consumer: Vec<u8>,
    pub delivered_at: u64,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Consumer {
    pending: BTreeSet<StreamId>,
    seen_at: u64,
}

#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    last_delivered: StreamId,
    consumers: HashMap<Vec<u8>, Consumer>,
    pending: BTreeMap<StreamId, PendingEntry>,
}

impl ConsumerGroup {
    fn new(last_delivered: StreamId) -> Self {
        ConsumerGroup {
            last_delivered,
            consumers: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    fn consumer(&mut self, name: &[u8], now: u64) -> &mut Consumer {
        let c = self.consumers.entry(name.to_vec()).or_default();
        c.seen_at = now;
        c
    }

    /// Records a delivery of `id` to `consumer`, taking it away from any
    /// previous owner.
    fn assign(&mut self, id: StreamId, consumer: &[u8], count: u64, now: u64) {
        if let Some(prev) = self.pending.get(&id) {
            if let Some(c) = self.consumers.get_mut(&prev.consumer) {
                c.pending.remove(&id);
            }
        }
        self.pending.insert(
            id,
            PendingEntry {
                consumer: consumer.to_vec(),
                delivered_at: now,
                delivery_count: count,
            },
        );
        self.consumer(consumer, now).pending.insert(id);
    }

    pub fn last_delivered(&self) -> StreamId {
        self.last_delivered
    }

    pub fn pending(&self, id: StreamId) -> Option<&PendingEntry> {
        self.pending.get(&id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    groups: HashMap<Vec<u8>, ConsumerGroup>,
}

impl Stream {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> StreamId {
        self.last_id
    }

    pub fn group(&self, name: &[u8]) -> Option<&ConsumerGroup> {
        self.groups.get(name)
    }
}

/// Id for an auto-generated entry: never below the last id, even when the
/// clock goes backwards.
fn auto_id(last: StreamId, now: u64) -> Result<StreamId> {
    if now > last.ms {
        Ok(StreamId::new(now, 0))
    } else {
        last.next().ok_or(StoreError::StreamIdTooSmall)
    }
}

/// The id argument of XADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XAddId {
    Auto,
    Explicit(StreamId),
}

impl XAddId {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw == b"*" {
            Ok(XAddId::Auto)
        } else {
            StreamId::parse(raw).map(XAddId::Explicit)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XAddOptions {
    pub nomkstream: bool,
    pub maxlen: Option<usize>,
}

/// XADD key [NOMKSTREAM] [MAXLEN n] <*|id> field value [field value ...]
///
/// # Returns
///
/// The id of the new entry, or `None` when `NOMKSTREAM` is given and the
/// stream does not exist.
pub fn xadd(
    shard: &mut Shard,
    key: &[u8],
    id: XAddId,
    fields: &[(Vec<u8>, Vec<u8>)],
    opts: XAddOptions,
    now: u64,
) -> Result<Option<StreamId>> {
    let last = match shard.stream(key, now)? {
        Some(stream) => stream.last_id,
        None if opts.nomkstream => return Ok(None),
        None => StreamId::ZERO,
    };
    let id = match id {
        XAddId::Auto => auto_id(last, now)?,
        // 0-0 is never above the initial last id, so it is rejected here too
        XAddId::Explicit(id) if id <= last => return Err(StoreError::StreamIdTooSmall),
        XAddId::Explicit(id) => id,
    };
    let stream = shard.stream_or_create(key, now)?;
    stream.entries.insert(id, fields.to_vec());
    stream.last_id = id;
    if let Some(max) = opts.maxlen {
        while stream.entries.len() > max {
            stream.entries.pop_first();
        }
    }
    Ok(Some(id))
}

pub fn xlen(shard: &mut Shard, key: &[u8], now: u64) -> Result<usize> {
    Ok(shard.stream(key, now)?.map_or(0, Stream::len))
}

/// XRANGE key start end [COUNT n], both bounds inclusive.
pub fn xrange(
    shard: &mut Shard,
    key: &[u8],
    start: StreamId,
    end: StreamId,
    count: Option<usize>,
    now: u64,
) -> Result<Vec<StreamEntry>> {
    let Some(stream) = shard.stream(key, now)? else {
        return Ok(Vec::new());
    };
    if start > end {
        return Ok(Vec::new());
    }
    Ok(stream
        .entries
        .range(start..=end)
        .take(count.unwrap_or(usize::MAX))
        .map(|(id, f)| (*id, f.clone()))
        .collect())
}

/// Where a group starts reading: an explicit id or `$` (the current last id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    Id(StreamId),
    Last,
}

impl GroupStart {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw == b"$" {
            Ok(GroupStart::Last)
        } else {
            StreamId::parse(raw).map(GroupStart::Id)
        }
    }

    fn resolve(self, stream: &Stream) -> StreamId {
        match self {
            GroupStart::Id(id) => id,
            GroupStart::Last => stream.last_id,
        }
    }
}

fn group_mut<'a>(shard: &'a mut Shard, key: &[u8], group: &[u8], now: u64) -> Result<(&'a mut ConsumerGroup, &'a BTreeMap<StreamId, Fields>)> {
    let Some(stream) = shard.stream_mut(key, now)? else {
        return Err(StoreError::group_not_found(key, group));
    };
    let Stream { entries, groups, .. } = stream;
    match groups.get_mut(group) {
        Some(g) => Ok((g, entries)),
        None => Err(StoreError::group_not_found(key, group)),
    }
}

/// XGROUP CREATE key group <id|$> [MKSTREAM] [REPLACE]
///
/// An existing group is an error unless `replace` is set, in which case the
/// group starts over with no consumers and nothing pending.
pub fn xgroup_create(
    shard: &mut Shard,
    key: &[u8],
    group: &[u8],
    start: GroupStart,
    mkstream: bool,
    replace: bool,
    now: u64,
) -> Result<()> {
    if shard.stream(key, now)?.is_none() && !mkstream {
        return Err(StoreError::NoSuchKey);
    }
    let stream = shard.stream_or_create(key, now)?;
    if stream.groups.contains_key(group) && !replace {
        return Err(StoreError::GroupExists);
    }
    let last = start.resolve(stream);
    stream.groups.insert(group.to_vec(), ConsumerGroup::new(last));
    Ok(())
}

/// XGROUP CREATECONSUMER key group consumer
/// Returns `false` if the consumer already existed.
pub fn xgroup_createconsumer(shard: &mut Shard, key: &[u8], group: &[u8], consumer: &[u8], now: u64) -> Result<bool> {
    let (g, _) = group_mut(shard, key, group, now)?;
    if g.consumers.contains_key(consumer) {
        return Ok(false);
    }
    g.consumer(consumer, now);
    Ok(true)
}

/// XGROUP DESTROY key group
pub fn xgroup_destroy(shard: &mut Shard, key: &[u8], group: &[u8], now: u64) -> Result<bool> {
    match shard.stream_mut(key, now)? {
        Some(stream) => Ok(stream.groups.remove(group).is_some()),
        None => Err(StoreError::NoSuchKey),
    }
}

/// XGROUP DELCONSUMER key group consumer
/// Returns how many pending entries the consumer still owned; they are dropped.
pub fn xgroup_delconsumer(shard: &mut Shard, key: &[u8], group: &[u8], consumer: &[u8], now: u64) -> Result<usize> {
    let (g, _) = group_mut(shard, key, group, now)?;
    let Some(c) = g.consumers.remove(consumer) else {
        return Ok(0);
    };
    for id in &c.pending {
        g.pending.remove(id);
    }
    Ok(c.pending.len())
}

/// XGROUP SETID key group <id|$>
pub fn xgroup_setid(shard: &mut Shard, key: &[u8], group: &[u8], start: GroupStart, now: u64) -> Result<()> {
    let Some(stream) = shard.stream_mut(key, now)? else {
        return Err(StoreError::NoSuchKey);
    };
    let last = start.resolve(stream);
    match stream.groups.get_mut(group) {
        Some(g) => {
            g.last_delivered = last;
            Ok(())
        }
        None => Err(StoreError::group_not_found(key, group)),
    }
}

/// The id argument of XREADGROUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// `>`: entries never delivered to any consumer of the group.
    New,
    /// The consumer's own pending entries with ids above the given one.
    Pending(StreamId),
}

impl ReadFrom {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw == b">" {
            Ok(ReadFrom::New)
        } else {
            StreamId::parse(raw).map(ReadFrom::Pending)
        }
    }
}

/// XREADGROUP for a single stream.
///
/// With [`ReadFrom::New`] up to `count` unclaimed entries are assigned to
/// `consumer` and the group's last-delivered id moves past them; unless
/// `noack` they stay pending until acknowledged. With
/// [`ReadFrom::Pending`] the consumer's own pending entries are delivered
/// again and their delivery counters go up.
#[allow(clippy::too_many_arguments)]
pub fn xreadgroup(
    shard: &mut Shard,
    key: &[u8],
    group: &[u8],
    consumer: &[u8],
    from: ReadFrom,
    count: Option<usize>,
    noack: bool,
    now: u64,
) -> Result<Vec<StreamEntry>> {
    let (g, entries) = group_mut(shard, key, group, now)?;
    g.consumer(consumer, now);
    let limit = count.filter(|&n| n > 0).unwrap_or(usize::MAX);

    match from {
        ReadFrom::New => {
            let Some(start) = g.last_delivered.next() else {
                return Ok(Vec::new());
            };
            let batch: Vec<StreamEntry> = entries
                .range(start..)
                .take(limit)
                .map(|(id, f)| (*id, f.clone()))
                .collect();
            if let Some((last, _)) = batch.last() {
                g.last_delivered = *last;
            }
            if !noack {
                for (id, _) in &batch {
                    g.assign(*id, consumer, 1, now);
                }
            }
            Ok(batch)
        }
        ReadFrom::Pending(after) => {
            let owned: Vec<StreamId> = g
                .pending
                .range(after..)
                .filter(|(id, pe)| **id > after && pe.consumer == consumer)
                .map(|(id, _)| *id)
                .take(limit)
                .collect();
            let mut batch = Vec::with_capacity(owned.len());
            for id in owned {
                // trimmed entries can no longer be delivered
                let Some(fields) = entries.get(&id) else {
                    continue;
                };
                if let Some(pe) = g.pending.get_mut(&id) {
                    pe.delivery_count += 1;
                    pe.delivered_at = now;
                }
                batch.push((id, fields.clone()));
            }
            Ok(batch)
        }
    }
}

/// XACK key group id [id ...]
/// Returns how many of the ids were pending.
pub fn xack(shard: &mut Shard, key: &[u8], group: &[u8], ids: &[StreamId], now: u64) -> Result<usize> {
    if shard.stream(key, now)?.is_none() {
        return Ok(0);
    }
    let (g, _) = group_mut(shard, key, group, now)?;
    let mut acked = 0;
    for id in ids {
        if let Some(pe) = g.pending.remove(id) {
            if let Some(c) = g.consumers.get_mut(&pe.consumer) {
                c.pending.remove(id);
            }
            acked += 1;
        }
    }
    Ok(acked)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingSummary {
    pub count: usize,
    pub min_id: Option<StreamId>,
    pub max_id: Option<StreamId>,
    /// (consumer, pending count), sorted by consumer name; idle consumers omitted.
    pub consumers: Vec<(Vec<u8>, usize)>,
}

/// XPENDING key group
pub fn xpending(shard: &mut Shard, key: &[u8], group: &[u8], now: u64) -> Result<PendingSummary> {
    let (g, _) = group_mut(shard, key, group, now)?;
    let mut consumers: Vec<(Vec<u8>, usize)> = g
        .consumers
        .iter()
        .filter(|(_, c)| !c.pending.is_empty())
        .map(|(name, c)| (name.clone(), c.pending.len()))
        .collect();
    consumers.sort();
    Ok(PendingSummary {
        count: g.pending.len(),
        min_id: g.pending.keys().next().copied(),
        max_id: g.pending.keys().next_back().copied(),
        consumers,
    })
}

/// XCLAIM key group consumer min-idle-time id [id ...]
///
/// Entries pending for at least `min_idle_ms` move to `consumer`. Ids that
/// are not pending are skipped; pending ids whose entry was trimmed are
/// dropped from the pending list.
#[allow(clippy::too_many_arguments)]
pub fn xclaim(
    shard: &mut Shard,
    key: &[u8],
    group: &[u8],
    consumer: &[u8],
    min_idle_ms: u64,
    ids: &[StreamId],
    now: u64,
) -> Result<Vec<StreamEntry>> {
    let (g, entries) = group_mut(shard, key, group, now)?;
    g.consumer(consumer, now);
    let mut claimed = Vec::new();
    for id in ids {
        let Some(pe) = g.pending.get(id) else {
            continue;
        };
        if now.saturating_sub(pe.delivered_at) < min_idle_ms {
            continue;
        }
        let count = pe.delivery_count + 1;
        match entries.get(id) {
            Some(fields) => {
                g.assign(*id, consumer, count, now);
                claimed.push((*id, fields.clone()));
            }
            None => {
                if let Some(pe) = g.pending.remove(id) {
                    if let Some(c) = g.consumers.get_mut(&pe.consumer) {
                        c.pending.remove(id);
                    }
                }
            }
        }
    }
    Ok(claimed)
}
