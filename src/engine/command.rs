// src/engine/command.rs

//! # 命令定义
//!
//! - [`Command`]：引擎能执行的全部数据命令，封闭枚举，`Store::execute` 对其做穷尽匹配
//! - [`Request`]：连接层的请求，额外包含 MULTI / EXEC / WATCH / SUBSCRIBE 等会话命令
//! - [`Reply`]：命令的返回值
//!
//! 文本解析只发生在协议边界（[`Request::parse`]），引擎内部只处理强类型的命令。

use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::types::geo::{DistanceUnit, GeoOrigin, GeoQuery, GeoShape};
use crate::types::stream::{GroupStart, ReadFrom, StreamId, XAddId, XAddOptions};
use crate::types::zset::ScoreBound;

/// XREADGROUP GROUP group consumer [COUNT n] [BLOCK ms] [NOACK] STREAMS key... id...
#[derive(Debug, Clone, PartialEq)]
pub struct XReadGroup {
    pub group: Vec<u8>,
    pub consumer: Vec<u8>,
    pub streams: Vec<(Vec<u8>, ReadFrom)>,
    pub count: Option<usize>,
    /// `None` never blocks; `Some(ZERO)` blocks until data arrives.
    pub block: Option<Duration>,
    pub noack: bool,
}

impl XReadGroup {
    pub fn new(group: impl Into<Vec<u8>>, consumer: impl Into<Vec<u8>>) -> Self {
        XReadGroup {
            group: group.into(),
            consumer: consumer.into(),
            streams: Vec::new(),
            count: None,
            block: None,
            noack: false,
        }
    }

    /// Reads new entries (`>`) from `key`.
    pub fn stream(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.streams.push((key.into(), ReadFrom::New));
        self
    }

    pub fn count(mut self, n: usize) -> Self {
        self.count = Some(n);
        self
    }

    pub fn block(mut self, d: Duration) -> Self {
        self.block = Some(d);
        self
    }

    pub fn noack(mut self) -> Self {
        self.noack = true;
        self
    }

    /// Only reads of new entries can wait for data.
    pub(crate) fn may_block(&self) -> bool {
        self.streams.iter().all(|(_, from)| *from == ReadFrom::New)
    }
}

/// Every data command the engine executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping(Option<Vec<u8>>),

    // keyspace
    Del(Vec<Vec<u8>>),
    Exists(Vec<Vec<u8>>),
    Type(Vec<u8>),
    DbSize,
    /// EXPIRE / PEXPIRE; a non-positive TTL deletes the key.
    Expire { key: Vec<u8>, millis: i64 },
    /// TTL (`millis == false`) / PTTL.
    Ttl { key: Vec<u8>, millis: bool },
    Persist(Vec<u8>),

    // string
    Get(Vec<u8>),
    /// SET without TTL also clears an existing deadline.
    Set { key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration> },
    IncrBy { key: Vec<u8>, delta: i64 },

    // list
    LPush { key: Vec<u8>, values: Vec<Vec<u8>> },
    RPush { key: Vec<u8>, values: Vec<Vec<u8>> },
    LPop(Vec<u8>),
    RPop(Vec<u8>),
    LRange { key: Vec<u8>, start: i64, stop: i64 },
    LLen(Vec<u8>),

    // set
    SAdd { key: Vec<u8>, members: Vec<Vec<u8>> },
    SRem { key: Vec<u8>, members: Vec<Vec<u8>> },
    SMembers(Vec<u8>),
    SIsMember { key: Vec<u8>, member: Vec<u8> },
    SCard(Vec<u8>),

    // sorted set
    ZAdd { key: Vec<u8>, pairs: Vec<(f64, Vec<u8>)> },
    ZRange { key: Vec<u8>, start: i64, stop: i64, with_scores: bool },
    ZRangeByScore { key: Vec<u8>, min: ScoreBound, max: ScoreBound, with_scores: bool },
    ZScore { key: Vec<u8>, member: Vec<u8> },
    ZRem { key: Vec<u8>, members: Vec<Vec<u8>> },
    ZCard(Vec<u8>),

    // hash
    HSet { key: Vec<u8>, pairs: Vec<(Vec<u8>, Vec<u8>)> },
    HGet { key: Vec<u8>, field: Vec<u8> },
    HGetAll(Vec<u8>),
    HDel { key: Vec<u8>, fields: Vec<Vec<u8>> },
    HKeys(Vec<u8>),
    HVals(Vec<u8>),
    HLen(Vec<u8>),

    // geo
    GeoAdd { key: Vec<u8>, items: Vec<(f64, f64, Vec<u8>)> },
    GeoDist { key: Vec<u8>, a: Vec<u8>, b: Vec<u8>, unit: DistanceUnit },
    GeoPos { key: Vec<u8>, members: Vec<Vec<u8>> },
    GeoSearch { key: Vec<u8>, query: GeoQuery },

    // hyperloglog
    PfAdd { key: Vec<u8>, members: Vec<Vec<u8>> },
    PfCount(Vec<Vec<u8>>),
    PfMerge { dest: Vec<u8>, sources: Vec<Vec<u8>> },

    // pub/sub
    Publish { channel: Vec<u8>, message: Vec<u8> },

    // stream
    XAdd { key: Vec<u8>, id: XAddId, fields: Vec<(Vec<u8>, Vec<u8>)>, opts: XAddOptions },
    XLen(Vec<u8>),
    XRange { key: Vec<u8>, start: StreamId, end: StreamId, count: Option<usize> },
    XGroupCreate { key: Vec<u8>, group: Vec<u8>, start: GroupStart, mkstream: bool, replace: bool },
    XGroupCreateConsumer { key: Vec<u8>, group: Vec<u8>, consumer: Vec<u8> },
    XGroupDestroy { key: Vec<u8>, group: Vec<u8> },
    XGroupDelConsumer { key: Vec<u8>, group: Vec<u8>, consumer: Vec<u8> },
    XGroupSetId { key: Vec<u8>, group: Vec<u8>, start: GroupStart },
    XReadGroup(XReadGroup),
    XAck { key: Vec<u8>, group: Vec<u8>, ids: Vec<StreamId> },
    XPending { key: Vec<u8>, group: Vec<u8> },
    XClaim { key: Vec<u8>, group: Vec<u8>, consumer: Vec<u8>, min_idle_ms: u64, ids: Vec<StreamId> },
}

impl Command {
    /// Every key the command reads or writes, used to pick the shards to lock.
    pub fn keys(&self) -> Vec<&[u8]> {
        use Command::*;
        match self {
            Ping(_) | DbSize | Publish { .. } => Vec::new(),
            Del(keys) | Exists(keys) | PfCount(keys) => keys.iter().map(Vec::as_slice).collect(),
            PfMerge { dest, sources } => std::iter::once(dest.as_slice())
                .chain(sources.iter().map(Vec::as_slice))
                .collect(),
            Command::XReadGroup(r) => r.streams.iter().map(|(k, _)| k.as_slice()).collect(),
            Type(key) | Persist(key) | Get(key) | LPop(key) | RPop(key) | LLen(key) | SMembers(key)
            | SCard(key) | ZCard(key) | HGetAll(key) | HKeys(key) | HVals(key) | HLen(key) | XLen(key) => {
                vec![key.as_slice()]
            }
            Expire { key, .. }
            | Ttl { key, .. }
            | Set { key, .. }
            | IncrBy { key, .. }
            | LPush { key, .. }
            | RPush { key, .. }
            | LRange { key, .. }
            | SAdd { key, .. }
            | SRem { key, .. }
            | SIsMember { key, .. }
            | ZAdd { key, .. }
            | ZRange { key, .. }
            | ZRangeByScore { key, .. }
            | ZScore { key, .. }
            | ZRem { key, .. }
            | HSet { key, .. }
            | HGet { key, .. }
            | HDel { key, .. }
            | GeoAdd { key, .. }
            | GeoDist { key, .. }
            | GeoPos { key, .. }
            | GeoSearch { key, .. }
            | PfAdd { key, .. }
            | XAdd { key, .. }
            | XRange { key, .. }
            | XGroupCreate { key, .. }
            | XGroupCreateConsumer { key, .. }
            | XGroupDestroy { key, .. }
            | XGroupDelConsumer { key, .. }
            | XGroupSetId { key, .. }
            | XAck { key, .. }
            | XPending { key, .. }
            | XClaim { key, .. } => vec![key.as_slice()],
        }
    }

    /// DBSIZE needs every shard locked.
    pub fn spans_keyspace(&self) -> bool {
        matches!(self, Command::DbSize)
    }

    /// Commands that may modify the keys they name. Used for WATCH invalidation.
    pub fn is_write(&self) -> bool {
        use Command::*;
        matches!(
            self,
            Del(_)
                | Expire { .. }
                | Persist(_)
                | Set { .. }
                | IncrBy { .. }
                | LPush { .. }
                | RPush { .. }
                | LPop(_)
                | RPop(_)
                | SAdd { .. }
                | SRem { .. }
                | ZAdd { .. }
                | ZRem { .. }
                | HSet { .. }
                | HDel { .. }
                | GeoAdd { .. }
                | PfAdd { .. }
                | PfMerge { .. }
                | XAdd { .. }
                | XGroupCreate { .. }
                | XGroupCreateConsumer { .. }
                | XGroupDestroy { .. }
                | XGroupDelConsumer { .. }
                | XGroupSetId { .. }
                | Command::XReadGroup(_)
                | XAck { .. }
                | XClaim { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        use Command::*;
        match self {
            Ping(_) => "ping",
            Del(_) => "del",
            Exists(_) => "exists",
            Type(_) => "type",
            DbSize => "dbsize",
            Expire { .. } => "expire",
            Ttl { .. } => "ttl",
            Persist(_) => "persist",
            Get(_) => "get",
            Set { .. } => "set",
            IncrBy { .. } => "incrby",
            LPush { .. } => "lpush",
            RPush { .. } => "rpush",
            LPop(_) => "lpop",
            RPop(_) => "rpop",
            LRange { .. } => "lrange",
            LLen(_) => "llen",
            SAdd { .. } => "sadd",
            SRem { .. } => "srem",
            SMembers(_) => "smembers",
            SIsMember { .. } => "sismember",
            SCard(_) => "scard",
            ZAdd { .. } => "zadd",
            ZRange { .. } => "zrange",
            ZRangeByScore { .. } => "zrangebyscore",
            ZScore { .. } => "zscore",
            ZRem { .. } => "zrem",
            ZCard(_) => "zcard",
            HSet { .. } => "hset",
            HGet { .. } => "hget",
            HGetAll(_) => "hgetall",
            HDel { .. } => "hdel",
            HKeys(_) => "hkeys",
            HVals(_) => "hvals",
            HLen(_) => "hlen",
            GeoAdd { .. } => "geoadd",
            GeoDist { .. } => "geodist",
            GeoPos { .. } => "geopos",
            GeoSearch { .. } => "geosearch",
            PfAdd { .. } => "pfadd",
            PfCount(_) => "pfcount",
            PfMerge { .. } => "pfmerge",
            Publish { .. } => "publish",
            XAdd { .. } => "xadd",
            XLen(_) => "xlen",
            XRange { .. } => "xrange",
            XGroupCreate { .. }
            | XGroupCreateConsumer { .. }
            | XGroupDestroy { .. }
            | XGroupDelConsumer { .. }
            | XGroupSetId { .. } => "xgroup",
            Command::XReadGroup(_) => "xreadgroup",
            XAck { .. } => "xack",
            XPending { .. } => "xpending",
            XClaim { .. } => "xclaim",
        }
    }
}

/// A command result.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Pong,
    Queued,
    Nil,
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn bulk(b: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(b.into())
    }

    pub fn opt_bulk(b: Option<Vec<u8>>) -> Self {
        b.map_or(Reply::Nil, Reply::Bulk)
    }

    pub fn bulks<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Reply::Array(items.into_iter().map(Reply::Bulk).collect())
    }

    pub fn int(n: usize) -> Self {
        Reply::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }

    pub fn float(f: f64) -> Self {
        Reply::Bulk(format_float(f).into_bytes())
    }

    pub fn as_bulk(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// Shortest text that parses back to the same `f64`; `inf` / `-inf` for infinities.
pub fn format_float(f: f64) -> String {
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    f.to_string()
}

/// A request as seen by a connection: a data command or a session command.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Command(Command),
    Multi,
    Exec,
    Discard,
    Watch(Vec<Vec<u8>>),
    Unwatch,
    Subscribe(Vec<Vec<u8>>),
    PSubscribe(Vec<Vec<u8>>),
    Unsubscribe(Vec<Vec<u8>>),
    PUnsubscribe(Vec<Vec<u8>>),
    Quit,
}

/// Cursor over the arguments of one request.
struct Args {
    name: String,
    rest: std::vec::IntoIter<Vec<u8>>,
}

impl Args {
    fn arity(&self) -> StoreError {
        StoreError::arity(&self.name)
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        self.rest.next().ok_or_else(|| self.arity())
    }

    fn peek_is(&self, word: &str) -> bool {
        self.rest
            .as_slice()
            .first()
            .is_some_and(|a| a.eq_ignore_ascii_case(word.as_bytes()))
    }

    fn len(&self) -> usize {
        self.rest.len()
    }

    fn is_empty(&self) -> bool {
        self.rest.len() == 0
    }

    fn int(&mut self) -> Result<i64> {
        parse_int(&self.next()?)
    }

    fn uint(&mut self) -> Result<usize> {
        usize::try_from(self.int()?).map_err(|_| StoreError::NotInteger)
    }

    fn float(&mut self) -> Result<f64> {
        parse_float(&self.next()?)
    }

    /// All remaining arguments; at least one.
    fn many(&mut self) -> Result<Vec<Vec<u8>>> {
        let out: Vec<Vec<u8>> = self.rest.by_ref().collect();
        if out.is_empty() {
            return Err(self.arity());
        }
        Ok(out)
    }

    /// Remaining arguments as pairs; at least one.
    fn pairs(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if self.is_empty() || self.len() % 2 != 0 {
            return Err(self.arity());
        }
        let mut out = Vec::with_capacity(self.len() / 2);
        while let (Some(a), Some(b)) = (self.rest.next(), self.rest.next()) {
            out.push((a, b));
        }
        Ok(out)
    }

    fn done(&self) -> Result<()> {
        if self.is_empty() { Ok(()) } else { Err(self.arity()) }
    }

    /// Upper-cased next option keyword.
    fn keyword(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.next()?).to_ascii_uppercase())
    }
}

fn parse_int(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(StoreError::NotInteger)
}

fn parse_float(raw: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(raw).map_err(|_| StoreError::NotFloat)?;
    let v = match text.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other.parse::<f64>().map_err(|_| StoreError::NotFloat)?,
    };
    if v.is_nan() {
        return Err(StoreError::NotFloat);
    }
    Ok(v)
}

fn positive_ttl(value: i64, scale: u64, cmd: &str) -> Result<Duration> {
    match u64::try_from(value) {
        Ok(v) if v > 0 => Ok(Duration::from_millis(v.saturating_mul(scale))),
        _ => Err(StoreError::InvalidExpire(cmd.to_string())),
    }
}

impl Request {
    /// Decodes one request from its argument vector (command name first).
    pub fn parse(parts: Vec<Vec<u8>>) -> Result<Request> {
        let mut rest = parts.into_iter();
        let Some(name) = rest.next() else {
            return Err(StoreError::UnknownCommand(String::new()));
        };
        let name = String::from_utf8_lossy(&name).to_ascii_lowercase();
        let mut a = Args { name, rest };

        let req = match a.name.as_str() {
            "multi" => Request::Multi,
            "exec" => Request::Exec,
            "discard" => Request::Discard,
            "unwatch" => Request::Unwatch,
            "quit" => Request::Quit,
            "watch" => return Ok(Request::Watch(a.many()?)),
            "subscribe" => return Ok(Request::Subscribe(a.many()?)),
            "psubscribe" => return Ok(Request::PSubscribe(a.many()?)),
            "unsubscribe" => return Ok(Request::Unsubscribe(a.rest.by_ref().collect())),
            "punsubscribe" => return Ok(Request::PUnsubscribe(a.rest.by_ref().collect())),
            _ => return parse_command(&mut a).map(Request::Command),
        };
        a.done()?;
        Ok(req)
    }
}

impl Command {
    /// Parses a data command; session commands are rejected as unknown.
    pub fn parse(parts: Vec<Vec<u8>>) -> Result<Command> {
        match Request::parse(parts)? {
            Request::Command(cmd) => Ok(cmd),
            other => Err(StoreError::UnknownCommand(format!("{other:?}"))),
        }
    }
}

fn parse_command(a: &mut Args) -> Result<Command> {
    use Command::*;

    let cmd = match a.name.as_str() {
        "ping" => {
            let msg = a.rest.next();
            Ping(msg)
        }
        "del" => Del(a.many()?),
        "exists" => Exists(a.many()?),
        "type" => Type(a.next()?),
        "dbsize" => DbSize,
        "expire" | "pexpire" => {
            let key = a.next()?;
            let n = a.int()?;
            let millis = if a.name == "expire" { n.saturating_mul(1000) } else { n };
            Expire { key, millis }
        }
        "ttl" => Ttl { key: a.next()?, millis: false },
        "pttl" => Ttl { key: a.next()?, millis: true },
        "persist" => Persist(a.next()?),

        "get" => Get(a.next()?),
        "set" => {
            let key = a.next()?;
            let value = a.next()?;
            let ttl = if a.is_empty() {
                None
            } else {
                let unit = a.keyword()?;
                let n = a.int()?;
                match unit.as_str() {
                    "EX" => Some(positive_ttl(n, 1000, "set")?),
                    "PX" => Some(positive_ttl(n, 1, "set")?),
                    _ => return Err(StoreError::Syntax),
                }
            };
            Set { key, value, ttl }
        }
        "setex" => {
            let key = a.next()?;
            let secs = a.int()?;
            let value = a.next()?;
            Set { key, value, ttl: Some(positive_ttl(secs, 1000, "setex")?) }
        }
        "incr" => IncrBy { key: a.next()?, delta: 1 },
        "decr" => IncrBy { key: a.next()?, delta: -1 },
        "incrby" => IncrBy { key: a.next()?, delta: a.int()? },

        "lpush" => LPush { key: a.next()?, values: a.many()? },
        "rpush" => RPush { key: a.next()?, values: a.many()? },
        "lpop" => LPop(a.next()?),
        "rpop" => RPop(a.next()?),
        "lrange" => LRange { key: a.next()?, start: a.int()?, stop: a.int()? },
        "llen" => LLen(a.next()?),

        "sadd" => SAdd { key: a.next()?, members: a.many()? },
        "srem" => SRem { key: a.next()?, members: a.many()? },
        "smembers" => SMembers(a.next()?),
        "sismember" => SIsMember { key: a.next()?, member: a.next()? },
        "scard" => SCard(a.next()?),

        "zadd" => {
            let key = a.next()?;
            let pairs = a
                .pairs()?
                .into_iter()
                .map(|(score, member)| parse_float(&score).map(|s| (s, member)))
                .collect::<Result<Vec<_>>>()?;
            ZAdd { key, pairs }
        }
        "zrange" => {
            let (key, start, stop) = (a.next()?, a.int()?, a.int()?);
            let with_scores = with_scores(a)?;
            ZRange { key, start, stop, with_scores }
        }
        "zrangebyscore" => {
            let key = a.next()?;
            let min = ScoreBound::parse(&a.next()?)?;
            let max = ScoreBound::parse(&a.next()?)?;
            let with_scores = with_scores(a)?;
            ZRangeByScore { key, min, max, with_scores }
        }
        "zscore" => ZScore { key: a.next()?, member: a.next()? },
        "zrem" => ZRem { key: a.next()?, members: a.many()? },
        "zcard" => ZCard(a.next()?),

        "hset" => HSet { key: a.next()?, pairs: a.pairs()? },
        "hget" => HGet { key: a.next()?, field: a.next()? },
        "hgetall" => HGetAll(a.next()?),
        "hdel" => HDel { key: a.next()?, fields: a.many()? },
        "hkeys" => HKeys(a.next()?),
        "hvals" => HVals(a.next()?),
        "hlen" => HLen(a.next()?),

        "geoadd" => {
            let key = a.next()?;
            if a.is_empty() || a.len() % 3 != 0 {
                return Err(a.arity());
            }
            let mut items = Vec::with_capacity(a.len() / 3);
            while !a.is_empty() {
                items.push((a.float()?, a.float()?, a.next()?));
            }
            GeoAdd { key, items }
        }
        "geodist" => {
            let (key, m1, m2) = (a.next()?, a.next()?, a.next()?);
            let unit = match a.rest.next() {
                Some(u) => DistanceUnit::parse(&u)?,
                None => DistanceUnit::Meters,
            };
            GeoDist { key, a: m1, b: m2, unit }
        }
        "geopos" => GeoPos { key: a.next()?, members: a.many()? },
        "geosearch" => parse_geosearch(a)?,

        "pfadd" => PfAdd { key: a.next()?, members: a.rest.by_ref().collect() },
        "pfcount" => PfCount(a.many()?),
        "pfmerge" => PfMerge { dest: a.next()?, sources: a.rest.by_ref().collect() },

        "publish" => Publish { channel: a.next()?, message: a.next()? },

        "xadd" => parse_xadd(a)?,
        "xlen" => XLen(a.next()?),
        "xrange" => {
            let key = a.next()?;
            let start = StreamId::parse_start(&a.next()?)?;
            let end = StreamId::parse_end(&a.next()?)?;
            let count = if a.is_empty() {
                None
            } else if a.keyword()? == "COUNT" {
                Some(a.uint()?)
            } else {
                return Err(StoreError::Syntax);
            };
            XRange { key, start, end, count }
        }
        "xgroup" => parse_xgroup(a)?,
        "xreadgroup" => Command::XReadGroup(parse_xreadgroup(a)?),
        "xack" => {
            let (key, group) = (a.next()?, a.next()?);
            let ids = a.many()?.iter().map(|i| StreamId::parse(i)).collect::<Result<_>>()?;
            XAck { key, group, ids }
        }
        "xpending" => XPending { key: a.next()?, group: a.next()? },
        "xclaim" => {
            let (key, group, consumer) = (a.next()?, a.next()?, a.next()?);
            let min_idle_ms = a.uint()? as u64;
            let ids = a.many()?.iter().map(|i| StreamId::parse(i)).collect::<Result<_>>()?;
            XClaim { key, group, consumer, min_idle_ms, ids }
        }

        other => return Err(StoreError::UnknownCommand(other.to_string())),
    };
    a.done()?;
    Ok(cmd)
}

fn with_scores(a: &mut Args) -> Result<bool> {
    if a.is_empty() {
        return Ok(false);
    }
    if a.keyword()? == "WITHSCORES" { Ok(true) } else { Err(StoreError::Syntax) }
}

fn parse_geosearch(a: &mut Args) -> Result<Command> {
    let key = a.next()?;
    let mut origin = None;
    let mut shape = None;
    let mut descending = false;
    let mut count = None;
    let (mut with_dist, mut with_coord) = (false, false);

    while !a.is_empty() {
        match a.keyword()?.as_str() {
            "FROMMEMBER" => origin = Some(GeoOrigin::Member(a.next()?)),
            "FROMLONLAT" => origin = Some(GeoOrigin::LonLat(a.float()?, a.float()?)),
            "BYRADIUS" => {
                let radius = a.float()?;
                let unit = DistanceUnit::parse(&a.next()?)?;
                shape = Some(GeoShape::Radius { radius, unit });
            }
            "BYBOX" => {
                let (width, height) = (a.float()?, a.float()?);
                let unit = DistanceUnit::parse(&a.next()?)?;
                shape = Some(GeoShape::Box { width, height, unit });
            }
            "ASC" => descending = false,
            "DESC" => descending = true,
            "COUNT" => {
                let n = a.uint()?;
                if n == 0 {
                    return Err(StoreError::Syntax);
                }
                count = Some(n);
            }
            "WITHDIST" => with_dist = true,
            "WITHCOORD" => with_coord = true,
            _ => return Err(StoreError::Syntax),
        }
    }
    let (Some(origin), Some(shape)) = (origin, shape) else {
        return Err(StoreError::Syntax);
    };
    let mut query = GeoQuery::new(origin, shape);
    query.descending = descending;
    query.count = count;
    query.with_dist = with_dist;
    query.with_coord = with_coord;
    Ok(Command::GeoSearch { key, query })
}

fn parse_xadd(a: &mut Args) -> Result<Command> {
    let key = a.next()?;
    let mut opts = XAddOptions::default();
    loop {
        if a.peek_is("NOMKSTREAM") {
            a.next()?;
            opts.nomkstream = true;
        } else if a.peek_is("MAXLEN") {
            a.next()?;
            if a.peek_is("=") || a.peek_is("~") {
                a.next()?;
            }
            opts.maxlen = Some(a.uint()?);
        } else {
            break;
        }
    }
    let id = XAddId::parse(&a.next()?)?;
    let fields = a.pairs()?;
    Ok(Command::XAdd { key, id, fields, opts })
}

fn parse_xgroup(a: &mut Args) -> Result<Command> {
    use Command::*;
    let sub = a.keyword()?;
    let cmd = match sub.as_str() {
        "CREATE" => {
            let (key, group) = (a.next()?, a.next()?);
            let start = GroupStart::parse(&a.next()?)?;
            let (mut mkstream, mut replace) = (false, false);
            while !a.is_empty() {
                match a.keyword()?.as_str() {
                    "MKSTREAM" => mkstream = true,
                    "REPLACE" => replace = true,
                    _ => return Err(StoreError::Syntax),
                }
            }
            XGroupCreate { key, group, start, mkstream, replace }
        }
        "CREATECONSUMER" => XGroupCreateConsumer { key: a.next()?, group: a.next()?, consumer: a.next()? },
        "DESTROY" => XGroupDestroy { key: a.next()?, group: a.next()? },
        "DELCONSUMER" => XGroupDelConsumer { key: a.next()?, group: a.next()?, consumer: a.next()? },
        "SETID" => XGroupSetId { key: a.next()?, group: a.next()?, start: GroupStart::parse(&a.next()?)? },
        _ => return Err(StoreError::Syntax),
    };
    Ok(cmd)
}

fn parse_xreadgroup(a: &mut Args) -> Result<XReadGroup> {
    if a.keyword()? != "GROUP" {
        return Err(StoreError::Syntax);
    }
    let mut req = XReadGroup::new(a.next()?, a.next()?);
    loop {
        match a.keyword()?.as_str() {
            // COUNT 0 等同于不限制
            "COUNT" => req.count = Some(a.uint()?).filter(|&n| n > 0),
            "BLOCK" => req.block = Some(Duration::from_millis(a.uint()? as u64)),
            "NOACK" => req.noack = true,
            "STREAMS" => break,
            _ => return Err(StoreError::Syntax),
        }
    }
    let rest = a.many()?;
    if rest.len() % 2 != 0 {
        return Err(StoreError::Syntax);
    }
    let (keys, ids) = rest.split_at(rest.len() / 2);
    for (key, id) in keys.iter().zip(ids) {
        req.streams.push((key.clone(), ReadFrom::parse(id)?));
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(line: &str) -> Vec<Vec<u8>> {
        line.split_whitespace().map(|s| s.as_bytes().to_vec()).collect()
    }

    fn cmd(line: &str) -> Result<Command> {
        Command::parse(argv(line))
    }

    #[test]
    fn test_parse_strings_and_ttl() {
        assert_eq!(
            cmd("SETEX name 2 Marcell"),
            Ok(Command::Set {
                key: b"name".to_vec(),
                value: b"Marcell".to_vec(),
                ttl: Some(Duration::from_secs(2)),
            })
        );
        assert_eq!(
            cmd("set k v PX 150"),
            Ok(Command::Set { key: b"k".to_vec(), value: b"v".to_vec(), ttl: Some(Duration::from_millis(150)) })
        );
        assert_eq!(cmd("SETEX k 0 v"), Err(StoreError::InvalidExpire("setex".into())));
        assert_eq!(cmd("SET k v EX nope"), Err(StoreError::NotInteger));
        assert_eq!(cmd("SET k v KEEP 1"), Err(StoreError::Syntax));
        assert_eq!(cmd("GET"), Err(StoreError::arity("get")));
        assert_eq!(cmd("GET a b"), Err(StoreError::arity("get")));
        assert_eq!(cmd("incr n"), Ok(Command::IncrBy { key: b"n".to_vec(), delta: 1 }));
        assert_eq!(cmd("EXPIRE k 3"), Ok(Command::Expire { key: b"k".to_vec(), millis: 3000 }));
    }

    #[test]
    fn test_parse_collections() {
        assert_eq!(
            cmd("ZADD z 1.5 a -inf b"),
            Ok(Command::ZAdd { key: b"z".to_vec(), pairs: vec![(1.5, b"a".to_vec()), (f64::NEG_INFINITY, b"b".to_vec())] })
        );
        assert_eq!(cmd("ZADD z nan a"), Err(StoreError::NotFloat));
        assert_eq!(cmd("ZADD z 1"), Err(StoreError::arity("zadd")));
        assert!(matches!(cmd("ZRANGE z 0 -1 WITHSCORES"), Ok(Command::ZRange { with_scores: true, .. })));
        assert_eq!(cmd("HSET h f1 v1 f2"), Err(StoreError::arity("hset")));
        assert_eq!(cmd("LRANGE l a 1"), Err(StoreError::NotInteger));
        assert_eq!(cmd("FLUSHALL"), Err(StoreError::UnknownCommand("flushall".into())));
    }

    #[test]
    fn test_parse_geo() {
        let Ok(Command::GeoSearch { key, query }) =
            cmd("GEOSEARCH sellers FROMLONLAT 106.821666 -6.175494 BYRADIUS 5 km ASC WITHDIST COUNT 2")
        else {
            panic!("geosearch did not parse");
        };
        assert_eq!(key, b"sellers".to_vec());
        assert_eq!(query.origin, GeoOrigin::LonLat(106.821666, -6.175494));
        assert_eq!(query.shape, GeoShape::Radius { radius: 5.0, unit: DistanceUnit::Kilometers });
        assert_eq!(query.count, Some(2));
        assert!(query.with_dist && !query.with_coord && !query.descending);

        assert_eq!(cmd("GEOSEARCH sellers BYRADIUS 5 km"), Err(StoreError::Syntax));
        assert_eq!(cmd("GEOADD g 1 2"), Err(StoreError::arity("geoadd")));
        assert!(matches!(cmd("GEODIST g a b km"), Ok(Command::GeoDist { unit: DistanceUnit::Kilometers, .. })));
    }

    #[test]
    fn test_parse_streams() {
        let Ok(Command::XAdd { id, opts, fields, .. }) = cmd("XADD s NOMKSTREAM MAXLEN ~ 10 * f v") else {
            panic!("xadd did not parse");
        };
        assert_eq!(id, XAddId::Auto);
        assert_eq!(opts, XAddOptions { nomkstream: true, maxlen: Some(10) });
        assert_eq!(fields, vec![(b"f".to_vec(), b"v".to_vec())]);

        let Ok(Command::XReadGroup(r)) = cmd("XREADGROUP GROUP g c COUNT 2 BLOCK 0 STREAMS s1 s2 > 0-0") else {
            panic!("xreadgroup did not parse");
        };
        assert_eq!(r.count, Some(2));
        assert_eq!(r.block, Some(Duration::ZERO));
        assert_eq!(r.streams, vec![(b"s1".to_vec(), ReadFrom::New), (b"s2".to_vec(), ReadFrom::Pending(StreamId::ZERO))]);
        assert!(!r.may_block());

        let Ok(Command::XReadGroup(r)) = cmd("XREADGROUP GROUP g c COUNT 0 STREAMS s >") else {
            panic!("xreadgroup did not parse");
        };
        assert_eq!(r.count, None);

        assert!(matches!(
            cmd("XGROUP CREATE s g $ MKSTREAM REPLACE"),
            Ok(Command::XGroupCreate { start: GroupStart::Last, mkstream: true, replace: true, .. })
        ));
        assert_eq!(cmd("XADD s * f"), Err(StoreError::arity("xadd")));
        assert_eq!(cmd("XADD s 1-x f v"), Err(StoreError::InvalidStreamId));
    }

    #[test]
    fn test_parse_session_requests() {
        assert_eq!(Request::parse(argv("MULTI")), Ok(Request::Multi));
        assert_eq!(Request::parse(argv("watch a b")), Ok(Request::Watch(vec![b"a".to_vec(), b"b".to_vec()])));
        assert_eq!(Request::parse(argv("UNSUBSCRIBE")), Ok(Request::Unsubscribe(vec![])));
        assert_eq!(Request::parse(argv("SUBSCRIBE")), Err(StoreError::arity("subscribe")));
        assert_eq!(Request::parse(argv("EXEC now")), Err(StoreError::arity("exec")));
    }

    #[test]
    fn test_keys_and_write_flags() {
        let c = cmd("PFMERGE dest a b").unwrap();
        assert_eq!(c.keys(), vec![b"dest".as_slice(), b"a", b"b"]);
        assert!(c.is_write());
        assert!(!cmd("GET k").unwrap().is_write());
        assert!(cmd("PUBLISH ch msg").unwrap().keys().is_empty());
        assert_eq!(format_float(2.0), "2");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }
}
