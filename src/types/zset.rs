// src/types/zset.rs

//! # Sorted Set Type Support
//!
//! Members are unique and ordered by `(score, member)`: ascending score, ties
//! broken by ascending member bytes. A score map gives O(1) lookups and an
//! ordered index gives range scans.
//!
//! Supported commands:
//! - `ZADD`
//! - `ZRANGE`
//! - `ZRANGEBYSCORE`
//! - `ZSCORE`
//! - `ZREM`
//! - `ZCARD`

use std::collections::{BTreeSet, HashMap};

use ordered_float::OrderedFloat;

use crate::engine::keyspace::Shard;
use crate::error::{Result, StoreError};
use crate::types::normalize_range;

#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: HashMap<Vec<u8>, f64>,
    ordered: BTreeSet<(OrderedFloat<f64>, Vec<u8>)>,
}

impl SortedSet {
    /// Inserts or re-scores a member. Returns `true` if it was new.
    pub fn insert(&mut self, member: &[u8], score: f64) -> bool {
        match self.scores.insert(member.to_vec(), score) {
            Some(old) => {
                self.ordered.remove(&(OrderedFloat(old), member.to_vec()));
                self.ordered.insert((OrderedFloat(score), member.to_vec()));
                false
            }
            None => {
                self.ordered.insert((OrderedFloat(score), member.to_vec()));
                true
            }
        }
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(OrderedFloat(score), member.to_vec()));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members in `(score, member)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], f64)> {
        self.ordered.iter().map(|(s, m)| (m.as_slice(), s.0))
    }
}

/// One end of a score interval, `(` prefix makes it exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    pub fn inclusive(value: f64) -> Self {
        ScoreBound { value, exclusive: false }
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| StoreError::NotFloat)?;
        let (exclusive, num) = match text.strip_prefix('(') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let value = match num.to_ascii_lowercase().as_str() {
            "-inf" => f64::NEG_INFINITY,
            "+inf" | "inf" => f64::INFINITY,
            other => other.parse::<f64>().map_err(|_| StoreError::NotFloat)?,
        };
        if value.is_nan() {
            return Err(StoreError::NotFloat);
        }
        Ok(ScoreBound { value, exclusive })
    }

    fn admits_above(&self, score: f64) -> bool {
        if self.exclusive { score > self.value } else { score >= self.value }
    }

    fn admits_below(&self, score: f64) -> bool {
        if self.exclusive { score < self.value } else { score <= self.value }
    }
}

/// ZADD key score member [score member ...]
/// Returns how many members were newly added; re-adding only updates the score.
pub fn zadd(shard: &mut Shard, key: &[u8], pairs: &[(f64, Vec<u8>)], now: u64) -> Result<usize> {
    if pairs.iter().any(|(s, _)| s.is_nan()) {
        return Err(StoreError::NotFloat);
    }
    let zset = shard.zset_or_create(key, now)?;
    Ok(pairs.iter().filter(|(s, m)| zset.insert(m, *s)).count())
}

/// ZRANGE key start stop, by rank with negative indices from the end.
pub fn zrange(shard: &mut Shard, key: &[u8], start: i64, stop: i64, now: u64) -> Result<Vec<(Vec<u8>, f64)>> {
    let Some(zset) = shard.zset(key, now)? else {
        return Ok(Vec::new());
    };
    Ok(match normalize_range(start, stop, zset.len()) {
        Some((s, e)) => zset
            .iter()
            .skip(s)
            .take(e - s + 1)
            .map(|(m, sc)| (m.to_vec(), sc))
            .collect(),
        None => Vec::new(),
    })
}

/// ZRANGEBYSCORE key min max
pub fn zrangebyscore(
    shard: &mut Shard,
    key: &[u8],
    min: ScoreBound,
    max: ScoreBound,
    now: u64,
) -> Result<Vec<(Vec<u8>, f64)>> {
    let Some(zset) = shard.zset(key, now)? else {
        return Ok(Vec::new());
    };
    Ok(zset
        .iter()
        .skip_while(|(_, s)| !min.admits_above(*s))
        .take_while(|(_, s)| max.admits_below(*s))
        .map(|(m, s)| (m.to_vec(), s))
        .collect())
}

pub fn zscore(shard: &mut Shard, key: &[u8], member: &[u8], now: u64) -> Result<Option<f64>> {
    Ok(shard.zset(key, now)?.and_then(|z| z.score(member)))
}

pub fn zrem(shard: &mut Shard, key: &[u8], members: &[Vec<u8>], now: u64) -> Result<usize> {
    let removed = match shard.zset_mut(key, now)? {
        Some(zset) => members.iter().filter(|m| zset.remove(m)).count(),
        None => return Ok(0),
    };
    shard.remove_if_empty(key);
    Ok(removed)
}

pub fn zcard(shard: &mut Shard, key: &[u8], now: u64) -> Result<usize> {
    Ok(shard.zset(key, now)?.map_or(0, |z| z.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: Vec<(Vec<u8>, f64)>) -> Vec<String> {
        items
            .into_iter()
            .map(|(m, _)| String::from_utf8(m).unwrap())
            .collect()
    }

    #[test]
    fn test_zadd_is_idempotent_and_rescores() -> Result<()> {
        let mut shard = Shard::default();
        for (score, name) in [(100.0, "Marcell"), (100.0, "Marcell"), (85.0, "Budi"), (85.0, "Budi"), (95.0, "Putra"), (95.0, "Putra")] {
            zadd(&mut shard, b"names", &[(score, name.as_bytes().to_vec())], 0)?;
        }
        assert_eq!(zcard(&mut shard, b"names", 0)?, 3);
        assert_eq!(names(zrange(&mut shard, b"names", 0, -1, 0)?), ["Budi", "Putra", "Marcell"]);

        assert_eq!(zadd(&mut shard, b"names", &[(1.0, b"Marcell".to_vec())], 0)?, 0);
        assert_eq!(zscore(&mut shard, b"names", b"Marcell", 0)?, Some(1.0));
        assert_eq!(names(zrange(&mut shard, b"names", 0, 0, 0)?), ["Marcell"]);
        Ok(())
    }

    #[test]
    fn test_ties_break_on_member() -> Result<()> {
        let mut shard = Shard::default();
        zadd(
            &mut shard,
            b"z",
            &[(1.0, b"c".to_vec()), (1.0, b"a".to_vec()), (0.5, b"z".to_vec()), (1.0, b"b".to_vec())],
            0,
        )?;
        assert_eq!(names(zrange(&mut shard, b"z", 0, -1, 0)?), ["z", "a", "b", "c"]);
        assert_eq!(names(zrange(&mut shard, b"z", -2, -1, 0)?), ["b", "c"]);
        Ok(())
    }

    #[test]
    fn test_range_by_score_bounds() -> Result<()> {
        let mut shard = Shard::default();
        zadd(
            &mut shard,
            b"z",
            &[(1.0, b"a".to_vec()), (2.0, b"b".to_vec()), (3.0, b"c".to_vec())],
            0,
        )?;
        let all = zrangebyscore(&mut shard, b"z", ScoreBound::parse(b"-inf")?, ScoreBound::parse(b"+inf")?, 0)?;
        assert_eq!(names(all), ["a", "b", "c"]);
        let open = zrangebyscore(&mut shard, b"z", ScoreBound::parse(b"(1")?, ScoreBound::parse(b"3")?, 0)?;
        assert_eq!(names(open), ["b", "c"]);
        let closed = zrangebyscore(&mut shard, b"z", ScoreBound::inclusive(2.0), ScoreBound::parse(b"(3")?, 0)?;
        assert_eq!(names(closed), ["b"]);
        assert_eq!(ScoreBound::parse(b"abc"), Err(StoreError::NotFloat));
        Ok(())
    }

    #[test]
    fn test_zrem_drops_empty_key() -> Result<()> {
        let mut shard = Shard::default();
        zadd(&mut shard, b"z", &[(1.0, b"a".to_vec())], 0)?;
        assert_eq!(zrem(&mut shard, b"z", &[b"a".to_vec(), b"b".to_vec()], 0)?, 1);
        assert!(!shard.contains(b"z", 0));
        assert_eq!(zadd(&mut shard, b"z", &[(f64::NAN, b"a".to_vec())], 0), Err(StoreError::NotFloat));
        Ok(())
    }
}
