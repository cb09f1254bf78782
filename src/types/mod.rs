// src/types/mod.rs

//! Data structure operations, one module per value family.
//!
//! Every function takes the already-locked [`Shard`](crate::engine::keyspace::Shard)
//! owning the key plus the current time; expiry and type checks happen through
//! the shard's typed accessors.

pub mod geo;
pub mod hash;
pub mod hll;
pub mod list;
pub mod set;
pub mod stream;
pub mod string;
pub mod zset;

/// Resolves an inclusive `[start, stop]` range with negative indices counting
/// from the end (`-1` is the last element). `None` when the range is empty.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let s = if start < 0 { (len + start).max(0) } else { start };
    let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if s > e || s >= len || e < 0 {
        return None;
    }
    Some((s as usize, e as usize))
}
