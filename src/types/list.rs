// src/types/list.rs

//! # List Type Support
//!
//! Lists are double-ended queues. `RPUSH` appends at the tail and `LPOP`
//! removes from the head, so the pair behaves as a FIFO queue.
//!
//! Supported commands:
//! - `LPUSH`
//! - `RPUSH`
//! - `LPOP`
//! - `RPOP`
//! - `LRANGE`
//! - `LLEN`

use crate::engine::keyspace::Shard;
use crate::error::Result;
use crate::types::normalize_range;

/// Execute LPUSH:
/// Push every value to the head of the list, one after the other, so the
/// last argument ends up first.
///
/// # Returns
///
/// The new length of the list.
pub fn lpush(shard: &mut Shard, key: &[u8], values: &[Vec<u8>], now: u64) -> Result<usize> {
    let list = shard.list_or_create(key, now)?;
    for v in values {
        list.push_front(v.clone());
    }
    Ok(list.len())
}

/// Execute RPUSH:
/// Append every value to the tail of the list.
///
/// # Returns
///
/// The new length of the list.
pub fn rpush(shard: &mut Shard, key: &[u8], values: &[Vec<u8>], now: u64) -> Result<usize> {
    let list = shard.list_or_create(key, now)?;
    list.extend(values.iter().cloned());
    Ok(list.len())
}

/// Execute LPOP:
/// Pop the head element, or `None` if the list is empty or does not exist.
pub fn lpop(shard: &mut Shard, key: &[u8], now: u64) -> Result<Option<Vec<u8>>> {
    let popped = match shard.list_mut(key, now)? {
        Some(list) => list.pop_front(),
        None => return Ok(None),
    };
    shard.remove_if_empty(key);
    Ok(popped)
}

/// Execute RPOP:
/// Pop the tail element, or `None` if the list is empty or does not exist.
pub fn rpop(shard: &mut Shard, key: &[u8], now: u64) -> Result<Option<Vec<u8>>> {
    let popped = match shard.list_mut(key, now)? {
        Some(list) => list.pop_back(),
        None => return Ok(None),
    };
    shard.remove_if_empty(key);
    Ok(popped)
}

/// Execute LRANGE:
/// Return the elements in `[start, stop]`, both inclusive, supporting
/// negative indices (counting from the end, `-1` is the last element).
///
/// # Returns
///
/// The elements in range; empty if the range is empty or the key is missing.
pub fn lrange(shard: &mut Shard, key: &[u8], start: i64, stop: i64, now: u64) -> Result<Vec<Vec<u8>>> {
    let Some(list) = shard.list(key, now)? else {
        return Ok(Vec::new());
    };
    Ok(match normalize_range(start, stop, list.len()) {
        Some((s, e)) => list.range(s..=e).cloned().collect(),
        None => Vec::new(),
    })
}

pub fn llen(shard: &mut Shard, key: &[u8], now: u64) -> Result<usize> {
    Ok(shard.list(key, now)?.map_or(0, |l| l.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    /// Basic tests for List commands: LPUSH, RPUSH, LPOP, RPOP, LRANGE
    #[test]
    fn test_list_basic() -> Result<()> {
        let mut shard = Shard::default();

        // LPUSH / RPUSH
        assert_eq!(lpush(&mut shard, b"L", &vals(&["a"]), 0)?, 1);
        assert_eq!(lpush(&mut shard, b"L", &vals(&["b"]), 0)?, 2); // b, a
        assert_eq!(rpush(&mut shard, b"L", &vals(&["c"]), 0)?, 3); // b, a, c

        // LRANGE full and single-element
        assert_eq!(lrange(&mut shard, b"L", 0, 2, 0)?, vals(&["b", "a", "c"]));
        assert_eq!(lrange(&mut shard, b"L", 1, 1, 0)?, vals(&["a"]));

        // LPOP, RPOP
        assert_eq!(lpop(&mut shard, b"L", 0)?, Some(b"b".to_vec()));
        assert_eq!(rpop(&mut shard, b"L", 0)?, Some(b"c".to_vec()));
        assert_eq!(lrange(&mut shard, b"L", 0, -1, 0)?, vals(&["a"]));

        // Exhaust and empty pops
        assert_eq!(lpop(&mut shard, b"L", 0)?, Some(b"a".to_vec()));
        assert_eq!(lpop(&mut shard, b"L", 0)?, None);
        assert_eq!(rpop(&mut shard, b"L", 0)?, None);
        assert!(!shard.contains(b"L", 0));
        Ok(())
    }

    #[test]
    fn test_rpush_lpop_is_fifo() -> Result<()> {
        let mut shard = Shard::default();
        for name in ["Marcell", "Budi", "Putra"] {
            rpush(&mut shard, b"names", &vals(&[name]), 0)?;
        }
        assert_eq!(
            lrange(&mut shard, b"names", 0, -1, 0)?,
            vals(&["Marcell", "Budi", "Putra"])
        );
        assert_eq!(llen(&mut shard, b"names", 0)?, 3);
        for name in ["Marcell", "Budi", "Putra"] {
            assert_eq!(lpop(&mut shard, b"names", 0)?, Some(name.as_bytes().to_vec()));
        }
        Ok(())
    }

    #[test]
    fn test_multi_value_lpush_order() -> Result<()> {
        let mut shard = Shard::default();
        lpush(&mut shard, b"L", &vals(&["a", "b", "c"]), 0)?;
        assert_eq!(lrange(&mut shard, b"L", 0, -1, 0)?, vals(&["c", "b", "a"]));
        assert_eq!(lrange(&mut shard, b"missing", 0, -1, 0)?, Vec::<Vec<u8>>::new());
        Ok(())
    }
}
