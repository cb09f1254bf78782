// src/types/set.rs

//! # Set Type Support
//!
//! Unordered sets of unique members. Adding a member that is already present
//! is a no-op; `SMEMBERS` gives no ordering guarantee.
//!
//! Supported commands:
//! - `SADD`
//! - `SREM`
//! - `SMEMBERS`
//! - `SISMEMBER`
//! - `SCARD`

use crate::engine::keyspace::Shard;
use crate::error::Result;

/// Execute the SADD command:
/// Add the given `members` to the set stored at `key`.
///
/// # Returns
///
/// The number of members that were not already present.
pub fn sadd(shard: &mut Shard, key: &[u8], members: &[Vec<u8>], now: u64) -> Result<usize> {
    let set = shard.set_or_create(key, now)?;
    Ok(members.iter().filter(|m| set.insert((*m).clone())).count())
}

/// Execute the SREM command:
/// Remove the given `members` from the set stored at `key`.
///
/// # Returns
///
/// The number of members that existed and were removed.
pub fn srem(shard: &mut Shard, key: &[u8], members: &[Vec<u8>], now: u64) -> Result<usize> {
    let removed = match shard.set_mut(key, now)? {
        Some(set) => members.iter().filter(|m| set.remove(*m)).count(),
        None => return Ok(0),
    };
    shard.remove_if_empty(key);
    Ok(removed)
}

/// Execute the SMEMBERS command:
/// Retrieve all members of the set stored at `key`, in no particular order.
pub fn smembers(shard: &mut Shard, key: &[u8], now: u64) -> Result<Vec<Vec<u8>>> {
    Ok(shard
        .set(key, now)?
        .map(|s| s.iter().cloned().collect())
        .unwrap_or_default())
}

/// Execute the SISMEMBER command.
pub fn sismember(shard: &mut Shard, key: &[u8], member: &[u8], now: u64) -> Result<bool> {
    Ok(shard.set(key, now)?.is_some_and(|s| s.contains(member)))
}

pub fn scard(shard: &mut Shard, key: &[u8], now: u64) -> Result<usize> {
    Ok(shard.set(key, now)?.map_or(0, |s| s.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> Vec<Vec<u8>> {
        vec![s.as_bytes().to_vec()]
    }

    /// Basic tests for Set commands: SADD, SREM, SMEMBERS, SISMEMBER
    #[test]
    fn test_set_basic() -> Result<()> {
        let mut shard = Shard::default();

        // SADD: add members "a" and "b"
        assert_eq!(sadd(&mut shard, b"S", &m("a"), 0)?, 1);
        assert_eq!(sadd(&mut shard, b"S", &m("a"), 0)?, 0); // already exists
        assert_eq!(sadd(&mut shard, b"S", &m("b"), 0)?, 1);

        // SISMEMBER: check membership
        assert!(sismember(&mut shard, b"S", b"a", 0)?);
        assert!(!sismember(&mut shard, b"S", b"x", 0)?);

        // SMEMBERS: list all members
        let mut ms = smembers(&mut shard, b"S", 0)?;
        ms.sort();
        assert_eq!(ms, vec![b"a".to_vec(), b"b".to_vec()]);

        // SREM: remove member "a"
        assert_eq!(srem(&mut shard, b"S", &m("a"), 0)?, 1);
        assert_eq!(srem(&mut shard, b"S", &m("a"), 0)?, 0); // already removed

        // After removal, only "b" remains
        assert_eq!(smembers(&mut shard, b"S", 0)?, vec![b"b".to_vec()]);
        assert_eq!(scard(&mut shard, b"S", 0)?, 1);

        srem(&mut shard, b"S", &m("b"), 0)?;
        assert!(!shard.contains(b"S", 0));
        Ok(())
    }

    #[test]
    fn test_sadd_idempotent() -> Result<()> {
        let mut shard = Shard::default();
        for name in ["Marcell", "Marcell", "Budi", "Budi", "Putra", "Putra"] {
            sadd(&mut shard, b"names", &m(name), 0)?;
        }
        let mut got = smembers(&mut shard, b"names", 0)?;
        got.sort();
        let mut want: Vec<Vec<u8>> = ["Marcell", "Budi", "Putra"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        want.sort();
        assert_eq!(got, want);
        Ok(())
    }
}
