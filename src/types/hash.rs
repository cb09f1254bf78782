// src/types/hash.rs

//! 支持 Hash 类型：field -> value 映射
//! 数值在写入前已经是文本，读取时原样返回

use crate::engine::keyspace::Shard;
use crate::error::Result;

/// HSET key field value [field value ...]
/// 返回新建的 field 数量（覆盖旧值不计入）
pub fn hset(shard: &mut Shard, key: &[u8], pairs: &[(Vec<u8>, Vec<u8>)], now: u64) -> Result<usize> {
    let hash = shard.hash_or_create(key, now)?;
    let mut created = 0;
    for (field, value) in pairs {
        if hash.insert(field.clone(), value.clone()).is_none() {
            created += 1;
        }
    }
    Ok(created)
}

/// HGET key field
/// field 不存在时返回 None
pub fn hget(shard: &mut Shard, key: &[u8], field: &[u8], now: u64) -> Result<Option<Vec<u8>>> {
    Ok(shard.hash(key, now)?.and_then(|h| h.get(field).cloned()))
}

/// HDEL key field [field ...]
/// 返回实际删除的 field 数量
pub fn hdel(shard: &mut Shard, key: &[u8], fields: &[Vec<u8>], now: u64) -> Result<usize> {
    let removed = match shard.hash_mut(key, now)? {
        Some(hash) => fields.iter().filter(|f| hash.remove(*f).is_some()).count(),
        None => return Ok(0),
    };
    shard.remove_if_empty(key);
    Ok(removed)
}

/// HGETALL key
/// 返回所有 (field, value)，顺序不固定
pub fn hgetall(shard: &mut Shard, key: &[u8], now: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    Ok(shard
        .hash(key, now)?
        .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
        .unwrap_or_default())
}

/// HKEYS key
pub fn hkeys(shard: &mut Shard, key: &[u8], now: u64) -> Result<Vec<Vec<u8>>> {
    Ok(shard
        .hash(key, now)?
        .map(|h| h.keys().cloned().collect())
        .unwrap_or_default())
}

/// HVALS key
pub fn hvals(shard: &mut Shard, key: &[u8], now: u64) -> Result<Vec<Vec<u8>>> {
    Ok(shard
        .hash(key, now)?
        .map(|h| h.values().cloned().collect())
        .unwrap_or_default())
}

pub fn hlen(shard: &mut Shard, key: &[u8], now: u64) -> Result<usize> {
    Ok(shard.hash(key, now)?.map_or(0, |h| h.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pair(f: &str, v: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![(f.as_bytes().to_vec(), v.as_bytes().to_vec())]
    }

    #[test]
    fn test_hash_basic() -> Result<()> {
        let mut shard = Shard::default();

        // HSET 新 field
        assert_eq!(hset(&mut shard, b"myhash", &pair("f1", "v1"), 0)?, 1);
        // HSET 覆盖 field
        assert_eq!(hset(&mut shard, b"myhash", &pair("f1", "v1a"), 0)?, 0);
        // HGET 存在 / 不存在
        assert_eq!(hget(&mut shard, b"myhash", b"f1", 0)?, Some(b"v1a".to_vec()));
        assert_eq!(hget(&mut shard, b"myhash", b"f2", 0)?, None);

        // HKEYS / HVALS
        hset(&mut shard, b"myhash", &pair("f2", "v2"), 0)?;
        let mut ks = hkeys(&mut shard, b"myhash", 0)?;
        ks.sort();
        assert_eq!(ks, vec![b"f1".to_vec(), b"f2".to_vec()]);
        let mut vs = hvals(&mut shard, b"myhash", 0)?;
        vs.sort();
        assert_eq!(vs, vec![b"v1a".to_vec(), b"v2".to_vec()]);
        assert_eq!(hlen(&mut shard, b"myhash", 0)?, 2);

        // HDEL 存在 / 不存在
        assert_eq!(hdel(&mut shard, b"myhash", &[b"f1".to_vec()], 0)?, 1);
        assert_eq!(hdel(&mut shard, b"myhash", &[b"no".to_vec()], 0)?, 0);
        assert_eq!(hget(&mut shard, b"myhash", b"f1", 0)?, None);
        Ok(())
    }

    #[test]
    fn test_hgetall_numeric_as_text() -> Result<()> {
        let mut shard = Shard::default();
        hset(&mut shard, b"user:1", &pair("name", "Marcell"), 0)?;
        hset(&mut shard, b"user:1", &pair("email", "marcell@gmail.com"), 0)?;
        hset(&mut shard, b"user:1", &pair("age", &30.to_string()), 0)?;

        let all: HashMap<_, _> = hgetall(&mut shard, b"user:1", 0)?.into_iter().collect();
        let want: HashMap<_, _> = [
            ("name", "Marcell"),
            ("email", "marcell@gmail.com"),
            ("age", "30"),
        ]
        .iter()
        .map(|(f, v)| (f.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
        assert_eq!(all, want);
        Ok(())
    }
}
