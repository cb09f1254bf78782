// src/types/string.rs

//! String 类型
//!
//! - SET / SETEX 覆盖写入；不带 TTL 的写入会清除原有的过期时间
//! - GET 返回 value，key 不存在或已过期时返回 `None`
//! - INCR / DECR / INCRBY 以十进制文本存储整数，保留原有过期时间

use crate::engine::keyspace::{Shard, Value};
use crate::error::{Result, StoreError};

/// 写入字符串，`expires_at` 为绝对 deadline（毫秒）。
pub fn set(shard: &mut Shard, key: &[u8], value: &[u8], expires_at: Option<u64>) {
    shard.insert(key, Value::String(value.to_vec()), expires_at);
}

/// 读取字符串。
///
/// # 错误
/// - key 绑定的不是字符串时返回 `WrongType`
pub fn get(shard: &mut Shard, key: &[u8], now: u64) -> Result<Option<Vec<u8>>> {
    Ok(shard.string(key, now)?.cloned())
}

/// 原子地加上 `delta`，key 不存在时视为 0。
pub fn incr_by(shard: &mut Shard, key: &[u8], delta: i64, now: u64) -> Result<i64> {
    let old = match shard.string(key, now)? {
        Some(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(StoreError::NotInteger)?,
        None => 0,
    };
    // 检查溢出
    let new = old.checked_add(delta).ok_or(StoreError::Overflow)?;
    shard.replace_value(key, Value::String(new.to_string().into_bytes()), now);
    Ok(new)
}
