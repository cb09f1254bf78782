// src/expire.rs

//! 过期策略
//!
//! - 惰性过期：每次访问 key 之前由 `Shard` 检查 deadline，过期即删除
//! - 定期过期：后台任务按 shard 逐个清理，每个 shard 每轮最多清理固定数量的 key
//!
//! Deadlines are absolute milliseconds since the Unix epoch. Each shard keeps an
//! [`ExpiryIndex`] ordered by deadline so a sweep only touches keys that are due.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::interval;
use tracing::{debug, warn};

use crate::engine::Store;

/// 返回当前的 UNIX 毫秒
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time source for the store.
///
/// `Manual` lets tests move time forward without sleeping.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicU64>),
}

impl Clock {
    pub fn manual(start_ms: u64) -> Self {
        Clock::Manual(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn now_ms(&self) -> u64 {
        match self {
            Clock::System => now_ms(),
            Clock::Manual(t) => t.load(Ordering::SeqCst),
        }
    }

    /// Moves a manual clock forward. No-op on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(t) = self {
            t.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }
}

/// Converts a relative TTL into an absolute deadline.
pub fn deadline_after(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(ttl.as_millis() as u64)
}

/// Deadline-ordered index of the keys of one shard that carry a TTL.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    due: BTreeSet<(u64, Vec<u8>)>,
}

impl ExpiryIndex {
    pub fn schedule(&mut self, key: &[u8], at: u64) {
        self.due.insert((at, key.to_vec()));
    }

    pub fn cancel(&mut self, key: &[u8], at: u64) {
        self.due.remove(&(at, key.to_vec()));
    }

    /// Up to `limit` keys whose deadline is `<= now`, earliest first.
    pub fn due(&self, now: u64, limit: usize) -> Vec<Vec<u8>> {
        self.due
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    pub fn clear(&mut self) {
        self.due.clear();
    }
}

/// 后台定时清理任务
///
/// Runs until the task is aborted. Each tick sweeps the shards one after the
/// other; a shard lock is held only while that shard's budget is processed.
pub async fn start_cleaner(store: Arc<Store>, every: Duration, keys_per_shard: usize) {
    let mut iv = interval(every);
    loop {
        iv.tick().await;
        match store.sweep_expired(keys_per_shard) {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "expire sweep"),
            // 下一轮重试
            Err(e) => warn!(error = %e, "expire sweep failed"),
        }
    }
}
