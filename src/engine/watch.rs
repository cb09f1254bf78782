// src/engine/watch.rs

//! WATCH 支持：乐观锁
//!
//! 会话在 MULTI 之前 WATCH 若干 key；只要其中任意一个 key 在 EXEC 之前被写入
//! （或过期删除），该会话就被标记为脏，EXEC 随之中止。

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};

#[derive(Debug, Default)]
pub struct WatchManager {
    next_session: AtomicU64,
    // key -> 监视该 key 的会话 ID 集合
    watched_keys: DashMap<Vec<u8>, DashSet<u64>>,
    // 会话 ID -> 该会话监视的 key 集合
    session_watches: DashMap<u64, DashSet<Vec<u8>>>,
    // 已被标记为脏的会话
    dirty: DashSet<u64>,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配一个新的会话 ID
    pub fn register(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    // 添加监视
    pub fn watch<K: AsRef<[u8]>>(&self, session_id: u64, keys: &[K]) {
        for key in keys {
            let key = key.as_ref();
            self.watched_keys
                .entry(key.to_vec())
                .or_default()
                .insert(session_id);
            self.session_watches
                .entry(session_id)
                .or_default()
                .insert(key.to_vec());
        }
    }

    // 移除 session 的所有监视，并清除脏标记
    pub fn unwatch(&self, session_id: u64) {
        if let Some((_, keys)) = self.session_watches.remove(&session_id) {
            for key in keys.iter() {
                let now_empty = match self.watched_keys.get(key.as_slice()) {
                    Some(sessions) => {
                        sessions.remove(&session_id);
                        sessions.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.watched_keys.remove_if(key.as_slice(), |_, s| s.is_empty());
                }
            }
        }
        self.dirty.remove(&session_id);
    }

    /// 通知 key 被修改，返回受影响的会话
    pub fn touch(&self, key: &[u8]) -> Vec<u64> {
        // 没有任何监视时走快速路径
        if self.watched_keys.is_empty() {
            return Vec::new();
        }
        let Some((_, sessions)) = self.watched_keys.remove(key) else {
            return Vec::new();
        };
        let affected: Vec<u64> = sessions.into_iter().collect();
        for id in &affected {
            self.dirty.insert(*id);
        }
        affected
    }

    // 检查会话是否标记为脏
    pub fn is_dirty(&self, session_id: u64) -> bool {
        self.dirty.contains(&session_id)
    }

    /// 会话当前监视的 key
    pub fn watched(&self, session_id: u64) -> Vec<Vec<u8>> {
        self.session_watches
            .get(&session_id)
            .map(|keys| keys.iter().map(|k| k.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_watching(&self, session_id: u64) -> bool {
        self.session_watches.contains_key(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_and_notify() {
        let manager = WatchManager::new();
        let session_id = manager.register();
        let keys = [b"key1".to_vec(), b"key2".to_vec()];

        // 添加监视
        manager.watch(session_id, &keys);
        assert!(manager.watched_keys.contains_key(b"key1".as_slice()));
        assert_eq!(manager.watched_keys.get(b"key1".as_slice()).unwrap().len(), 1);
        assert!(!manager.is_dirty(session_id));

        // 通知无关 key
        assert!(manager.touch(b"other").is_empty());
        // 通知键被修改
        assert_eq!(manager.touch(b"key1"), vec![session_id]);
        assert!(manager.is_dirty(session_id));

        // 清除监视
        manager.unwatch(session_id);
        assert!(!manager.is_watching(session_id));
        assert!(!manager.is_dirty(session_id));
        assert!(manager.watched_keys.is_empty());
    }

    #[test]
    fn test_sessions_are_independent() {
        let manager = WatchManager::new();
        let a = manager.register();
        let b = manager.register();
        assert_ne!(a, b);
        manager.watch(a, &[b"k"]);
        manager.watch(b, &[b"j"]);

        manager.touch(b"k");
        assert!(manager.is_dirty(a));
        assert!(!manager.is_dirty(b));
    }
}
