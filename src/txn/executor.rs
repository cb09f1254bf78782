// src/txn/executor.rs

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::engine::{Command, Reply, Store, wakes_readers};
use crate::error::{Result, StoreError};

// 管道的执行命令
// 一次性锁定所有涉及的 shard，逐一执行，每条命令独立返回结果
pub fn exec_pipeline(store: &Store, cmds: &[Command]) -> Vec<Result<Reply>> {
    if cmds.is_empty() {
        return Vec::new();
    }
    let now = store.clock().now_ms();
    let mut locks = store.lock_for(cmds, &[]);

    let mut out = Vec::with_capacity(cmds.len());
    let mut touched = Vec::new();
    let mut wake = false;
    for cmd in cmds {
        let res = store.apply(&mut locks, cmd, now);
        if res.is_ok() {
            if cmd.is_write() {
                touched.extend(cmd.keys().into_iter().map(<[u8]>::to_vec));
            }
            wake |= wakes_readers(cmd);
        }
        out.push(res);
    }
    touched.extend(locks.take_evicted());
    store.notify(&touched);
    drop(locks);

    if wake {
        store.wake_readers();
    }
    out
}

// 事务的执行命令
// 任一命令失败则全部回滚；WATCH 的 key 被修改过则直接中止
// 无论结果如何，执行后会话的 WATCH 都被清除
pub fn exec_transaction(store: &Store, cmds: &[Command], session: Option<u64>) -> Result<Vec<Reply>> {
    let out = run_transaction(store, cmds, session);
    if let Some(id) = session {
        store.watch_manager().unwatch(id);
    }
    out
}

fn run_transaction(store: &Store, cmds: &[Command], session: Option<u64>) -> Result<Vec<Reply>> {
    let watched = session
        .map(|id| store.watch_manager().watched(id))
        .unwrap_or_default();
    let now = store.clock().now_ms();
    let mut locks = store.lock_for(cmds, &watched);

    if let Some(id) = session {
        // 被监视的 key 在此刻过期也算修改
        for key in &watched {
            locks.shard(key)?.contains(key, now);
        }
        let evicted = locks.take_evicted();
        store.notify(&evicted);
        if store.watch_manager().is_dirty(id) {
            debug!(session = id, "transaction aborted by WATCH");
            return Err(StoreError::TransactionAborted("watched key modified".into()));
        }
    }

    let keys: BTreeSet<Vec<u8>> = cmds
        .iter()
        .flat_map(Command::keys)
        .map(<[u8]>::to_vec)
        .collect();
    let mut snapshot = Vec::with_capacity(keys.len());
    for key in keys {
        let entry = locks.shard(&key)?.snapshot(&key);
        snapshot.push((key, entry));
    }

    let mut replies = Vec::with_capacity(cmds.len());
    let mut deferred = Vec::new();
    for (idx, cmd) in cmds.iter().enumerate() {
        // PUBLISH 延迟到提交之后
        if let Command::Publish { channel, message } = cmd {
            deferred.push((idx, channel, message));
            replies.push(Reply::Integer(0));
            continue;
        }
        match store.apply(&mut locks, cmd, now) {
            Ok(reply) => replies.push(reply),
            Err(e) => {
                for (key, entry) in snapshot {
                    locks.shard(&key)?.restore(&key, entry);
                }
                // 回滚后这些惰性删除也一并撤销
                locks.take_evicted();
                warn!(command = cmd.name(), error = %e, "transaction rolled back");
                return Err(StoreError::TransactionAborted(format!("'{}' failed: {e}", cmd.name())));
            }
        }
    }

    let mut touched: Vec<Vec<u8>> = cmds
        .iter()
        .filter(|c| c.is_write())
        .flat_map(Command::keys)
        .map(<[u8]>::to_vec)
        .collect();
    touched.extend(locks.take_evicted());
    store.notify(&touched);
    drop(locks);

    for (idx, channel, message) in deferred {
        replies[idx] = Reply::int(store.pubsub().publish(channel, message));
    }
    if cmds.iter().any(wakes_readers) {
        store.wake_readers();
    }
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StoreOptions;
    use crate::expire::Clock;

    fn make_store() -> Store {
        Store::new(StoreOptions {
            shard_count: 8,
            clock: Clock::manual(1_000),
            ..StoreOptions::default()
        })
    }

    fn set(key: &str, value: &str) -> Command {
        Command::Set { key: key.into(), value: value.into(), ttl: None }
    }

    // 管道中的错误只影响该命令本身
    #[test]
    fn test_pipeline_reports_per_command() {
        let store = make_store();
        let cmds = vec![
            set("a", "1"),
            Command::LPush { key: b"a".to_vec(), values: vec![b"x".to_vec()] },
            Command::IncrBy { key: b"a".to_vec(), delta: 2 },
            Command::DbSize,
        ];
        let out = exec_pipeline(&store, &cmds);
        assert_eq!(out[0], Ok(Reply::Ok));
        assert_eq!(out[1], Err(StoreError::WrongType));
        assert_eq!(out[2], Ok(Reply::Integer(3)));
        assert_eq!(out[3], Ok(Reply::Integer(1)));
    }

    // 事务中任一命令失败则全部回滚
    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = make_store();
        store.set("a", "old").unwrap();
        store.rpush("l", &["x"]).unwrap();

        let cmds = vec![
            set("a", "new"),
            set("b", "fresh"),
            Command::LPop(b"l".to_vec()),
            Command::IncrBy { key: b"a".to_vec(), delta: 1 },
        ];
        let err = exec_transaction(&store, &cmds, None).unwrap_err();
        assert!(matches!(err, StoreError::TransactionAborted(_)));

        assert_eq!(store.get("a").unwrap(), Some(b"old".to_vec()));
        assert_eq!(store.get("b").unwrap(), None);
        assert_eq!(store.lrange("l", 0, -1).unwrap(), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_transaction_publishes_after_commit() {
        let store = make_store();
        let mut sub = store.pubsub().subscribe(&[b"news".to_vec()]);
        let cmds = vec![
            set("a", "1"),
            Command::Publish { channel: b"news".to_vec(), message: b"hello".to_vec() },
        ];
        let out = exec_transaction(&store, &cmds, None).unwrap();
        assert_eq!(out, vec![Reply::Ok, Reply::Integer(1)]);
        assert_eq!(sub.try_recv().map(|m| m.payload), Some(b"hello".to_vec()));

        // 回滚的事务不发布
        let cmds = vec![
            Command::Publish { channel: b"news".to_vec(), message: b"lost".to_vec() },
            Command::LPush { key: b"a".to_vec(), values: vec![b"x".to_vec()] },
        ];
        assert!(exec_transaction(&store, &cmds, None).is_err());
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_watch_aborts_after_foreign_write() {
        let store = make_store();
        let session = store.watch_manager().register();
        store.watch_manager().watch(session, &[b"balance"]);

        store.set("balance", "100").unwrap();
        let err = exec_transaction(&store, &[set("balance", "0")], Some(session)).unwrap_err();
        assert_eq!(err, StoreError::TransactionAborted("watched key modified".into()));
        assert_eq!(store.get("balance").unwrap(), Some(b"100".to_vec()));
        // 执行后清除 WATCH
        assert!(!store.watch_manager().is_watching(session));

        store.watch_manager().watch(session, &[b"balance"]);
        let out = exec_transaction(&store, &[set("balance", "0")], Some(session)).unwrap();
        assert_eq!(out, vec![Reply::Ok]);
    }
}
