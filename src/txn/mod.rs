// src/txn/mod.rs

//! # 批处理与事务
//!
//! - [`Pipeline`]：一次加锁执行一组命令，命令之间不会被其他客户端插入，每条命令单独返回结果
//! - [`Transaction`]：全有或全无；支持 WATCH 乐观锁，任一命令失败则回滚所有修改
//! - [`session::TxnSession`]：连接层的 MULTI / EXEC / DISCARD / WATCH 状态

pub mod executor;
pub mod session;

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::engine::{Command, Reply, Store};
use crate::error::Result;
use crate::types::stream::{XAddId, XAddOptions};

/// An ordered list of commands, built before being handed to a pipeline or
/// a transaction.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    commands: Vec<Command>,
}

fn bytes(v: impl AsRef<[u8]>) -> Vec<u8> {
    v.as_ref().to_vec()
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: Command) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::Set { key: bytes(key), value: bytes(value), ttl: None })
    }

    pub fn set_ex(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: Duration) -> &mut Self {
        self.push(Command::Set { key: bytes(key), value: bytes(value), ttl: Some(ttl) })
    }

    pub fn get(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::Get(bytes(key)))
    }

    pub fn del(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::Del(vec![bytes(key)]))
    }

    pub fn incr_by(&mut self, key: impl AsRef<[u8]>, delta: i64) -> &mut Self {
        self.push(Command::IncrBy { key: bytes(key), delta })
    }

    pub fn rpush(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::RPush { key: bytes(key), values: vec![bytes(value)] })
    }

    pub fn lpop(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::LPop(bytes(key)))
    }

    pub fn lrange(&mut self, key: impl AsRef<[u8]>, start: i64, stop: i64) -> &mut Self {
        self.push(Command::LRange { key: bytes(key), start, stop })
    }

    pub fn sadd(&mut self, key: impl AsRef<[u8]>, member: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::SAdd { key: bytes(key), members: vec![bytes(member)] })
    }

    pub fn zadd(&mut self, key: impl AsRef<[u8]>, score: f64, member: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::ZAdd { key: bytes(key), pairs: vec![(score, bytes(member))] })
    }

    pub fn hset(&mut self, key: impl AsRef<[u8]>, field: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::HSet { key: bytes(key), pairs: vec![(bytes(field), bytes(value))] })
    }

    pub fn hgetall(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::HGetAll(bytes(key)))
    }

    pub fn publish(&mut self, channel: impl AsRef<[u8]>, message: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::Publish { channel: bytes(channel), message: bytes(message) })
    }

    /// XADD with an auto-generated id.
    pub fn xadd(&mut self, key: impl AsRef<[u8]>, field: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.push(Command::XAdd {
            key: bytes(key),
            id: XAddId::Auto,
            fields: vec![(bytes(field), bytes(value))],
            opts: XAddOptions::default(),
        })
    }
}

/// Commands executed back to back under one lock acquisition.
pub struct Pipeline<'a> {
    store: &'a Store,
    batch: Batch,
}

impl Pipeline<'_> {
    /// One result per queued command, in order.
    pub fn execute(self) -> Vec<Result<Reply>> {
        executor::exec_pipeline(self.store, self.batch.commands())
    }
}

impl Deref for Pipeline<'_> {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        &self.batch
    }
}

impl DerefMut for Pipeline<'_> {
    fn deref_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }
}

/// An all-or-nothing batch with optional WATCH guards.
pub struct Transaction<'a> {
    store: &'a Store,
    batch: Batch,
    session: u64,
}

impl Transaction<'_> {
    /// Aborts the transaction if any of `keys` is written before `exec`.
    pub fn watch<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> &mut Self {
        self.store.watch_manager().watch(self.session, keys);
        self
    }

    /// Runs every queued command or none of them.
    pub fn exec(mut self) -> Result<Vec<Reply>> {
        let batch = std::mem::take(&mut self.batch);
        executor::exec_transaction(self.store, batch.commands(), Some(self.session))
    }
}

impl Deref for Transaction<'_> {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        &self.batch
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.store.watch_manager().unwatch(self.session);
    }
}

impl Store {
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline { store: self, batch: Batch::new() }
    }

    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            batch: Batch::new(),
            session: self.watch_manager().register(),
        }
    }
}
