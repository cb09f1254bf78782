// src/txn/session.rs

use crate::engine::{Command, Reply, Store};
use crate::error::{Result, StoreError};
use crate::txn::executor::exec_transaction;

/// 保存单个连接的 MULTI 队列与 WATCH 状态
#[derive(Debug, Default)]
pub struct TxnSession {
    pub in_multi: bool,
    pub queue: Vec<Command>,
    // 入队时出现过解析错误，EXEC 必须中止
    queue_error: bool,
    watch_id: Option<u64>,
}

impl TxnSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> Result<Reply> {
        if self.in_multi {
            return Err(StoreError::NestedMulti);
        }
        self.in_multi = true;
        self.queue.clear();
        self.queue_error = false;
        Ok(Reply::Ok)
    }

    pub fn enqueue(&mut self, cmd: Command) -> Result<Reply> {
        if !self.in_multi {
            return Err(StoreError::NotInMulti("queueing"));
        }
        self.queue.push(cmd);
        Ok(Reply::Queued)
    }

    /// 记录一条无法入队的命令
    pub fn mark_error(&mut self) {
        if self.in_multi {
            self.queue_error = true;
        }
    }

    pub fn discard(&mut self, store: &Store) -> Result<Reply> {
        if !self.in_multi {
            return Err(StoreError::NotInMulti("DISCARD"));
        }
        self.in_multi = false;
        self.queue.clear();
        self.queue_error = false;
        self.unwatch(store);
        Ok(Reply::Ok)
    }

    pub fn take_queue(&mut self) -> Result<Vec<Command>> {
        if !self.in_multi {
            return Err(StoreError::NotInMulti("EXEC"));
        }
        self.in_multi = false;
        let queue = std::mem::take(&mut self.queue);
        if std::mem::take(&mut self.queue_error) {
            return Err(StoreError::TransactionAborted("previous errors while queueing".into()));
        }
        Ok(queue)
    }

    /// EXEC：执行队列中的全部命令，返回每条命令的结果
    pub fn exec(&mut self, store: &Store) -> Result<Reply> {
        let queue = match self.take_queue() {
            Ok(q) => q,
            Err(e) => {
                if matches!(e, StoreError::TransactionAborted(_)) {
                    self.unwatch(store);
                }
                return Err(e);
            }
        };
        let session = self.watch_id;
        exec_transaction(store, &queue, session).map(Reply::Array)
    }

    pub fn watch(&mut self, store: &Store, keys: &[Vec<u8>]) -> Result<Reply> {
        if self.in_multi {
            return Err(StoreError::WatchInMulti);
        }
        let id = *self
            .watch_id
            .get_or_insert_with(|| store.watch_manager().register());
        store.watch_manager().watch(id, keys);
        Ok(Reply::Ok)
    }

    pub fn unwatch(&mut self, store: &Store) -> Reply {
        if let Some(id) = self.watch_id {
            store.watch_manager().unwatch(id);
        }
        Reply::Ok
    }

    /// 连接关闭时释放 WATCH 注册
    pub fn close(&mut self, store: &Store) {
        self.unwatch(store);
        self.in_multi = false;
        self.queue.clear();
    }
}
