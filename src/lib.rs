// src/lib.rs
//! crabkv 库：engine / types / expire / pubsub / txn / protocol / server

pub mod client;    // 简单 RESP 客户端
pub mod config;    // JSON 配置
pub mod engine;    // 分片 keyspace + 命令执行
pub mod error;     // 结构化错误
pub mod expire;    // 过期策略
pub mod protocol;  // 协议编解码
pub mod pubsub;    // 发布 / 订阅
pub mod server;    // 网络层 & 会话
pub mod txn;       // 管道与事务
pub mod types;     // String / Hash / List / Set / ZSet / Geo / HLL / Stream

pub use engine::{Command, Reply, Store, StoreOptions};
pub use error::StoreError;
