// src/server.rs
//! 这是 crabkv 服务的网络层：
//! - 监听 TCP 连接
//! - 解码请求（RESP / 简单文本），由独立的读任务完成
//! - 会话命令（MULTI / WATCH / SUBSCRIBE ...）在连接内处理，其余交给 engine 执行
//! - 订阅模式下把消息推送给客户端；阻塞 XREADGROUP 在客户端断开时取消
//! - 以 RESP2 回复
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Command, Reply, Request, Store, streams_reply};
use crate::error::StoreError;
use crate::protocol::{encode_error, encode_reply, encode_result, message_reply, read_request};
use crate::pubsub::{Message, Subscription};
use crate::txn::session::TxnSession;

/// 绑定配置中的地址并进入接受循环
pub async fn start(cfg: &Config, store: Arc<Store>) -> Result<()> {
    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind))?;
    info!(addr = %listener.local_addr()?, "crabkv listening");
    serve(listener, store).await
}

/// 核心循环: 不断 accept 新连接，并为每个连接 spawn 一个异步任务
pub async fn serve(listener: TcpListener, store: Arc<Store>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");

        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, store).await {
                warn!(%peer, error = %err, "connection error");
            }
        });
    }
}

type Incoming = Result<Vec<Vec<u8>>>;

/// 单个连接：读任务负责解析请求，当前任务负责执行与回复
async fn handle_connection(stream: TcpStream, peer: SocketAddr, store: Arc<Store>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Incoming>(64);
    let closed = Arc::new(Notify::new());
    let reader_task = tokio::spawn(read_loop(reader, tx, closed.clone()));

    let mut conn = Connection {
        store,
        session: TxnSession::new(),
        sub: None,
        out: Vec::new(),
    };
    let res = conn.run(&mut rx, &mut writer, &closed).await;

    conn.session.close(&conn.store);
    reader_task.abort();
    debug!(%peer, "disconnected");
    res
}

async fn read_loop(reader: OwnedReadHalf, tx: mpsc::Sender<Incoming>, closed: Arc<Notify>) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_request(&mut reader).await {
            // 空行直接忽略
            Ok(Some(parts)) if parts.is_empty() => continue,
            Ok(Some(parts)) => {
                if tx.send(Ok(parts)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
    // 唤醒可能阻塞在 XREADGROUP 上的连接
    closed.notify_one();
}

enum Event {
    Request(Option<Incoming>),
    Message(Option<Message>),
}

struct Connection {
    store: Arc<Store>,
    session: TxnSession,
    sub: Option<Subscription>,
    out: Vec<u8>,
}

impl Connection {
    async fn run(
        &mut self,
        rx: &mut mpsc::Receiver<Incoming>,
        writer: &mut OwnedWriteHalf,
        closed: &Notify,
    ) -> Result<()> {
        loop {
            let event = match &mut self.sub {
                Some(sub) => tokio::select! {
                    req = rx.recv() => Event::Request(req),
                    msg = sub.recv() => Event::Message(msg),
                },
                None => Event::Request(rx.recv().await),
            };

            let keep_going = match event {
                Event::Request(None) => return Ok(()),
                Event::Request(Some(Err(e))) => {
                    self.out.extend_from_slice(format!("-ERR Protocol error: {e}\r\n").as_bytes());
                    writer.write_all(&self.out).await?;
                    return Err(e);
                }
                Event::Request(Some(Ok(parts))) => self.handle(parts, closed).await,
                Event::Message(Some(msg)) => {
                    encode_reply(&message_reply(msg), &mut self.out);
                    true
                }
                Event::Message(None) => {
                    // 队列溢出，broker 已经断开了这个订阅者
                    warn!("subscriber fell behind, closing connection");
                    return Ok(());
                }
            };

            writer.write_all(&self.out).await?;
            self.out.clear();
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// 处理一条请求，返回 `false` 表示连接应当关闭
    async fn handle(&mut self, parts: Vec<Vec<u8>>, closed: &Notify) -> bool {
        let req = match Request::parse(parts) {
            Ok(req) => req,
            Err(e) => {
                self.session.mark_error();
                encode_error(&e, &mut self.out);
                return true;
            }
        };

        if self.sub.is_some() {
            if let Some(name) = forbidden_while_subscribed(&req) {
                encode_error(&StoreError::SubscribedContext(name.into()), &mut self.out);
                return true;
            }
        }

        let store = self.store.clone();
        let res = match req {
            Request::Quit => {
                encode_reply(&Reply::Ok, &mut self.out);
                return false;
            }
            Request::Multi => self.session.begin(),
            Request::Exec => self.session.exec(&store),
            Request::Discard => self.session.discard(&store),
            Request::Watch(keys) => self.session.watch(&store, &keys),
            Request::Unwatch => Ok(self.session.unwatch(&store)),
            Request::Subscribe(names) => {
                self.subscribe(names, false);
                return true;
            }
            Request::PSubscribe(names) => {
                self.subscribe(names, true);
                return true;
            }
            Request::Unsubscribe(names) => {
                self.unsubscribe(names, false);
                return true;
            }
            Request::PUnsubscribe(names) => {
                self.unsubscribe(names, true);
                return true;
            }
            Request::Command(cmd) if self.session.in_multi => self.session.enqueue(cmd),
            Request::Command(Command::XReadGroup(req)) if req.block.is_some() && req.may_block() => {
                let block = req.block.unwrap_or_default();
                store
                    .xreadgroup_until(&req, block, closed.notified())
                    .await
                    .map(streams_reply)
            }
            Request::Command(cmd) => store.execute(cmd),
        };
        encode_result(&res, &mut self.out);
        true
    }

    fn subscribe(&mut self, names: Vec<Vec<u8>>, pattern: bool) {
        let kind = if pattern { "psubscribe" } else { "subscribe" };
        for name in names {
            let one = std::slice::from_ref(&name);
            let count = match &self.sub {
                Some(sub) if pattern => sub.psubscribe(one),
                Some(sub) => sub.subscribe(one),
                None => {
                    let pubsub = self.store.pubsub();
                    let sub = if pattern { pubsub.psubscribe(one) } else { pubsub.subscribe(one) };
                    let count = sub.subscription_count();
                    self.sub = Some(sub);
                    count
                }
            };
            encode_reply(
                &Reply::Array(vec![Reply::bulk(kind), Reply::Bulk(name), Reply::int(count)]),
                &mut self.out,
            );
        }
    }

    fn unsubscribe(&mut self, names: Vec<Vec<u8>>, pattern: bool) {
        let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
        let Some(sub) = &self.sub else {
            encode_reply(&Reply::Array(vec![Reply::bulk(kind), Reply::Nil, Reply::Integer(0)]), &mut self.out);
            return;
        };

        let names = match (names.is_empty(), pattern) {
            (true, true) => sub.pattern_names(),
            (true, false) => sub.channel_names(),
            (false, _) => names,
        };
        if names.is_empty() {
            let count = sub.subscription_count();
            encode_reply(&Reply::Array(vec![Reply::bulk(kind), Reply::Nil, Reply::int(count)]), &mut self.out);
        }
        for name in names {
            let one = std::slice::from_ref(&name);
            let count = if pattern { sub.punsubscribe(one) } else { sub.unsubscribe(one) };
            encode_reply(
                &Reply::Array(vec![Reply::bulk(kind), Reply::Bulk(name), Reply::int(count)]),
                &mut self.out,
            );
        }

        // 没有任何订阅时退出订阅模式
        if sub.subscription_count() == 0 {
            self.sub = None;
        }
    }
}

fn forbidden_while_subscribed(req: &Request) -> Option<&'static str> {
    match req {
        Request::Subscribe(_)
        | Request::PSubscribe(_)
        | Request::Unsubscribe(_)
        | Request::PUnsubscribe(_)
        | Request::Quit
        | Request::Command(Command::Ping(_)) => None,
        Request::Command(cmd) => Some(cmd.name()),
        Request::Multi => Some("multi"),
        Request::Exec => Some("exec"),
        Request::Discard => Some("discard"),
        Request::Watch(_) => Some("watch"),
        Request::Unwatch => Some("unwatch"),
    }
}
