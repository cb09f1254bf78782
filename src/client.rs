// src/client.rs

//! 最小的 RESP 客户端：命令行 `subscribe` 子命令与集成测试共用

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::ToSocketAddrs;

use crate::protocol::{Frame, encode_request, read_frame};

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("failed to connect")?;
        let (reader, writer) = stream.into_split();
        Ok(Client { reader: BufReader::new(reader), writer })
    }

    pub async fn send<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<()> {
        self.writer.write_all(&encode_request(args)).await?;
        Ok(())
    }

    /// Sends raw bytes, e.g. an inline command.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// 下一帧；服务端关闭连接时返回 `None`
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        read_frame(&mut self.reader).await
    }

    /// 发送一条命令并等待它的回复
    pub async fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Frame> {
        self.send(args).await?;
        match self.next_frame().await? {
            Some(frame) => Ok(frame),
            None => bail!("connection closed by server"),
        }
    }
}

/// 订阅频道 / 模式，每收到一条消息就调用 `on_message(channel, payload)`，直到服务端断开
pub async fn subscribe<F>(addr: &str, channels: &[String], patterns: &[String], mut on_message: F) -> Result<()>
where
    F: FnMut(&[u8], &[u8]),
{
    let mut client = Client::connect(addr).await?;
    if !channels.is_empty() {
        let mut args = vec!["SUBSCRIBE".to_string()];
        args.extend(channels.iter().cloned());
        client.send(args.as_slice()).await?;
    }
    if !patterns.is_empty() {
        let mut args = vec!["PSUBSCRIBE".to_string()];
        args.extend(patterns.iter().cloned());
        client.send(args.as_slice()).await?;
    }

    while let Some(frame) = client.next_frame().await? {
        match frame {
            Frame::Error(e) => bail!("server error: {e}"),
            Frame::Array(Some(items)) => {
                if let Some((channel, payload)) = message_parts(&items) {
                    on_message(channel, payload);
                }
            }
            // 订阅确认等其他推送
            _ => {}
        }
    }
    Ok(())
}

/// `message` 推送取 (channel, payload)；`pmessage` 跳过模式字段
fn message_parts(items: &[Frame]) -> Option<(&[u8], &[u8])> {
    fn bulk(f: &Frame) -> Option<&[u8]> {
        match f {
            Frame::Bulk(Some(b)) => Some(b.as_slice()),
            _ => None,
        }
    }
    match items {
        [kind, channel, payload] if bulk(kind)? == b"message" => Some((bulk(channel)?, bulk(payload)?)),
        [kind, _, channel, payload] if bulk(kind)? == b"pmessage" => Some((bulk(channel)?, bulk(payload)?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_parts() {
        let msg = [Frame::bulk("message"), Frame::bulk("news"), Frame::bulk("hi")];
        assert_eq!(message_parts(&msg), Some((b"news".as_slice(), b"hi".as_slice())));

        let pmsg = [Frame::bulk("pmessage"), Frame::bulk("n*"), Frame::bulk("news"), Frame::bulk("hi")];
        assert_eq!(message_parts(&pmsg), Some((b"news".as_slice(), b"hi".as_slice())));

        let confirm = [Frame::bulk("subscribe"), Frame::bulk("news"), Frame::Integer(1)];
        assert_eq!(message_parts(&confirm), None);
    }
}
