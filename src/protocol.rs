// src/protocol.rs

//! RESP 协议编解码
//!
//! - 请求：RESP Array of Bulk String，或者一行以空格分隔的简单文本（便于 telnet 调试）
//! - 响应：把 [`Reply`] / [`StoreError`] 编码成 RESP2
//! - 客户端：[`read_frame`] 解析服务端返回的任意 RESP2 帧

use std::io::ErrorKind;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::engine::Reply;
use crate::error::StoreError;
use crate::pubsub::Message;

const MAX_ARRAY_LEN: usize = 1024 * 1024;
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
// 按声明长度预分配的上限，超出部分随数据到达再增长
const BULK_PREALLOC: usize = 64 * 1024;

/// 读一个字节；连接正常关闭时返回 `None`
async fn read_first<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<u8>> {
    let mut first = [0u8; 1];
    match reader.read_exact(&mut first).await {
        Ok(_) => Ok(Some(first[0])),
        // 客户端断开（EOF） or Windows 下的 RST(10054)
        Err(e) if e.kind() == ErrorKind::UnexpectedEof || e.kind() == ErrorKind::ConnectionReset => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        bail!("unexpected end of stream");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn parse_len(line: &str, max: usize) -> Result<Option<usize>> {
    let n: i64 = line.trim().parse().with_context(|| format!("invalid length {line:?}"))?;
    if n < 0 {
        return Ok(None);
    }
    let n = n as usize;
    if n > max {
        bail!("length {n} exceeds limit {max}");
    }
    Ok(Some(n))
}

async fn read_bulk_body<R: AsyncBufRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(BULK_PREALLOC));
    (&mut *reader).take(len as u64).read_to_end(&mut buf).await?;
    if buf.len() != len {
        bail!("unexpected end of stream inside a bulk string");
    }
    // 丢弃结尾的 "\r\n"
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
        bail!("bulk string not terminated by CRLF");
    }
    Ok(buf)
}

/// Reads one request. `Ok(None)` on a clean disconnect; an empty vector for
/// a blank inline line.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>> {
    let Some(first) = read_first(reader).await? else {
        return Ok(None);
    };

    if first == b'*' {
        // --- RESP Array 分支 ---
        //   *2\r\n$3\r\nGET\r\n$5\r\nmykey\r\n
        let count = parse_len(&read_line(reader).await?, MAX_ARRAY_LEN)?.unwrap_or(0);
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let line = read_line(reader).await?;
            let Some(len) = line.strip_prefix('$') else {
                bail!("expected bulk string, got {line:?}");
            };
            let len = parse_len(len, MAX_BULK_LEN)?.unwrap_or(0);
            parts.push(read_bulk_body(reader, len).await?);
        }
        return Ok(Some(parts));
    }

    // --- 简单文本协议分支 ---
    // 已经读了第一个字节，和剩下的一行拼起来
    let mut line = vec![first];
    if first != b'\n' {
        reader.read_until(b'\n', &mut line).await?;
    }
    Ok(Some(
        line.split(|b| b.is_ascii_whitespace())
            .filter(|w| !w.is_empty())
            .map(<[u8]>::to_vec)
            .collect(),
    ))
}

fn write_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Appends the RESP2 encoding of `reply`.
pub fn encode_reply(reply: &Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::Ok => out.extend_from_slice(b"+OK\r\n"),
        Reply::Pong => out.extend_from_slice(b"+PONG\r\n"),
        Reply::Queued => out.extend_from_slice(b"+QUEUED\r\n"),
        Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
        Reply::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
        Reply::Bulk(b) => write_bulk(out, b),
        Reply::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_reply(item, out);
            }
        }
    }
}

pub fn encode_error(err: &StoreError, out: &mut Vec<u8>) {
    // 错误文本里不能出现换行
    let text = err.to_string().replace(['\r', '\n'], " ");
    out.extend_from_slice(b"-");
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"\r\n");
}

pub fn encode_result(res: &Result<Reply, StoreError>, out: &mut Vec<u8>) {
    match res {
        Ok(reply) => encode_reply(reply, out),
        Err(e) => encode_error(e, out),
    }
}

/// Push frame for a delivered pub/sub message.
pub fn message_reply(msg: Message) -> Reply {
    match msg.pattern {
        Some(p) => Reply::Array(vec![
            Reply::bulk("pmessage"),
            Reply::Bulk(p),
            Reply::Bulk(msg.channel),
            Reply::Bulk(msg.payload),
        ]),
        None => Reply::Array(vec![
            Reply::bulk("message"),
            Reply::Bulk(msg.channel),
            Reply::Bulk(msg.payload),
        ]),
    }
}

/// Encodes a request the way clients send it: an array of bulk strings.
pub fn encode_request<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for a in args {
        write_bulk(&mut out, a.as_ref());
    }
    out
}

/// A RESP2 frame as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    pub fn bulk(s: &str) -> Frame {
        Frame::Bulk(Some(s.as_bytes().to_vec()))
    }
}

/// Reads one reply frame. `Ok(None)` when the server closed the connection.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let Some(kind) = read_first(reader).await? else {
        return Ok(None);
    };
    let line = read_line(reader).await?;
    let frame = match kind {
        b'+' => Frame::Simple(line),
        b'-' => Frame::Error(line),
        b':' => Frame::Integer(line.parse().with_context(|| format!("invalid integer {line:?}"))?),
        b'$' => match parse_len(&line, MAX_BULK_LEN)? {
            Some(len) => Frame::Bulk(Some(read_bulk_body(reader, len).await?)),
            None => Frame::Bulk(None),
        },
        b'*' => match parse_len(&line, MAX_ARRAY_LEN)? {
            Some(n) => {
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    let item = Box::pin(read_frame(reader)).await?;
                    items.push(item.context("connection closed inside an array")?);
                }
                Frame::Array(Some(items))
            }
            None => Frame::Array(None),
        },
        other => bail!("unknown frame type {:?}", other as char),
    };
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn argv(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[tokio::test]
    async fn test_read_resp_and_inline_requests() -> Result<()> {
        let mut wire = encode_request(&["SET", "key", "two words"]);
        wire.extend_from_slice(b"GET  key\r\n\r\n");
        let mut reader = BufReader::new(wire.as_slice());

        assert_eq!(read_request(&mut reader).await?, Some(argv(&["SET", "key", "two words"])));
        assert_eq!(read_request(&mut reader).await?, Some(argv(&["GET", "key"])));
        assert_eq!(read_request(&mut reader).await?, Some(vec![]));
        assert_eq!(read_request(&mut reader).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_malformed_bulk() {
        let mut reader = BufReader::new(&b"*1\r\n$3\r\nGETXX"[..]);
        assert!(read_request(&mut reader).await.is_err());
        let mut reader = BufReader::new(&b"*1\r\n:3\r\n"[..]);
        assert!(read_request(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_huge_declared_bulk_without_data() {
        // 声明 500MB 但只发了几个字节
        let mut reader = BufReader::new(&b"*1\r\n$500000000\r\nabc"[..]);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("unexpected end of stream"), "{err}");

        let mut reader = BufReader::new(&b"$500000000\r\nabc"[..]);
        assert!(read_frame(&mut reader).await.is_err());

        let mut reader = BufReader::new(&b"*1\r\n$600000000\r\n"[..]);
        assert!(read_request(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_reply_frames_decode() -> Result<()> {
        let mut out = Vec::new();
        let reply = Reply::Array(vec![
            Reply::Ok,
            Reply::Integer(-2),
            Reply::Nil,
            Reply::bulk("Budi"),
            Reply::Array(vec![]),
        ]);
        encode_reply(&reply, &mut out);
        encode_error(&StoreError::WrongType, &mut out);

        let mut reader = BufReader::new(out.as_slice());
        assert_eq!(
            read_frame(&mut reader).await?,
            Some(Frame::Array(Some(vec![
                Frame::Simple("OK".into()),
                Frame::Integer(-2),
                Frame::Bulk(None),
                Frame::bulk("Budi"),
                Frame::Array(Some(vec![])),
            ])))
        );
        let Some(Frame::Error(e)) = read_frame(&mut reader).await? else {
            panic!("expected error frame");
        };
        assert!(e.starts_with("WRONGTYPE"));
        assert_eq!(read_frame(&mut reader).await?, None);
        Ok(())
    }

    #[test]
    fn test_message_frames() {
        let msg = Message { channel: b"news".to_vec(), pattern: Some(b"n*".to_vec()), payload: b"hi".to_vec() };
        let mut out = Vec::new();
        encode_reply(&message_reply(msg), &mut out);
        assert_eq!(out, b"*4\r\n$8\r\npmessage\r\n$2\r\nn*\r\n$4\r\nnews\r\n$2\r\nhi\r\n".to_vec());
    }
}
