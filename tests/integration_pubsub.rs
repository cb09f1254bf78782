// tests/integration_pubsub.rs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, timeout};

use crabkv::{Store, StoreOptions};

#[tokio::test]
async fn test_handler_sees_each_message_once() -> Result<()> {
    let store = Store::default();
    let got = Arc::new(Mutex::new(Vec::new()));

    let sink = got.clone();
    let task = store.pubsub().subscribe_with(&[b"news".to_vec()], move |msg| {
        sink.lock().unwrap().push(msg.payload);
    });

    assert_eq!(store.publish("news", "first"), 1);
    assert_eq!(store.publish("sports", "ignored"), 0);
    assert_eq!(store.publish("news", "second"), 1);

    timeout(Duration::from_secs(5), async {
        while got.lock().unwrap().len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(*got.lock().unwrap(), vec![b"first".to_vec(), b"second".to_vec()]);

    task.abort();
    Ok(())
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_messages() -> Result<()> {
    let store = Store::default();
    assert_eq!(store.publish("news", "nobody listening"), 0);

    let mut sub = store.pubsub().subscribe(&[b"news".to_vec()]);
    assert!(sub.try_recv().is_none());

    store.publish("news", "hello");
    let msg = timeout(Duration::from_secs(5), sub.recv()).await?;
    assert_eq!(msg.map(|m| m.payload), Some(b"hello".to_vec()));
    Ok(())
}

#[tokio::test]
async fn test_pattern_subscription() -> Result<()> {
    let store = Store::default();
    let mut sub = store.pubsub().psubscribe(&[b"order.*".to_vec()]);

    assert_eq!(store.publish("order.created", "42"), 1);
    assert_eq!(store.publish("user.created", "7"), 0);

    let msg = timeout(Duration::from_secs(5), sub.recv()).await?.expect("message");
    assert_eq!(msg.channel, b"order.created".to_vec());
    assert_eq!(msg.pattern, Some(b"order.*".to_vec()));
    Ok(())
}

// 慢订阅者不会阻塞发布者：队列满了就被断开
#[tokio::test]
async fn test_slow_subscriber_is_disconnected() -> Result<()> {
    let store = Store::new(StoreOptions {
        pubsub_queue_capacity: 2,
        ..StoreOptions::default()
    });
    let mut slow = store.pubsub().subscribe(&[b"ticks".to_vec()]);
    let mut fast = store.pubsub().subscribe(&[b"ticks".to_vec()]);

    assert_eq!(store.publish("ticks", "1"), 2);
    assert!(fast.try_recv().is_some());
    assert_eq!(store.publish("ticks", "2"), 2);
    assert!(fast.try_recv().is_some());
    // slow 的队列已满，这次只投递给 fast
    assert_eq!(store.publish("ticks", "3"), 1);
    assert_eq!(store.pubsub().subscriber_count(), 1);

    // 已入队的消息仍可读完，然后结束
    assert_eq!(slow.recv().await.map(|m| m.payload), Some(b"1".to_vec()));
    assert_eq!(slow.recv().await.map(|m| m.payload), Some(b"2".to_vec()));
    assert!(slow.recv().await.is_none());
    Ok(())
}
