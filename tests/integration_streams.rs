// tests/integration_streams.rs

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use crabkv::engine::XReadGroup;
use crabkv::types::stream::{GroupStart, StreamId, XAddId, XAddOptions};
use crabkv::{Store, StoreError};

fn add(store: &Store, key: &str, value: &str) -> Result<StreamId> {
    let id = store.xadd(key, XAddId::Auto, &[("v", value)], XAddOptions::default())?;
    id.ok_or_else(|| anyhow::anyhow!("xadd returned no id"))
}

#[test]
fn test_disjoint_consumers() -> Result<()> {
    let store = Store::default();
    for i in 0..10 {
        add(&store, "orders", &format!("o{i}"))?;
    }
    store.xgroup_create("orders", "workers", GroupStart::Id(StreamId::new(0, 0)), false, false)?;

    let mut seen = BTreeSet::new();
    let mut total = 0;
    // 两个消费者交替读取不同的数量
    for (consumer, count) in [("alice", 3), ("bob", 4), ("alice", 2), ("bob", 5)] {
        let batch = store.xreadgroup(&XReadGroup::new("workers", consumer).stream("orders").count(count))?;
        for (_, entries) in batch {
            for (id, _) in entries {
                assert!(seen.insert(id), "entry {id:?} delivered twice");
                total += 1;
            }
        }
    }
    assert_eq!(total, 10);

    let pending = store.xpending("orders", "workers")?;
    assert_eq!(pending.count, 10);
    assert_eq!(
        pending.consumers,
        vec![(b"alice".to_vec(), 5), (b"bob".to_vec(), 5)]
    );

    let first = *seen.iter().next().unwrap();
    assert_eq!(store.xack("orders", "workers", &[first])?, 1);
    assert_eq!(store.xack("orders", "workers", &[first])?, 0);
    assert_eq!(store.xpending("orders", "workers")?.count, 9);
    Ok(())
}

#[test]
fn test_group_lifecycle_errors() -> Result<()> {
    let store = Store::default();

    assert_eq!(
        store.xgroup_create("jobs", "g", GroupStart::Last, false, false),
        Err(StoreError::NoSuchKey)
    );
    store.xgroup_create("jobs", "g", GroupStart::Last, true, false)?;
    assert_eq!(
        store.xgroup_create("jobs", "g", GroupStart::Last, false, false),
        Err(StoreError::GroupExists)
    );
    // REPLACE 允许覆盖
    store.xgroup_create("jobs", "g", GroupStart::Last, false, true)?;

    assert!(store.xgroup_createconsumer("jobs", "g", "c1")?);
    assert!(!store.xgroup_createconsumer("jobs", "g", "c1")?, "重复创建是幂等的");

    assert!(matches!(
        store.xreadgroup(&XReadGroup::new("nope", "c1").stream("jobs")),
        Err(StoreError::GroupNotFound { .. })
    ));
    assert!(store.xgroup_destroy("jobs", "g")?);
    assert!(!store.xgroup_destroy("jobs", "g")?);
    Ok(())
}

#[tokio::test]
async fn test_blocking_read_wakes_on_xadd() -> Result<()> {
    let store = Arc::new(Store::default());
    store.xgroup_create("events", "g", GroupStart::Last, true, false)?;

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            store.xadd("events", XAddId::Auto, &[("kind", "signup")], XAddOptions::default())
        })
    };

    let req = XReadGroup::new("g", "c1").stream("events").count(10);
    let batch = timeout(
        Duration::from_secs(5),
        store.xreadgroup_blocking(&req, Duration::from_secs(3)),
    )
    .await??;
    writer.await??;

    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].0, b"events".to_vec());
    assert_eq!(batch[0].1.len(), 1);
    assert_eq!(batch[0].1[0].1, vec![(b"kind".to_vec(), b"signup".to_vec())]);
    Ok(())
}

#[tokio::test]
async fn test_blocking_read_times_out_empty() -> Result<()> {
    let store = Store::default();
    store.xgroup_create("quiet", "g", GroupStart::Last, true, false)?;

    let req = XReadGroup::new("g", "c1").stream("quiet");
    let batch = store.xreadgroup_blocking(&req, Duration::from_millis(30)).await?;
    assert!(batch.is_empty(), "超时返回空结果，而不是错误");
    Ok(())
}

#[tokio::test]
async fn test_blocking_read_cancelled() -> Result<()> {
    let store = Store::default();
    store.xgroup_create("quiet", "g", GroupStart::Last, true, false)?;

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        let _ = cancel_tx.send(());
    });

    // block 为 0 表示一直等待，只能靠取消返回
    let req = XReadGroup::new("g", "c1").stream("quiet");
    let batch = timeout(
        Duration::from_secs(5),
        store.xreadgroup_until(&req, Duration::ZERO, async {
            let _ = cancel_rx.await;
        }),
    )
    .await??;
    assert!(batch.is_empty());

    // 取消之后写入的条目仍然留给后续读取
    store.xadd("quiet", XAddId::Auto, &[("v", "1")], XAddOptions::default())?;
    assert_eq!(store.xreadgroup(&req)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_claim_moves_pending_entry() -> Result<()> {
    let store = Store::default();
    let id = add(&store, "tasks", "t1")?;
    store.xgroup_create("tasks", "g", GroupStart::Id(StreamId::new(0, 0)), false, false)?;
    store.xreadgroup(&XReadGroup::new("g", "slow").stream("tasks"))?;

    let claimed = store.xclaim("tasks", "g", "fast", Duration::ZERO, &[id])?;
    assert_eq!(claimed.len(), 1);
    let pending = store.xpending("tasks", "g")?;
    assert_eq!(pending.consumers, vec![(b"fast".to_vec(), 1)]);
    Ok(())
}
