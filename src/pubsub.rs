// src/pubsub.rs

//! Publish/subscribe broker.
//!
//! Messages are fire-and-forget and never stored. Every subscriber owns a
//! bounded queue; `publish` only ever does a non-blocking enqueue, so a
//! publisher never waits on a reader. A subscriber whose queue is full is
//! disconnected: its sender is dropped, the reader drains what it already
//! holds and then sees the end of the stream.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A delivered message. `pattern` is set when it matched a pattern
/// subscription rather than the channel itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Vec<u8>,
    pub pattern: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

struct Subscriber {
    tx: mpsc::Sender<Message>,
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<u64, Subscriber>,
    // channel -> subscriber ids
    channels: HashMap<Vec<u8>, HashSet<u64>>,
    // pattern -> subscriber ids
    patterns: HashMap<Vec<u8>, HashSet<u64>>,
}

impl Registry {
    fn remove(&mut self, id: u64) -> bool {
        let Some(sub) = self.subscribers.remove(&id) else {
            return false;
        };
        for ch in &sub.channels {
            detach(&mut self.channels, ch, id);
        }
        for p in &sub.patterns {
            detach(&mut self.patterns, p, id);
        }
        true
    }
}

fn detach(index: &mut HashMap<Vec<u8>, HashSet<u64>>, name: &[u8], id: u64) {
    if let Some(ids) = index.get_mut(name) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(name);
        }
    }
}

struct Shared {
    next_id: AtomicU64,
    capacity: usize,
    registry: RwLock<Registry>,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct PubSub {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("capacity", &self.shared.capacity)
            .field("subscribers", &self.shared.registry.read().subscribers.len())
            .finish()
    }
}

impl PubSub {
    /// `capacity` bounds every subscriber queue.
    pub fn new(capacity: usize) -> Self {
        PubSub {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    fn register(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.registry.write().subscribers.insert(
            id,
            Subscriber {
                tx,
                channels: HashSet::new(),
                patterns: HashSet::new(),
            },
        );
        Subscription {
            id,
            rx,
            broker: self.clone(),
        }
    }

    /// SUBSCRIBE channel [channel ...]
    pub fn subscribe(&self, channels: &[Vec<u8>]) -> Subscription {
        let sub = self.register();
        sub.subscribe(channels);
        sub
    }

    /// PSUBSCRIBE pattern [pattern ...]
    pub fn psubscribe(&self, patterns: &[Vec<u8>]) -> Subscription {
        let sub = self.register();
        sub.psubscribe(patterns);
        sub
    }

    /// Subscribes and drives delivery on a spawned task: `handler` runs once
    /// per message until the subscription ends (disconnect or task abort).
    pub fn subscribe_with<F>(&self, channels: &[Vec<u8>], mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut sub = self.subscribe(channels);
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                handler(msg);
            }
            debug!(subscriber = sub.id, "subscription ended");
        })
    }

    /// PUBLISH channel message
    ///
    /// Returns the number of queues the message was placed on.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        let mut closed = Vec::new();
        {
            let reg = self.shared.registry.read();
            let direct = reg
                .channels
                .get(channel)
                .into_iter()
                .flatten()
                .map(|id| (*id, None));
            let matched = reg
                .patterns
                .iter()
                .filter(|(p, _)| glob_match(p, channel))
                .flat_map(|(p, ids)| ids.iter().map(move |id| (*id, Some(p.clone()))));

            for (id, pattern) in direct.chain(matched) {
                let Some(sub) = reg.subscribers.get(&id) else {
                    continue;
                };
                let msg = Message {
                    channel: channel.to_vec(),
                    pattern,
                    payload: payload.to_vec(),
                };
                match sub.tx.try_send(msg) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => overflowed.push(id),
                    Err(TrySendError::Closed(_)) => closed.push(id),
                }
            }
        }

        if !overflowed.is_empty() || !closed.is_empty() {
            let mut reg = self.shared.registry.write();
            for id in overflowed {
                if reg.remove(id) {
                    warn!(subscriber = id, "subscriber queue full, disconnecting");
                }
            }
            for id in closed {
                reg.remove(id);
            }
        }
        delivered
    }

    /// PUBSUB NUMSUB channel [channel ...]
    pub fn numsub(&self, channels: &[Vec<u8>]) -> Vec<(Vec<u8>, usize)> {
        let reg = self.shared.registry.read();
        channels
            .iter()
            .map(|ch| (ch.clone(), reg.channels.get(ch).map_or(0, HashSet::len)))
            .collect()
    }

    /// PUBSUB NUMPAT: pattern subscriptions over all subscribers.
    pub fn numpat(&self) -> usize {
        self.shared.registry.read().patterns.values().map(HashSet::len).sum()
    }

    /// PUBSUB CHANNELS [pattern]: channels with at least one subscriber.
    pub fn channels(&self, pattern: Option<&[u8]>) -> Vec<Vec<u8>> {
        let reg = self.shared.registry.read();
        let mut out: Vec<Vec<u8>> = reg
            .channels
            .keys()
            .filter(|ch| pattern.is_none_or(|p| glob_match(p, ch)))
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.read().subscribers.len()
    }
}

/// Receiving end of one subscriber. Dropping it unsubscribes everything.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Message>,
    broker: PubSub,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message; `None` once the subscriber has been disconnected and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Like [`recv`](Self::recv), but gives up with `None` when `cancel` resolves first.
    pub async fn recv_until(&mut self, cancel: impl Future<Output = ()>) -> Option<Message> {
        tokio::select! {
            msg = self.rx.recv() => msg,
            _ = cancel => None,
        }
    }

    fn update<F>(&self, f: F) -> usize
    where
        F: FnOnce(&mut Registry, u64),
    {
        let mut reg = self.broker.shared.registry.write();
        f(&mut reg, self.id);
        reg.subscribers
            .get(&self.id)
            .map_or(0, |s| s.channels.len() + s.patterns.len())
    }

    /// Adds channels; returns the total number of subscriptions held.
    pub fn subscribe(&self, channels: &[Vec<u8>]) -> usize {
        self.update(|reg, id| {
            let Some(sub) = reg.subscribers.get_mut(&id) else {
                return;
            };
            for ch in channels {
                sub.channels.insert(ch.clone());
                reg.channels.entry(ch.clone()).or_default().insert(id);
            }
        })
    }

    pub fn psubscribe(&self, patterns: &[Vec<u8>]) -> usize {
        self.update(|reg, id| {
            let Some(sub) = reg.subscribers.get_mut(&id) else {
                return;
            };
            for p in patterns {
                sub.patterns.insert(p.clone());
                reg.patterns.entry(p.clone()).or_default().insert(id);
            }
        })
    }

    /// Removes channels; an empty slice removes all of them.
    pub fn unsubscribe(&self, channels: &[Vec<u8>]) -> usize {
        self.update(|reg, id| {
            let Some(sub) = reg.subscribers.get_mut(&id) else {
                return;
            };
            let gone: Vec<Vec<u8>> = if channels.is_empty() {
                sub.channels.drain().collect()
            } else {
                channels.iter().filter(|c| sub.channels.remove(*c)).cloned().collect()
            };
            for ch in gone {
                detach(&mut reg.channels, &ch, id);
            }
        })
    }

    pub fn punsubscribe(&self, patterns: &[Vec<u8>]) -> usize {
        self.update(|reg, id| {
            let Some(sub) = reg.subscribers.get_mut(&id) else {
                return;
            };
            let gone: Vec<Vec<u8>> = if patterns.is_empty() {
                sub.patterns.drain().collect()
            } else {
                patterns.iter().filter(|p| sub.patterns.remove(*p)).cloned().collect()
            };
            for p in gone {
                detach(&mut reg.patterns, &p, id);
            }
        })
    }

    /// Subscribed channels, sorted.
    pub fn channel_names(&self) -> Vec<Vec<u8>> {
        self.names(|s| &s.channels)
    }

    /// Subscribed patterns, sorted.
    pub fn pattern_names(&self) -> Vec<Vec<u8>> {
        self.names(|s| &s.patterns)
    }

    fn names(&self, pick: impl Fn(&Subscriber) -> &HashSet<Vec<u8>>) -> Vec<Vec<u8>> {
        let reg = self.broker.shared.registry.read();
        let mut out: Vec<Vec<u8>> = reg
            .subscribers
            .get(&self.id)
            .map(|s| pick(s).iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Channels and patterns currently held.
    pub fn subscription_count(&self) -> usize {
        self.update(|_, _| {})
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.shared.registry.write().remove(self.id);
    }
}

/// Glob matching for pattern subscriptions: `*`, `?`, `[abc]`, `[^a-z]` and
/// `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // position after the last `*` and the text index it is trying
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c => {
                    if c == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches `c` against the class opening at `pattern[start] == b'['`.
/// Returns whether it matched and the index after the closing `]`.
fn match_class(pattern: &[u8], start: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    loop {
        let &b = pattern.get(i)?;
        if b == b']' && !first {
            break;
        }
        first = false;
        if b == b'\\' {
            let &esc = pattern.get(i + 1)?;
            matched |= esc == c;
            i += 2;
        } else if pattern.get(i + 1) == Some(&b'-') && pattern.get(i + 2).is_some_and(|&e| e != b']') {
            let (lo, hi) = (b.min(pattern[i + 2]), b.max(pattern[i + 2]));
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= b == c;
            i += 1;
        }
    }
    Some((matched != negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chans(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_glob_patterns() {
        assert!(glob_match(b"news.*", b"news.sport"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(!glob_match(b"h?llo", b"heello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"h[a-c]llo", b"hbllo"));
        assert!(glob_match(b"a*b*c", b"axxbyyc"));
        assert!(!glob_match(b"a*b*c", b"axxbyy"));
        assert!(glob_match(b"literal\\*", b"literal*"));
        assert!(!glob_match(b"literal\\*", b"literalx"));
    }

    #[tokio::test]
    async fn test_publish_reaches_channel_and_pattern_subscribers() {
        let broker = PubSub::new(16);
        let mut a = broker.subscribe(&chans(&["channel-1", "channel-2"]));
        let mut p = broker.psubscribe(&chans(&["channel-*"]));

        assert_eq!(broker.publish(b"channel-1", b"hello"), 2);
        assert_eq!(broker.publish(b"other", b"nobody"), 0);

        let got = a.recv().await.unwrap();
        assert_eq!(got.channel, b"channel-1".to_vec());
        assert_eq!(got.payload, b"hello".to_vec());
        assert_eq!(got.pattern, None);
        assert_eq!(p.recv().await.unwrap().pattern, Some(b"channel-*".to_vec()));

        assert_eq!(broker.numsub(&chans(&["channel-1", "none"])), vec![(b"channel-1".to_vec(), 1), (b"none".to_vec(), 0)]);
        assert_eq!(broker.numpat(), 1);
        assert_eq!(broker.channels(None), chans(&["channel-1", "channel-2"]));
        assert_eq!(broker.channels(Some(b"*-2".as_slice())), chans(&["channel-2"]));
    }

    #[tokio::test]
    async fn test_incremental_and_drop_unsubscribe() {
        let broker = PubSub::new(4);
        let sub = broker.subscribe(&chans(&["a"]));
        assert_eq!(sub.subscribe(&chans(&["b"])), 2);
        assert_eq!(sub.psubscribe(&chans(&["c*"])), 3);
        assert_eq!(sub.unsubscribe(&chans(&["a"])), 2);
        assert_eq!(broker.publish(b"a", b"x"), 0);
        assert_eq!(sub.unsubscribe(&[]), 1);
        assert_eq!(sub.punsubscribe(&[]), 0);

        let other = broker.subscribe(&chans(&["z"]));
        drop(other);
        assert_eq!(broker.publish(b"z", b"x"), 0);
        assert_eq!(broker.numsub(&chans(&["z"]))[0].1, 0);
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let broker = PubSub::new(2);
        let mut slow = broker.subscribe(&chans(&["ch"]));
        let mut fast = broker.subscribe(&chans(&["ch"]));

        assert_eq!(broker.publish(b"ch", b"1"), 2);
        fast.recv().await.unwrap();
        assert_eq!(broker.publish(b"ch", b"2"), 2);
        fast.recv().await.unwrap();
        // slow holds 2 unread messages: the third overflows it
        assert_eq!(broker.publish(b"ch", b"3"), 1);
        assert_eq!(broker.subscriber_count(), 1);

        // what was queued is still readable, then the stream ends
        assert_eq!(slow.recv().await.unwrap().payload, b"1".to_vec());
        assert_eq!(slow.recv().await.unwrap().payload, b"2".to_vec());
        assert_eq!(slow.recv().await, None);
        assert_eq!(fast.recv().await.unwrap().payload, b"3".to_vec());
    }

    #[tokio::test]
    async fn test_subscribe_with_handler() {
        let broker = PubSub::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = broker.subscribe_with(&chans(&["jobs"]), move |m| {
            let _ = tx.send(m.payload);
        });
        assert_eq!(broker.publish(b"jobs", b"job-1"), 1);
        assert_eq!(rx.recv().await, Some(b"job-1".to_vec()));
        task.abort();
    }

    #[tokio::test]
    async fn test_recv_until_cancel() {
        let broker = PubSub::new(8);
        let mut sub = broker.subscribe(&chans(&["quiet"]));
        assert_eq!(sub.recv_until(async {}).await, None);
    }
}
