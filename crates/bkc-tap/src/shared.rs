//! Shared cache and event stream used by the distributed engine.
//!
//! The interface is shaped after a Redis deployment: hashes with atomic field
//! increments, optimistic `WATCH`/`MULTI`/`EXEC` transactions, and a stream
//! with consumer groups. [`MemorySharedStore`] implements it in-process for
//! single-node runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{SharedError, SharedResult};

pub type Hash = BTreeMap<String, String>;

/// One write inside an optimistic transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum SharedOp {
    HSet { key: String, fields: Hash },
    HIncrBy { key: String, field: String, by: i64 },
    XAdd { stream: String, fields: Hash },
}

/// Versions of the watched keys as they were read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watch {
    pub versions: Vec<(String, u64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Hash,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub length: usize,
    /// Appended but never handed to a consumer of the group.
    pub undelivered: usize,
    /// Delivered but not yet acknowledged.
    pub pending: usize,
}

impl StreamStats {
    pub fn is_drained(&self) -> bool {
        self.undelivered == 0 && self.pending == 0
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn hgetall(&self, key: &str) -> SharedResult<Option<Hash>>;

    /// Create `key` with `fields` unless it exists. Returns whether it was created.
    async fn hset_if_absent(&self, key: &str, fields: Hash) -> SharedResult<bool>;

    /// Increment a field of an existing hash; `None` if the hash is absent.
    async fn hincrby_existing(&self, key: &str, field: &str, by: i64) -> SharedResult<Option<i64>>;

    async fn watch(&self, keys: &[String]) -> SharedResult<(Vec<Option<Hash>>, Watch)>;

    /// Apply `ops` atomically if no watched key changed since `watch`,
    /// else fail with [`SharedError::Conflict`].
    async fn exec(&self, watch: Watch, ops: Vec<SharedOp>) -> SharedResult<()>;

    /// Create the group reading from the start of the stream. Existing groups are kept.
    async fn xgroup_create(&self, stream: &str, group: &str) -> SharedResult<()>;

    /// Entries never delivered to the group, now owned by `consumer`.
    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> SharedResult<Vec<StreamEntry>>;

    /// Take over pending entries idle for at least `min_idle`.
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SharedResult<Vec<StreamEntry>>;

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> SharedResult<usize>;

    async fn stream_stats(&self, stream: &str, group: &str) -> SharedResult<StreamStats>;
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<u64, Hash>,
    next_id: u64,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn append(&mut self, fields: Hash) -> u64 {
        self.next_id += 1;
        self.entries.insert(self.next_id, fields);
        self.next_id
    }

    /// Drop entries every group has delivered and acknowledged.
    fn trim(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        let floor = self
            .groups
            .values()
            .map(|g| {
                let oldest_pending = g.pending.keys().next().map_or(u64::MAX, |id| id - 1);
                g.last_delivered.min(oldest_pending)
            })
            .min()
            .unwrap_or(0);
        self.entries = self.entries.split_off(&(floor + 1));
    }
}

#[derive(Default)]
struct SharedState {
    hashes: HashMap<String, Hash>,
    versions: HashMap<String, u64>,
    streams: HashMap<String, Stream>,
    fail_next: u32,
}

impl SharedState {
    fn check_available(&mut self) -> SharedResult<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(SharedError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

fn entry_id(n: u64) -> String {
    format!("{n}-0")
}

fn parse_entry_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

fn parse_counter(key: &str, field: &str, raw: Option<&String>) -> SharedResult<i64> {
    match raw {
        None => Ok(0),
        Some(s) => s
            .parse()
            .map_err(|_| SharedError::corrupt(key, format!("field {field} is not an integer: {s:?}"))),
    }
}

/// In-process [`SharedStore`]. Every call is atomic under one lock.
#[derive(Default)]
pub struct MemorySharedStore {
    state: Mutex<SharedState>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with [`SharedError::Unavailable`].
    pub fn fail_next_ops(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Times each pending entry has been handed out, keyed by entry id.
    pub fn deliveries(&self, stream: &str, group: &str) -> BTreeMap<String, u32> {
        let st = self.state.lock();
        st.streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| (entry_id(*id), p.deliveries))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Owner of every pending entry, keyed by entry id.
    pub fn pending_owners(&self, stream: &str, group: &str) -> BTreeMap<String, String> {
        let st = self.state.lock();
        st.streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, p)| (entry_id(*id), p.consumer.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn hgetall(&self, key: &str) -> SharedResult<Option<Hash>> {
        let mut st = self.state.lock();
        st.check_available()?;
        Ok(st.hashes.get(key).cloned())
    }

    async fn hset_if_absent(&self, key: &str, fields: Hash) -> SharedResult<bool> {
        let mut st = self.state.lock();
        st.check_available()?;
        if st.hashes.contains_key(key) {
            return Ok(false);
        }
        st.hashes.insert(key.to_string(), fields);
        st.bump(key);
        Ok(true)
    }

    async fn hincrby_existing(&self, key: &str, field: &str, by: i64) -> SharedResult<Option<i64>> {
        let mut st = self.state.lock();
        st.check_available()?;
        let Some(hash) = st.hashes.get_mut(key) else {
            return Ok(None);
        };
        let next = parse_counter(key, field, hash.get(field))? + by;
        hash.insert(field.to_string(), next.to_string());
        st.bump(key);
        Ok(Some(next))
    }

    async fn watch(&self, keys: &[String]) -> SharedResult<(Vec<Option<Hash>>, Watch)> {
        let mut st = self.state.lock();
        st.check_available()?;
        let values = keys.iter().map(|k| st.hashes.get(k).cloned()).collect();
        let versions = keys.iter().map(|k| (k.clone(), st.version(k))).collect();
        Ok((values, Watch { versions }))
    }

    async fn exec(&self, watch: Watch, ops: Vec<SharedOp>) -> SharedResult<()> {
        let mut st = self.state.lock();
        st.check_available()?;
        if watch.versions.iter().any(|(k, v)| st.version(k) != *v) {
            return Err(SharedError::Conflict);
        }

        // Validate counters first so a corrupt field aborts before any write.
        for op in &ops {
            if let SharedOp::HIncrBy { key, field, .. } = op {
                let raw = st.hashes.get(key).and_then(|h| h.get(field));
                parse_counter(key, field, raw)?;
            }
        }

        for op in ops {
            match op {
                SharedOp::HSet { key, fields } => {
                    st.hashes.entry(key.clone()).or_default().extend(fields);
                    st.bump(&key);
                }
                SharedOp::HIncrBy { key, field, by } => {
                    let hash = st.hashes.entry(key.clone()).or_default();
                    let next = parse_counter(&key, &field, hash.get(&field))? + by;
                    hash.insert(field, next.to_string());
                    st.bump(&key);
                }
                SharedOp::XAdd { stream, fields } => {
                    st.streams.entry(stream).or_default().append(fields);
                }
            }
        }
        Ok(())
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> SharedResult<()> {
        let mut st = self.state.lock();
        st.check_available()?;
        st.streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> SharedResult<Vec<StreamEntry>> {
        let mut st = self.state.lock();
        st.check_available()?;
        let Some(s) = st.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Err(SharedError::Unavailable(format!(
                "NOGROUP no group {group} on stream {stream}"
            )));
        };

        let now = Instant::now();
        let mut out = Vec::new();
        for (id, fields) in s.entries.range(g.last_delivered + 1..).take(count) {
            g.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            out.push(StreamEntry {
                id: entry_id(*id),
                fields: fields.clone(),
            });
        }
        if let Some(last) = out.last().and_then(|e| parse_entry_id(&e.id)) {
            g.last_delivered = last;
        }
        Ok(out)
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SharedResult<Vec<StreamEntry>> {
        let mut st = self.state.lock();
        st.check_available()?;
        let Some(s) = st.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut out = Vec::new();
        let mut vanished = Vec::new();
        for (id, p) in g.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(p.delivered_at) < min_idle {
                continue;
            }
            match s.entries.get(id) {
                Some(fields) => {
                    p.consumer = consumer.to_string();
                    p.delivered_at = now;
                    p.deliveries += 1;
                    out.push(StreamEntry {
                        id: entry_id(*id),
                        fields: fields.clone(),
                    });
                }
                None => vanished.push(*id),
            }
        }
        for id in vanished {
            g.pending.remove(&id);
        }
        Ok(out)
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> SharedResult<usize> {
        let mut st = self.state.lock();
        st.check_available()?;
        let Some(s) = st.streams.get_mut(stream) else {
            return Ok(0);
        };
        let acked = match s.groups.get_mut(group) {
            Some(g) => ids
                .iter()
                .filter_map(|id| parse_entry_id(id))
                .filter(|id| g.pending.remove(id).is_some())
                .count(),
            None => 0,
        };
        s.trim();
        Ok(acked)
    }

    async fn stream_stats(&self, stream: &str, group: &str) -> SharedResult<StreamStats> {
        let mut st = self.state.lock();
        st.check_available()?;
        let Some(s) = st.streams.get(stream) else {
            return Ok(StreamStats::default());
        };
        let (undelivered, pending) = match s.groups.get(group) {
            Some(g) => (
                s.entries.range(g.last_delivered + 1..).count(),
                g.pending.len(),
            ),
            None => (s.entries.len(), 0),
        };
        Ok(StreamStats {
            length: s.entries.len(),
            undelivered,
            pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Hash {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn exec_conflicts_when_a_watched_key_moves() {
        let s = MemorySharedStore::new();
        s.hset_if_absent("sys", fields(&[("reserve", "100")])).await.unwrap();

        let (vals, w) = s.watch(&["sys".to_string()]).await.unwrap();
        assert_eq!(vals[0].as_ref().unwrap()["reserve"], "100");

        assert_eq!(s.hincrby_existing("sys", "reserve", -5).await.unwrap(), Some(95));

        let err = s
            .exec(
                w,
                vec![SharedOp::HIncrBy {
                    key: "sys".into(),
                    field: "reserve".into(),
                    by: -10,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SharedError::Conflict));
        assert_eq!(s.hgetall("sys").await.unwrap().unwrap()["reserve"], "95");
    }

    #[tokio::test]
    async fn hincrby_on_missing_hash_is_none() {
        let s = MemorySharedStore::new();
        assert_eq!(s.hincrby_existing("nope", "x", 1).await.unwrap(), None);
        assert!(s.hgetall("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_entries_are_reclaimed_then_trimmed_on_ack() {
        let s = MemorySharedStore::new();
        s.xgroup_create("st", "g").await.unwrap();
        for n in 0..3 {
            let w = Watch { versions: vec![] };
            s.exec(
                w,
                vec![SharedOp::XAdd {
                    stream: "st".into(),
                    fields: fields(&[("n", n.to_string().as_str())]),
                }],
            )
            .await
            .unwrap();
        }

        let first = s.xreadgroup("st", "g", "a", 10).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(s.xreadgroup("st", "g", "a", 10).await.unwrap().is_empty());

        let stats = s.stream_stats("st", "g").await.unwrap();
        assert_eq!(stats, StreamStats { length: 3, undelivered: 0, pending: 3 });

        let claimed = s.xautoclaim("st", "g", "b", Duration::ZERO, 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(s.pending_owners("st", "g")[&claimed[0].id], "b");
        assert_eq!(s.deliveries("st", "g")[&claimed[0].id], 2);

        let ids: Vec<String> = first.iter().map(|e| e.id.clone()).collect();
        assert_eq!(s.xack("st", "g", &ids).await.unwrap(), 3);
        let stats = s.stream_stats("st", "g").await.unwrap();
        assert!(stats.is_drained());
        assert_eq!(stats.length, 0);
    }

    #[tokio::test]
    async fn injected_failures_are_unavailable() {
        let s = MemorySharedStore::new();
        s.fail_next_ops(1);
        assert!(matches!(
            s.hgetall("k").await,
            Err(SharedError::Unavailable(_))
        ));
        assert!(s.hgetall("k").await.unwrap().is_none());
    }
}
