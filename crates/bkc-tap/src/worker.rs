//! Stream consumer that makes distributed taps durable.
//!
//! Entries are read in batches through the consumer group, grouped per user,
//! ordered by sequence, and applied with [`LedgerStore::apply_tap_events`],
//! whose inbox skips any `(user_id, seq)` it has already applied. Entries are
//! acknowledged only after their user's transaction commits, so a crash
//! between the two leads to a harmless redelivery.
//!
//! A batch the store rejects outright (anything but a transient failure) is
//! copied to the dead-letter stream and acknowledged, and the user's cache
//! entry is marked quarantined so the engine refuses further taps. Leaving it
//! pending would fail every later drain and wedge the consistency gate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use bkc_db::{LedgerStore, TapEvent};
use bkc_econ::UserId;

use crate::codec::{decode_event, encode_event, encode_quarantine};
use crate::shared::{SharedOp, SharedStore, StreamEntry, StreamStats};
use crate::{FlushReport, SharedError, TapError, TapResult};

/// Where the distributed engine keeps its cache keys and event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    pub key_prefix: String,
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    /// Pending entries idle this long are taken over by the periodic drain.
    pub claim_idle: Duration,
    /// Optimistic transaction attempts per tap.
    pub tx_attempts: u32,
}

impl StreamSettings {
    pub fn system_key(&self) -> String {
        format!("{}:sys", self.key_prefix)
    }

    pub fn user_key(&self, user_id: UserId) -> String {
        format!("{}:user:{user_id}", self.key_prefix)
    }

    /// Events the store rejected, each with its original entry id and the error.
    pub fn dead_letter_key(&self) -> String {
        format!("{}:dead", self.stream_key)
    }
}

struct Batch {
    read: usize,
    report: FlushReport,
}

pub struct StreamWorker {
    store: Arc<dyn LedgerStore>,
    shared: Arc<dyn SharedStore>,
    settings: StreamSettings,
    drain: Arc<Mutex<()>>,
    /// Coins dead-lettered by this consumer, per user, until released.
    dead: SyncMutex<BTreeMap<UserId, i64>>,
}

impl StreamWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        shared: Arc<dyn SharedStore>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            store,
            shared,
            settings,
            drain: Arc::new(Mutex::new(())),
            dead: SyncMutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub(crate) fn drain_lock(&self) -> Arc<Mutex<()>> {
        self.drain.clone()
    }

    pub async fn ensure_group(&self) -> TapResult<()> {
        self.shared
            .xgroup_create(&self.settings.stream_key, &self.settings.group)
            .await?;
        Ok(())
    }

    pub async fn stream_stats(&self) -> TapResult<StreamStats> {
        Ok(self
            .shared
            .stream_stats(&self.settings.stream_key, &self.settings.group)
            .await?)
    }

    /// Users this consumer quarantined and the coins their dead-lettered events granted.
    pub fn quarantined(&self) -> BTreeMap<UserId, i64> {
        self.dead.lock().clone()
    }

    pub(crate) fn forget_quarantine(&self, user_id: UserId) {
        self.dead.lock().remove(&user_id);
    }

    /// Process one batch: idle pending entries first, then new ones.
    pub async fn drain_once(&self) -> TapResult<FlushReport> {
        let _serial = self.drain.lock().await;
        Ok(self.drain_batch(self.settings.claim_idle).await?.report)
    }

    /// Drain until a batch comes back empty. Fails on the first batch that
    /// could not be applied.
    pub async fn drain_all(&self) -> TapResult<FlushReport> {
        let _serial = self.drain.lock().await;
        self.drain_all_serialized().await
    }

    /// Caller holds the drain lock.
    pub(crate) async fn drain_all_serialized(&self) -> TapResult<FlushReport> {
        let mut total = FlushReport::default();
        loop {
            let batch = self.drain_batch(Duration::ZERO).await?;
            total.absorb(batch.report);
            if batch.read == 0 {
                return Ok(total);
            }
        }
    }

    async fn drain_batch(&self, claim_idle: Duration) -> TapResult<Batch> {
        let s = &self.settings;
        let mut entries = self
            .shared
            .xautoclaim(&s.stream_key, &s.group, &s.consumer, claim_idle, s.batch)
            .await?;
        let room = s.batch.saturating_sub(entries.len());
        if room > 0 {
            entries.extend(
                self.shared
                    .xreadgroup(&s.stream_key, &s.group, &s.consumer, room)
                    .await?,
            );
        }
        let read = entries.len();
        if read == 0 {
            return Ok(Batch {
                read,
                report: FlushReport::default(),
            });
        }

        let (per_user, malformed) = group_by_user(entries);
        let mut ack = malformed;
        let mut report = FlushReport::default();
        let mut first_err: Option<TapError> = None;

        for (user_id, items) in per_user {
            let events: Vec<TapEvent> = items.iter().map(|(_, ev)| ev.clone()).collect();
            match self.store.apply_tap_events(user_id, &events).await {
                Ok(applied) => {
                    report.users += 1;
                    report.coins += applied.gained;
                    report.events += applied.applied;
                    report.duplicates += applied.duplicates;
                    ack.extend(items.into_iter().map(|(id, _)| id));
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(user_id, events = events.len(), error = %e, "tap event apply failed; left pending");
                    first_err.get_or_insert(e.into());
                }
                Err(e) => {
                    let reason = e.to_string();
                    match self.dead_letter(user_id, &items, &reason).await {
                        Ok(()) => {
                            let coins: i64 = events.iter().map(|ev| ev.granted).sum();
                            tracing::error!(user_id, events = events.len(), coins, error = %reason, "store rejected tap events; dead-lettered and user quarantined");
                            *self.dead.lock().entry(user_id).or_insert(0) += coins;
                            report.quarantined += 1;
                            ack.extend(items.into_iter().map(|(id, _)| id));
                        }
                        Err(dl) => {
                            tracing::warn!(user_id, error = %dl, "dead-lettering failed; events left pending");
                            first_err.get_or_insert(dl);
                        }
                    }
                }
            }
        }

        if !ack.is_empty() {
            self.shared.xack(&s.stream_key, &s.group, &ack).await?;
        }
        if report.events > 0 || report.duplicates > 0 {
            tracing::debug!(
                flushed_users = report.users,
                events = report.events,
                duplicates = report.duplicates,
                "tap events applied"
            );
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(Batch { read, report }),
        }
    }
}

type UserBatch = Vec<(String, TapEvent)>;

impl StreamWorker {
    /// Copy a rejected batch to the dead-letter stream and mark the user,
    /// atomically. The marker is only written over an existing cache entry.
    async fn dead_letter(&self, user_id: UserId, items: &UserBatch, reason: &str) -> TapResult<()> {
        let s = &self.settings;
        let user_key = s.user_key(user_id);
        let attempts = s.tx_attempts.max(1);
        for _ in 0..attempts {
            let (vals, watch) = self.shared.watch(std::slice::from_ref(&user_key)).await?;
            let mut ops: Vec<SharedOp> = items
                .iter()
                .map(|(id, ev)| {
                    let mut fields = encode_event(ev);
                    fields.insert("entry_id".to_string(), id.clone());
                    fields.insert("error".to_string(), reason.to_string());
                    SharedOp::XAdd {
                        stream: s.dead_letter_key(),
                        fields,
                    }
                })
                .collect();
            if vals.first().is_some_and(Option::is_some) {
                ops.push(SharedOp::HSet {
                    key: user_key.clone(),
                    fields: encode_quarantine(reason),
                });
            }
            match self.shared.exec(watch, ops).await {
                Ok(()) => return Ok(()),
                Err(SharedError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(TapError::Contended { attempts })
    }
}

/// Decode and bucket entries per user, each bucket ordered by `seq`.
/// Undecodable entries come back as ids to acknowledge and drop.
fn group_by_user(entries: Vec<StreamEntry>) -> (BTreeMap<UserId, UserBatch>, Vec<String>) {
    let mut per_user: BTreeMap<UserId, UserBatch> = BTreeMap::new();
    let mut malformed = Vec::new();
    for entry in entries {
        match decode_event(&entry.id, &entry.fields) {
            Ok(ev) => per_user.entry(ev.user_id).or_default().push((entry.id, ev)),
            Err(e) => {
                tracing::error!(entry_id = %entry.id, error = %e, "dropping malformed tap event");
                malformed.push(entry.id);
            }
        }
    }
    for items in per_user.values_mut() {
        items.sort_by_key(|(_, ev)| ev.seq);
    }
    (per_user, malformed)
}

/// Spawn the periodic drain. On shutdown it makes one last full drain.
pub fn spawn_stream_worker(
    worker: Arc<StreamWorker>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(consumer = %worker.settings.consumer, stream = %worker.settings.stream_key, "stream worker started");
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = worker.drain_once().await {
                tracing::warn!(error = %e, "stream drain failed");
            }
        }
        match worker.drain_all().await {
            Ok(r) => tracing::info!(events = r.events, duplicates = r.duplicates, "stream worker stopped"),
            Err(e) => tracing::warn!(error = %e, "final stream drain failed; events stay pending"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_event;
    use chrono::{TimeZone, Utc};

    fn entry(id: &str, user_id: UserId, seq: i64) -> StreamEntry {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        StreamEntry {
            id: id.to_string(),
            fields: encode_event(&TapEvent {
                user_id,
                seq,
                requested: 1,
                granted: 1,
                day: at.date_naive(),
                energy_after: 10.0,
                at,
            }),
        }
    }

    #[test]
    fn groups_sort_by_seq_and_drop_garbage() {
        let mut bad = entry("4-0", 1, 1);
        bad.fields.remove("seq");
        let (per_user, malformed) = group_by_user(vec![
            entry("1-0", 2, 7),
            entry("2-0", 1, 3),
            entry("3-0", 2, 5),
            bad,
        ]);
        assert_eq!(malformed, vec!["4-0".to_string()]);
        let seqs: Vec<i64> = per_user[&2].iter().map(|(_, e)| e.seq).collect();
        assert_eq!(seqs, vec![5, 7]);
        assert_eq!(per_user[&1].len(), 1);
    }
}
