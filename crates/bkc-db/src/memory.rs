//! In-process `LedgerStore`.
//!
//! Writes stage changes against a read-only view of the committed state and
//! publish them in one step, so a failed operation leaves nothing behind. Used
//! by tests and by the daemon when no database URL is configured.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use bkc_econ::{plan_tap, utc_day, TapOutcome, TapParams, UserId};

use crate::rules;
use crate::{
    BoostPurchase, DailyQuota, EventApplyReport, Genesis, LedgerEntry, LedgerKind, LedgerStore,
    NewLedgerEntry, StoreError, StoreResult, SystemReserve, TapDelta, TapEvent, UserAccount,
};

#[derive(Default)]
struct MemState {
    system: Option<SystemReserve>,
    users: HashMap<UserId, UserAccount>,
    daily: HashMap<(UserId, NaiveDate), DailyQuota>,
    ledger: Vec<LedgerEntry>,
    inbox: HashSet<(UserId, i64)>,
}

struct MemTx<'a> {
    base: &'a MemState,
    system: Option<SystemReserve>,
    users: HashMap<UserId, UserAccount>,
    daily: HashMap<(UserId, NaiveDate), DailyQuota>,
    ledger: Vec<NewLedgerEntry>,
    inbox: Vec<(UserId, i64)>,
}

impl<'a> MemTx<'a> {
    fn new(base: &'a MemState) -> Self {
        Self {
            base,
            system: None,
            users: HashMap::new(),
            daily: HashMap::new(),
            ledger: Vec::new(),
            inbox: Vec::new(),
        }
    }

    fn system(&self) -> StoreResult<SystemReserve> {
        self.system
            .as_ref()
            .or(self.base.system.as_ref())
            .cloned()
            .ok_or_else(|| StoreError::NotFound("system reserve".to_string()))
    }

    fn user(&self, user_id: UserId) -> StoreResult<UserAccount> {
        self.users
            .get(&user_id)
            .or_else(|| self.base.users.get(&user_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    fn daily(&self, user_id: UserId, day: NaiveDate) -> DailyQuota {
        self.daily
            .get(&(user_id, day))
            .or_else(|| self.base.daily.get(&(user_id, day)))
            .cloned()
            .unwrap_or_else(|| DailyQuota::empty(user_id, day))
    }

    fn seen(&self, key: (UserId, i64)) -> bool {
        self.base.inbox.contains(&key) || self.inbox.contains(&key)
    }

    fn put_system(&mut self, sys: SystemReserve) {
        self.system = Some(sys);
    }

    fn put_user(&mut self, user: UserAccount) {
        self.users.insert(user.user_id, user);
    }

    fn put_daily(&mut self, daily: DailyQuota) {
        self.daily.insert((daily.user_id, daily.day), daily);
    }

    fn push_ledger(&mut self, entry: NewLedgerEntry) {
        self.ledger.push(entry);
    }

    fn into_staged(self) -> Staged {
        Staged {
            system: self.system,
            users: self.users,
            daily: self.daily,
            ledger: self.ledger,
            inbox: self.inbox,
        }
    }
}

struct Staged {
    system: Option<SystemReserve>,
    users: HashMap<UserId, UserAccount>,
    daily: HashMap<(UserId, NaiveDate), DailyQuota>,
    ledger: Vec<NewLedgerEntry>,
    inbox: Vec<(UserId, i64)>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemState>,
    fail_writes: AtomicU32,
    commits: AtomicU64,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write transactions fail with `Unavailable`.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of committed write transactions.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn ledger_len(&self) -> usize {
        self.state.lock().ledger.len()
    }

    fn transact<R>(&self, f: impl FnOnce(&mut MemTx<'_>) -> StoreResult<R>) -> StoreResult<R> {
        if self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let mut state = self.state.lock();
        let (out, staged) = {
            let mut tx = MemTx::new(&state);
            let out = f(&mut tx)?;
            (out, tx.into_staged())
        };

        if let Some(sys) = staged.system {
            state.system = Some(sys);
        }
        state.users.extend(staged.users);
        state.daily.extend(staged.daily);
        state.inbox.extend(staged.inbox);
        let now = Utc::now();
        for e in staged.ledger {
            let id = state.ledger.len() as i64 + 1;
            state.ledger.push(LedgerEntry {
                id,
                kind: e.kind,
                from_id: e.from_id,
                to_id: e.to_id,
                amount: e.amount,
                meta: e.meta,
                created_at: now,
            });
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(out)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_genesis(&self, genesis: &Genesis) -> StoreResult<SystemReserve> {
        if let Some(sys) = self.state.lock().system.clone() {
            return Ok(sys);
        }
        if genesis.total_supply < 0 || !(0..=100).contains(&genesis.admin_allocation_pct) {
            return Err(StoreError::Invalid("genesis parameters out of range".to_string()));
        }
        self.transact(|tx| {
            if let Ok(existing) = tx.system() {
                return Ok(existing);
            }
            let premine = genesis.admin_allocated();
            let sys = SystemReserve {
                total_supply: genesis.total_supply,
                reserve_supply: genesis.initial_reserve(),
                reserved_supply: 0,
                initial_reserve: genesis.initial_reserve(),
                start_rate: genesis.start_rate,
                min_rate: genesis.min_rate,
            };
            let mut admin = tx.user(genesis.admin_id).unwrap_or_else(|_| {
                UserAccount::new(genesis.admin_id, genesis.admin_energy_max, Utc::now())
            });
            rules::credit_balance(&mut admin, premine)?;
            tx.put_user(admin);
            tx.put_system(sys.clone());
            tx.push_ledger(NewLedgerEntry {
                kind: LedgerKind::GenesisAdmin,
                from_id: None,
                to_id: Some(genesis.admin_id),
                amount: premine,
                meta: json!({}),
            });
            Ok(sys)
        })
    }

    async fn system(&self) -> StoreResult<SystemReserve> {
        self.state
            .lock()
            .system
            .clone()
            .ok_or_else(|| StoreError::NotFound("system reserve".to_string()))
    }

    async fn ensure_user(
        &self,
        user_id: UserId,
        energy_max: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<UserAccount> {
        if let Some(u) = self.state.lock().users.get(&user_id) {
            return Ok(u.clone());
        }
        self.transact(|tx| {
            if let Ok(u) = tx.user(user_id) {
                return Ok(u);
            }
            let u = UserAccount::new(user_id, energy_max, now);
            tx.put_user(u.clone());
            Ok(u)
        })
    }

    async fn user(&self, user_id: UserId) -> StoreResult<Option<UserAccount>> {
        Ok(self.state.lock().users.get(&user_id).cloned())
    }

    async fn daily(&self, user_id: UserId, day: NaiveDate) -> StoreResult<DailyQuota> {
        Ok(self
            .state
            .lock()
            .daily
            .get(&(user_id, day))
            .cloned()
            .unwrap_or_else(|| DailyQuota::empty(user_id, day)))
    }

    async fn apply_tap(
        &self,
        user_id: UserId,
        requested: i64,
        now: DateTime<Utc>,
        params: &TapParams,
    ) -> StoreResult<TapOutcome> {
        self.transact(|tx| {
            let mut sys = tx.system()?;
            let mut user = tx.user(user_id)?;
            let mut daily = tx.daily(user_id, utc_day(now));

            let plan = plan_tap(params, &rules::tap_input(&sys, &user, &daily, requested, now));
            rules::apply_tap_plan(&mut sys, &mut user, &mut daily, &plan, now)?;

            if plan.granted > 0 {
                tx.push_ledger(NewLedgerEntry {
                    kind: LedgerKind::Tap,
                    from_id: None,
                    to_id: Some(user_id),
                    amount: plan.granted,
                    meta: rules::direct_tap_meta(requested),
                });
            }
            let extra = daily.extra_quota;
            tx.put_system(sys);
            tx.put_user(user);
            tx.put_daily(daily);
            Ok(plan.outcome(extra))
        })
    }

    async fn flush_tap_delta(&self, user_id: UserId, delta: &TapDelta) -> StoreResult<()> {
        if delta.taps == 0 {
            return Ok(());
        }
        self.transact(|tx| {
            let mut sys = tx.system()?;
            let mut user = tx.user(user_id)?;
            rules::fold_delta(&mut sys, &mut user, delta)?;
            for (day, n) in &delta.daily {
                let mut d = tx.daily(user_id, *day);
                d.tapped += n;
                tx.put_daily(d);
            }
            if delta.gained > 0 {
                tx.push_ledger(NewLedgerEntry {
                    kind: LedgerKind::Tap,
                    from_id: None,
                    to_id: Some(user_id),
                    amount: delta.gained,
                    meta: rules::buffered_tap_meta(delta),
                });
            }
            tx.put_system(sys);
            tx.put_user(user);
            Ok(())
        })
    }

    async fn apply_tap_events(
        &self,
        user_id: UserId,
        events: &[TapEvent],
    ) -> StoreResult<EventApplyReport> {
        if events.is_empty() {
            return Ok(EventApplyReport::default());
        }
        self.transact(|tx| {
            let mut sys = tx.system()?;
            let mut user = tx.user(user_id)?;

            let mut fresh = Vec::with_capacity(events.len());
            let mut duplicates = 0;
            for ev in events {
                let key = (ev.user_id, ev.seq);
                if tx.seen(key) {
                    duplicates += 1;
                    continue;
                }
                tx.inbox.push(key);
                fresh.push(ev.clone());
            }

            let fold = rules::fold_events(&mut sys, &mut user, &fresh)?;
            for (day, n) in &fold.per_day {
                let mut d = tx.daily(user_id, *day);
                d.tapped += n;
                tx.put_daily(d);
            }
            if fold.gained > 0 {
                tx.push_ledger(NewLedgerEntry {
                    kind: LedgerKind::Tap,
                    from_id: None,
                    to_id: Some(user_id),
                    amount: fold.gained,
                    meta: rules::stream_tap_meta(&fold, fresh.len()),
                });
            }
            tx.put_system(sys);
            tx.put_user(user);
            Ok(EventApplyReport {
                applied: fresh.len(),
                duplicates,
                gained: fold.gained,
            })
        })
    }

    async fn transfer(&self, from: UserId, to: UserId, amount: i64) -> StoreResult<()> {
        rules::require_positive(amount, "transfer amount")?;
        if from == to {
            return Err(StoreError::Invalid("cannot transfer to self".to_string()));
        }
        self.transact(|tx| {
            let mut sender = tx.user(from)?;
            let mut receiver = tx.user(to)?;
            rules::debit_balance(&mut sender, amount)?;
            rules::credit_balance(&mut receiver, amount)?;
            tx.put_user(sender);
            tx.put_user(receiver);
            tx.push_ledger(NewLedgerEntry {
                kind: LedgerKind::Transfer,
                from_id: Some(from),
                to_id: Some(to),
                amount,
                meta: json!({}),
            });
            Ok(())
        })
    }

    async fn buy_energy_boost(
        &self,
        user_id: UserId,
        purchase: &BoostPurchase,
    ) -> StoreResult<UserAccount> {
        self.transact(|tx| {
            let mut sys = tx.system()?;
            let mut user = tx.user(user_id)?;
            rules::debit_balance(&mut user, purchase.price)?;
            rules::credit_reserve(&mut sys, purchase.price)?;
            rules::apply_boost(&mut user, purchase.boost, purchase.at);
            tx.put_system(sys);
            tx.put_user(user.clone());
            tx.push_ledger(NewLedgerEntry {
                kind: LedgerKind::BuyEnergyBoost,
                from_id: Some(user_id),
                to_id: None,
                amount: purchase.price,
                meta: json!({ "until": purchase.boost.until }),
            });
            Ok(user)
        })
    }

    async fn buy_tap_pack(
        &self,
        user_id: UserId,
        price: i64,
        pack_size: i64,
        day: NaiveDate,
    ) -> StoreResult<DailyQuota> {
        rules::require_positive(pack_size, "pack size")?;
        self.transact(|tx| {
            let mut sys = tx.system()?;
            let mut user = tx.user(user_id)?;
            let mut daily = tx.daily(user_id, day);
            rules::debit_balance(&mut user, price)?;
            rules::credit_reserve(&mut sys, price)?;
            daily.extra_quota += pack_size;
            tx.put_system(sys);
            tx.put_user(user);
            tx.put_daily(daily.clone());
            tx.push_ledger(NewLedgerEntry {
                kind: LedgerKind::BuyTapPack,
                from_id: Some(user_id),
                to_id: None,
                amount: price,
                meta: json!({ "pack_size": pack_size, "day": day }),
            });
            Ok(daily)
        })
    }

    async fn credit_from_reserve(
        &self,
        user_id: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: Value,
    ) -> StoreResult<()> {
        rules::require_positive(amount, "amount")?;
        self.transact(|tx| {
            let mut sys = tx.system()?;
            let mut user = tx.user(user_id)?;
            rules::take_from_reserve(&mut sys, amount)?;
            rules::credit_balance(&mut user, amount)?;
            tx.put_system(sys);
            tx.put_user(user);
            tx.push_ledger(NewLedgerEntry {
                kind,
                from_id: None,
                to_id: Some(user_id),
                amount,
                meta,
            });
            Ok(())
        })
    }

    async fn reserve_for_deposit(&self, user_id: UserId, amount: i64) -> StoreResult<()> {
        rules::require_positive(amount, "deposit amount")?;
        self.transact(|tx| {
            let mut sys = tx.system()?;
            tx.user(user_id)?;
            rules::earmark(&mut sys, amount)?;
            tx.put_system(sys);
            tx.push_ledger(NewLedgerEntry {
                kind: LedgerKind::DepositReserve,
                from_id: None,
                to_id: Some(user_id),
                amount,
                meta: json!({}),
            });
            Ok(())
        })
    }

    async fn settle_deposit(&self, user_id: UserId, amount: i64, approve: bool) -> StoreResult<()> {
        rules::require_positive(amount, "deposit amount")?;
        self.transact(|tx| {
            let mut sys = tx.system()?;
            let mut user = tx.user(user_id)?;
            rules::release_earmark(&mut sys, amount)?;
            let kind = if approve {
                rules::take_from_reserve(&mut sys, amount)?;
                rules::credit_balance(&mut user, amount)?;
                tx.put_user(user);
                LedgerKind::Deposit
            } else {
                LedgerKind::DepositReject
            };
            tx.put_system(sys);
            tx.push_ledger(NewLedgerEntry {
                kind,
                from_id: None,
                to_id: Some(user_id),
                amount,
                meta: json!({}),
            });
            Ok(())
        })
    }

    async fn ledger_for_user(&self, user_id: UserId, limit: i64) -> StoreResult<Vec<LedgerEntry>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .state
            .lock()
            .ledger
            .iter()
            .rev()
            .filter(|e| e.from_id == Some(user_id) || e.to_id == Some(user_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ledger_sum(&self, kind: LedgerKind) -> StoreResult<i64> {
        Ok(self
            .state
            .lock()
            .ledger
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.amount)
            .sum())
    }

    async fn circulating_supply(&self) -> StoreResult<i64> {
        Ok(self
            .state
            .lock()
            .users
            .values()
            .map(|u| u.balance + u.frozen_balance)
            .sum())
    }
}
