use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use bkc_econ::{plan_tap, utc_day, EnergyBoost, TapOutcome, TapParams, UserId};

use crate::rules;
use crate::{
    BoostPurchase, DailyQuota, EventApplyReport, Genesis, LedgerEntry, LedgerKind, LedgerStore,
    NewLedgerEntry, StoreError, StoreResult, SystemReserve, TapDelta, TapEvent, UserAccount,
};

/// Postgres-backed `LedgerStore`. Each write is one transaction with
/// `SELECT ... FOR UPDATE` row locks in the crate-wide lock order.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn system_from_row(row: &PgRow) -> Result<SystemReserve, sqlx::Error> {
    Ok(SystemReserve {
        total_supply: row.try_get("total_supply")?,
        reserve_supply: row.try_get("reserve_supply")?,
        reserved_supply: row.try_get("reserved_supply")?,
        initial_reserve: row.try_get("initial_reserve")?,
        start_rate: row.try_get("start_rate")?,
        min_rate: row.try_get("min_rate")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<UserAccount, sqlx::Error> {
    Ok(UserAccount {
        user_id: row.try_get("user_id")?,
        balance: row.try_get("balance")?,
        frozen_balance: row.try_get("frozen_balance")?,
        taps_total: row.try_get("taps_total")?,
        energy: row.try_get("energy")?,
        energy_max: row.try_get("energy_max")?,
        energy_updated_at: row.try_get("energy_updated_at")?,
        boost: EnergyBoost {
            until: row.try_get("energy_boost_until")?,
            regen_multiplier: row.try_get("energy_boost_regen_multiplier")?,
            max_multiplier: row.try_get("energy_boost_max_multiplier")?,
        },
        tap_seq: row.try_get("tap_seq")?,
    })
}

fn daily_from_row(row: &PgRow) -> Result<DailyQuota, sqlx::Error> {
    Ok(DailyQuota {
        user_id: row.try_get("user_id")?,
        day: row.try_get("day")?,
        tapped: row.try_get("tapped")?,
        extra_quota: row.try_get("extra_quota")?,
    })
}

fn ledger_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    let kind: String = row.try_get("kind")?;
    let kind = LedgerKind::parse(&kind)
        .ok_or_else(|| StoreError::Invariant(format!("unknown ledger kind in db: {kind}")))?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        kind,
        from_id: row.try_get("from_id")?,
        to_id: row.try_get("to_id")?,
        amount: row.try_get("amount")?,
        meta: row.try_get("meta")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Locked reads / writes (call inside a transaction)
// ---------------------------------------------------------------------------

async fn lock_system(conn: &mut PgConnection) -> StoreResult<SystemReserve> {
    let row = sqlx::query(
        r#"
        select total_supply, reserve_supply, reserved_supply, initial_reserve, start_rate, min_rate
        from system_reserve
        where id = 1
        for update
        "#,
    )
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| StoreError::NotFound("system reserve".to_string()))?;
    Ok(system_from_row(&row)?)
}

async fn lock_user(conn: &mut PgConnection, user_id: UserId) -> StoreResult<UserAccount> {
    let row = sqlx::query(
        r#"
        select user_id, balance, frozen_balance, taps_total, energy, energy_max,
               energy_updated_at, energy_boost_until, energy_boost_regen_multiplier,
               energy_boost_max_multiplier, tap_seq
        from users
        where user_id = $1
        for update
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
    Ok(user_from_row(&row)?)
}

/// Lock two users in ascending id order; returns them in argument order.
async fn lock_user_pair(
    conn: &mut PgConnection,
    a: UserId,
    b: UserId,
) -> StoreResult<(UserAccount, UserAccount)> {
    if a < b {
        let ua = lock_user(conn, a).await?;
        let ub = lock_user(conn, b).await?;
        Ok((ua, ub))
    } else {
        let ub = lock_user(conn, b).await?;
        let ua = lock_user(conn, a).await?;
        Ok((ua, ub))
    }
}

async fn lock_daily(conn: &mut PgConnection, user_id: UserId, day: NaiveDate) -> StoreResult<DailyQuota> {
    sqlx::query(
        r#"
        insert into user_daily (user_id, day)
        values ($1, $2)
        on conflict (user_id, day) do nothing
        "#,
    )
    .bind(user_id)
    .bind(day)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        r#"
        select user_id, day, tapped, extra_quota
        from user_daily
        where user_id = $1 and day = $2
        for update
        "#,
    )
    .bind(user_id)
    .bind(day)
    .fetch_one(&mut *conn)
    .await?;
    Ok(daily_from_row(&row)?)
}

async fn write_system(conn: &mut PgConnection, sys: &SystemReserve) -> StoreResult<()> {
    sqlx::query(
        r#"
        update system_reserve
           set reserve_supply = $1,
               reserved_supply = $2,
               updated_at = now()
         where id = 1
        "#,
    )
    .bind(sys.reserve_supply)
    .bind(sys.reserved_supply)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_user(conn: &mut PgConnection, u: &UserAccount) -> StoreResult<()> {
    sqlx::query(
        r#"
        update users
           set balance = $2,
               frozen_balance = $3,
               taps_total = $4,
               energy = $5,
               energy_max = $6,
               energy_updated_at = $7,
               energy_boost_until = $8,
               energy_boost_regen_multiplier = $9,
               energy_boost_max_multiplier = $10,
               tap_seq = $11
         where user_id = $1
        "#,
    )
    .bind(u.user_id)
    .bind(u.balance)
    .bind(u.frozen_balance)
    .bind(u.taps_total)
    .bind(u.energy)
    .bind(u.energy_max)
    .bind(u.energy_updated_at)
    .bind(u.boost.until)
    .bind(u.boost.regen_multiplier)
    .bind(u.boost.max_multiplier)
    .bind(u.tap_seq)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_daily(conn: &mut PgConnection, d: &DailyQuota) -> StoreResult<()> {
    sqlx::query(
        r#"
        update user_daily
           set tapped = $3,
               extra_quota = $4,
               updated_at = now()
         where user_id = $1 and day = $2
        "#,
    )
    .bind(d.user_id)
    .bind(d.day)
    .bind(d.tapped)
    .bind(d.extra_quota)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn add_daily_tapped(
    conn: &mut PgConnection,
    user_id: UserId,
    day: NaiveDate,
    n: i64,
) -> StoreResult<()> {
    let mut d = lock_daily(conn, user_id, day).await?;
    d.tapped += n;
    write_daily(conn, &d).await
}

async fn insert_ledger(conn: &mut PgConnection, e: &NewLedgerEntry) -> StoreResult<()> {
    sqlx::query(
        r#"
        insert into ledger (kind, from_id, to_id, amount, meta)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(e.kind.as_str())
    .bind(e.from_id)
    .bind(e.to_id)
    .bind(e.amount)
    .bind(&e.meta)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Returns true if the key was newly recorded.
async fn inbox_insert_deduped(conn: &mut PgConnection, ev: &TapEvent) -> StoreResult<bool> {
    let res = sqlx::query(
        r#"
        insert into tap_event_inbox (user_id, seq, granted)
        values ($1, $2, $3)
        on conflict (user_id, seq) do nothing
        "#,
    )
    .bind(ev.user_id)
    .bind(ev.seq)
    .bind(ev.granted)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_genesis(&self, genesis: &Genesis) -> StoreResult<SystemReserve> {
        if genesis.total_supply < 0 || !(0..=100).contains(&genesis.admin_allocation_pct) {
            return Err(StoreError::Invalid("genesis parameters out of range".to_string()));
        }
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            insert into system_reserve
              (id, total_supply, reserve_supply, reserved_supply, initial_reserve, start_rate, min_rate)
            values (1, $1, $2, 0, $2, $3, $4)
            on conflict (id) do nothing
            "#,
        )
        .bind(genesis.total_supply)
        .bind(genesis.initial_reserve())
        .bind(genesis.start_rate)
        .bind(genesis.min_rate)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 1 {
            let premine = genesis.admin_allocated();
            sqlx::query(
                r#"
                insert into users (user_id, balance, energy, energy_max)
                values ($1, $2, $3, $3)
                on conflict (user_id) do update
                  set balance = users.balance + excluded.balance
                "#,
            )
            .bind(genesis.admin_id)
            .bind(premine)
            .bind(genesis.admin_energy_max)
            .execute(&mut *tx)
            .await?;

            insert_ledger(
                &mut tx,
                &NewLedgerEntry {
                    kind: LedgerKind::GenesisAdmin,
                    from_id: None,
                    to_id: Some(genesis.admin_id),
                    amount: premine,
                    meta: json!({}),
                },
            )
            .await?;
            tracing::info!(
                total_supply = genesis.total_supply,
                admin_id = genesis.admin_id,
                premine,
                reserve = genesis.initial_reserve(),
                "system reserve initialized"
            );
        }

        let sys = lock_system(&mut tx).await?;
        tx.commit().await?;
        Ok(sys)
    }

    async fn system(&self) -> StoreResult<SystemReserve> {
        let row = sqlx::query(
            r#"
            select total_supply, reserve_supply, reserved_supply, initial_reserve, start_rate, min_rate
            from system_reserve
            where id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound("system reserve".to_string()))?;
        Ok(system_from_row(&row)?)
    }

    async fn ensure_user(
        &self,
        user_id: UserId,
        energy_max: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<UserAccount> {
        sqlx::query(
            r#"
            insert into users (user_id, energy, energy_max, energy_updated_at)
            values ($1, $2, $2, $3)
            on conflict (user_id) do nothing
            "#,
        )
        .bind(user_id)
        .bind(energy_max)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.user(user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    async fn user(&self, user_id: UserId) -> StoreResult<Option<UserAccount>> {
        let row = sqlx::query(
            r#"
            select user_id, balance, frozen_balance, taps_total, energy, energy_max,
                   energy_updated_at, energy_boost_until, energy_boost_regen_multiplier,
                   energy_boost_max_multiplier, tap_seq
            from users
            where user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(Some(user_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn daily(&self, user_id: UserId, day: NaiveDate) -> StoreResult<DailyQuota> {
        let row = sqlx::query(
            r#"
            select user_id, day, tapped, extra_quota
            from user_daily
            where user_id = $1 and day = $2
            "#,
        )
        .bind(user_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(daily_from_row(&r)?),
            None => Ok(DailyQuota::empty(user_id, day)),
        }
    }

    async fn apply_tap(
        &self,
        user_id: UserId,
        requested: i64,
        now: DateTime<Utc>,
        params: &TapParams,
    ) -> StoreResult<TapOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        let mut user = lock_user(&mut tx, user_id).await?;
        let mut daily = lock_daily(&mut tx, user_id, utc_day(now)).await?;

        let plan = plan_tap(params, &rules::tap_input(&sys, &user, &daily, requested, now));
        rules::apply_tap_plan(&mut sys, &mut user, &mut daily, &plan, now)?;

        if plan.granted > 0 {
            write_system(&mut tx, &sys).await?;
            write_daily(&mut tx, &daily).await?;
            insert_ledger(
                &mut tx,
                &NewLedgerEntry {
                    kind: LedgerKind::Tap,
                    from_id: None,
                    to_id: Some(user_id),
                    amount: plan.granted,
                    meta: rules::direct_tap_meta(requested),
                },
            )
            .await?;
        }
        write_user(&mut tx, &user).await?;
        tx.commit().await?;
        Ok(plan.outcome(daily.extra_quota))
    }

    async fn flush_tap_delta(&self, user_id: UserId, delta: &TapDelta) -> StoreResult<()> {
        if delta.taps == 0 {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        let mut user = lock_user(&mut tx, user_id).await?;
        rules::fold_delta(&mut sys, &mut user, delta)?;

        for (day, n) in &delta.daily {
            add_daily_tapped(&mut tx, user_id, *day, *n).await?;
        }
        if delta.gained > 0 {
            write_system(&mut tx, &sys).await?;
            insert_ledger(
                &mut tx,
                &NewLedgerEntry {
                    kind: LedgerKind::Tap,
                    from_id: None,
                    to_id: Some(user_id),
                    amount: delta.gained,
                    meta: rules::buffered_tap_meta(delta),
                },
            )
            .await?;
        }
        write_user(&mut tx, &user).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_tap_events(
        &self,
        user_id: UserId,
        events: &[TapEvent],
    ) -> StoreResult<EventApplyReport> {
        if events.is_empty() {
            return Ok(EventApplyReport::default());
        }
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        let mut user = lock_user(&mut tx, user_id).await?;

        let mut fresh = Vec::with_capacity(events.len());
        let mut duplicates = 0;
        for ev in events {
            if ev.user_id != user_id {
                return Err(StoreError::Invalid(format!(
                    "event for user {} in batch of user {user_id}",
                    ev.user_id
                )));
            }
            if inbox_insert_deduped(&mut tx, ev).await? {
                fresh.push(ev.clone());
            } else {
                duplicates += 1;
            }
        }

        let fold = rules::fold_events(&mut sys, &mut user, &fresh)?;
        for (day, n) in &fold.per_day {
            add_daily_tapped(&mut tx, user_id, *day, *n).await?;
        }
        if fold.gained > 0 {
            write_system(&mut tx, &sys).await?;
            insert_ledger(
                &mut tx,
                &NewLedgerEntry {
                    kind: LedgerKind::Tap,
                    from_id: None,
                    to_id: Some(user_id),
                    amount: fold.gained,
                    meta: rules::stream_tap_meta(&fold, fresh.len()),
                },
            )
            .await?;
        }
        if !fresh.is_empty() {
            write_user(&mut tx, &user).await?;
        }
        tx.commit().await?;
        Ok(EventApplyReport {
            applied: fresh.len(),
            duplicates,
            gained: fold.gained,
        })
    }

    async fn transfer(&self, from: UserId, to: UserId, amount: i64) -> StoreResult<()> {
        rules::require_positive(amount, "transfer amount")?;
        if from == to {
            return Err(StoreError::Invalid("cannot transfer to self".to_string()));
        }
        let mut tx = self.pool.begin().await?;
        let (mut sender, mut receiver) = lock_user_pair(&mut tx, from, to).await?;
        rules::debit_balance(&mut sender, amount)?;
        rules::credit_balance(&mut receiver, amount)?;
        write_user(&mut tx, &sender).await?;
        write_user(&mut tx, &receiver).await?;
        insert_ledger(
            &mut tx,
            &NewLedgerEntry {
                kind: LedgerKind::Transfer,
                from_id: Some(from),
                to_id: Some(to),
                amount,
                meta: json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn buy_energy_boost(
        &self,
        user_id: UserId,
        purchase: &BoostPurchase,
    ) -> StoreResult<UserAccount> {
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        let mut user = lock_user(&mut tx, user_id).await?;
        rules::debit_balance(&mut user, purchase.price)?;
        rules::credit_reserve(&mut sys, purchase.price)?;
        rules::apply_boost(&mut user, purchase.boost, purchase.at);
        write_system(&mut tx, &sys).await?;
        write_user(&mut tx, &user).await?;
        insert_ledger(
            &mut tx,
            &NewLedgerEntry {
                kind: LedgerKind::BuyEnergyBoost,
                from_id: Some(user_id),
                to_id: None,
                amount: purchase.price,
                meta: json!({ "until": purchase.boost.until }),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(user)
    }

    async fn buy_tap_pack(
        &self,
        user_id: UserId,
        price: i64,
        pack_size: i64,
        day: NaiveDate,
    ) -> StoreResult<DailyQuota> {
        rules::require_positive(pack_size, "pack size")?;
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        let mut user = lock_user(&mut tx, user_id).await?;
        let mut daily = lock_daily(&mut tx, user_id, day).await?;
        rules::debit_balance(&mut user, price)?;
        rules::credit_reserve(&mut sys, price)?;
        daily.extra_quota += pack_size;
        write_system(&mut tx, &sys).await?;
        write_user(&mut tx, &user).await?;
        write_daily(&mut tx, &daily).await?;
        insert_ledger(
            &mut tx,
            &NewLedgerEntry {
                kind: LedgerKind::BuyTapPack,
                from_id: Some(user_id),
                to_id: None,
                amount: price,
                meta: json!({ "pack_size": pack_size, "day": day }),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(daily)
    }

    async fn credit_from_reserve(
        &self,
        user_id: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: Value,
    ) -> StoreResult<()> {
        rules::require_positive(amount, "amount")?;
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        let mut user = lock_user(&mut tx, user_id).await?;
        rules::take_from_reserve(&mut sys, amount)?;
        rules::credit_balance(&mut user, amount)?;
        write_system(&mut tx, &sys).await?;
        write_user(&mut tx, &user).await?;
        insert_ledger(
            &mut tx,
            &NewLedgerEntry {
                kind,
                from_id: None,
                to_id: Some(user_id),
                amount,
                meta,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reserve_for_deposit(&self, user_id: UserId, amount: i64) -> StoreResult<()> {
        rules::require_positive(amount, "deposit amount")?;
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        lock_user(&mut tx, user_id).await?;
        rules::earmark(&mut sys, amount)?;
        write_system(&mut tx, &sys).await?;
        insert_ledger(
            &mut tx,
            &NewLedgerEntry {
                kind: LedgerKind::DepositReserve,
                from_id: None,
                to_id: Some(user_id),
                amount,
                meta: json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn settle_deposit(&self, user_id: UserId, amount: i64, approve: bool) -> StoreResult<()> {
        rules::require_positive(amount, "deposit amount")?;
        let mut tx = self.pool.begin().await?;
        let mut sys = lock_system(&mut tx).await?;
        let mut user = lock_user(&mut tx, user_id).await?;
        rules::release_earmark(&mut sys, amount)?;
        let kind = if approve {
            rules::take_from_reserve(&mut sys, amount)?;
            rules::credit_balance(&mut user, amount)?;
            write_user(&mut tx, &user).await?;
            LedgerKind::Deposit
        } else {
            LedgerKind::DepositReject
        };
        write_system(&mut tx, &sys).await?;
        insert_ledger(
            &mut tx,
            &NewLedgerEntry {
                kind,
                from_id: None,
                to_id: Some(user_id),
                amount,
                meta: json!({}),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn ledger_for_user(&self, user_id: UserId, limit: i64) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            select id, kind, from_id, to_id, amount, meta, created_at
            from ledger
            where from_id = $1 or to_id = $1
            order by id desc
            limit $2
            "#,
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_from_row).collect()
    }

    async fn ledger_sum(&self, kind: LedgerKind) -> StoreResult<i64> {
        let (sum,): (i64,) = sqlx::query_as::<_, (i64,)>(
            "select coalesce(sum(amount), 0)::bigint from ledger where kind = $1",
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn circulating_supply(&self) -> StoreResult<i64> {
        let (sum,): (i64,) = sqlx::query_as::<_, (i64,)>(
            "select coalesce(sum(balance + frozen_balance), 0)::bigint from users",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }
}
