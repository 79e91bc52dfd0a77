//! bkc-db
//!
//! Durable store of the tap economy: the system reserve row, user accounts,
//! per-day quota rows, the append-only ledger, and the stream event inbox.
//!
//! `LedgerStore` is the seam. `PgLedgerStore` is the production
//! implementation; `MemoryLedgerStore` backs tests and database-less dev runs.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod error;
mod memory;
mod pg;
mod rules;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryLedgerStore;
pub use pg::PgLedgerStore;
pub use store::LedgerStore;
pub use types::*;

pub const ENV_DB_URL: &str = "BKC_DATABASE_URL";

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect using BKC_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_reserve_row: bool,
}

/// Connectivity plus genesis presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'system_reserve'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    let has_reserve_row = if exists {
        let (n,): (i64,) = sqlx::query_as::<_, (i64,)>("select count(*)::bigint from system_reserve")
            .fetch_one(pool)
            .await
            .context("status reserve-row query failed")?;
        n == 1
    } else {
        false
    };

    Ok(DbStatus {
        ok: one == 1,
        has_reserve_row,
    })
}
