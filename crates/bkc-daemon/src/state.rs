//! Shared runtime state for bkc-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Everything that moves
//! coins lives behind the engine and the treasury; this module only wires
//! them together at boot.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;

use bkc_config::BkcConfig;
use bkc_db::{Genesis, LedgerStore};
use bkc_tap::{build_engine, ConsistencyGate, SharedStore, StreamWorker, TapEngine, Treasury};

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            service: "bkc-daemon",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub build: BuildInfo,
    pub engine: Arc<dyn TapEngine>,
    pub treasury: Arc<Treasury>,
    pub store: Arc<dyn LedgerStore>,
    /// `None` disables the admin routes.
    pub admin_token: Option<String>,
    /// "postgres" | "memory"
    pub storage: &'static str,
}

/// Everything `main` needs after boot.
pub struct Booted {
    pub state: Arc<AppState>,
    /// Present in distributed mode; run it with `bkc_tap::spawn_stream_worker`.
    pub worker: Option<Arc<StreamWorker>>,
}

pub fn genesis(cfg: &BkcConfig) -> Genesis {
    let e = &cfg.economy;
    Genesis {
        total_supply: e.total_supply,
        admin_id: e.admin_id,
        admin_allocation_pct: e.admin_allocation_pct,
        start_rate: e.start_rate_coins_per_usd,
        min_rate: e.min_rate_coins_per_usd,
        admin_energy_max: cfg.tap.energy_max,
    }
}

/// Seed the reserve, pick the engine, and put the gate in front of the treasury.
pub async fn boot(
    cfg: &BkcConfig,
    store: Arc<dyn LedgerStore>,
    shared: Option<Arc<dyn SharedStore>>,
    storage: &'static str,
    admin_token: Option<String>,
) -> anyhow::Result<Booted> {
    let sys = store
        .ensure_genesis(&genesis(cfg))
        .await
        .context("genesis failed")?;
    tracing::info!(
        total_supply = sys.total_supply,
        reserve_supply = sys.reserve_supply,
        reserved_supply = sys.reserved_supply,
        "system reserve ready"
    );

    let bundle = build_engine(cfg, store.clone(), shared)
        .await
        .context("engine construction failed")?;
    let gate = ConsistencyGate::new(
        bundle.engine.clone(),
        Duration::from_millis(cfg.engine.gate_flush_timeout_ms),
    );
    let treasury = Treasury::new(store.clone(), bundle.engine.clone(), gate, cfg.shop_params());

    let state = AppState {
        build: BuildInfo::current(),
        engine: bundle.engine,
        treasury: Arc::new(treasury),
        store,
        admin_token,
        storage,
    };
    Ok(Booted {
        state: Arc::new(state),
        worker: bundle.worker,
    })
}

// ---------------------------------------------------------------------------
// Uptime
// ---------------------------------------------------------------------------

static STARTED: OnceLock<Instant> = OnceLock::new();

/// Seconds since the first call in this process.
pub fn uptime_secs() -> u64 {
    STARTED.get_or_init(Instant::now).elapsed().as_secs()
}
