use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use bkc_econ::{ShopParams, TapParams};

use crate::LoadedConfig;

/// Typed view of the merged configuration. Every field has a default so an
/// empty document is a valid (development) configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BkcConfig {
    pub economy: EconomyConfig,
    pub tap: TapConfig,
    pub shop: ShopConfig,
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    pub total_supply: i64,
    pub admin_id: i64,
    pub admin_allocation_pct: i64,
    pub start_rate_coins_per_usd: i64,
    pub min_rate_coins_per_usd: i64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            total_supply: 1_000_000_000,
            admin_id: 1,
            admin_allocation_pct: 10,
            start_rate_coins_per_usd: 1_000,
            min_rate_coins_per_usd: 100,
        }
    }
}

impl EconomyConfig {
    /// Premine credited to the admin at genesis.
    pub fn admin_allocated(&self) -> i64 {
        self.total_supply.saturating_mul(self.admin_allocation_pct) / 100
    }

    pub fn initial_reserve(&self) -> i64 {
        self.total_supply - self.admin_allocated()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    pub energy_max: f64,
    pub energy_regen_per_sec: f64,
    pub daily_limit: i64,
    pub max_per_request: i64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            energy_max: 1_000.0,
            energy_regen_per_sec: 1.0,
            daily_limit: 5_000,
            max_per_request: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShopConfig {
    pub energy_boost_price: i64,
    pub energy_boost_secs: i64,
    pub energy_boost_regen_multiplier: f64,
    pub energy_boost_max_multiplier: f64,
    pub tap_pack_size: i64,
    pub tap_pack_price: i64,
}

impl Default for ShopConfig {
    fn default() -> Self {
        Self {
            energy_boost_price: 500,
            energy_boost_secs: 3_600,
            energy_boost_regen_multiplier: 2.0,
            energy_boost_max_multiplier: 2.0,
            tap_pack_size: 1_000,
            tap_pack_price: 300,
        }
    }
}

/// Which tap engine to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineSelection {
    /// Distributed if the shared substrate is enabled, else local-buffered.
    #[default]
    Auto,
    Direct,
    Local,
    Distributed,
}

impl EngineSelection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineSelection::Auto => "auto",
            EngineSelection::Direct => "direct",
            EngineSelection::Local => "local",
            EngineSelection::Distributed => "distributed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: EngineSelection,
    /// Auto mode falls back to direct when this is false and no shared substrate is enabled.
    pub local_enabled: bool,
    pub shared_enabled: bool,
    pub flush_interval_ms: u64,
    pub gate_flush_timeout_ms: u64,
    /// Cached users with nothing pending are dropped after this long without a tap.
    pub idle_evict_ms: u64,
    pub key_prefix: String,
    pub stream_key: String,
    pub stream_group: String,
    /// Empty means "generate one per process".
    pub consumer: String,
    pub worker_batch: usize,
    pub worker_block_ms: u64,
    pub worker_claim_idle_ms: u64,
    /// Optimistic transaction attempts before a tap reports contention.
    pub tx_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineSelection::Auto,
            local_enabled: true,
            shared_enabled: false,
            flush_interval_ms: 1_000,
            gate_flush_timeout_ms: 8_000,
            idle_evict_ms: 60_000,
            key_prefix: "bkc".to_string(),
            stream_key: "bkc:tap_events".to_string(),
            stream_group: "bkc-ledger".to_string(),
            consumer: String::new(),
            worker_batch: 256,
            worker_block_ms: 200,
            worker_claim_idle_ms: 30_000,
            tx_attempts: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// NAME of the env var holding the connection URL.
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: "BKC_DATABASE_URL".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub bind_addr: String,
    /// NAME of the env var holding the admin route token. Unset env var
    /// disables admin routes entirely.
    pub admin_token_env: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8899".to_string(),
            admin_token_env: "BKC_ADMIN_TOKEN".to_string(),
        }
    }
}

impl BkcConfig {
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let cfg: BkcConfig = serde_json::from_value(loaded.config_json.clone())
            .context("CONFIG_INVALID: typed decode failed")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let e = &self.economy;
        if e.total_supply < 0 {
            bail!("CONFIG_INVALID: economy.total_supply must be >= 0");
        }
        if !(0..=100).contains(&e.admin_allocation_pct) {
            bail!("CONFIG_INVALID: economy.admin_allocation_pct must be within 0..=100");
        }
        if e.min_rate_coins_per_usd < 0 || e.min_rate_coins_per_usd > e.start_rate_coins_per_usd {
            bail!(
                "CONFIG_INVALID: rates must satisfy 0 <= min ({}) <= start ({})",
                e.min_rate_coins_per_usd,
                e.start_rate_coins_per_usd
            );
        }

        let t = &self.tap;
        if !t.energy_max.is_finite() || t.energy_max < 0.0 {
            bail!("CONFIG_INVALID: tap.energy_max must be a finite value >= 0");
        }
        if !t.energy_regen_per_sec.is_finite() || t.energy_regen_per_sec < 0.0 {
            bail!("CONFIG_INVALID: tap.energy_regen_per_sec must be a finite value >= 0");
        }

        let s = &self.shop;
        if s.energy_boost_price < 0 || s.tap_pack_price < 0 {
            bail!("CONFIG_INVALID: shop prices must be >= 0");
        }
        if s.energy_boost_secs <= 0 || s.tap_pack_size <= 0 {
            bail!("CONFIG_INVALID: shop.energy_boost_secs and shop.tap_pack_size must be > 0");
        }
        if !(s.energy_boost_regen_multiplier >= 0.0) || !(s.energy_boost_max_multiplier >= 0.0) {
            bail!("CONFIG_INVALID: shop boost multipliers must be >= 0");
        }

        let g = &self.engine;
        if g.flush_interval_ms == 0 {
            bail!("CONFIG_INVALID: engine.flush_interval_ms must be > 0");
        }
        if g.gate_flush_timeout_ms == 0 || g.gate_flush_timeout_ms >= 10_000 {
            bail!("CONFIG_INVALID: engine.gate_flush_timeout_ms must be within 1..10000");
        }
        if g.worker_batch == 0 || g.tx_attempts == 0 {
            bail!("CONFIG_INVALID: engine.worker_batch and engine.tx_attempts must be > 0");
        }
        if g.stream_key.trim().is_empty() || g.stream_group.trim().is_empty() {
            bail!("CONFIG_INVALID: engine.stream_key and engine.stream_group must be set");
        }
        if self.database.max_connections == 0 {
            bail!("CONFIG_INVALID: database.max_connections must be > 0");
        }
        Ok(())
    }

    pub fn tap_params(&self) -> TapParams {
        TapParams {
            energy_max: self.tap.energy_max,
            energy_regen_per_sec: self.tap.energy_regen_per_sec,
            daily_limit: self.tap.daily_limit,
            max_per_request: self.tap.max_per_request,
        }
    }

    pub fn shop_params(&self) -> ShopParams {
        ShopParams {
            energy_boost_price: self.shop.energy_boost_price,
            energy_boost_duration_secs: self.shop.energy_boost_secs,
            energy_boost_regen_multiplier: self.shop.energy_boost_regen_multiplier,
            energy_boost_max_multiplier: self.shop.energy_boost_max_multiplier,
            tap_pack_price: self.shop.tap_pack_price,
            tap_pack_size: self.shop.tap_pack_size,
        }
    }
}
