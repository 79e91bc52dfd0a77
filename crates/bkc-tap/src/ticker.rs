use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::TapEngine;

/// Spawn the periodic flush of a buffered engine. A failed flush keeps its
/// deltas for the next tick. On shutdown one final flush runs before the
/// task exits.
pub fn spawn_flush_ticker(
    engine: Arc<dyn TapEngine>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mode = engine.mode().as_str();
        tracing::info!(mode, every_ms = every.as_millis() as u64, "flush ticker started");
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
            if let Err(e) = engine.flush().await {
                tracing::warn!(mode, error = %e, "periodic flush failed");
            }
        }
        match engine.flush().await {
            Ok(r) => tracing::info!(mode, flushed_users = r.users, coins = r.coins, "flush ticker stopped"),
            Err(e) => tracing::error!(mode, error = %e, "final flush failed; buffered taps not durable"),
        }
    })
}
