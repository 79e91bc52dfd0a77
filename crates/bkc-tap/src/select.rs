use std::sync::Arc;
use std::time::Duration;

use bkc_config::{BkcConfig, EngineSelection};
use bkc_db::LedgerStore;

use crate::shared::{MemorySharedStore, SharedStore};
use crate::{
    DirectEngine, DistributedEngine, EngineMode, LocalBufferedEngine, StreamSettings, StreamWorker,
    TapEngine, TapResult,
};

/// Resolve the configured selection to a concrete mode.
pub fn select_mode(selection: EngineSelection, shared_enabled: bool, local_enabled: bool) -> EngineMode {
    match selection {
        EngineSelection::Direct => EngineMode::Direct,
        EngineSelection::Local => EngineMode::LocalBuffered,
        EngineSelection::Distributed => EngineMode::DistributedBuffered,
        EngineSelection::Auto if shared_enabled => EngineMode::DistributedBuffered,
        EngineSelection::Auto if local_enabled => EngineMode::LocalBuffered,
        EngineSelection::Auto => EngineMode::Direct,
    }
}

pub struct EngineBundle {
    pub engine: Arc<dyn TapEngine>,
    /// Set in distributed mode; the caller runs it with `spawn_stream_worker`.
    pub worker: Option<Arc<StreamWorker>>,
}

/// Construct the configured engine. `shared` is the substrate for the
/// distributed mode; an in-process one is used when none is given.
pub async fn build_engine(
    cfg: &BkcConfig,
    store: Arc<dyn LedgerStore>,
    shared: Option<Arc<dyn SharedStore>>,
) -> TapResult<EngineBundle> {
    let e = &cfg.engine;
    let params = cfg.tap_params();
    let mode = select_mode(e.mode, e.shared_enabled, e.local_enabled);
    tracing::info!(selection = e.mode.as_str(), mode = mode.as_str(), "tap engine selected");

    let bundle = match mode {
        EngineMode::Direct => EngineBundle {
            engine: Arc::new(DirectEngine::new(store, params)),
            worker: None,
        },
        EngineMode::LocalBuffered => EngineBundle {
            engine: Arc::new(LocalBufferedEngine::new(
                store,
                params,
                Duration::from_millis(e.idle_evict_ms),
            )),
            worker: None,
        },
        EngineMode::DistributedBuffered => {
            let shared = shared.unwrap_or_else(|| {
                tracing::warn!("no shared substrate configured; using in-process store (single node only)");
                Arc::new(MemorySharedStore::new())
            });
            let consumer = match e.consumer.trim() {
                "" => format!("bkc-{}", uuid::Uuid::new_v4()),
                name => name.to_string(),
            };
            let settings = StreamSettings {
                key_prefix: e.key_prefix.clone(),
                stream_key: e.stream_key.clone(),
                group: e.stream_group.clone(),
                consumer,
                batch: e.worker_batch.max(1),
                claim_idle: Duration::from_millis(e.worker_claim_idle_ms),
                tx_attempts: e.tx_attempts.max(1),
            };
            let worker = Arc::new(StreamWorker::new(store.clone(), shared.clone(), settings));
            worker.ensure_group().await?;
            EngineBundle {
                engine: Arc::new(DistributedEngine::new(store, shared, params, worker.clone())),
                worker: Some(worker),
            }
        }
    };
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_prefers_distributed_then_local() {
        assert_eq!(select_mode(EngineSelection::Auto, true, true), EngineMode::DistributedBuffered);
        assert_eq!(select_mode(EngineSelection::Auto, false, true), EngineMode::LocalBuffered);
        assert_eq!(select_mode(EngineSelection::Auto, false, false), EngineMode::Direct);
    }

    #[test]
    fn explicit_selection_wins() {
        assert_eq!(select_mode(EngineSelection::Direct, true, true), EngineMode::Direct);
        assert_eq!(select_mode(EngineSelection::Local, true, false), EngineMode::LocalBuffered);
        assert_eq!(
            select_mode(EngineSelection::Distributed, false, false),
            EngineMode::DistributedBuffered
        );
    }
}
