use std::sync::Arc;
use std::time::Duration;

use crate::{SettleGuard, TapEngine, TapError, TapResult};

/// Runs in front of every request that moves value outside the tap path.
///
/// Entering settles the engine: every acknowledged tap is made durable and
/// the engine stays quiet until the returned pass drops. If that does not
/// happen within the deadline the request fails with
/// [`TapError::BufferBusy`] instead of proceeding against stale numbers.
#[derive(Clone)]
pub struct ConsistencyGate {
    engine: Arc<dyn TapEngine>,
    timeout: Duration,
}

/// Proof the gate was passed. Hold it until the side operation has committed
/// and its side-channel adjustment has been applied.
pub struct GatePass {
    _guard: SettleGuard,
}

impl ConsistencyGate {
    pub fn new(engine: Arc<dyn TapEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn enter(&self) -> TapResult<GatePass> {
        match tokio::time::timeout(self.timeout, self.engine.settle()).await {
            Ok(Ok(guard)) => Ok(GatePass { _guard: guard }),
            Ok(Err(e)) => {
                tracing::warn!(mode = self.engine.mode().as_str(), error = %e, "gate flush failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    mode = self.engine.mode().as_str(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "gate flush timed out"
                );
                Err(TapError::BufferBusy)
            }
        }
    }
}
