//! bkc-tap
//!
//! Tap accumulation engines and the machinery around them.
//!
//! - [`DirectEngine`]: one durable transaction per tap.
//! - [`LocalBufferedEngine`]: in-process write-behind buffer, flushed per user.
//! - [`DistributedEngine`]: shared cache plus an event stream drained by
//!   [`StreamWorker`], safe to run on many nodes.
//!
//! Every engine plans taps with [`bkc_econ::plan_tap`], so identical inputs
//! give identical outcomes whichever mode is running. Operations that move
//! value outside the tap path go through [`Treasury`], which passes the
//! [`ConsistencyGate`] first.

mod codec;
mod delta;
mod direct;
mod distributed;
mod engine;
mod error;
mod gate;
mod local;
mod select;
pub mod shared;
mod ticker;
mod treasury;
mod worker;

pub use delta::BufferedDelta;
pub use direct::DirectEngine;
pub use distributed::DistributedEngine;
pub use engine::{EngineMode, EngineStats, FlushReport, SettleGuard, StateSnapshot, TapEngine};
pub use error::{SharedError, SharedResult, TapError, TapResult};
pub use gate::{ConsistencyGate, GatePass};
pub use local::LocalBufferedEngine;
pub use select::{build_engine, select_mode, EngineBundle};
pub use shared::{MemorySharedStore, SharedStore, StreamStats};
pub use ticker::spawn_flush_ticker;
pub use treasury::Treasury;
pub use worker::{spawn_stream_worker, StreamSettings, StreamWorker};
