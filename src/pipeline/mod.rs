//! Render-thread to streaming-thread hand-off

pub mod slot;
pub mod worker;

pub use slot::{FrameSlot, SlotStats};
pub use worker::{StreamWorker, WorkerStats, WorkerStatsSnapshot};
