//! Backend implementations for timer and scheduler persistence.

mod base;
mod memory;
mod postgres;

pub use base::{
    BackendError, BackendResult, ClaimRequest, FencingToken, LeaderRecord, SchedulerBackend,
    SchedulerLastRun, TimerQuery, TimerStore, WorkerRecord, WorkerStatusBackend,
};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
