//! Leader-elected scheduler tier.

mod leader;
mod task;

pub use leader::{LeaderElector, LeaderState};
pub use task::{
    SchedulerError, SchedulerTask, SchedulerTaskConfig, TickReport, delay_until_next_minute,
    spawn_scheduler,
};
