//! Sand - durable delayed RPC delivery over PostgreSQL.

pub mod backends;
pub mod config;
pub mod db;
pub mod messages;
pub mod metrics;
pub mod observability;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod timer;
pub mod workers;

pub use backends::{
    BackendError, BackendResult, MemoryBackend, PostgresBackend, SchedulerBackend, TimerStore,
    WorkerStatusBackend,
};
pub use config::Config;
pub use messages::{MessageError, proto};
pub use metrics::Metrics;
pub use rpc::{ConnectionCache, DeliveryError, DescriptorResolver, DynamicInvoker, TypeResolver};
pub use scheduler::{LeaderElector, LeaderState, SchedulerTask, spawn_scheduler};
pub use server::{TimersService, WorkersService, run_grpc_server, run_server};
pub use timer::{NewTimer, RpcTarget, ShardMap, Timer, TimerId};
pub use workers::{DeliveryConfig, DeliveryWorker, TimerDelivery, spawn_delivery_worker};
