//! gRPC front door: the Timers and Workers services plus health checks.

mod timers;
mod workers;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::info;

use crate::backends::{TimerStore, WorkerStatusBackend};
use crate::messages::proto::timers_server::TimersServer;
use crate::messages::proto::workers_server::WorkersServer;
use crate::timer::ShardMap;

pub use timers::TimersService;
pub use workers::WorkersService;

/// Bind `addr` and serve until `shutdown` flips to `true`.
pub async fn run_server<B>(
    addr: SocketAddr,
    backend: B,
    shards: ShardMap,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    B: TimerStore + WorkerStatusBackend + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind grpc listener on {addr}"))?;
    info!(?addr, shard_count = shards.count(), "sand server listening");
    run_grpc_server(listener, backend, shards, shutdown).await
}

/// Serve on an already bound listener.
pub async fn run_grpc_server<B>(
    listener: TcpListener,
    backend: B,
    shards: ShardMap,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    B: TimerStore + WorkerStatusBackend + Clone + Send + Sync + 'static,
{
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<TimersServer<TimersService<B>>>()
        .await;
    health_reporter
        .set_serving::<WorkersServer<WorkersService<B>>>()
        .await;

    let incoming = TcpListenerStream::new(listener);
    let timers = TimersService::new(backend.clone(), shards);
    let workers = WorkersService::new(backend);

    Server::builder()
        .add_service(health_service)
        .add_service(TimersServer::new(timers))
        .add_service(WorkersServer::new(workers))
        .serve_with_incoming_shutdown(incoming, async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("sand server stopped");
    Ok(())
}
