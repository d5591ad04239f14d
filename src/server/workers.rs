//! `sand.v1.Workers` service.

use tonic::{Request, Response, Status};

use super::timers::status_from_backend;
use crate::backends::WorkerStatusBackend;
use crate::messages::proto;

#[derive(Clone)]
pub struct WorkersService<B> {
    backend: B,
}

impl<B> WorkersService<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl<B> proto::workers_server::Workers for WorkersService<B>
where
    B: WorkerStatusBackend + Clone + Send + Sync + 'static,
{
    async fn list_workers(
        &self,
        _request: Request<proto::ListWorkersRequest>,
    ) -> Result<Response<proto::ListWorkersResponse>, Status> {
        let workers = self
            .backend
            .list_workers()
            .await
            .map_err(status_from_backend)?;
        Ok(Response::new(proto::ListWorkersResponse {
            workers: workers.into_iter().map(Into::into).collect(),
        }))
    }
}
