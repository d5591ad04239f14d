//! `sand.v1.Timers` service.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::backends::{BackendError, TimerQuery, TimerStore};
use crate::messages::{self, MessageError, proto};
use crate::timer::{ShardMap, Timer, TimerId, partition_selector};

pub(super) fn status_from_backend(err: BackendError) -> Status {
    match err {
        BackendError::Validation(err) => Status::invalid_argument(err.to_string()),
        other => Status::internal(format!("database error: {other}")),
    }
}

fn status_from_message(err: MessageError) -> Status {
    Status::invalid_argument(err.to_string())
}

fn parse_id(raw: &str) -> Result<TimerId, Status> {
    raw.parse()
        .map_err(|_| status_from_message(MessageError::InvalidTimerId(raw.to_string())))
}

#[derive(Clone)]
pub struct TimersService<B> {
    backend: B,
    shards: ShardMap,
}

impl<B> TimersService<B>
where
    B: TimerStore + Clone + Send + Sync + 'static,
{
    pub fn new(backend: B, shards: ShardMap) -> Self {
        Self { backend, shards }
    }

    async fn select(
        &self,
        shard_id: Option<i32>,
        selector: &HashMap<String, String>,
        limit: usize,
    ) -> Result<Vec<Timer>, Status> {
        // User labels are filtered by the store. Synthetic keys are checked
        // here, so the store only limits when none are present.
        let (labels, synthetic) = partition_selector(selector);
        let query = TimerQuery {
            shard_id,
            labels,
            limit: if synthetic.is_empty() { limit } else { 0 },
        };
        let mut timers: Vec<Timer> = self
            .backend
            .list_timers(&query)
            .await
            .map_err(status_from_backend)?
            .into_iter()
            .filter(|timer| timer.matches(&synthetic))
            .collect();
        if limit > 0 {
            timers.truncate(limit);
        }
        Ok(timers)
    }
}

#[tonic::async_trait]
impl<B> proto::timers_server::Timers for TimersService<B>
where
    B: TimerStore + Clone + Send + Sync + 'static,
{
    async fn create_timer(
        &self,
        request: Request<proto::CreateTimerRequest>,
    ) -> Result<Response<proto::CreateTimerResponse>, Status> {
        let new_timer = messages::new_timer_from_request(request.into_inner(), &self.shards)
            .map_err(status_from_message)?;
        let timer = self
            .backend
            .create_timer(new_timer)
            .await
            .map_err(status_from_backend)?;
        info!(
            timer_id = %timer.id,
            timer_name = %timer.name,
            shard_id = timer.shard_id,
            due_at = %timer.due_at,
            "timer created"
        );
        Ok(Response::new(proto::CreateTimerResponse {
            timer: Some(timer.into()),
        }))
    }

    async fn get_timer(
        &self,
        request: Request<proto::GetTimerRequest>,
    ) -> Result<Response<proto::GetTimerResponse>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let timer = self
            .backend
            .get_timer(id)
            .await
            .map_err(status_from_backend)?
            .ok_or_else(|| Status::not_found(format!("timer {id} not found")))?;
        Ok(Response::new(proto::GetTimerResponse {
            timer: Some(timer.into()),
        }))
    }

    async fn list_timers(
        &self,
        request: Request<proto::ListTimersRequest>,
    ) -> Result<Response<proto::ListTimersResponse>, Status> {
        let request = request.into_inner();
        let shard_id = request
            .shard_key
            .as_deref()
            .map(|key| self.shards.shard_for(key));
        let timers = self
            .select(shard_id, &request.selector, request.limit as usize)
            .await?;
        Ok(Response::new(proto::ListTimersResponse {
            timers: timers.into_iter().map(Into::into).collect(),
        }))
    }

    async fn delete_timer(
        &self,
        request: Request<proto::DeleteTimerRequest>,
    ) -> Result<Response<proto::DeleteTimerResponse>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let deleted = self
            .backend
            .delete_timer(id)
            .await
            .map_err(status_from_backend)?;
        Ok(Response::new(proto::DeleteTimerResponse { deleted }))
    }

    async fn delete_timers(
        &self,
        request: Request<proto::DeleteTimersRequest>,
    ) -> Result<Response<proto::DeleteTimersResponse>, Status> {
        let selector = request.into_inner().selector;
        if selector.is_empty() {
            return Err(Status::invalid_argument(
                "a non-empty selector is required to delete timers",
            ));
        }
        let mut deleted = 0u64;
        for timer in self.select(None, &selector, 0).await? {
            if self
                .backend
                .delete_timer(timer.id)
                .await
                .map_err(status_from_backend)?
            {
                deleted += 1;
            }
        }
        info!(deleted, selector = ?selector, "timers deleted by selector");
        Ok(Response::new(proto::DeleteTimersResponse { deleted }))
    }
}
