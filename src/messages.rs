//! Protocol buffer message types and conversions to the timer model.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::backends::WorkerRecord;
use crate::timer::{NewTimer, RpcTarget, ShardMap, Timer};

/// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("sand.v1");
}

/// Encoded `FileDescriptorSet` of `sand.v1`, used to resolve builtin type URLs.
pub const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/sand_descriptor.bin"));

/// Errors converting wire messages into model types
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid timer id `{0}`")]
    InvalidTimerId(String),
    #[error("rpc target is required")]
    MissingTarget,
    #[error("timestamp {0}ms is out of range")]
    InvalidTimestamp(i64),
}

pub fn unix_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_unix_ms(ms: i64) -> Result<DateTime<Utc>, MessageError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(MessageError::InvalidTimestamp(ms))
}

impl From<RpcTarget> for proto::RpcTarget {
    fn from(target: RpcTarget) -> Self {
        Self {
            addr: target.addr,
            authority: target.authority,
            method: target.method,
            meta: target.meta,
            args_type_url: target.args_type_url,
            args_data: target.args_data,
            return_type_url: target.return_type_url,
        }
    }
}

impl From<proto::RpcTarget> for RpcTarget {
    fn from(target: proto::RpcTarget) -> Self {
        Self {
            addr: target.addr,
            authority: target.authority,
            method: target.method,
            meta: target.meta,
            args_type_url: target.args_type_url,
            args_data: target.args_data,
            return_type_url: target.return_type_url,
        }
    }
}

impl From<Timer> for proto::Timer {
    fn from(timer: Timer) -> Self {
        Self {
            id: timer.id.to_string(),
            name: timer.name,
            shard_key: timer.shard_key,
            shard_id: timer.shard_id,
            labels: timer.labels,
            created_at_unix_ms: unix_ms(timer.created_at),
            due_at_unix_ms: unix_ms(timer.due_at),
            due_counter: timer.due_counter,
            priority: timer.priority,
            assigned_worker: timer.assigned_worker,
            assignable_at_unix_ms: timer.assignable_at.map(unix_ms),
            attempt: timer.attempt,
            retry_counter: timer.retry_counter,
            target: Some(timer.target.into()),
            delivered_at_unix_ms: timer.delivered_at.map(unix_ms),
            delivered_status_code: timer.delivered_status_code,
            delivered_err: timer.delivered_err,
        }
    }
}

impl From<WorkerRecord> for proto::Worker {
    fn from(worker: WorkerRecord) -> Self {
        Self {
            identity: worker.identity,
            started_at_unix_ms: unix_ms(worker.started_at),
            last_seen_at_unix_ms: unix_ms(worker.last_seen_at),
        }
    }
}

/// Build a [`NewTimer`], deriving the shard from `shard_key`.
///
/// An empty shard key falls back to the timer name so that unkeyed timers
/// still spread across shards.
pub fn new_timer_from_request(
    request: proto::CreateTimerRequest,
    shards: &ShardMap,
) -> Result<NewTimer, MessageError> {
    let target = request.target.ok_or(MessageError::MissingTarget)?;
    let shard_key = if request.shard_key.is_empty() {
        request.name.clone()
    } else {
        request.shard_key
    };
    Ok(NewTimer {
        shard_id: shards.shard_for(&shard_key),
        name: request.name,
        shard_key,
        labels: request.labels,
        due_at: from_unix_ms(request.due_at_unix_ms)?,
        priority: request.priority,
        target: target.into(),
    })
}
