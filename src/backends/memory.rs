//! In-memory backend for tests and single-process runs.
//!
//! Every operation takes one mutex over the whole state, which gives the same
//! atomicity the Postgres backend gets from row locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tonic::async_trait;

use super::base::{
    BackendResult, ClaimRequest, FencingToken, LeaderRecord, SchedulerBackend, SchedulerLastRun,
    TimerQuery, TimerStore, WorkerRecord, WorkerStatusBackend,
};
use crate::timer::{DEFAULT_MAX_ATTEMPTS, NewTimer, Timer, TimerId};

#[derive(Default)]
struct MemoryState {
    timers: HashMap<TimerId, Timer>,
    next_due_counter: i64,
    leaders: HashMap<String, LeaderRecord>,
    last_runs: HashMap<String, SchedulerLastRun>,
    workers: HashMap<String, WorkerRecord>,
}

impl MemoryState {
    fn leader(&self, namespace: &str) -> LeaderRecord {
        self.leaders
            .get(namespace)
            .cloned()
            .unwrap_or_else(|| LeaderRecord::vacant(namespace))
    }

    fn check_fence(&self, token: &FencingToken) -> BackendResult<()> {
        let current = self.leader(&token.namespace);
        if current.generation == token.generation
            && current.leader.as_deref() == Some(token.holder.as_str())
        {
            Ok(())
        } else {
            Err(token.fenced())
        }
    }
}

/// Backend that keeps every table in process memory.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    max_attempts: i32,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_due_counter: 1,
                ..MemoryState::default()
            })),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Overwrite a stored timer, for tests that need a precise starting state.
    pub fn put_timer(&self, timer: Timer) {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.timers.insert(timer.id, timer);
    }

    /// Overwrite the leadership row of a namespace.
    pub fn put_leader(&self, record: LeaderRecord) {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.leaders.insert(record.namespace.clone(), record);
    }

    pub fn timers(&self) -> Vec<Timer> {
        let state = self.state.lock().expect("memory backend poisoned");
        state.timers.values().cloned().collect()
    }
}

#[async_trait]
impl TimerStore for MemoryBackend {
    async fn create_timer(&self, timer: NewTimer) -> BackendResult<Timer> {
        timer.validate()?;
        let timer = timer.into_timer(TimerId::new(), Utc::now());
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.timers.insert(timer.id, timer.clone());
        Ok(timer)
    }

    async fn get_timer(&self, id: TimerId) -> BackendResult<Option<Timer>> {
        let state = self.state.lock().expect("memory backend poisoned");
        Ok(state.timers.get(&id).cloned())
    }

    async fn list_timers(&self, query: &TimerQuery) -> BackendResult<Vec<Timer>> {
        let state = self.state.lock().expect("memory backend poisoned");
        let mut timers: Vec<Timer> = state
            .timers
            .values()
            .filter(|timer| query.shard_id.map_or(true, |shard_id| shard_id == timer.shard_id))
            .filter(|timer| {
                query
                    .labels
                    .iter()
                    .all(|(key, value)| timer.labels.get(key) == Some(value))
            })
            .cloned()
            .collect();
        timers.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if query.limit > 0 {
            timers.truncate(query.limit);
        }
        Ok(timers)
    }

    async fn delete_timer(&self, id: TimerId) -> BackendResult<bool> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        Ok(state.timers.remove(&id).is_some())
    }

    async fn claim_timers(&self, claim: &ClaimRequest) -> BackendResult<Vec<Timer>> {
        if claim.batch_size == 0 {
            return Ok(Vec::new());
        }
        let lease_expires_at = claim.lease_expires_at();
        let mut state = self.state.lock().expect("memory backend poisoned");

        let mut candidates: Vec<&Timer> = state
            .timers
            .values()
            .filter(|timer| {
                timer.shard_id == claim.shard_id
                    && timer.is_claimable(claim.now, self.max_attempts)
            })
            .collect();
        candidates.sort_by(|a, b| claim_order(a).cmp(&claim_order(b)));
        let ids: Vec<TimerId> = candidates
            .into_iter()
            .take(claim.batch_size)
            .map(|timer| timer.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(timer) = state.timers.get_mut(&id) {
                timer.assigned_worker = Some(claim.worker.clone());
                timer.attempt += 1;
                timer.assignable_at = Some(lease_expires_at);
                claimed.push(timer.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: TimerId, now: DateTime<Utc>) -> BackendResult<()> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        if let Some(timer) = state.timers.get_mut(&id) {
            if timer.delivered_at.is_none() {
                timer.delivered_at = Some(now);
                timer.delivered_status_code = Some(0);
                timer.delivered_err = None;
                timer.assignable_at = None;
            }
        }
        Ok(())
    }

    async fn mark_attempted(
        &self,
        claimed: &Timer,
        status_code: i32,
        error: &str,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        let Some(timer) = state.timers.get_mut(&claimed.id) else {
            return Ok(false);
        };
        let holds_lease = claimed.assigned_worker.is_some()
            && timer.assigned_worker == claimed.assigned_worker
            && timer.attempt == claimed.attempt;
        if timer.delivered_at.is_some() || !holds_lease {
            return Ok(false);
        }
        timer.retry_counter += 1;
        timer.delivered_status_code = Some(status_code);
        timer.delivered_err = Some(error.to_string());
        timer.assignable_at = None;
        Ok(true)
    }

    async fn cull_timers(&self, shard_id: i32, now: DateTime<Utc>) -> BackendResult<u64> {
        let max_attempts = self.max_attempts;
        let mut state = self.state.lock().expect("memory backend poisoned");
        let before = state.timers.len();
        state.timers.retain(|_, timer| {
            timer.shard_id != shard_id || !is_cullable(timer, now, max_attempts)
        });
        Ok((before - state.timers.len()) as u64)
    }
}

/// Claim order: numbered timers first by `due_counter`, then the rest by due time.
fn claim_order(timer: &Timer) -> (bool, i64, DateTime<Utc>, TimerId) {
    (
        timer.due_counter.is_none(),
        timer.due_counter.unwrap_or(i64::MAX),
        timer.due_at,
        timer.id,
    )
}

fn is_cullable(timer: &Timer, now: DateTime<Utc>, max_attempts: i32) -> bool {
    timer.is_delivered()
        || (timer.attempt >= max_attempts && timer.assignable_at.map_or(true, |until| until < now))
}

#[async_trait]
impl SchedulerBackend for MemoryBackend {
    async fn read_leader(&self, namespace: &str) -> BackendResult<LeaderRecord> {
        let state = self.state.lock().expect("memory backend poisoned");
        Ok(state.leader(namespace))
    }

    async fn try_acquire_leadership(
        &self,
        observed: &LeaderRecord,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<LeaderRecord>> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        let current = state.leader(&observed.namespace);
        if &current != observed {
            return Ok(None);
        }
        let acquired = LeaderRecord {
            namespace: observed.namespace.clone(),
            generation: current.generation + 1,
            leader: Some(candidate.to_string()),
            last_seen_at: Some(now),
        };
        state
            .leaders
            .insert(acquired.namespace.clone(), acquired.clone());
        Ok(Some(acquired))
    }

    async fn renew_leadership(
        &self,
        token: &FencingToken,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        if state.check_fence(token).is_err() {
            return Ok(false);
        }
        if let Some(record) = state.leaders.get_mut(&token.namespace) {
            record.last_seen_at = Some(now);
        }
        Ok(true)
    }

    async fn assign_due_counters(
        &self,
        token: &FencingToken,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<usize> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.check_fence(token)?;

        let mut pending: Vec<(DateTime<Utc>, DateTime<Utc>, TimerId)> = state
            .timers
            .values()
            .filter(|timer| timer.due_counter.is_none() && timer.due_at <= now)
            .map(|timer| (timer.due_at, timer.created_at, timer.id))
            .collect();
        pending.sort();
        pending.truncate(limit);

        let mut next = state.next_due_counter;
        for (_, _, id) in &pending {
            if let Some(timer) = state.timers.get_mut(id) {
                timer.due_counter = Some(next);
                next += 1;
            }
        }
        state.next_due_counter = next;
        Ok(pending.len())
    }

    async fn record_last_run(
        &self,
        token: &FencingToken,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.check_fence(token)?;
        state.last_runs.insert(
            token.namespace.clone(),
            SchedulerLastRun {
                namespace: token.namespace.clone(),
                worker: token.holder.clone(),
                last_run_at: now,
            },
        );
        Ok(())
    }

    async fn last_run(&self, namespace: &str) -> BackendResult<Option<SchedulerLastRun>> {
        let state = self.state.lock().expect("memory backend poisoned");
        Ok(state.last_runs.get(namespace).cloned())
    }
}

#[async_trait]
impl WorkerStatusBackend for MemoryBackend {
    async fn upsert_worker(&self, identity: &str, now: DateTime<Utc>) -> BackendResult<()> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state
            .workers
            .entry(identity.to_string())
            .and_modify(|record| record.last_seen_at = now)
            .or_insert_with(|| WorkerRecord {
                identity: identity.to_string(),
                started_at: now,
                last_seen_at: now,
            });
        Ok(())
    }

    async fn list_workers(&self) -> BackendResult<Vec<WorkerRecord>> {
        let state = self.state.lock().expect("memory backend poisoned");
        let mut workers: Vec<WorkerRecord> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use super::*;
    use crate::backends::BackendError;
    use crate::timer::test_fixtures::sample_new_timer;

    const LEASE: StdDuration = StdDuration::from_secs(30);

    fn claim(worker: &str, now: DateTime<Utc>, batch_size: usize) -> ClaimRequest {
        ClaimRequest {
            shard_id: 0,
            worker: worker.to_string(),
            now,
            batch_size,
            lease: LEASE,
        }
    }

    fn token(generation: i64) -> FencingToken {
        FencingToken {
            namespace: "default".to_string(),
            holder: "scheduler-a".to_string(),
            generation,
        }
    }

    async fn become_leader(backend: &MemoryBackend, now: DateTime<Utc>) -> FencingToken {
        let observed = backend.read_leader("default").await.expect("read leader");
        let acquired = backend
            .try_acquire_leadership(&observed, "scheduler-a", now)
            .await
            .expect("acquire")
            .expect("vacant row is acquirable");
        token(acquired.generation)
    }

    #[tokio::test]
    async fn create_rejects_missing_target_fields() {
        let backend = MemoryBackend::new();
        let mut timer = sample_new_timer(0, Utc::now());
        timer.target.method.clear();
        let err = backend.create_timer(timer).await.expect_err("invalid timer");
        assert!(matches!(err, BackendError::Validation(_)));
        assert!(backend.timers().is_empty());
    }

    #[tokio::test]
    async fn create_starts_unclaimed() {
        let backend = MemoryBackend::new();
        let timer = backend
            .create_timer(sample_new_timer(0, Utc::now()))
            .await
            .expect("create");
        assert_eq!(timer.attempt, 0);
        assert!(timer.assigned_worker.is_none());
        assert!(timer.assignable_at.is_none());
        assert!(timer.delivered_at.is_none());
    }

    #[tokio::test]
    async fn claims_follow_due_counter_order() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for counter in [3, 1, 2] {
            let mut timer = sample_new_timer(0, now - Duration::seconds(5))
                .into_timer(TimerId::new(), now);
            timer.due_counter = Some(counter);
            ids.push((counter, timer.id));
            backend.put_timer(timer);
        }
        ids.sort();

        let claimed = backend
            .claim_timers(&claim("worker-a", now, 2))
            .await
            .expect("claim");
        let claimed_ids: Vec<TimerId> = claimed.iter().map(|timer| timer.id).collect();
        assert_eq!(claimed_ids, vec![ids[0].1, ids[1].1]);
        assert!(claimed.iter().all(|timer| timer.attempt == 1));
        assert!(claimed
            .iter()
            .all(|timer| timer.assigned_worker.as_deref() == Some("worker-a")));
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_timer() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        for _ in 0..50 {
            backend
                .create_timer(sample_new_timer(0, now - Duration::seconds(1)))
                .await
                .expect("create");
        }

        let mut handles = Vec::new();
        for worker in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .claim_timers(&claim(&format!("worker-{worker}"), now, 10))
                    .await
                    .expect("claim")
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for timer in handle.await.expect("join") {
                total += 1;
                assert!(seen.insert(timer.id), "timer {} leased twice", timer.id);
            }
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn list_filters_by_shard_and_labels() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let billing = backend
            .create_timer(sample_new_timer(0, now))
            .await
            .expect("create");
        let mut search = sample_new_timer(1, now);
        search
            .labels
            .insert("team".to_string(), "search".to_string());
        backend.create_timer(search).await.expect("create");

        let query = TimerQuery {
            labels: HashMap::from([("team".to_string(), "billing".to_string())]),
            ..TimerQuery::default()
        };
        let listed = backend.list_timers(&query).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, billing.id);

        let shard_one = TimerQuery {
            shard_id: Some(1),
            ..TimerQuery::default()
        };
        assert_eq!(backend.list_timers(&shard_one).await.expect("list").len(), 1);
        let nobody = TimerQuery {
            shard_id: Some(1),
            ..query
        };
        assert!(backend.list_timers(&nobody).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn not_due_timers_are_not_claimed() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        backend
            .create_timer(sample_new_timer(0, now + Duration::hours(1)))
            .await
            .expect("create");
        let claimed = backend
            .claim_timers(&claim("worker-a", now, 10))
            .await
            .expect("claim");
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_by_another_worker() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let created = backend
            .create_timer(sample_new_timer(0, now - Duration::seconds(1)))
            .await
            .expect("create");

        let first = backend
            .claim_timers(&claim("worker-a", now, 1))
            .await
            .expect("claim");
        assert_eq!(first.len(), 1);

        let during_lease = backend
            .claim_timers(&claim("worker-b", now + Duration::seconds(10), 1))
            .await
            .expect("claim");
        assert!(during_lease.is_empty());

        let after_lease = backend
            .claim_timers(&claim("worker-b", now + Duration::seconds(31), 1))
            .await
            .expect("claim");
        assert_eq!(after_lease.len(), 1);
        assert_eq!(after_lease[0].id, created.id);
        assert_eq!(after_lease[0].assigned_worker.as_deref(), Some("worker-b"));
        assert_eq!(after_lease[0].attempt, 2);
    }

    #[tokio::test]
    async fn stale_failure_report_keeps_reclaimed_lease() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        backend
            .create_timer(sample_new_timer(0, now - Duration::seconds(1)))
            .await
            .expect("create");

        let stale = backend
            .claim_timers(&claim("worker-a", now, 1))
            .await
            .expect("claim");
        let reclaim_at = now + Duration::seconds(31);
        let live = backend
            .claim_timers(&claim("worker-b", reclaim_at, 1))
            .await
            .expect("reclaim");
        assert_eq!(live.len(), 1);

        let recorded = backend
            .mark_attempted(&stale[0], 14, "late failure")
            .await
            .expect("attempted");
        assert!(!recorded);

        let stored = backend
            .get_timer(live[0].id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.assigned_worker.as_deref(), Some("worker-b"));
        assert_eq!(stored.assignable_at, live[0].assignable_at);
        assert_eq!(stored.retry_counter, 0);
        assert!(stored.delivered_err.is_none());

        let third = backend
            .claim_timers(&claim("worker-c", reclaim_at + Duration::seconds(1), 1))
            .await
            .expect("claim");
        assert!(third.is_empty());

        // The same worker retrying an older attempt is stale too.
        let mut older = live[0].clone();
        older.attempt -= 1;
        assert!(!backend.mark_attempted(&older, 14, "old").await.expect("attempted"));

        assert!(
            backend
                .mark_attempted(&live[0], 14, "unavailable")
                .await
                .expect("attempted")
        );
        let stored = backend
            .get_timer(live[0].id)
            .await
            .expect("get")
            .expect("present");
        assert!(stored.assignable_at.is_none());
        assert_eq!(stored.retry_counter, 1);
    }

    #[tokio::test]
    async fn mark_delivered_is_idempotent() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let created = backend
            .create_timer(sample_new_timer(0, now))
            .await
            .expect("create");
        let claimed = backend
            .claim_timers(&claim("worker-a", now, 1))
            .await
            .expect("claim");

        backend.mark_delivered(created.id, now).await.expect("first");
        backend
            .mark_delivered(created.id, now + Duration::seconds(5))
            .await
            .expect("second");

        let stored = backend
            .get_timer(created.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.delivered_at, Some(now));
        assert!(stored.assignable_at.is_none());

        let recorded = backend
            .mark_attempted(&claimed[0], 14, "unavailable")
            .await
            .expect("attempted after delivery");
        assert!(!recorded);
        let stored = backend
            .get_timer(created.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.delivered_status_code, Some(0));
    }

    #[tokio::test]
    async fn attempt_ceiling_stops_claims_and_enables_cull() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let created = backend
            .create_timer(sample_new_timer(0, now))
            .await
            .expect("create");

        for expected_attempt in 1..=DEFAULT_MAX_ATTEMPTS {
            let claimed = backend
                .claim_timers(&claim("worker-a", now, 1))
                .await
                .expect("claim");
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].attempt, expected_attempt);
            assert!(
                backend
                    .mark_attempted(&claimed[0], 14, "unavailable")
                    .await
                    .expect("attempted")
            );
        }

        let claimed = backend
            .claim_timers(&claim("worker-a", now, 1))
            .await
            .expect("claim");
        assert!(claimed.is_empty());

        let stored = backend
            .get_timer(created.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.attempt, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(stored.retry_counter, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(stored.delivered_err.as_deref(), Some("unavailable"));

        assert_eq!(backend.cull_timers(0, now).await.expect("cull"), 1);
        assert!(backend.get_timer(created.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn cull_keeps_leased_and_live_timers() {
        let backend = MemoryBackend::new().with_max_attempts(1);
        let now = Utc::now();
        let leased = backend
            .create_timer(sample_new_timer(0, now))
            .await
            .expect("create");
        backend
            .claim_timers(&claim("worker-a", now, 1))
            .await
            .expect("claim");
        let pending = backend
            .create_timer(sample_new_timer(0, now + Duration::hours(1)))
            .await
            .expect("create");

        assert_eq!(backend.cull_timers(0, now).await.expect("cull"), 0);
        assert!(backend.get_timer(leased.id).await.expect("get").is_some());
        assert!(backend.get_timer(pending.id).await.expect("get").is_some());

        // Once the final lease lapses the timer is dead.
        let later = now + Duration::seconds(31);
        assert_eq!(backend.cull_timers(0, later).await.expect("cull"), 1);
    }

    #[tokio::test]
    async fn due_counters_are_assigned_once_in_due_order() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let token = become_leader(&backend, now).await;
        let late = backend
            .create_timer(sample_new_timer(0, now - Duration::seconds(1)))
            .await
            .expect("create");
        let early = backend
            .create_timer(sample_new_timer(1, now - Duration::seconds(10)))
            .await
            .expect("create");
        let future = backend
            .create_timer(sample_new_timer(0, now + Duration::hours(1)))
            .await
            .expect("create");

        assert_eq!(
            backend
                .assign_due_counters(&token, now, 10)
                .await
                .expect("assign"),
            2
        );
        assert_eq!(
            backend
                .assign_due_counters(&token, now, 10)
                .await
                .expect("assign"),
            0
        );

        let counter = |id| {
            let backend = backend.clone();
            async move {
                backend
                    .get_timer(id)
                    .await
                    .expect("get")
                    .expect("present")
                    .due_counter
            }
        };
        assert_eq!(counter(early.id).await, Some(1));
        assert_eq!(counter(late.id).await, Some(2));
        assert_eq!(counter(future.id).await, None);
    }

    #[tokio::test]
    async fn stale_generation_is_fenced() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let token = become_leader(&backend, now).await;

        let stale = FencingToken {
            generation: token.generation - 1,
            ..token.clone()
        };
        let err = backend
            .record_last_run(&stale, now)
            .await
            .expect_err("stale token");
        assert!(matches!(err, BackendError::Fenced { .. }));
        assert!(!backend.renew_leadership(&stale, now).await.expect("renew"));

        backend
            .record_last_run(&token, now)
            .await
            .expect("current token");
        let last_run = backend
            .last_run("default")
            .await
            .expect("last run")
            .expect("recorded");
        assert_eq!(last_run.worker, "scheduler-a");
        assert_eq!(last_run.last_run_at, now);
    }

    #[tokio::test]
    async fn worker_heartbeats_keep_start_time() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        backend.upsert_worker("worker-a", now).await.expect("first");
        backend
            .upsert_worker("worker-a", now + Duration::seconds(10))
            .await
            .expect("second");
        let workers = backend.list_workers().await.expect("list");
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].started_at, now);
        assert_eq!(workers[0].last_seen_at, now + Duration::seconds(10));
    }
}
