//! Leader election over the `scheduler_leader` row.
//!
//! Leadership is taken with a compare-and-swap that bumps the row's generation.
//! The generation doubles as the fencing token for every leader-only write, so
//! a paused or partitioned ex-leader cannot clobber its successor.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::backends::{BackendResult, FencingToken, SchedulerBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Follower,
    Candidate,
    Leader { generation: i64 },
}

pub struct LeaderElector<B> {
    backend: B,
    namespace: String,
    identity: String,
    lease_timeout: Duration,
    state: LeaderState,
    last_renewed: Option<DateTime<Utc>>,
}

impl<B> LeaderElector<B>
where
    B: SchedulerBackend,
{
    pub fn new(
        backend: B,
        namespace: impl Into<String>,
        identity: impl Into<String>,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            identity: identity.into(),
            lease_timeout,
            state: LeaderState::Follower,
            last_renewed: None,
        }
    }

    pub fn state(&self) -> LeaderState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, LeaderState::Leader { .. })
    }

    /// Token for leader-only writes, while leading.
    pub fn token(&self) -> Option<FencingToken> {
        match self.state {
            LeaderState::Leader { generation } => Some(FencingToken {
                namespace: self.namespace.clone(),
                holder: self.identity.clone(),
                generation,
            }),
            _ => None,
        }
    }

    /// Step down without touching the store.
    pub fn demote(&mut self) {
        if self.is_leader() {
            warn!(
                namespace = %self.namespace,
                identity = %self.identity,
                "scheduler demoted to follower"
            );
        }
        self.state = LeaderState::Follower;
        self.last_renewed = None;
    }

    /// Advance the state machine once: renew while leading, otherwise try to
    /// take over a vacant or stale leadership row.
    pub async fn step(&mut self, now: DateTime<Utc>) -> BackendResult<LeaderState> {
        if let Some(token) = self.token() {
            match self.backend.renew_leadership(&token, now).await {
                Ok(true) => {
                    self.last_renewed = Some(now);
                    return Ok(self.state);
                }
                Ok(false) => {
                    self.demote();
                    return Ok(self.state);
                }
                Err(err) => {
                    if self.renewal_expired(now) {
                        self.demote();
                    }
                    return Err(err);
                }
            }
        }

        let observed = self.backend.read_leader(&self.namespace).await?;
        if !observed.is_stale(now, self.lease_timeout) {
            self.state = LeaderState::Follower;
            return Ok(self.state);
        }

        self.state = LeaderState::Candidate;
        match self
            .backend
            .try_acquire_leadership(&observed, &self.identity, now)
            .await
        {
            Ok(Some(acquired)) => {
                info!(
                    namespace = %self.namespace,
                    identity = %self.identity,
                    generation = acquired.generation,
                    previous_leader = ?observed.leader,
                    "scheduler acquired leadership"
                );
                self.state = LeaderState::Leader {
                    generation: acquired.generation,
                };
                self.last_renewed = Some(now);
            }
            Ok(None) => {
                self.state = LeaderState::Follower;
            }
            Err(err) => {
                self.state = LeaderState::Follower;
                return Err(err);
            }
        }
        Ok(self.state)
    }

    fn renewal_expired(&self, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(self.lease_timeout).unwrap_or(chrono::Duration::MAX);
        self.last_renewed
            .map_or(true, |renewed| now - renewed > timeout)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::backends::{BackendError, MemoryBackend};

    const TIMEOUT: Duration = Duration::from_secs(150);

    fn elector(backend: &MemoryBackend, identity: &str) -> LeaderElector<MemoryBackend> {
        LeaderElector::new(backend.clone(), "default", identity, TIMEOUT)
    }

    #[tokio::test]
    async fn first_candidate_wins_vacant_row() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let mut a = elector(&backend, "scheduler-a");
        let mut b = elector(&backend, "scheduler-b");

        assert_eq!(
            a.step(now).await.expect("a"),
            LeaderState::Leader { generation: 1 }
        );
        assert_eq!(b.step(now).await.expect("b"), LeaderState::Follower);
        assert!(b.token().is_none());

        // Renewal keeps the same generation.
        assert_eq!(
            a.step(now + ChronoDuration::seconds(60)).await.expect("renew"),
            LeaderState::Leader { generation: 1 }
        );
    }

    #[tokio::test]
    async fn concurrent_candidates_elect_exactly_one() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let mut a = elector(&backend, "scheduler-a");
        let mut b = elector(&backend, "scheduler-b");

        let (ra, rb) = tokio::join!(a.step(now), b.step(now));
        let states = [ra.expect("a"), rb.expect("b")];
        let leaders = states
            .iter()
            .filter(|state| matches!(state, LeaderState::Leader { .. }))
            .count();
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn stale_leader_is_replaced_and_fenced() {
        let backend = MemoryBackend::new();
        let start = Utc::now();
        let mut a = elector(&backend, "scheduler-a");
        let mut b = elector(&backend, "scheduler-b");

        a.step(start).await.expect("a leads");
        let old_token = a.token().expect("token");

        // `a` stops heartbeating; after the timeout `b` takes over.
        let later = start + ChronoDuration::seconds(151);
        assert_eq!(
            b.step(later).await.expect("b"),
            LeaderState::Leader { generation: 2 }
        );

        let err = backend
            .record_last_run(&old_token, later)
            .await
            .expect_err("old generation is fenced");
        assert!(matches!(err, BackendError::Fenced { generation: 1, .. }));

        // The old leader notices on its next renewal.
        assert_eq!(a.step(later).await.expect("a"), LeaderState::Follower);
        assert!(a.token().is_none());
    }

    #[tokio::test]
    async fn live_leader_is_not_replaced() {
        let backend = MemoryBackend::new();
        let start = Utc::now();
        let mut a = elector(&backend, "scheduler-a");
        let mut b = elector(&backend, "scheduler-b");

        a.step(start).await.expect("a leads");
        let soon = start + ChronoDuration::seconds(100);
        assert_eq!(b.step(soon).await.expect("b"), LeaderState::Follower);
    }

    #[tokio::test]
    async fn demote_drops_token() {
        let backend = MemoryBackend::new();
        let mut a = elector(&backend, "scheduler-a");
        a.step(Utc::now()).await.expect("a leads");
        assert!(a.is_leader());
        a.demote();
        assert_eq!(a.state(), LeaderState::Follower);
        assert!(a.token().is_none());
    }
}
