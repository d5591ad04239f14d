//! Timer model: the unit of delayed work and its derived views.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Number of claims a timer may receive before it is considered dead.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Unique identifier for a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub Uuid);

impl TimerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TimerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where and how a timer is delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcTarget {
    pub addr: String,
    pub authority: String,
    /// Full gRPC path, e.g. `/pkg.Service/Method`.
    pub method: String,
    pub meta: HashMap<String, String>,
    pub args_type_url: String,
    /// Wire-format bytes of a message of `args_type_url`.
    pub args_data: Vec<u8>,
    pub return_type_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("timer name is required")]
    MissingName,
    #[error("rpc target field `{0}` is required")]
    MissingTarget(&'static str),
    #[error("rpc method must be a full path like /pkg.Service/Method, got `{0}`")]
    InvalidMethod(String),
    #[error("shard id {shard_id} is outside of 0..{shard_count}")]
    ShardOutOfRange { shard_id: i32, shard_count: u32 },
}

/// Caller-supplied fields for a new timer.
#[derive(Debug, Clone)]
pub struct NewTimer {
    pub name: String,
    pub shard_key: String,
    pub shard_id: i32,
    pub labels: HashMap<String, String>,
    pub due_at: DateTime<Utc>,
    pub priority: i32,
    pub target: RpcTarget,
}

impl NewTimer {
    /// Check the fields delivery depends on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingName);
        }
        let target = &self.target;
        let required = [
            ("addr", &target.addr),
            ("method", &target.method),
            ("args_type_url", &target.args_type_url),
            ("return_type_url", &target.return_type_url),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingTarget(field));
            }
        }
        if !is_method_path(&target.method) {
            return Err(ValidationError::InvalidMethod(target.method.clone()));
        }
        Ok(())
    }

    /// Materialize the stored row for this request.
    pub fn into_timer(self, id: TimerId, created_at: DateTime<Utc>) -> Timer {
        Timer {
            id,
            name: self.name,
            shard_key: self.shard_key,
            shard_id: self.shard_id,
            labels: self.labels,
            created_at,
            due_at: self.due_at,
            due_counter: None,
            priority: self.priority,
            assigned_worker: None,
            assignable_at: None,
            attempt: 0,
            retry_counter: 0,
            target: self.target,
            delivered_at: None,
            delivered_status_code: None,
            delivered_err: None,
        }
    }
}

fn is_method_path(method: &str) -> bool {
    let Some(rest) = method.strip_prefix('/') else {
        return false;
    };
    match rest.split_once('/') {
        Some((service, name)) => !service.is_empty() && !name.is_empty() && !name.contains('/'),
        None => false,
    }
}

/// A persisted timer row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    pub name: String,
    pub shard_key: String,
    pub shard_id: i32,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    /// FIFO position among due timers, assigned once by the scheduler.
    pub due_counter: Option<i64>,
    pub priority: i32,
    pub assigned_worker: Option<String>,
    /// Lease expiry. `None` while nobody holds the timer.
    pub assignable_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub retry_counter: i32,
    pub target: RpcTarget,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivered_status_code: Option<i32>,
    pub delivered_err: Option<String>,
}

impl Timer {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    /// Delivered, or out of attempts.
    pub fn is_terminal(&self, max_attempts: i32) -> bool {
        self.is_delivered() || self.attempt >= max_attempts
    }

    pub fn lease_held_at(&self, now: DateTime<Utc>) -> bool {
        self.assigned_worker.is_some() && self.assignable_at.is_some_and(|until| until >= now)
    }

    /// Whether `claim` at `now` may hand this timer out.
    pub fn is_claimable(&self, now: DateTime<Utc>, max_attempts: i32) -> bool {
        self.due_at <= now
            && self.attempt < max_attempts
            && self.delivered_at.is_none()
            && self.assignable_at.map_or(true, |until| until < now)
    }

    /// User labels plus the [`SYNTHETIC_LABELS`], which take precedence.
    pub fn match_labels(&self) -> HashMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(
            "assigned".to_string(),
            self.assignable_at.is_some().to_string(),
        );
        labels.insert(
            "assigned_worker".to_string(),
            self.assigned_worker.clone().unwrap_or_default(),
        );
        labels.insert("delivered".to_string(), self.is_delivered().to_string());
        labels
    }

    /// True when every selector entry equals the corresponding match label.
    pub fn matches(&self, selector: &HashMap<String, String>) -> bool {
        if selector.is_empty() {
            return true;
        }
        let labels = self.match_labels();
        selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Selector keys derived from timer state rather than stored labels.
pub const SYNTHETIC_LABELS: [&str; 3] = ["assigned", "assigned_worker", "delivered"];

/// Split a selector into `(user labels, synthetic keys)`.
pub fn partition_selector(
    selector: &HashMap<String, String>,
) -> (HashMap<String, String>, HashMap<String, String>) {
    selector
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .partition(|(key, _)| !SYNTHETIC_LABELS.contains(&key.as_str()))
}

/// Stable mapping from shard keys to a fixed number of shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMap {
    count: u32,
}

impl ShardMap {
    pub fn new(count: u32) -> Self {
        Self {
            count: count.max(1),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn shard_for(&self, shard_key: &str) -> i32 {
        let digest = Sha256::digest(shard_key.as_bytes());
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (prefix % self.count) as i32
    }

    pub fn all(&self) -> Vec<i32> {
        (0..self.count as i32).collect()
    }

    pub fn check(&self, shard_id: i32) -> Result<(), ValidationError> {
        if shard_id < 0 || shard_id as u32 >= self.count {
            return Err(ValidationError::ShardOutOfRange {
                shard_id,
                shard_count: self.count,
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::test_fixtures::sample_new_timer;
    use super::*;

    #[test]
    fn validate_rejects_missing_target_fields() {
        let mut timer = sample_new_timer(0, Utc::now());
        timer.target.addr.clear();
        assert_eq!(
            timer.validate(),
            Err(ValidationError::MissingTarget("addr"))
        );

        let mut timer = sample_new_timer(0, Utc::now());
        timer.target.return_type_url = "  ".to_string();
        assert_eq!(
            timer.validate(),
            Err(ValidationError::MissingTarget("return_type_url"))
        );
    }

    #[test]
    fn validate_requires_full_method_path() {
        let mut timer = sample_new_timer(0, Utc::now());
        timer.target.method = "GetTimer".to_string();
        assert!(matches!(
            timer.validate(),
            Err(ValidationError::InvalidMethod(_))
        ));

        timer.target.method = "/sand.v1.Timers/".to_string();
        assert!(timer.validate().is_err());

        timer.target.method = "/sand.v1.Timers/GetTimer".to_string();
        assert!(timer.validate().is_ok());
    }

    #[test]
    fn match_labels_adds_synthetic_keys() {
        let now = Utc::now();
        let mut timer = sample_new_timer(0, now).into_timer(TimerId::new(), now);

        let labels = timer.match_labels();
        assert_eq!(labels.get("team").map(String::as_str), Some("billing"));
        assert_eq!(labels.get("assigned").map(String::as_str), Some("false"));
        assert_eq!(labels.get("assigned_worker").map(String::as_str), Some(""));
        assert_eq!(labels.get("delivered").map(String::as_str), Some("false"));

        timer.assigned_worker = Some("worker-a".to_string());
        timer.assignable_at = Some(now + Duration::seconds(30));
        timer.delivered_at = Some(now);
        let selector = HashMap::from([
            ("assigned_worker".to_string(), "worker-a".to_string()),
            ("delivered".to_string(), "true".to_string()),
        ]);
        assert!(timer.matches(&selector));
        assert!(!timer.matches(&HashMap::from([(
            "team".to_string(),
            "search".to_string()
        )])));
    }

    #[test]
    fn selector_splits_user_and_synthetic_keys() {
        let selector = HashMap::from([
            ("team".to_string(), "billing".to_string()),
            ("delivered".to_string(), "false".to_string()),
            ("assigned".to_string(), "true".to_string()),
        ]);
        let (labels, synthetic) = partition_selector(&selector);
        assert_eq!(
            labels,
            HashMap::from([("team".to_string(), "billing".to_string())])
        );
        assert_eq!(synthetic.len(), 2);
        assert!(synthetic.contains_key("delivered"));
        assert!(synthetic.contains_key("assigned"));
    }

    #[test]
    fn claimable_respects_lease_and_ceiling() {
        let now = Utc::now();
        let mut timer = sample_new_timer(0, now - Duration::seconds(1)).into_timer(TimerId::new(), now);
        assert!(timer.is_claimable(now, DEFAULT_MAX_ATTEMPTS));

        timer.assigned_worker = Some("worker-a".to_string());
        timer.assignable_at = Some(now + Duration::seconds(10));
        assert!(!timer.is_claimable(now, DEFAULT_MAX_ATTEMPTS));
        assert!(timer.lease_held_at(now));
        assert!(timer.is_claimable(now + Duration::seconds(11), DEFAULT_MAX_ATTEMPTS));

        timer.assignable_at = None;
        timer.attempt = DEFAULT_MAX_ATTEMPTS;
        assert!(!timer.is_claimable(now, DEFAULT_MAX_ATTEMPTS));
        assert!(timer.is_terminal(DEFAULT_MAX_ATTEMPTS));
    }

    #[test]
    fn shard_map_is_stable_and_bounded() {
        let shards = ShardMap::new(16);
        let first = shards.shard_for("customer-42");
        assert_eq!(first, shards.shard_for("customer-42"));
        assert!((0..16).contains(&first));
        assert_eq!(shards.all().len(), 16);
        assert!(shards.check(15).is_ok());
        assert!(shards.check(16).is_err());
        assert_eq!(ShardMap::new(0).count(), 1);
    }
}
