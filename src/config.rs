//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `SAND_DATABASE_URL`: PostgreSQL connection string (required)
//! - `SAND_DB_MAX_CONNECTIONS`: Pool size (default: 16)
//! - `SAND_GRPC_ADDR`: Timers/Workers gRPC API (default: 127.0.0.1:7710)
//! - `SAND_METRICS_ADDR`: Prometheus `/metrics` endpoint (default: 0.0.0.0:7711)
//! - `SAND_SHARD_COUNT`: Number of timer shards (default: 16)
//! - `SAND_WORKER_SHARDS`: Comma-separated shard ids a worker claims from (default: all)
//! - `SAND_WORKER_ID`: Worker identity (default: worker-<uuid>)
//! - `SAND_WORKER_INTERVAL_MS`: Delivery tick interval (default: 10000)
//! - `SAND_WORKER_BATCH_SIZE`: Timers claimed per shard per tick (default: 100)
//! - `SAND_WORKER_PARALLELISM`: Concurrent deliveries per worker (default: 255)
//! - `SAND_LEASE_DURATION_MS`: Lease granted by a claim (default: 60000)
//! - `SAND_MAX_ATTEMPTS`: Claims before a timer is dead (default: 5)
//! - `SAND_SCHEDULER_NAMESPACE`: Leader election namespace (default: default)
//! - `SAND_SCHEDULER_INTERVAL_MS`: Scheduler tick interval (default: 60000)
//! - `SAND_LEADER_LEASE_TIMEOUT_MS`: Heartbeat age after which a leader is stale (default: 150000)
//! - `SAND_DUE_BATCH_SIZE`: Due counters assigned per statement (default: 500)
//! - `SAND_DESCRIPTOR_SETS`: Comma-separated descriptor set files for the type resolver
//! - `SAND_RPC_TLS`: Deliver over TLS (default: false)
//! - `SAND_RPC_TLS_CA`: PEM CA bundle for delivery TLS (default: native roots)

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::timer::{DEFAULT_MAX_ATTEMPTS, ShardMap};

pub const DEFAULT_GRPC_ADDR: &str = "127.0.0.1:7710";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:7711";

/// Delivery worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub identity: String,
    /// Shards to claim from; `None` means every shard.
    pub shards: Option<Vec<i32>>,
    pub interval: Duration,
    pub batch_size: usize,
    pub parallelism: usize,
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identity: format!("worker-{}", Uuid::new_v4()),
            shards: None,
            interval: Duration::from_millis(10_000),
            batch_size: 100,
            parallelism: 255,
            lease: Duration::from_millis(60_000),
        }
    }
}

/// Scheduler tier settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub namespace: String,
    pub interval: Duration,
    pub leader_lease_timeout: Duration,
    pub due_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            interval: Duration::from_millis(60_000),
            leader_lease_timeout: Duration::from_millis(150_000),
            due_batch_size: 500,
        }
    }
}

/// Outbound delivery transport settings
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    pub descriptor_sets: Vec<PathBuf>,
    pub tls: bool,
    pub tls_ca: Option<PathBuf>,
}

/// Process configuration shared by every binary
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    pub db_max_connections: u32,

    /// Timers/Workers gRPC API
    pub grpc_addr: SocketAddr,

    pub metrics_addr: SocketAddr,

    pub shard_count: u32,

    pub max_attempts: i32,

    pub worker: WorkerConfig,

    pub scheduler: SchedulerConfig,

    pub rpc: RpcConfig,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("SAND_DATABASE_URL")
            .context("SAND_DATABASE_URL environment variable is required")?;

        let db_max_connections = parse_or(&lookup, "SAND_DB_MAX_CONNECTIONS", 16)?;

        let grpc_addr = lookup("SAND_GRPC_ADDR").unwrap_or_else(|| DEFAULT_GRPC_ADDR.to_string());
        let grpc_addr =
            SocketAddr::from_str(&grpc_addr).context("invalid SAND_GRPC_ADDR format")?;

        let metrics_addr =
            lookup("SAND_METRICS_ADDR").unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr =
            SocketAddr::from_str(&metrics_addr).context("invalid SAND_METRICS_ADDR format")?;

        let shard_count: u32 = parse_or(&lookup, "SAND_SHARD_COUNT", 16)?;
        if shard_count == 0 {
            anyhow::bail!("SAND_SHARD_COUNT must be at least 1");
        }

        let max_attempts = parse_or(&lookup, "SAND_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;

        let defaults = WorkerConfig::default();
        let shards = match lookup("SAND_WORKER_SHARDS") {
            Some(raw) if !raw.trim().is_empty() => {
                let shards = parse_shard_list(&raw).context("invalid SAND_WORKER_SHARDS")?;
                let shard_map = ShardMap::new(shard_count);
                for shard_id in &shards {
                    shard_map
                        .check(*shard_id)
                        .context("invalid SAND_WORKER_SHARDS")?;
                }
                Some(shards)
            }
            _ => None,
        };
        let worker = WorkerConfig {
            identity: lookup("SAND_WORKER_ID").unwrap_or(defaults.identity),
            shards,
            interval: Duration::from_millis(parse_or(&lookup, "SAND_WORKER_INTERVAL_MS", 10_000)?),
            batch_size: parse_or(&lookup, "SAND_WORKER_BATCH_SIZE", defaults.batch_size)?,
            parallelism: parse_or(&lookup, "SAND_WORKER_PARALLELISM", defaults.parallelism)?
                .max(1),
            lease: Duration::from_millis(parse_or(&lookup, "SAND_LEASE_DURATION_MS", 60_000)?),
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            namespace: lookup("SAND_SCHEDULER_NAMESPACE").unwrap_or(scheduler_defaults.namespace),
            interval: Duration::from_millis(parse_or(
                &lookup,
                "SAND_SCHEDULER_INTERVAL_MS",
                60_000,
            )?),
            leader_lease_timeout: Duration::from_millis(parse_or(
                &lookup,
                "SAND_LEADER_LEASE_TIMEOUT_MS",
                150_000,
            )?),
            due_batch_size: parse_or(
                &lookup,
                "SAND_DUE_BATCH_SIZE",
                scheduler_defaults.due_batch_size,
            )?,
        };

        let descriptor_sets = lookup("SAND_DESCRIPTOR_SETS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|path| !path.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        let rpc = RpcConfig {
            descriptor_sets,
            tls: lookup("SAND_RPC_TLS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            tls_ca: lookup("SAND_RPC_TLS_CA").map(PathBuf::from),
        };

        Ok(Self {
            database_url,
            db_max_connections,
            grpc_addr,
            metrics_addr,
            shard_count,
            max_attempts,
            worker,
            scheduler,
            rpc,
        })
    }

    pub fn shard_map(&self) -> ShardMap {
        ShardMap::new(self.shard_count)
    }

    /// Shards the local worker claims from.
    pub fn worker_shards(&self) -> Vec<i32> {
        self.worker
            .shards
            .clone()
            .unwrap_or_else(|| self.shard_map().all())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: `{raw}`")),
        None => Ok(default),
    }
}

fn parse_shard_list(raw: &str) -> Result<Vec<i32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i32>()
                .with_context(|| format!("invalid shard id `{part}`"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_lookup(lookup_from(&[("SAND_DATABASE_URL", "postgres://test")])).unwrap();
        assert_eq!(config.grpc_addr, DEFAULT_GRPC_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(
            config.metrics_addr,
            DEFAULT_METRICS_ADDR.parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.worker.interval, Duration::from_secs(10));
        assert_eq!(config.worker.parallelism, 255);
        assert!(config.worker.identity.starts_with("worker-"));
        assert_eq!(config.scheduler.namespace, "default");
        assert_eq!(config.scheduler.interval, Duration::from_secs(60));
        assert_eq!(config.worker_shards().len(), 16);
        assert!(!config.rpc.tls);
    }

    #[test]
    fn test_database_url_is_required() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("SAND_DATABASE_URL"));
    }

    #[test]
    fn test_worker_shards_are_validated() {
        let config = Config::from_lookup(lookup_from(&[
            ("SAND_DATABASE_URL", "postgres://test"),
            ("SAND_SHARD_COUNT", "4"),
            ("SAND_WORKER_SHARDS", "0, 2"),
        ]))
        .unwrap();
        assert_eq!(config.worker_shards(), vec![0, 2]);

        let err = Config::from_lookup(lookup_from(&[
            ("SAND_DATABASE_URL", "postgres://test"),
            ("SAND_SHARD_COUNT", "4"),
            ("SAND_WORKER_SHARDS", "7"),
        ]));
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[
            ("SAND_DATABASE_URL", "postgres://test"),
            ("SAND_WORKER_PARALLELISM", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SAND_WORKER_PARALLELISM"));
    }

    #[test]
    fn test_descriptor_sets_and_tls() {
        let config = Config::from_lookup(lookup_from(&[
            ("SAND_DATABASE_URL", "postgres://test"),
            ("SAND_DESCRIPTOR_SETS", "a.bin, b.bin,"),
            ("SAND_RPC_TLS", "true"),
            ("SAND_RPC_TLS_CA", "/etc/ca.pem"),
        ]))
        .unwrap();
        assert_eq!(
            config.rpc.descriptor_sets,
            vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")]
        );
        assert!(config.rpc.tls);
        assert_eq!(config.rpc.tls_ca, Some(PathBuf::from("/etc/ca.pem")));
    }
}
