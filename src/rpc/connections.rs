//! Process-local cache of outbound gRPC channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Uri};
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to resolve `{addr}`: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{0}` resolved to no addresses")]
    NoAddresses(String),
    #[error("invalid endpoint `{uri}`: {source}")]
    InvalidEndpoint {
        uri: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("invalid authority `{0}`")]
    InvalidAuthority(String),
    #[error("failed to read CA bundle {path}: {source}")]
    ReadCa {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Transport security for outbound deliveries.
#[derive(Debug, Clone, Default)]
pub enum TransportSecurity {
    #[default]
    Insecure,
    /// TLS verified against the platform roots, or against `ca_pem` when set.
    Tls { ca_pem: Option<Vec<u8>> },
}

impl TransportSecurity {
    pub fn from_settings(tls: bool, ca_path: Option<&Path>) -> Result<Self, ConnectionError> {
        if !tls {
            return Ok(Self::Insecure);
        }
        let ca_pem = match ca_path {
            Some(path) => Some(std::fs::read(path).map_err(|source| ConnectionError::ReadCa {
                path: path.display().to_string(),
                source,
            })?),
            None => None,
        };
        Ok(Self::Tls { ca_pem })
    }

    fn scheme(&self) -> &'static str {
        match self {
            Self::Insecure => "http",
            Self::Tls { .. } => "https",
        }
    }
}

type ChannelKey = (String, String);

/// Channels keyed by `(addr, authority)`.
///
/// Entries are created lazily and live for the life of the process. A channel
/// balances over every address its host resolved to when it was created.
pub struct ConnectionCache {
    channels: Mutex<HashMap<ChannelKey, Channel>>,
    security: TransportSecurity,
    connect_timeout: Duration,
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new(TransportSecurity::Insecure)
    }
}

impl ConnectionCache {
    pub fn new(security: TransportSecurity) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            security,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Return the cached channel for the pair, creating it on first use.
    pub async fn get(&self, addr: &str, authority: &str) -> Result<Channel, ConnectionError> {
        let key = (addr.to_string(), authority.to_string());
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&key) {
            return Ok(channel.clone());
        }

        let channel = self.connect(addr, authority).await?;
        channels.insert(key, channel.clone());
        Ok(channel)
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn connect(&self, addr: &str, authority: &str) -> Result<Channel, ConnectionError> {
        let host_port = strip_scheme(addr);
        let mut resolved: Vec<SocketAddr> = tokio::net::lookup_host(host_port)
            .await
            .map_err(|source| ConnectionError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .collect();
        resolved.sort();
        resolved.dedup();
        if resolved.is_empty() {
            return Err(ConnectionError::NoAddresses(addr.to_string()));
        }

        let endpoints = resolved
            .iter()
            .map(|socket_addr| self.endpoint(host_port, *socket_addr, authority))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            rpc_addr = addr,
            rpc_authority = authority,
            endpoints = endpoints.len(),
            "created delivery channel"
        );

        match <[Endpoint; 1]>::try_from(endpoints) {
            Ok([endpoint]) => Ok(endpoint.connect_lazy()),
            Err(endpoints) => Ok(Channel::balance_list(endpoints.into_iter())),
        }
    }

    fn endpoint(
        &self,
        host_port: &str,
        socket_addr: SocketAddr,
        authority: &str,
    ) -> Result<Endpoint, ConnectionError> {
        let scheme = self.security.scheme();
        let uri = format!("{scheme}://{socket_addr}");
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|source| ConnectionError::InvalidEndpoint {
                uri: uri.clone(),
                source,
            })?
            .connect_timeout(self.connect_timeout);

        if !authority.is_empty() {
            let origin: Uri = format!("{scheme}://{authority}")
                .parse()
                .map_err(|_| ConnectionError::InvalidAuthority(authority.to_string()))?;
            endpoint = endpoint.origin(origin);
        }

        if let TransportSecurity::Tls { ca_pem } = &self.security {
            let domain = if authority.is_empty() {
                host_of(host_port)
            } else {
                host_of(authority)
            };
            let mut tls = ClientTlsConfig::new().domain_name(domain);
            tls = match ca_pem {
                Some(pem) => tls.ca_certificate(Certificate::from_pem(pem)),
                None => tls.with_native_roots(),
            };
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|source| ConnectionError::InvalidEndpoint { uri, source })?;
        }
        Ok(endpoint)
    }
}

fn strip_scheme(addr: &str) -> &str {
    addr.strip_prefix("http://")
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr)
}

/// Host part of `host:port`, tolerating bracketed IPv6 literals.
fn host_of(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host_port.rsplit_once(':') {
        Some((host, _)) => host,
        None => host_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_parsing() {
        assert_eq!(host_of("svc.internal:443"), "svc.internal");
        assert_eq!(host_of("[::1]:8080"), "::1");
        assert_eq!(host_of("svc.internal"), "svc.internal");
        assert_eq!(strip_scheme("http://127.0.0.1:1"), "127.0.0.1:1");
        assert_eq!(strip_scheme("127.0.0.1:1"), "127.0.0.1:1");
    }

    #[tokio::test]
    async fn channels_are_cached_per_addr_and_authority() {
        let cache = ConnectionCache::default();
        assert!(cache.is_empty().await);

        cache.get("127.0.0.1:50051", "").await.expect("first");
        cache.get("127.0.0.1:50051", "").await.expect("cached");
        assert_eq!(cache.len().await, 1);

        cache
            .get("127.0.0.1:50051", "timers.internal")
            .await
            .expect("distinct authority");
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn unresolvable_address_is_not_cached() {
        let cache = ConnectionCache::default();
        let err = cache
            .get("missing-port", "")
            .await
            .expect_err("no port");
        assert!(matches!(err, ConnectionError::Resolve { .. }));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn invalid_authority_is_rejected() {
        let cache = ConnectionCache::default();
        let err = cache
            .get("127.0.0.1:50051", "bad authority")
            .await
            .expect_err("space in authority");
        assert!(matches!(err, ConnectionError::InvalidAuthority(_)));
    }

    #[test]
    fn tls_settings_read_ca_file() {
        assert!(matches!(
            TransportSecurity::from_settings(false, None).unwrap(),
            TransportSecurity::Insecure
        ));
        assert!(matches!(
            TransportSecurity::from_settings(true, None).unwrap(),
            TransportSecurity::Tls { ca_pem: None }
        ));
        assert!(matches!(
            TransportSecurity::from_settings(true, Some(Path::new("/nonexistent/ca.pem"))),
            Err(ConnectionError::ReadCa { .. })
        ));
    }
}
