//! File configuration for an elector and its lock backend.
//!
//! ```yaml
//! role:
//!   namespace: dhcp
//!   name: lease-gc
//! backend:
//!   type: nats
//!   servers: ["nats://127.0.0.1:4222"]
//!   bucket: leader_election
//!   security_mode: token
//!   token: s3cr3t
//! timings:
//!   lease_duration_ms: 15000
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ElectionResult;
use crate::identity::Role;
use crate::lease::{
    DEFAULT_LEASE_DURATION, DEFAULT_RENEW_DEADLINE, DEFAULT_RETRY_PERIOD, ElectionTimings,
};
use crate::lock::LockBackend;
use crate::memory::MemoryBackend;
use crate::nats::NatsBackend;

/// Default KV bucket holding lease records.
pub const DEFAULT_BUCKET: &str = "leader_election";

/// Default number of reconnect attempts after the first failed connect.
pub const DEFAULT_CONNECT_RETRY_MAX: u32 = 2;

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ElectionConfig {
    pub role: Role,
    /// Fixed identity; generated from the hostname when unset.
    #[serde(default)]
    pub identity: Option<String>,
    pub backend: BackendConfig,
    #[serde(default)]
    pub timings: TimingsConfig,
}

/// Which lock backend to use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Nats(NatsConfig),
    /// Process-local leases. Only electors in the same process compete.
    Memory,
}

impl BackendConfig {
    pub fn build(&self) -> Arc<dyn LockBackend> {
        match self {
            BackendConfig::Nats(cfg) => Arc::new(NatsBackend::new(cfg.clone())),
            BackendConfig::Memory => Arc::new(MemoryBackend::new()),
        }
    }
}

/// How to authenticate with the NATS servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    CredsFile,
    Tls,
}

/// NATS JetStream KV backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Prepended to `<namespace>.<name>` when building lease keys.
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub security_mode: SecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub creds_file_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub connect_timeout_ms: Option<u64>,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
}

impl NatsConfig {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            bucket: default_bucket(),
            key_prefix: None,
            security_mode: SecurityMode::None,
            username: None,
            password: None,
            token: None,
            creds_file_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            connect_timeout_ms: None,
            connect_retry_max: DEFAULT_CONNECT_RETRY_MAX,
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Lease timing overrides, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub lease_duration_ms: u64,
    pub renew_deadline_ms: u64,
    pub retry_period_ms: u64,
    pub release_on_cancel: bool,
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: DEFAULT_LEASE_DURATION.as_millis() as u64,
            renew_deadline_ms: DEFAULT_RENEW_DEADLINE.as_millis() as u64,
            retry_period_ms: DEFAULT_RETRY_PERIOD.as_millis() as u64,
            release_on_cancel: true,
        }
    }
}

impl TimingsConfig {
    /// Convert to [`ElectionTimings`], rejecting inconsistent values.
    pub fn timings(&self) -> ElectionResult<ElectionTimings> {
        let timings = ElectionTimings {
            lease_duration: Duration::from_millis(self.lease_duration_ms),
            renew_deadline: Duration::from_millis(self.renew_deadline_ms),
            retry_period: Duration::from_millis(self.retry_period_ms),
            release_on_cancel: self.release_on_cancel,
        };
        timings.validate()?;
        Ok(timings)
    }
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_owned()
}

const fn default_connect_retry_max() -> u32 {
    DEFAULT_CONNECT_RETRY_MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ElectionError;

    static EXAMPLE: &str = r#"
role:
  namespace: dhcp
  name: lease-gc
identity: node-a
backend:
  type: nats
  servers: ["nats://127.0.0.1:4222", "nats://127.0.0.2:4222"]
  security_mode: user_password
  username: elector
  password: hunter2
  connect_timeout_ms: 2500
timings:
  lease_duration_ms: 30000
  renew_deadline_ms: 20000
"#;

    #[test]
    fn test_parse_example() {
        let cfg: ElectionConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.role, Role::new("dhcp", "lease-gc"));
        assert_eq!(cfg.identity.as_deref(), Some("node-a"));

        let BackendConfig::Nats(nats) = &cfg.backend else {
            panic!("expected nats backend");
        };
        assert_eq!(nats.servers.len(), 2);
        assert_eq!(nats.bucket, DEFAULT_BUCKET);
        assert_eq!(nats.security_mode, SecurityMode::UserPassword);
        assert_eq!(nats.connect_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(nats.connect_retry_max, DEFAULT_CONNECT_RETRY_MAX);

        let timings = cfg.timings.timings().unwrap();
        assert_eq!(timings.lease_duration, Duration::from_secs(30));
        assert_eq!(timings.renew_deadline, Duration::from_secs(20));
        assert_eq!(timings.retry_period, DEFAULT_RETRY_PERIOD);
        assert!(timings.release_on_cancel);
    }

    #[test]
    fn test_parse_memory_backend_defaults() {
        let cfg: ElectionConfig = serde_yaml::from_str(
            "role: {namespace: default, name: gc}\nbackend: {type: memory}\n",
        )
        .unwrap();
        assert_eq!(cfg.backend, BackendConfig::Memory);
        assert_eq!(cfg.identity, None);
        assert_eq!(cfg.timings.timings().unwrap(), ElectionTimings::default());
    }

    #[test]
    fn test_invalid_timings_rejected() {
        let cfg = TimingsConfig {
            lease_duration_ms: 5_000,
            renew_deadline_ms: 10_000,
            ..TimingsConfig::default()
        };
        assert!(matches!(cfg.timings(), Err(ElectionError::Config(_))));
    }
}
