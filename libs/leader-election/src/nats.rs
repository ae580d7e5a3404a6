//! NATS JetStream KV lock backend.
//!
//! Each role's lease is one key in a KV bucket. JetStream's per-key revision
//! gives the compare-and-set the runner needs: `create` only succeeds on an
//! absent (or deleted) key and `update` only when the last revision matches.

use std::sync::Arc;
use std::time::Duration;

use async_nats::ConnectOptions;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::{NatsConfig, SecurityMode};
use crate::error::{ElectionError, ElectionResult};
use crate::identity::{Identity, Role};
use crate::lock::{self, LeaderElectionRecord, LeaseLock, LockBackend, Versioned};

/// Default connection timeout if not configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay for retrying initial NATS connections.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during initial NATS connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Lease records only need the latest value.
const BUCKET_HISTORY: i64 = 1;

/// Build connect options from the nats config, applying the selected security mode.
async fn build_connect_options(config: &NatsConfig) -> ElectionResult<ConnectOptions> {
    let mut opts = ConnectOptions::new();

    match config.security_mode {
        SecurityMode::None => {}
        SecurityMode::UserPassword => {
            let user = config.username.as_deref().ok_or_else(|| {
                ElectionError::Config("user_password security mode requires 'username'".into())
            })?;
            let pass = config.password.as_deref().ok_or_else(|| {
                ElectionError::Config("user_password security mode requires 'password'".into())
            })?;
            opts = opts.user_and_password(user.into(), pass.into());
        }
        SecurityMode::Token => {
            let token = config.token.as_deref().ok_or_else(|| {
                ElectionError::Config("token security mode requires 'token'".into())
            })?;
            opts = opts.token(token.into());
        }
        SecurityMode::CredsFile => {
            let creds_path = config.creds_file_path.as_ref().ok_or_else(|| {
                ElectionError::Config("creds_file security mode requires 'creds_file_path'".into())
            })?;
            opts = opts.credentials_file(creds_path).await.map_err(|e| {
                ElectionError::Config(format!(
                    "failed to load credentials file '{}': {e}",
                    creds_path.display()
                ))
            })?;
        }
        SecurityMode::Tls => {
            let cert_path = config.tls_cert_path.as_ref().ok_or_else(|| {
                ElectionError::Config("tls security mode requires 'tls_cert_path'".into())
            })?;
            let key_path = config.tls_key_path.as_ref().ok_or_else(|| {
                ElectionError::Config("tls security mode requires 'tls_key_path'".into())
            })?;
            opts = opts
                .add_client_certificate(cert_path.clone(), key_path.clone())
                .require_tls(true);
        }
    }

    // server-side TLS verification applies to every auth mode
    if let Some(ca_path) = &config.tls_ca_path {
        opts = opts.add_root_certificates(ca_path.clone()).require_tls(true);
    }

    Ok(opts.connection_timeout(config.connect_timeout().unwrap_or(DEFAULT_CONNECT_TIMEOUT)))
}

/// Connect with exponential backoff, giving up after `connect_retry_max`
/// retries.
async fn connect(config: &NatsConfig) -> ElectionResult<async_nats::Client> {
    if config.servers.is_empty() {
        return Err(ElectionError::Config(
            "nats backend requires at least one server".into(),
        ));
    }

    info!(
        servers = ?config.servers,
        security_mode = ?config.security_mode,
        connect_retry_max = config.connect_retry_max,
        "connecting to NATS"
    );

    let total_attempts = config.connect_retry_max.saturating_add(1);
    for attempt in 0..total_attempts {
        let opts = build_connect_options(config).await?;
        match opts.connect(config.servers.clone()).await {
            Ok(client) => {
                info!(
                    attempt = attempt + 1,
                    total_attempts, "NATS connection established"
                );
                return Ok(client);
            }
            Err(err) => {
                let attempt_num = attempt + 1;
                if attempt_num >= total_attempts {
                    error!(
                        attempts = total_attempts,
                        error = %err,
                        "NATS connection failed after all retry attempts"
                    );
                    return Err(ElectionError::Transport(format!(
                        "NATS connection failed after {total_attempts} attempt(s): {err}"
                    )));
                }

                let delay = CONNECT_RETRY_BASE_DELAY
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(MAX_CONNECT_RETRY_DELAY);
                warn!(
                    attempt = attempt_num,
                    total_attempts,
                    retry_in_ms = delay.as_millis(),
                    error = %err,
                    "NATS connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(ElectionError::Config(
        "connect_retry_max overflowed the attempt count".into(),
    ))
}

/// Get an existing KV bucket or create it if missing.
async fn get_or_create_bucket(
    client: async_nats::Client,
    bucket: &str,
) -> ElectionResult<kv::Store> {
    let js = jetstream::new(client);
    match js.get_key_value(bucket.to_string()).await {
        Ok(store) => Ok(store),
        Err(get_err) => {
            debug!(bucket, error = %get_err, "creating missing JetStream KV bucket");
            js.create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: BUCKET_HISTORY,
                ..Default::default()
            })
            .await
            .map_err(|create_err| {
                ElectionError::Transport(format!(
                    "failed to create JetStream KV bucket '{bucket}': {create_err} (get error: {get_err})"
                ))
            })
        }
    }
}

fn sanitize_key_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// KV key for a role: `[<prefix>.]<namespace>.<name>`.
fn lease_key(prefix: Option<&str>, role: &Role) -> String {
    let role_key = format!(
        "{}.{}",
        sanitize_key_component(&role.namespace),
        sanitize_key_component(&role.name)
    );
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}.{role_key}", sanitize_key_component(prefix)),
        _ => role_key,
    }
}

/// [`LockBackend`] that connects to NATS on first use.
#[derive(Debug, Clone)]
pub struct NatsBackend {
    config: NatsConfig,
}

impl NatsBackend {
    pub fn new(config: NatsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

#[async_trait]
impl LockBackend for NatsBackend {
    async fn connect(
        &self,
        role: &Role,
        identity: &Identity,
    ) -> ElectionResult<Arc<dyn LeaseLock>> {
        let client = connect(&self.config).await?;
        let store = get_or_create_bucket(client, &self.config.bucket).await?;
        let key = lease_key(self.config.key_prefix.as_deref(), role);
        info!(%identity, bucket = %self.config.bucket, %key, "using NATS KV lease lock");
        Ok(Arc::new(NatsLock {
            store,
            bucket: self.config.bucket.clone(),
            key,
        }))
    }
}

/// One role's lease stored under a single KV key.
pub struct NatsLock {
    store: kv::Store,
    bucket: String,
    key: String,
}

impl std::fmt::Debug for NatsLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsLock")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl NatsLock {
    /// A rejected write is a conflict when the key has moved past `expected`
    /// (for a create, when a live record now exists). Otherwise it is
    /// reported as a transport failure.
    async fn classify_write_error(&self, expected: u64, msg: String) -> ElectionError {
        match self.store.entry(self.key.clone()).await {
            Ok(Some(entry)) => {
                let live = matches!(entry.operation, kv::Operation::Put);
                conflict_or_transport(expected, Some((entry.revision, live)), msg)
            }
            Ok(None) => conflict_or_transport(expected, None, msg),
            Err(read_err) => ElectionError::Transport(format!("{msg} (re-read failed: {read_err})")),
        }
    }
}

/// `current` is the key's revision and whether it holds a live value.
fn conflict_or_transport(expected: u64, current: Option<(u64, bool)>, msg: String) -> ElectionError {
    match current {
        Some((actual, true)) if expected == 0 => ElectionError::Conflict { expected, actual },
        Some((actual, _)) if expected != 0 && actual != expected => {
            ElectionError::Conflict { expected, actual }
        }
        None if expected != 0 => ElectionError::Conflict {
            expected,
            actual: 0,
        },
        _ => ElectionError::Transport(msg),
    }
}

#[async_trait]
impl LeaseLock for NatsLock {
    async fn get(&self) -> ElectionResult<Option<Versioned<LeaderElectionRecord>>> {
        let entry = self.store.entry(self.key.clone()).await.map_err(|e| {
            ElectionError::Transport(format!("KV read failed for key '{}': {e}", self.key))
        })?;
        match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => Ok(Some(Versioned {
                value: lock::decode(&entry.value)?,
                revision: entry.revision,
            })),
            _ => Ok(None),
        }
    }

    async fn create(&self, record: &LeaderElectionRecord) -> ElectionResult<u64> {
        let payload = lock::encode(record)?;
        match self.store.create(&self.key, payload.into()).await {
            Ok(revision) => Ok(revision),
            Err(e) => Err(self
                .classify_write_error(
                    0,
                    format!("KV create failed for key '{}': {e}", self.key),
                )
                .await),
        }
    }

    async fn update(&self, record: &LeaderElectionRecord, revision: u64) -> ElectionResult<u64> {
        let payload = lock::encode(record)?;
        match self.store.update(&self.key, payload.into(), revision).await {
            Ok(revision) => Ok(revision),
            Err(e) => Err(self
                .classify_write_error(
                    revision,
                    format!(
                        "KV update failed for key '{}' at revision {revision}: {e}",
                        self.key
                    ),
                )
                .await),
        }
    }

    fn describe(&self) -> String {
        format!("nats-kv/{}/{}", self.bucket, self.key)
    }
}
