//! Bucket configuration, handle options, and NATS client configuration.

use crate::api::types::{DiscardPolicy, RetentionPolicy, StreamConfig};
use crate::error::{Error, Result};

pub use crate::api::types::{Placement, Republish, StorageType};
use crate::subject;
use async_nats::{Client, ConnectOptions};
use std::collections::HashMap;
use std::time::Duration;

/// The server refuses per-key history beyond this.
pub const MAX_HISTORY_PER_KEY: i64 = 64;

/// Server-side ceiling for the duplicate-tracking window.
const MAX_DUPLICATE_WINDOW: Duration = Duration::from_secs(2 * 60);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DELETE_MARKER_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Configuration of a bucket. The backing stream configuration is derived
/// from this, never specified directly.
///
/// ```
/// use jetstream_kv::config::KvConfig;
///
/// let config = KvConfig {
///     bucket: "profiles".to_string(),
///     max_history_per_key: 5,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct KvConfig {
    pub bucket: String,
    pub description: Option<String>,
    /// Revisions the server retains per key, 1..=64.
    pub max_history_per_key: i64,
    /// Largest accepted value in bytes; `None` leaves it unlimited.
    pub max_value_size: Option<i32>,
    /// Total bucket size in bytes; `None` leaves it unlimited.
    pub max_bucket_size: Option<i64>,
    /// Per-entry age limit; entries older than this are dropped server-side.
    pub ttl: Option<Duration>,
    /// Immutable after creation.
    pub storage_type: StorageType,
    pub replicas: usize,
    pub placement: Option<Placement>,
    pub republish: Option<Republish>,
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig {
            bucket: String::new(),
            description: None,
            max_history_per_key: 1,
            max_value_size: None,
            max_bucket_size: None,
            ttl: None,
            storage_type: StorageType::File,
            replicas: 1,
            placement: None,
            republish: None,
        }
    }
}

impl KvConfig {
    pub fn validate(&self) -> Result<()> {
        subject::validate_bucket_name(&self.bucket)?;
        if self.max_history_per_key < 1 || self.max_history_per_key > MAX_HISTORY_PER_KEY {
            return Err(Error::InvalidArgument(format!(
                "max_history_per_key must be between 1 and {MAX_HISTORY_PER_KEY}, got {}",
                self.max_history_per_key
            )));
        }
        if self.replicas < 1 || self.replicas > 5 {
            return Err(Error::InvalidArgument(format!(
                "replicas must be between 1 and 5, got {}",
                self.replicas
            )));
        }
        Ok(())
    }

    /// Derives the backing stream configuration: limits retention, new-style
    /// discard, per-subject cap carrying the history limit, rollups allowed
    /// for purge, deletes denied so history stays append-only.
    pub(crate) fn to_stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: subject::stream_name(&self.bucket),
            description: self.description.clone(),
            subjects: vec![subject::stream_subject(&self.bucket)],
            retention: RetentionPolicy::Limits,
            discard: DiscardPolicy::New,
            max_consumers: -1,
            max_msgs: -1,
            max_msgs_per_subject: self.max_history_per_key,
            max_bytes: self.max_bucket_size.unwrap_or(-1),
            max_msg_size: self.max_value_size.unwrap_or(-1),
            max_age: self.ttl.map(|ttl| ttl.as_nanos() as u64).unwrap_or(0),
            duplicate_window: self
                .ttl
                .map(|ttl| ttl.min(MAX_DUPLICATE_WINDOW).as_nanos() as u64)
                .unwrap_or(0),
            storage: self.storage_type,
            num_replicas: self.replicas,
            allow_rollup_hdrs: true,
            deny_delete: true,
            deny_purge: false,
            placement: self.placement.clone(),
            republish: self.republish.clone(),
        }
    }
}

/// Options shared by the bucket manager and store handles.
#[derive(Debug, Clone)]
pub struct KvOptions {
    /// Explicit API subject prefix, e.g. `FromA.$JS.API` when the bucket is
    /// reached over an account bridge. Wins over `domain`.
    pub api_prefix: Option<String>,
    /// JetStream domain; maps to the `$JS.<domain>.API` prefix.
    pub domain: Option<String>,
    pub request_timeout: Duration,
    /// Tombstones younger than this survive `purge_deletes` by default.
    pub delete_marker_threshold: Duration,
    /// When set, `put`, `delete` and `purge` do not wait for the stream
    /// acknowledgement; `put` then reports revision 0. `create` and `update`
    /// always wait, they need the ack for the sequence check.
    pub publish_no_ack: bool,
}

impl Default for KvOptions {
    fn default() -> Self {
        KvOptions {
            api_prefix: None,
            domain: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            delete_marker_threshold: DEFAULT_DELETE_MARKER_THRESHOLD,
            publish_no_ack: false,
        }
    }
}

const DEFAULT_URL: &str = "localhost:4222";

const ENV_NATS_URL: &str = "NATS_URL";
const ENV_NATS_USER: &str = "NATS_USER";
const ENV_NATS_PASSWORD: &str = "NATS_PASSWORD";
const ENV_NATS_TLS_ENABLED: &str = "NATS_TLS_ENABLED";

/// NATS client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// NATS server URL.
    pub url: String,
    /// NATS server username.
    pub user: Option<String>,
    /// NATS server password.
    pub password: Option<String>,
    /// Whether to enable TLS.
    pub tls_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: DEFAULT_URL.to_string(),
            user: None,
            password: None,
            tls_enabled: false,
        }
    }
}

impl ClientConfig {
    pub fn load(env_vars: HashMap<String, String>) -> Result<Self> {
        let get_var = |var: &str| -> Result<String> {
            Ok(env_vars
                .get(var)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("environment variable {var} is not set"))
                })?
                .to_string())
        };

        Ok(Self {
            url: get_var(ENV_NATS_URL)?,
            user: get_var(ENV_NATS_USER).ok(),
            password: get_var(ENV_NATS_PASSWORD).ok(),
            tls_enabled: get_var(ENV_NATS_TLS_ENABLED)
                .map(|v| v == "true")
                .unwrap_or(false),
        })
    }
}

/// Connects to the server with the crate's reconnection posture: unlimited
/// reconnects and retry on the initial connect.
pub async fn connect(config: ClientConfig) -> Result<Client> {
    let mut opts = ConnectOptions::new()
        .max_reconnects(None)
        .ping_interval(Duration::from_secs(3))
        .retry_on_initial_connect();

    if let (Some(user), Some(password)) = (config.user, config.password) {
        opts = opts.user_and_password(user, password);
    }
    if config.tls_enabled {
        opts = opts.require_tls(true);
    }

    async_nats::connect_with_options(&config.url, opts)
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bucket: &str) -> KvConfig {
        KvConfig {
            bucket: bucket.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_bounds() {
        assert!(config("ok").validate().is_ok());
        assert!(config("bad.name").validate().is_err());

        let mut c = config("b");
        c.max_history_per_key = 0;
        assert!(c.validate().is_err());
        c.max_history_per_key = 65;
        assert!(c.validate().is_err());
        c.max_history_per_key = 64;
        assert!(c.validate().is_ok());

        c.replicas = 0;
        assert!(c.validate().is_err());
        c.replicas = 6;
        assert!(c.validate().is_err());
        c.replicas = 3;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_stream_config_derivation() {
        let mut c = config("cfg");
        c.max_history_per_key = 7;
        c.max_bucket_size = Some(1 << 20);
        c.max_value_size = Some(4096);
        c.storage_type = StorageType::Memory;

        let sc = c.to_stream_config();
        assert_eq!(sc.name, "KV_cfg");
        assert_eq!(sc.subjects, vec!["$KV.cfg.>".to_string()]);
        assert_eq!(sc.retention, RetentionPolicy::Limits);
        assert_eq!(sc.discard, DiscardPolicy::New);
        assert_eq!(sc.max_msgs_per_subject, 7);
        assert_eq!(sc.max_bytes, 1 << 20);
        assert_eq!(sc.max_msg_size, 4096);
        assert_eq!(sc.max_age, 0);
        assert_eq!(sc.duplicate_window, 0);
        assert_eq!(sc.storage, StorageType::Memory);
        assert!(sc.allow_rollup_hdrs);
        assert!(sc.deny_delete);
        assert!(!sc.deny_purge);
    }

    #[test]
    fn test_duplicate_window_follows_ttl_up_to_the_cap() {
        let mut c = config("cfg");
        c.ttl = Some(Duration::from_secs(30));
        assert_eq!(
            c.to_stream_config().duplicate_window,
            Duration::from_secs(30).as_nanos() as u64
        );
        assert_eq!(
            c.to_stream_config().max_age,
            Duration::from_secs(30).as_nanos() as u64
        );

        c.ttl = Some(Duration::from_secs(3600));
        assert_eq!(
            c.to_stream_config().duplicate_window,
            MAX_DUPLICATE_WINDOW.as_nanos() as u64
        );
    }

    #[test]
    fn test_client_config_load() {
        let env: HashMap<String, String> = [
            (ENV_NATS_URL.to_string(), "nats-0:4222".to_string()),
            (ENV_NATS_USER.to_string(), "svc".to_string()),
            (ENV_NATS_PASSWORD.to_string(), "secret".to_string()),
            (ENV_NATS_TLS_ENABLED.to_string(), "true".to_string()),
        ]
        .into();

        let config = ClientConfig::load(env).unwrap();
        assert_eq!(
            config,
            ClientConfig {
                url: "nats-0:4222".to_string(),
                user: Some("svc".to_string()),
                password: Some("secret".to_string()),
                tls_enabled: true,
            }
        );

        assert!(ClientConfig::load(HashMap::new()).is_err());
    }
}
