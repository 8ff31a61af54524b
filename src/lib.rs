//! Key/Value store client built on NATS JetStream streams.
//!
//! A bucket is a disciplined use of one stream: the bucket `B` is backed by
//! the stream `KV_B`, every key is a subject under `$KV.B.`, a revision is a
//! stream sequence number, and deletes are retained tombstone messages. On
//! top of that mapping this crate provides versioned reads, per-key history,
//! optimistic concurrency for create/update, purge with server-side rollup,
//! and watchers that replay retained data before following the live tail.
//!
//! ```no_run
//! use bytes::Bytes;
//! use jetstream_kv::{ClientConfig, KeyValue, KvConfig, KvManager, KvOptions};
//!
//! # async fn demo() -> jetstream_kv::Result<()> {
//! let client = jetstream_kv::connect(ClientConfig::default()).await?;
//!
//! let manager = KvManager::new(client.clone(), KvOptions::default());
//! manager
//!     .create(KvConfig {
//!         bucket: "profiles".to_string(),
//!         max_history_per_key: 5,
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! let kv = KeyValue::new(client, "profiles", KvOptions::default())?;
//! let revision = kv.put("alice", Bytes::from("{}")).await?;
//! let entry = kv.get("alice").await?.expect("just written");
//! assert_eq!(entry.revision, revision);
//! # Ok(())
//! # }
//! ```

/// Bucket, handle and connection configuration.
pub mod config;

/// Projection of stream messages into KV entries.
pub mod entry;

/// Error exposed by the crate.
pub mod error;

/// Bucket lifecycle: create, update, delete, status, enumeration.
pub mod manager;

/// Entry operations on one bucket.
pub mod store;

/// Long-lived watchers with an end-of-initial-data boundary.
pub mod watch;

mod api;
mod scan;
mod subject;

pub use config::{ClientConfig, KvConfig, KvOptions, Placement, Republish, StorageType, connect};
pub use entry::{Entry, Operation};
pub use error::{Error, Result};
pub use manager::{KvManager, KvStatus};
pub use store::{KeyValue, PurgeThreshold};
pub use watch::{KvWatcher, WatchHandle, WatchOptions};
