//! Bucket lifecycle: create, update, delete, status, enumeration.

use crate::api::ApiClient;
use crate::api::types::{
    Placement, StorageType, StreamInfo, StreamNamesRequest, StreamNamesResponse, SuccessResponse,
};
use crate::config::{KvConfig, KvOptions};
use crate::error::{Error, Result};
use crate::subject::{self, KV_STREAM_PREFIX};
use async_nats::Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::info;

/// Handle for bucket administration. Cheap to clone and safe to share
/// across tasks.
#[derive(Clone)]
pub struct KvManager {
    api: ApiClient,
}

impl KvManager {
    pub fn new(client: Client, options: KvOptions) -> Self {
        KvManager {
            api: ApiClient::new(client, &options),
        }
    }

    /// Creates the bucket. Fails with [`Error::AlreadyExists`] when a stream
    /// of the same name is already present.
    pub async fn create(&self, config: KvConfig) -> Result<KvStatus> {
        config.validate()?;
        let stream_config = config.to_stream_config();
        let body = serde_json::to_vec(&stream_config)
            .map_err(|e| Error::Other(format!("encoding stream config: {e}")))?;
        let info: StreamInfo = self
            .api
            .request(&format!("STREAM.CREATE.{}", stream_config.name), body.into())
            .await?;
        info!(bucket = %config.bucket, "created bucket");
        Ok(KvStatus { info })
    }

    /// Updates the bucket configuration. The storage type is immutable; a
    /// change is refused here before the server ever sees it.
    pub async fn update(&self, config: KvConfig) -> Result<KvStatus> {
        config.validate()?;
        let current = self.stream_info(&config.bucket).await?;
        if current.config.storage != config.storage_type {
            return Err(Error::InvalidArgument(
                "storage type of an existing bucket cannot be changed".to_string(),
            ));
        }
        let stream_config = config.to_stream_config();
        let body = serde_json::to_vec(&stream_config)
            .map_err(|e| Error::Other(format!("encoding stream config: {e}")))?;
        let info: StreamInfo = self
            .api
            .request(&format!("STREAM.UPDATE.{}", stream_config.name), body.into())
            .await?;
        Ok(KvStatus { info })
    }

    /// Deletes the bucket and everything in it. [`Error::NotFound`] when the
    /// bucket does not exist.
    pub async fn delete(&self, bucket: &str) -> Result<()> {
        subject::validate_bucket_name(bucket)?;
        let response: SuccessResponse = self
            .api
            .request(
                &format!("STREAM.DELETE.{}", subject::stream_name(bucket)),
                Bytes::new(),
            )
            .await?;
        if !response.success {
            return Err(Error::Other(format!(
                "deleting bucket {bucket} was not acknowledged"
            )));
        }
        info!(%bucket, "deleted bucket");
        Ok(())
    }

    /// Fetches the current status of the bucket.
    pub async fn status(&self, bucket: &str) -> Result<KvStatus> {
        let info = self.stream_info(bucket).await?;
        Ok(KvStatus { info })
    }

    /// Names of all KV buckets visible on this connection. Only streams
    /// carrying the `KV_` prefix participate.
    pub async fn bucket_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut offset = 0;
        loop {
            let request = StreamNamesRequest {
                subject: Some(format!("{}*.>", subject::KV_SUBJECT_PREFIX)),
                offset,
            };
            let body = serde_json::to_vec(&request)
                .map_err(|e| Error::Other(format!("encoding names request: {e}")))?;
            let page: StreamNamesResponse = self.api.request("STREAM.NAMES", body.into()).await?;
            let streams = page.streams.unwrap_or_default();
            let count = streams.len() as u64;
            offset += count;
            names.extend(
                streams
                    .into_iter()
                    .filter_map(|name| name.strip_prefix(KV_STREAM_PREFIX).map(str::to_string)),
            );
            if count == 0 || offset >= page.total {
                break;
            }
        }
        Ok(names)
    }

    async fn stream_info(&self, bucket: &str) -> Result<StreamInfo> {
        subject::validate_bucket_name(bucket)?;
        self.api
            .request(
                &format!("STREAM.INFO.{}", subject::stream_name(bucket)),
                Bytes::new(),
            )
            .await
    }
}

/// Bucket status re-projected from the backing stream info.
#[derive(Debug, Clone)]
pub struct KvStatus {
    info: StreamInfo,
}

impl KvStatus {
    pub fn bucket(&self) -> &str {
        self.info
            .config
            .name
            .strip_prefix(KV_STREAM_PREFIX)
            .unwrap_or(&self.info.config.name)
    }

    /// Number of messages currently held, tombstones and history included.
    pub fn entry_count(&self) -> u64 {
        self.info.state.messages
    }

    pub fn max_history_per_key(&self) -> i64 {
        self.info.config.max_msgs_per_subject
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self.info.config.max_age {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    pub fn max_value_size(&self) -> Option<i32> {
        match self.info.config.max_msg_size {
            size if size > 0 => Some(size),
            _ => None,
        }
    }

    pub fn max_bucket_size(&self) -> Option<i64> {
        match self.info.config.max_bytes {
            size if size > 0 => Some(size),
            _ => None,
        }
    }

    pub fn storage_type(&self) -> StorageType {
        self.info.config.storage
    }

    pub fn replicas(&self) -> usize {
        self.info.config.num_replicas
    }

    pub fn description(&self) -> Option<&str> {
        self.info.config.description.as_deref()
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.info.config.placement.as_ref()
    }

    pub fn backing_store(&self) -> &'static str {
        "JetStream"
    }
}
