//! Wire types for the JetStream administrative API.
//!
//! Everything here mirrors the JSON payloads exchanged on `$JS.API.*`
//! subjects. Durations travel as integer nanoseconds; unset size limits are
//! `-1` per the server convention.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every API reply is either the expected payload or an error envelope.
/// The error variant is listed first so an envelope never deserializes into
/// a payload type whose fields are all defaulted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ApiResponse<T> {
    Err { error: ApiError },
    Ok(T),
}

/// The server's `error{code, err_code, description}` envelope.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub err_code: u64,
    #[serde(default)]
    pub description: String,
}

// Known err_codes are matched first; they are version-sensitive, so the
// description text is kept as a fallback for the sequence check.
const ERR_CODE_STREAM_ALREADY_EXISTS: u64 = 10058;
const ERR_CODE_STREAM_NOT_FOUND: u64 = 10059;
const ERR_CODE_WRONG_LAST_SEQUENCE: u64 = 10071;
const ERR_CODE_NO_MESSAGE_FOUND: u64 = 10037;

impl From<ApiError> for Error {
    fn from(e: ApiError) -> Self {
        match e.err_code {
            ERR_CODE_STREAM_ALREADY_EXISTS => Error::AlreadyExists(e.description),
            ERR_CODE_WRONG_LAST_SEQUENCE => Error::WrongLastSequence(e.description),
            ERR_CODE_STREAM_NOT_FOUND | ERR_CODE_NO_MESSAGE_FOUND => Error::NotFound(e.description),
            _ if e.description.contains("wrong last sequence") => {
                Error::WrongLastSequence(e.description)
            }
            _ => match e.code {
                404 => Error::NotFound(e.description),
                400 | 408 => Error::BadRequest(e.description),
                _ => Error::Api {
                    code: e.code,
                    err_code: e.err_code,
                    description: e.description,
                },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    #[serde(rename = "workqueue")]
    WorkQueue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DiscardPolicy {
    #[default]
    Old,
    New,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AckPolicy {
    #[default]
    Explicit,
    None,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
    LastPerSubject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Placement directive for the backing stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Republish directive for the backing stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Republish {
    pub src: String,
    pub dest: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub headers_only: bool,
}

/// The subset of the stream configuration a KV bucket maps onto.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    pub max_consumers: i64,
    pub max_msgs: i64,
    // the server omits zero-valued omitempty fields when it echoes a config
    #[serde(default)]
    pub max_msgs_per_subject: i64,
    pub max_bytes: i64,
    #[serde(default)]
    pub max_msg_size: i32,
    /// Entry TTL in nanoseconds; `0` means unlimited.
    #[serde(default)]
    pub max_age: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub duplicate_window: u64,
    pub storage: StorageType,
    pub num_replicas: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_rollup_hdrs: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deny_delete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deny_purge: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub republish: Option<Republish>,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StreamInfo {
    pub config: StreamConfig,
    #[serde(default)]
    pub state: StreamState,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct StreamNamesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamNamesResponse {
    #[serde(default)]
    pub total: u64,
    /// The server sends `null` instead of an empty list.
    #[serde(default)]
    pub streams: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PurgeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PurgeResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub purged: u64,
}

/// Reply to `STREAM.DELETE` and `CONSUMER.DELETE`.
#[derive(Debug, Deserialize)]
pub(crate) struct SuccessResponse {
    #[serde(default)]
    pub success: bool,
}

/// Acknowledgement for a publish into the stream.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PubAck {
    pub stream: String,
    pub seq: u64,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    pub ack_policy: AckPolicy,
    pub replay_policy: ReplayPolicy,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_subject: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub headers_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flow_control: bool,
    /// Nanoseconds; required by the server whenever flow control is on.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub idle_heartbeat: u64,
    /// Nanoseconds before the server reaps an abandoned ephemeral.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub inactive_threshold: u64,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub num_replicas: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mem_storage: bool,
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateConsumerRequest {
    pub stream_name: String,
    pub config: ConsumerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ConsumerInfo {
    pub name: String,
    #[serde(default)]
    pub num_pending: u64,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct MsgGetRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_by_subj: Option<String>,
}

impl MsgGetRequest {
    pub(crate) fn last_by_subject(subject: String) -> Self {
        MsgGetRequest {
            last_by_subj: Some(subject),
            ..Default::default()
        }
    }

    pub(crate) fn by_sequence(seq: u64) -> Self {
        MsgGetRequest {
            seq: Some(seq),
            ..Default::default()
        }
    }
}

/// A stored stream message as returned by `STREAM.MSG.GET`; `data` and
/// `hdrs` are base64.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StoredMessage {
    pub subject: String,
    pub seq: u64,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub hdrs: Option<String>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MsgGetResponse {
    pub message: StoredMessage,
}
