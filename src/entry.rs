//! Projection of raw stream messages into KV entries.

use crate::api::types::StoredMessage;
use crate::error::{Error, Result};
use crate::subject;
use async_nats::HeaderMap;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// The operation a stream message represents. Absence of the `KV-Operation`
/// header means a plain put; `DEL` and `PURGE` are tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Put,
    Delete,
    Purge,
}

impl Operation {
    fn from_header(value: Option<&str>) -> Operation {
        match value {
            Some(subject::KV_OPERATION_DEL) => Operation::Delete,
            Some(subject::KV_OPERATION_PURGE) => Operation::Purge,
            _ => Operation::Put,
        }
    }
}

/// An immutable snapshot of one revision of one key.
#[derive(Debug, Clone)]
pub struct Entry {
    pub bucket: String,
    pub key: String,
    /// Opaque value bytes; empty for tombstones.
    pub value: Bytes,
    /// Stream sequence number, monotonic across the whole bucket.
    pub revision: u64,
    /// Messages remaining on the same filter at read time; `0` when the
    /// entry was the last one known, or when it was fetched directly.
    pub delta: u64,
    /// Server-assigned timestamp.
    pub created: DateTime<Utc>,
    pub operation: Operation,
    data_len: usize,
}

impl Entry {
    /// Size of the stored value. Differs from `value.len()` only for
    /// headers-only (meta) deliveries, where the payload is withheld.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Decodes a message delivered by a push consumer. Revision, timestamp
    /// and delta come from the `$JS.ACK` delivery metadata on the reply
    /// subject.
    pub(crate) fn from_push_message(bucket: &str, msg: &async_nats::Message) -> Result<Entry> {
        let reply = msg
            .reply
            .as_ref()
            .ok_or_else(|| Error::Other("delivered message carries no ack metadata".to_string()))?;
        let meta = AckMetadata::parse(reply.as_str())?;
        let key = subject::key_from_subject(bucket, msg.subject.as_str())
            .ok_or_else(|| {
                Error::Other(format!(
                    "subject '{}' does not belong to bucket '{bucket}'",
                    msg.subject
                ))
            })?
            .to_string();

        let operation = Operation::from_header(header_str(msg.headers.as_ref(), subject::KV_OPERATION_HDR));
        let value = match operation {
            Operation::Put => msg.payload.clone(),
            _ => Bytes::new(),
        };
        // headers-only deliveries replace the payload with a size header
        let data_len = header_str(msg.headers.as_ref(), subject::MSG_SIZE_HDR)
            .and_then(|v| v.parse().ok())
            .unwrap_or(value.len());

        Ok(Entry {
            bucket: bucket.to_string(),
            key,
            value,
            revision: meta.stream_sequence,
            delta: meta.pending,
            created: meta.timestamp,
            operation,
            data_len,
        })
    }

    /// Decodes a stored message returned by `STREAM.MSG.GET`.
    pub(crate) fn from_stored(bucket: &str, msg: &StoredMessage) -> Result<Entry> {
        let key = subject::key_from_subject(bucket, &msg.subject)
            .ok_or_else(|| {
                Error::Other(format!(
                    "subject '{}' does not belong to bucket '{bucket}'",
                    msg.subject
                ))
            })?
            .to_string();

        let headers = match &msg.hdrs {
            Some(encoded) => {
                let block = BASE64_STANDARD
                    .decode(encoded)
                    .map_err(|e| Error::Other(format!("decoding stored headers: {e}")))?;
                subject::parse_header_block(&block)?
            }
            None => Vec::new(),
        };
        let operation = Operation::from_header(
            headers
                .iter()
                .find(|(name, _)| name == subject::KV_OPERATION_HDR)
                .map(|(_, value)| value.as_str()),
        );

        let value = match (&msg.data, operation) {
            (Some(encoded), Operation::Put) => Bytes::from(
                BASE64_STANDARD
                    .decode(encoded)
                    .map_err(|e| Error::Other(format!("decoding stored payload: {e}")))?,
            ),
            _ => Bytes::new(),
        };
        let data_len = value.len();

        Ok(Entry {
            bucket: bucket.to_string(),
            key,
            value,
            revision: msg.seq,
            delta: 0,
            created: msg.time,
            operation,
            data_len,
        })
    }
}

// Two reads of the same revision are the same entry; delta and data_len are
// read artifacts and do not participate.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket
            && self.key == other.key
            && self.revision == other.revision
            && self.operation == other.operation
            && self.value == other.value
            && self.created == other.created
    }
}

fn header_str<'a>(headers: Option<&'a HeaderMap>, name: &str) -> Option<&'a str> {
    headers.and_then(|h| h.get(name)).map(|v| v.as_str())
}

/// Delivery metadata parsed from a `$JS.ACK` reply subject. Both the
/// 9-token v1 form and the 12-token v2 form (domain + account hash) are
/// accepted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct AckMetadata {
    pub stream_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub pending: u64,
}

impl AckMetadata {
    pub(crate) fn parse(reply: &str) -> Result<AckMetadata> {
        let tokens: Vec<&str> = reply.split('.').collect();
        if tokens.len() < 9 || tokens[0] != "$JS" || tokens[1] != "ACK" {
            return Err(Error::Other(format!("malformed ack subject '{reply}'")));
        }
        // v2 prepends <domain>.<account hash> and appends a random token
        let base = if tokens.len() >= 12 { 4 } else { 2 };
        let number = |idx: usize| -> Result<u64> {
            tokens[base + idx]
                .parse()
                .map_err(|_| Error::Other(format!("malformed ack subject '{reply}'")))
        };
        let stream_sequence = number(3)?;
        let timestamp_nanos = tokens[base + 5]
            .parse::<i64>()
            .map_err(|_| Error::Other(format!("malformed ack subject '{reply}'")))?;
        let pending = number(6)?;
        Ok(AckMetadata {
            stream_sequence,
            timestamp: DateTime::from_timestamp_nanos(timestamp_nanos),
            pending,
        })
    }
}
