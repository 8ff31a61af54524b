//! Entry operations on a bucket: reads, writes, tombstones, enumeration.

use crate::api::ApiClient;
use crate::api::types::{
    DeliverPolicy, MsgGetRequest, MsgGetResponse, PurgeRequest, PurgeResponse,
};
use crate::config::KvOptions;
use crate::entry::{Entry, Operation};
use crate::error::{Error, Result};
use crate::scan::{Scan, ScanConfig};
use crate::subject;
use async_nats::{Client, HeaderMap};
use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

/// Age limit for tombstones considered by [`KeyValue::purge_deletes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PurgeThreshold {
    /// Use the handle's configured delete-marker threshold (30 minutes
    /// unless overridden in [`KvOptions`]).
    #[default]
    Default,
    /// Explicit age; a zero duration falls back to the configured default.
    Age(Duration),
    /// No age limit: every tombstone is collapsed.
    All,
}

fn resolve_threshold(threshold: PurgeThreshold, default: Duration) -> Option<Duration> {
    match threshold {
        PurgeThreshold::Default => Some(default),
        PurgeThreshold::Age(age) if age.is_zero() => Some(default),
        PurgeThreshold::Age(age) => Some(age),
        PurgeThreshold::All => None,
    }
}

/// Handle on one bucket. Cheap to clone; all operations are safe to issue
/// concurrently from multiple tasks.
///
/// Binding is lazy: constructing the handle validates the bucket name but
/// performs no network call, so operations against an absent bucket surface
/// [`Error::NotFound`] at call time.
#[derive(Clone)]
pub struct KeyValue {
    pub(crate) bucket: String,
    pub(crate) stream: String,
    pub(crate) api: ApiClient,
    /// Account-bridge prefix for publish subjects; empty on a plain
    /// connection.
    write_prefix: String,
    delete_marker_threshold: Duration,
    publish_no_ack: bool,
}

impl KeyValue {
    pub fn new(client: Client, bucket: &str, options: KvOptions) -> Result<KeyValue> {
        subject::validate_bucket_name(bucket)?;
        Ok(KeyValue {
            bucket: bucket.to_string(),
            stream: subject::stream_name(bucket),
            api: ApiClient::new(client, &options),
            write_prefix: crate::api::write_prefix(&options),
            delete_marker_threshold: options.delete_marker_threshold,
            publish_no_ack: options.publish_no_ack,
        })
    }

    fn write_subject(&self, key: &str) -> String {
        format!(
            "{}{}",
            self.write_prefix,
            subject::entry_subject(&self.bucket, key)
        )
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Latest live value of the key. Tombstoned or never-written keys
    /// resolve to `Ok(None)`, not an error.
    pub async fn get(&self, key: &str) -> Result<Option<Entry>> {
        subject::validate_key(key)?;
        match self.last_entry(key).await? {
            Some(entry) if entry.operation == Operation::Put => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// The entry stored at an exact revision. `Ok(None)` when the revision
    /// does not exist, belongs to a different key, or is a tombstone.
    pub async fn get_revision(&self, key: &str, revision: u64) -> Result<Option<Entry>> {
        subject::validate_key(key)?;
        let expected_subject = subject::entry_subject(&self.bucket, key);
        match self.msg_get(MsgGetRequest::by_sequence(revision)).await? {
            Some(message) if message.subject == expected_subject => {
                let entry = Entry::from_stored(&self.bucket, &message)?;
                Ok((entry.operation == Operation::Put).then_some(entry))
            }
            _ => Ok(None),
        }
    }

    /// Stores the value, unconditionally, and returns the assigned revision.
    pub async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        subject::validate_key(key)?;
        self.publish_entry(key, None, value).await
    }

    /// Stores the value only if the key has never been written. A key whose
    /// head is a tombstone counts as absent: the write is retried over the
    /// tombstone's revision.
    pub async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        subject::validate_key(key)?;
        match self.update(key, value.clone(), 0).await {
            Err(Error::WrongLastSequence(reason)) => match self.last_entry(key).await? {
                Some(head) if head.operation != Operation::Put => {
                    self.update(key, value, head.revision).await
                }
                _ => Err(Error::WrongLastSequence(reason)),
            },
            result => result,
        }
    }

    /// Stores the value only if the key's current head revision is exactly
    /// `expected_revision` (0 meaning "no message on the subject yet").
    pub async fn update(&self, key: &str, value: Bytes, expected_revision: u64) -> Result<u64> {
        subject::validate_key(key)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            subject::EXPECTED_LAST_SUBJECT_SEQ_HDR,
            expected_revision.to_string(),
        );
        // the sequence check needs the acknowledgement, so update never
        // falls back to fire-and-forget
        let ack = self
            .api
            .publish(self.write_subject(key), Some(headers), value)
            .await?;
        Ok(ack.seq)
    }

    /// Writes a delete tombstone. The key's history stays readable up to the
    /// bucket's per-key cap.
    pub async fn delete(&self, key: &str) -> Result<()> {
        subject::validate_key(key)?;
        let mut headers = HeaderMap::new();
        headers.insert(subject::KV_OPERATION_HDR, subject::KV_OPERATION_DEL);
        self.publish_tombstone(key, headers).await
    }

    /// Writes a purge tombstone with a rollup header: the server collapses
    /// all prior history of the key into this single message.
    pub async fn purge(&self, key: &str) -> Result<()> {
        subject::validate_key(key)?;
        let mut headers = HeaderMap::new();
        headers.insert(subject::KV_OPERATION_HDR, subject::KV_OPERATION_PURGE);
        headers.insert(subject::ROLLUP_HDR, subject::ROLLUP_SUBJECT);
        self.publish_tombstone(key, headers).await
    }

    /// All keys whose head is a live value. Keys that only ever carried
    /// tombstones do not appear. An empty bucket yields an empty vector.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let entries = self
            .drain(ScanConfig {
                filter: subject::stream_subject(&self.bucket),
                deliver_policy: DeliverPolicy::LastPerSubject,
                start_sequence: None,
                headers_only: true,
            })
            .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.operation == Operation::Put)
            .map(|entry| entry.key)
            .collect())
    }

    /// Retained history of the key in ascending revision order, tombstones
    /// included. An unknown key yields an empty vector.
    pub async fn history(&self, key: &str) -> Result<Vec<Entry>> {
        subject::validate_key(key)?;
        self.drain(ScanConfig {
            filter: subject::entry_subject(&self.bucket, key),
            deliver_policy: DeliverPolicy::All,
            start_sequence: None,
            headers_only: false,
        })
        .await
    }

    /// Collapses tombstoned keys. Tombstones older than the threshold are
    /// removed outright (`keep 0`); younger ones survive as markers while
    /// the history beneath them is dropped (`keep 1`). Processing stops at
    /// the first failure.
    pub async fn purge_deletes(&self, threshold: PurgeThreshold) -> Result<()> {
        let heads = self
            .drain(ScanConfig {
                filter: subject::stream_subject(&self.bucket),
                deliver_policy: DeliverPolicy::LastPerSubject,
                start_sequence: None,
                headers_only: false,
            })
            .await?;

        let limit = resolve_threshold(threshold, self.delete_marker_threshold);
        let now = Utc::now();
        for head in heads.iter().filter(|e| e.operation != Operation::Put) {
            let keep = match limit {
                None => 0,
                Some(limit) => {
                    // a clock skew putting the marker in the future reads as age zero
                    let age = now
                        .signed_duration_since(head.created)
                        .to_std()
                        .unwrap_or_default();
                    if age > limit { 0 } else { 1 }
                }
            };
            let request = PurgeRequest {
                filter: Some(subject::entry_subject(&self.bucket, &head.key)),
                keep: Some(keep),
            };
            let body = serde_json::to_vec(&request)
                .map_err(|e| Error::Other(format!("encoding purge request: {e}")))?;
            let response: PurgeResponse = self
                .api
                .request(&format!("STREAM.PURGE.{}", self.stream), body.into())
                .await?;
            debug!(
                bucket = %self.bucket,
                key = %head.key,
                keep,
                purged = response.purged,
                success = response.success,
                "collapsed tombstoned key"
            );
        }
        Ok(())
    }

    async fn publish_entry(&self, key: &str, headers: Option<HeaderMap>, value: Bytes) -> Result<u64> {
        let subject = self.write_subject(key);
        if self.publish_no_ack {
            self.api.publish_no_ack(subject, headers, value).await?;
            return Ok(0);
        }
        let ack = self.api.publish(subject, headers, value).await?;
        debug!(stream = %ack.stream, seq = ack.seq, duplicate = ack.duplicate, "entry acknowledged");
        Ok(ack.seq)
    }

    async fn publish_tombstone(&self, key: &str, headers: HeaderMap) -> Result<()> {
        self.publish_entry(key, Some(headers), Bytes::new())
            .await
            .map(|_| ())
    }

    /// Head message of the key regardless of operation; `None` when the key
    /// or the bucket has no message.
    pub(crate) async fn last_entry(&self, key: &str) -> Result<Option<Entry>> {
        let request =
            MsgGetRequest::last_by_subject(subject::entry_subject(&self.bucket, key));
        match self.msg_get(request).await? {
            Some(message) => Ok(Some(Entry::from_stored(&self.bucket, &message)?)),
            None => Ok(None),
        }
    }

    async fn msg_get(
        &self,
        request: MsgGetRequest,
    ) -> Result<Option<crate::api::types::StoredMessage>> {
        let body = serde_json::to_vec(&request)
            .map_err(|e| Error::Other(format!("encoding message-get request: {e}")))?;
        match self
            .api
            .request::<MsgGetResponse>(&format!("STREAM.MSG.GET.{}", self.stream), body.into())
            .await
        {
            Ok(response) => Ok(Some(response.message)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Opens an ordered scan and drains its initial data: every message up
    /// to the first one with nothing pending behind it on the filter. The
    /// consumer is released on success and on error.
    async fn drain(&self, config: ScanConfig) -> Result<Vec<Entry>> {
        let mut scan = Scan::open(self.api.clone(), &self.stream, config).await?;
        let result = async {
            let mut entries = Vec::new();
            let mut pending = scan.initial_pending;
            while pending > 0 {
                let Some(msg) = scan.next_message_timeout().await? else {
                    return Err(Error::Transport(
                        "delivery subscription closed before the drain finished".to_string(),
                    ));
                };
                let entry = Entry::from_push_message(&self.bucket, &msg)?;
                pending = entry.delta;
                entries.push(entry);
            }
            Ok(entries)
        }
        .await;
        scan.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_threshold() {
        let default = Duration::from_secs(1800);
        assert_eq!(
            resolve_threshold(PurgeThreshold::Default, default),
            Some(default)
        );
        assert_eq!(
            resolve_threshold(PurgeThreshold::Age(Duration::ZERO), default),
            Some(default)
        );
        assert_eq!(
            resolve_threshold(PurgeThreshold::Age(Duration::from_secs(60)), default),
            Some(Duration::from_secs(60))
        );
        assert_eq!(resolve_threshold(PurgeThreshold::All, default), None);
    }

    #[cfg(feature = "nats-tests")]
    mod live {
        use super::*;
        use crate::api::types::StorageType;
        use crate::config::KvConfig;
        use crate::manager::KvManager;

        async fn setup(bucket: &str, history: i64) -> (KvManager, KeyValue) {
            let client = async_nats::connect("localhost:4222").await.unwrap();
            let manager = KvManager::new(client.clone(), KvOptions::default());
            let _ = manager.delete(bucket).await;
            manager
                .create(KvConfig {
                    bucket: bucket.to_string(),
                    max_history_per_key: history,
                    storage_type: StorageType::Memory,
                    ..Default::default()
                })
                .await
                .unwrap();
            let kv = KeyValue::new(client, bucket, KvOptions::default()).unwrap();
            (manager, kv)
        }

        async fn cleanup(manager: &KvManager, bucket: &str) {
            let _ = manager.delete(bucket).await;
        }

        #[tokio::test]
        async fn test_put_get_roundtrip() {
            let (manager, kv) = setup("store-put-get", 1).await;

            let revision = kv.put("greeting", Bytes::from("hello")).await.unwrap();
            assert!(revision > 0);

            let entry = kv.get("greeting").await.unwrap().unwrap();
            assert_eq!(entry.value, Bytes::from("hello"));
            assert_eq!(entry.revision, revision);
            assert_eq!(entry.operation, Operation::Put);

            assert!(kv.get("absent").await.unwrap().is_none());

            cleanup(&manager, "store-put-get").await;
        }

        #[tokio::test]
        async fn test_history_cap_keeps_the_tail() {
            let (manager, kv) = setup("store-history-cap", 3).await;

            for v in ["1", "2", "3", "4"] {
                kv.put("k", Bytes::from(v.to_string())).await.unwrap();
            }
            let values: Vec<_> = kv
                .history("k")
                .await
                .unwrap()
                .iter()
                .map(|e| e.value.clone())
                .collect();
            assert_eq!(values, vec!["2", "3", "4"]);

            kv.put("k", Bytes::from("5")).await.unwrap();
            let values: Vec<_> = kv
                .history("k")
                .await
                .unwrap()
                .iter()
                .map(|e| e.value.clone())
                .collect();
            assert_eq!(values, vec!["3", "4", "5"]);

            cleanup(&manager, "store-history-cap").await;
        }

        #[tokio::test]
        async fn test_create_update_delete_recreate() {
            let (manager, kv) = setup("store-create-update", 64).await;

            let r1 = kv.create("k", Bytes::from("a")).await.unwrap();
            let r2 = kv.update("k", Bytes::from("b"), r1).await.unwrap();
            assert!(r2 > r1);

            assert!(matches!(
                kv.update("k", Bytes::from("z"), r1).await,
                Err(Error::WrongLastSequence(_))
            ));
            assert!(matches!(
                kv.create("k", Bytes::from("z")).await,
                Err(Error::WrongLastSequence(_))
            ));

            kv.delete("k").await.unwrap();
            let r3 = kv.create("k", Bytes::from("c")).await.unwrap();
            assert!(r3 > r2);

            kv.purge("k").await.unwrap();
            kv.create("k", Bytes::from("d")).await.unwrap();

            cleanup(&manager, "store-create-update").await;
        }

        #[tokio::test]
        async fn test_history_delete_purge() {
            let (manager, kv) = setup("store-history-ops", 64).await;

            let r1 = kv.put("k", Bytes::from("a")).await.unwrap();
            kv.delete("k").await.unwrap();
            kv.put("k", Bytes::from("b")).await.unwrap();

            let history = kv.history("k").await.unwrap();
            assert_eq!(history.len(), 3);
            assert_eq!(history[0].revision, r1);
            assert_eq!(history[1].operation, Operation::Delete);
            assert!(history.windows(2).all(|w| w[0].revision < w[1].revision));

            kv.purge("k").await.unwrap();
            let history = kv.history("k").await.unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].operation, Operation::Purge);

            cleanup(&manager, "store-history-ops").await;
        }

        #[tokio::test]
        async fn test_keys_excludes_tombstoned() {
            let (manager, kv) = setup("store-keys", 64).await;

            kv.put("alive", Bytes::from("v")).await.unwrap();
            kv.put("gone", Bytes::from("v")).await.unwrap();
            kv.delete("gone").await.unwrap();

            let mut keys = kv.keys().await.unwrap();
            keys.sort();
            assert_eq!(keys, vec!["alive"]);

            cleanup(&manager, "store-keys").await;
        }

        #[tokio::test]
        async fn test_purge_deletes_thresholds() {
            let (manager, kv) = setup("store-purge-deletes", 64).await;

            kv.put("k1", Bytes::from("a")).await.unwrap();
            kv.delete("k1").await.unwrap();
            kv.put("k2", Bytes::from("b")).await.unwrap();
            kv.put("k3", Bytes::from("c")).await.unwrap();
            kv.put("k4", Bytes::from("d")).await.unwrap();
            kv.purge("k4").await.unwrap();

            // fresh markers survive the default threshold, the history
            // beneath them does not
            kv.purge_deletes(PurgeThreshold::Default).await.unwrap();
            assert_eq!(kv.history("k1").await.unwrap().len(), 1);
            let mut keys = kv.keys().await.unwrap();
            keys.sort();
            assert_eq!(keys, vec!["k2", "k3"]);

            // no threshold collapses every tombstone
            kv.purge_deletes(PurgeThreshold::All).await.unwrap();
            assert!(kv.history("k1").await.unwrap().is_empty());
            assert!(kv.history("k4").await.unwrap().is_empty());
            let mut keys = kv.keys().await.unwrap();
            keys.sort();
            assert_eq!(keys, vec!["k2", "k3"]);

            cleanup(&manager, "store-purge-deletes").await;
        }

        #[tokio::test]
        async fn test_get_revision() {
            let (manager, kv) = setup("store-get-revision", 64).await;

            let r1 = kv.put("k", Bytes::from("v1")).await.unwrap();
            kv.put("k", Bytes::from("v2")).await.unwrap();
            let r3 = kv.put("k", Bytes::from("v3")).await.unwrap();

            let entry = kv.get_revision("k", r1).await.unwrap().unwrap();
            assert_eq!(entry.value, Bytes::from("v1"));

            kv.delete("k").await.unwrap();
            assert!(kv.get("k").await.unwrap().is_none());
            let r4 = kv.history("k").await.unwrap().last().unwrap().revision;
            assert!(kv.get_revision("k", r4).await.unwrap().is_none());
            assert_eq!(
                kv.get_revision("k", r3).await.unwrap().unwrap().value,
                Bytes::from("v3")
            );

            // a revision belonging to a different key resolves to absent
            let other = kv.put("other", Bytes::from("x")).await.unwrap();
            assert!(kv.get_revision("k", other).await.unwrap().is_none());

            cleanup(&manager, "store-get-revision").await;
        }
    }
}
