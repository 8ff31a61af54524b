//! Short-lived ordered consumers over the backing stream.
//!
//! `keys()`, `history()`, `purge_deletes()` and the watcher all read the
//! stream the same way: subscribe to a fresh inbox, attach an ephemeral
//! ack-none push consumer delivering into it, and drain. The scan owns the
//! consumer and tears it down again; callers must invoke [`Scan::close`] on
//! every exit path.

use crate::api::ApiClient;
use crate::api::types::{
    AckPolicy, ConsumerConfig, ConsumerInfo, CreateConsumerRequest, DeliverPolicy, ReplayPolicy,
    SuccessResponse,
};
use crate::error::{Error, Result};
use async_nats::{Message, Subscriber};
use bytes::Bytes;
use tokio_stream::StreamExt;
use std::time::Duration;
use tracing::debug;

const IDLE_HEARTBEAT: Duration = Duration::from_secs(5);
/// The server reaps the ephemeral if we die without cleaning up.
const INACTIVE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub(crate) struct ScanConfig {
    /// Full subject filter, e.g. `$KV.cfg.>` or `$KV.cfg.a.b`.
    pub filter: String,
    pub deliver_policy: DeliverPolicy,
    /// Start sequence, only with [`DeliverPolicy::ByStartSequence`].
    pub start_sequence: Option<u64>,
    /// Headers-only delivery for meta scans.
    pub headers_only: bool,
}

pub(crate) struct Scan {
    api: ApiClient,
    stream: String,
    consumer: String,
    subscriber: Subscriber,
    /// Matching messages at creation time; `0` means there is no initial
    /// data to catch up on.
    pub initial_pending: u64,
}

impl Scan {
    pub(crate) async fn open(api: ApiClient, stream: &str, config: ScanConfig) -> Result<Scan> {
        let inbox = api.client().new_inbox();
        let mut subscriber = api
            .client()
            .subscribe(inbox.clone())
            .await
            .map_err(|e| Error::Transport(format!("subscribing to delivery inbox: {e}")))?;

        let request = CreateConsumerRequest {
            stream_name: stream.to_string(),
            config: ConsumerConfig {
                deliver_subject: Some(inbox),
                deliver_policy: config.deliver_policy,
                opt_start_seq: config.start_sequence,
                ack_policy: AckPolicy::None,
                replay_policy: ReplayPolicy::Instant,
                filter_subject: config.filter,
                headers_only: config.headers_only,
                flow_control: true,
                idle_heartbeat: IDLE_HEARTBEAT.as_nanos() as u64,
                inactive_threshold: INACTIVE_THRESHOLD.as_nanos() as u64,
                num_replicas: 1,
                mem_storage: true,
            },
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| Error::Other(format!("encoding consumer request: {e}")))?;

        let info: ConsumerInfo = match api
            .request(&format!("CONSUMER.CREATE.{stream}"), body.into())
            .await
        {
            Ok(info) => info,
            Err(e) => {
                let _ = subscriber.unsubscribe().await;
                return Err(e);
            }
        };

        Ok(Scan {
            api,
            stream: stream.to_string(),
            consumer: info.name,
            subscriber,
            initial_pending: info.num_pending,
        })
    }

    /// Next delivered message. Status frames (idle heartbeats, flow control)
    /// are answered or skipped here; `None` means the subscription ended.
    pub(crate) async fn next_message(&mut self) -> Option<Message> {
        while let Some(msg) = self.subscriber.next().await {
            if msg.status.is_some() {
                // flow-control frames carry a reply subject that must be
                // answered for delivery to continue
                if let Some(reply) = msg.reply {
                    let _ = self.api.client().publish(reply, Bytes::new()).await;
                }
                continue;
            }
            return Some(msg);
        }
        None
    }

    /// [`Scan::next_message`] bounded by the request timeout; used by the
    /// blocking drains.
    pub(crate) async fn next_message_timeout(&mut self) -> Result<Option<Message>> {
        let timeout = self.api.timeout();
        tokio::time::timeout(timeout, self.next_message())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "no delivery on {} within {timeout:?}",
                    self.filter_description()
                ))
            })
    }

    fn filter_description(&self) -> String {
        format!("{}/{}", self.stream, self.consumer)
    }

    /// Releases the subscription and the server-side consumer. The delete is
    /// best effort; an abandoned ephemeral ages out via its inactivity
    /// threshold.
    pub(crate) async fn close(mut self) {
        if let Err(e) = self.subscriber.unsubscribe().await {
            debug!(?e, consumer = %self.consumer, "failed to unsubscribe scan inbox");
        }
        let op = format!("CONSUMER.DELETE.{}.{}", self.stream, self.consumer);
        if let Err(e) = self.api.request::<SuccessResponse>(&op, Bytes::new()).await {
            debug!(?e, consumer = %self.consumer, "failed to delete scan consumer");
        }
    }
}
