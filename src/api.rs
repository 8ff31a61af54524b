//! Request/response plane against the JetStream control subjects.
//!
//! Administrative calls are request/reply on `$JS.API.*` (optionally behind a
//! domain or an account bridge prefix such as `FromA.$JS.API`). Entry
//! mutations are request/reply on the entry subject itself and come back as a
//! publish acknowledgement. Either way the reply carries the expected payload
//! or an `error{code, err_code, description}` envelope, which is lifted into
//! [`crate::error::Error`] here.

use crate::config::KvOptions;
use crate::error::{Error, Result};
use async_nats::client::RequestErrorKind;
use async_nats::connection::State;
use async_nats::{Client, HeaderMap};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;

use types::{ApiResponse, PubAck};

pub(crate) mod types;

const DEFAULT_API_PREFIX: &str = "$JS.API";

/// Resolves the API subject prefix from the handle options: an explicit
/// prefix wins, then a JetStream domain, then the default.
pub(crate) fn api_prefix(options: &KvOptions) -> String {
    if let Some(prefix) = &options.api_prefix {
        return prefix.trim_end_matches('.').to_string();
    }
    if let Some(domain) = &options.domain {
        return format!("$JS.{domain}.API");
    }
    DEFAULT_API_PREFIX.to_string()
}

/// Cross-account write prefix. Behind an account bridge (`FromA.$JS.API`)
/// entry publishes must travel the same export, on `FromA.$KV.…`; consumer
/// filters and message-get bodies keep naming the stream's own subjects.
/// Domains do not relocate the subject space, only the API.
pub(crate) fn write_prefix(options: &KvOptions) -> String {
    match &options.api_prefix {
        Some(prefix) => prefix
            .trim_end_matches('.')
            .strip_suffix("$JS.API")
            .unwrap_or_default()
            .to_string(),
        None => String::new(),
    }
}

#[derive(Clone)]
pub(crate) struct ApiClient {
    client: Client,
    prefix: String,
    timeout: Duration,
}

impl ApiClient {
    pub(crate) fn new(client: Client, options: &KvOptions) -> Self {
        ApiClient {
            client,
            prefix: api_prefix(options),
            timeout: options.request_timeout,
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Rejects an operation up front when the connection cannot publish.
    fn ensure_connected(&self) -> Result<()> {
        match self.client.connection_state() {
            State::Connected => Ok(()),
            state => Err(Error::Transport(format!(
                "connection is not usable (state: {state:?})"
            ))),
        }
    }

    /// Performs one administrative request, e.g. `op = "STREAM.INFO.KV_cfg"`.
    pub(crate) async fn request<T: DeserializeOwned>(&self, op: &str, body: Bytes) -> Result<T> {
        self.ensure_connected()?;
        let subject = format!("{}.{}", self.prefix, op);
        trace!(%subject, "jetstream api request");
        let reply = tokio::time::timeout(self.timeout, self.client.request(subject.clone(), body))
            .await
            .map_err(|_| Error::Timeout(format!("no reply for {subject} within {:?}", self.timeout)))?
            .map_err(|e| match e.kind() {
                RequestErrorKind::TimedOut => {
                    Error::Timeout(format!("no reply for {subject} within {:?}", self.timeout))
                }
                RequestErrorKind::NoResponders => {
                    Error::Transport("JetStream is not available".to_string())
                }
                RequestErrorKind::Other => Error::Transport(e.to_string()),
            })?;
        decode_response(&reply.payload)
    }

    /// Publishes an entry mutation and waits for the stream acknowledgement.
    pub(crate) async fn publish(
        &self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<PubAck> {
        self.ensure_connected()?;
        let request = async {
            match headers {
                Some(headers) => {
                    self.client
                        .request_with_headers(subject.clone(), headers, payload)
                        .await
                }
                None => self.client.request(subject.clone(), payload).await,
            }
        };
        let reply = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| Error::Timeout(format!("no ack for {subject} within {:?}", self.timeout)))?
            .map_err(|e| match e.kind() {
                RequestErrorKind::TimedOut => {
                    Error::Timeout(format!("no ack for {subject} within {:?}", self.timeout))
                }
                // no stream is bound to the subject
                RequestErrorKind::NoResponders => {
                    Error::NotFound(format!("no stream is listening on {subject}"))
                }
                RequestErrorKind::Other => Error::Transport(e.to_string()),
            })?;
        decode_response(&reply.payload)
    }

    /// Fire-and-forget variant used when acknowledgements are disabled.
    pub(crate) async fn publish_no_ack(
        &self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        self.ensure_connected()?;
        let result = match headers {
            Some(headers) => {
                self.client
                    .publish_with_headers(subject, headers, payload)
                    .await
            }
            None => self.client.publish(subject, payload).await,
        };
        result.map_err(|e| Error::Transport(e.to_string()))
    }
}

fn decode_response<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    match serde_json::from_slice::<ApiResponse<T>>(payload) {
        Ok(ApiResponse::Ok(value)) => Ok(value),
        Ok(ApiResponse::Err { error }) => Err(error.into()),
        Err(e) => Err(Error::Other(format!("decoding api response: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::SuccessResponse;

    fn options() -> KvOptions {
        KvOptions::default()
    }

    #[test]
    fn test_api_prefix_default() {
        assert_eq!(api_prefix(&options()), "$JS.API");
    }

    #[test]
    fn test_api_prefix_domain() {
        let opts = KvOptions {
            domain: Some("hub".to_string()),
            ..options()
        };
        assert_eq!(api_prefix(&opts), "$JS.hub.API");
    }

    #[test]
    fn test_api_prefix_explicit_wins_over_domain() {
        let opts = KvOptions {
            api_prefix: Some("FromA.$JS.API.".to_string()),
            domain: Some("hub".to_string()),
            ..options()
        };
        assert_eq!(api_prefix(&opts), "FromA.$JS.API");
    }

    #[test]
    fn test_write_prefix_follows_account_bridge() {
        assert_eq!(write_prefix(&options()), "");
        let opts = KvOptions {
            api_prefix: Some("FromA.$JS.API".to_string()),
            ..options()
        };
        assert_eq!(write_prefix(&opts), "FromA.");
        let opts = KvOptions {
            api_prefix: Some("$JS.API".to_string()),
            ..options()
        };
        assert_eq!(write_prefix(&opts), "");
        let opts = KvOptions {
            domain: Some("hub".to_string()),
            ..options()
        };
        assert_eq!(write_prefix(&opts), "");
    }

    #[test]
    fn test_decode_response_ok() {
        let resp: SuccessResponse = decode_response(br#"{"success":true}"#).unwrap();
        assert!(resp.success);
    }

    #[test]
    fn test_decode_response_error_envelope() {
        let result: Result<SuccessResponse> = decode_response(
            br#"{"error":{"code":404,"err_code":10059,"description":"stream not found"}}"#,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_decode_response_garbage() {
        let result: Result<SuccessResponse> = decode_response(b"not json");
        assert!(matches!(result, Err(Error::Other(_))));
    }
}
