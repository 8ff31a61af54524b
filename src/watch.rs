//! Long-lived watchers over a bucket.
//!
//! A watcher attaches an ordered ephemeral consumer to the backing stream
//! and feeds a caller-supplied observer from a single delivery task, so the
//! observer always sees entries in stream order. The boundary between
//! replayed data and the live tail is signalled once through
//! [`KvWatcher::end_of_data`].

use crate::api::types::DeliverPolicy;
use crate::entry::{Entry, Operation};
use crate::error::{Error, Result};
use crate::scan::{Scan, ScanConfig};
use crate::store::KeyValue;
use crate::subject;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RECREATE_INTERVAL: Duration = Duration::from_secs(1);

/// Observer receiving watch deliveries. Both callbacks run on the watcher's
/// own delivery task, never concurrently with themselves or each other.
pub trait KvWatcher: Send + 'static {
    fn on_entry(&mut self, entry: Entry);

    /// Signalled exactly once, when the replayed data (if any) has been
    /// delivered and everything that follows is live tail. Fires before any
    /// entry when there is nothing to replay.
    fn end_of_data(&mut self);
}

/// Watch behavior flags. `include_history` and `updates_only` contradict
/// each other and are rejected together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Replay the full retained history before the live tail.
    pub include_history: bool,
    /// Skip all retained data; deliver only writes that happen after the
    /// watcher is attached.
    pub updates_only: bool,
    /// Drop DELETE and PURGE entries before delivery.
    pub ignore_deletes: bool,
    /// Headers-only delivery: entries arrive with an empty value but a
    /// correct [`Entry::data_len`].
    pub meta_only: bool,
}

impl WatchOptions {
    fn validate(&self) -> Result<()> {
        if self.include_history && self.updates_only {
            return Err(Error::InvalidArgument(
                "include_history and updates_only are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    fn deliver_policy(&self) -> DeliverPolicy {
        if self.include_history {
            DeliverPolicy::All
        } else if self.updates_only {
            DeliverPolicy::New
        } else {
            DeliverPolicy::LastPerSubject
        }
    }
}

impl KeyValue {
    /// Watches every key matching the pattern: an exact key, `prefix.*`,
    /// `prefix.>`, or `>` for the whole bucket. The observer first receives
    /// the retained data selected by the options, then the live tail.
    pub async fn watch<W: KvWatcher>(
        &self,
        pattern: &str,
        watcher: W,
        options: WatchOptions,
    ) -> Result<WatchHandle> {
        subject::validate_key_pattern(pattern)?;
        options.validate()?;
        let session = WatchSession {
            api: self.api.clone(),
            bucket: self.bucket.clone(),
            stream: self.stream.clone(),
            filter: subject::entry_subject(&self.bucket, pattern),
            options,
            watcher,
            end_of_data_sent: false,
            last_revision: None,
        };
        // the first consumer is created before spawning so a missing bucket
        // fails the watch call instead of a background task
        let scan = Scan::open(session.api.clone(), &session.stream, session.initial_config()).await?;
        let token = CancellationToken::new();
        let task = tokio::spawn(session.run(scan, token.clone()));
        Ok(WatchHandle {
            token,
            task: Mutex::new(Some(task)),
        })
    }

    /// [`KeyValue::watch`] over the whole bucket.
    pub async fn watch_all<W: KvWatcher>(
        &self,
        watcher: W,
        options: WatchOptions,
    ) -> Result<WatchHandle> {
        self.watch(">", watcher, options).await
    }
}

/// Owner of a running watcher. Dropping the handle cancels delivery;
/// [`WatchHandle::stop`] additionally waits for it to wind down.
pub struct WatchHandle {
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchHandle {
    /// Stops the watcher and releases its consumer. Idempotent; once this
    /// returns, no further observer callback will fire.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(?e, "watch delivery task ended abnormally");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct WatchSession<W> {
    api: crate::api::ApiClient,
    bucket: String,
    stream: String,
    filter: String,
    options: WatchOptions,
    watcher: W,
    end_of_data_sent: bool,
    last_revision: Option<u64>,
}

impl<W: KvWatcher> WatchSession<W> {
    fn initial_config(&self) -> ScanConfig {
        ScanConfig {
            filter: self.filter.clone(),
            deliver_policy: self.options.deliver_policy(),
            start_sequence: None,
            headers_only: self.options.meta_only,
        }
    }

    /// After a delivery interruption the watcher resumes right behind the
    /// last entry it handed out.
    fn resume_config(&self) -> ScanConfig {
        match self.last_revision {
            Some(revision) => ScanConfig {
                filter: self.filter.clone(),
                deliver_policy: DeliverPolicy::ByStartSequence,
                start_sequence: Some(revision + 1),
                headers_only: self.options.meta_only,
            },
            None => self.initial_config(),
        }
    }

    async fn run(mut self, mut scan: Scan, token: CancellationToken) {
        if self.options.updates_only || scan.initial_pending == 0 {
            self.fire_end_of_data();
        }
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                msg = scan.next_message() => match msg {
                    None => {
                        warn!(filter = %self.filter, "watch delivery ended unexpectedly, recreating consumer");
                        scan.close().await;
                        let Some(recreated) = self.recreate(&token).await else {
                            return;
                        };
                        if !self.end_of_data_sent && recreated.initial_pending == 0 {
                            self.fire_end_of_data();
                        }
                        scan = recreated;
                    }
                    Some(msg) => {
                        let entry = match Entry::from_push_message(&self.bucket, &msg) {
                            Ok(entry) => entry,
                            Err(e) => {
                                warn!(?e, "skipping undecodable delivery");
                                continue;
                            }
                        };
                        self.last_revision = Some(entry.revision);
                        let at_boundary = !self.end_of_data_sent && entry.delta == 0;
                        if !(self.options.ignore_deletes && entry.operation != Operation::Put) {
                            self.watcher.on_entry(entry);
                        }
                        if at_boundary {
                            self.fire_end_of_data();
                        }
                    }
                }
            }
        }
        scan.close().await;
    }

    async fn recreate(&mut self, token: &CancellationToken) -> Option<Scan> {
        loop {
            match Scan::open(self.api.clone(), &self.stream, self.resume_config()).await {
                Ok(scan) => return Some(scan),
                Err(e) => {
                    warn!(?e, filter = %self.filter, "failed to recreate watch consumer");
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(RECREATE_INTERVAL) => {}
                    }
                }
            }
        }
    }

    fn fire_end_of_data(&mut self) {
        if !self.end_of_data_sent {
            self.end_of_data_sent = true;
            self.watcher.end_of_data();
        }
    }
}
